//! High level AI model manager that routes chat completions through the
//! configured providers with graceful fallbacks and structured logging.
//!
//! Providers are tried strictly in priority order, one attempt each. A
//! provider without a stored credential is never contacted. The chain is
//! re-read from the store on every call, so credential changes take effect
//! on the next request.

use std::sync::Arc;

use serde_json::json;

use crate::ai::config::{self, AiProviderInfo, AiRuntimeSelection};
use crate::ai::{AiChatInput, AiChatMessage, AiChatResponse, ChatBackend};
use crate::db::{with_conn, DbPool};
use crate::errors::{GenieError, ProviderFailure};
use crate::logging::log_event;

/// Wrapper that owns the chat backend alongside access to provider metadata.
#[derive(Clone)]
pub struct ModelManager {
    pool: DbPool,
    backend: Arc<dyn ChatBackend>,
}

impl ModelManager {
    pub fn new(pool: DbPool, backend: Arc<dyn ChatBackend>) -> Arc<Self> {
        Arc::new(Self { pool, backend })
    }

    pub async fn list_providers(&self) -> Result<Vec<AiProviderInfo>, GenieError> {
        with_conn(&self.pool, |conn| config::list_providers(conn)).await
    }

    /// Store a credential for `provider_id`. A blank key removes it.
    pub async fn set_credential(
        &self,
        provider_id: &str,
        api_key: &str,
    ) -> Result<AiProviderInfo, GenieError> {
        let id = provider_id.to_string();
        let key = api_key.to_string();
        with_conn(&self.pool, move |conn| config::set_credential(conn, &id, &key))
            .await?
            .ok_or_else(|| GenieError::NotFound(format!("AI provider '{provider_id}'")))
    }

    pub async fn clear_credential(&self, provider_id: &str) -> Result<AiProviderInfo, GenieError> {
        self.set_credential(provider_id, "").await
    }

    /// Execute a chat completion, walking the fallback chain until a
    /// provider answers.
    pub async fn chat(&self, input: &AiChatInput) -> Result<AiChatResponse, GenieError> {
        validate_input(input)?;

        let chain = with_conn(&self.pool, |conn| config::fallback_chain(conn)).await?;
        if chain.is_empty() {
            log::error!("chat requested but no AI provider credential is configured");
            return Err(GenieError::NoProviderConfigured);
        }

        let mut failures = Vec::with_capacity(chain.len());
        for selection in &chain {
            match self.backend.chat(selection, input).await {
                Ok(response) => {
                    log::info!(
                        "chat served by {} ({}) after {} failed attempt(s)",
                        selection.provider.display_name,
                        response.model,
                        failures.len()
                    );
                    self.record_success(selection, &response, failures.len()).await;
                    return Ok(response);
                }
                Err(err) => {
                    let message = format!("{err:#}");
                    log::warn!(
                        "provider {} failed, moving to next: {message}",
                        selection.provider.display_name
                    );
                    self.record_failure(selection, &message).await;
                    failures.push(ProviderFailure {
                        provider_id: selection.provider.id.clone(),
                        model: selection.model.clone(),
                        error: message,
                    });
                }
            }
        }

        log::error!("all {} configured AI providers failed", failures.len());
        Err(GenieError::ProvidersExhausted(failures))
    }

    /// Single-turn helper returning only the completion text.
    pub async fn complete(
        &self,
        system: &str,
        user: &str,
        temperature: Option<f32>,
        max_tokens: Option<u32>,
    ) -> Result<AiChatResponse, GenieError> {
        let input = AiChatInput {
            messages: vec![AiChatMessage::system(system), AiChatMessage::user(user)],
            temperature,
            max_tokens,
        };
        self.chat(&input).await
    }

    async fn record_success(
        &self,
        selection: &AiRuntimeSelection,
        response: &AiChatResponse,
        failed_before: usize,
    ) {
        let data = json!({
            "provider": selection.provider.id,
            "model": response.model,
            "failed_before": failed_before,
            "preview": response.content.chars().take(200).collect::<String>(),
        });
        let _ = with_conn(&self.pool, move |conn| {
            log_event(
                conn,
                "info",
                Some("AI-0200"),
                "ai.runtime",
                "AI chat invocation succeeded",
                Some("Served by the first provider that answered"),
                Some(data),
            )?;
            Ok(())
        })
        .await;
    }

    async fn record_failure(&self, selection: &AiRuntimeSelection, message: &str) {
        let data = json!({
            "provider": selection.provider.id,
            "model": selection.model,
            "error": message,
        });
        let _ = with_conn(&self.pool, move |conn| {
            log_event(
                conn,
                "warn",
                Some("AI-0201"),
                "ai.runtime",
                "AI provider invocation failed",
                Some("Attempting fallback"),
                Some(data),
            )?;
            Ok(())
        })
        .await;
    }
}

fn validate_input(input: &AiChatInput) -> Result<(), GenieError> {
    if input.messages.is_empty() {
        return Err(GenieError::InvalidRequest("at least one message is required".into()));
    }
    if input.messages.iter().all(|m| m.content.trim().is_empty()) {
        return Err(GenieError::InvalidRequest("all messages are empty".into()));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::ProviderConfig;
    use crate::db::init_db;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Scripted backend: providers listed in `failing` error out, the rest
    /// answer with `"<id> says hi"`. Every call is recorded.
    #[derive(Default)]
    pub(crate) struct FakeBackend {
        failing: Mutex<HashSet<String>>,
        pub calls: Mutex<Vec<(String, AiChatInput)>>,
    }

    impl FakeBackend {
        pub fn failing(ids: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                failing: Mutex::new(ids.iter().map(|s| s.to_string()).collect()),
                calls: Mutex::new(Vec::new()),
            })
        }

        pub fn called(&self) -> Vec<String> {
            self.calls.lock().unwrap().iter().map(|(id, _)| id.clone()).collect()
        }
    }

    #[async_trait]
    impl ChatBackend for FakeBackend {
        async fn chat(
            &self,
            selection: &AiRuntimeSelection,
            input: &AiChatInput,
        ) -> anyhow::Result<AiChatResponse> {
            self.calls
                .lock()
                .unwrap()
                .push((selection.provider.id.clone(), input.clone()));
            if self.failing.lock().unwrap().contains(&selection.provider.id) {
                return Err(anyhow!("{} returned 429 Too Many Requests", selection.provider.id));
            }
            Ok(AiChatResponse {
                provider_id: selection.provider.id.clone(),
                model: selection.model.clone(),
                content: format!("{} says hi", selection.provider.id),
                usage: None,
                raw: serde_json::Value::Null,
            })
        }
    }

    pub(crate) fn providers(keys: &[(&str, Option<&str>)]) -> Vec<ProviderConfig> {
        keys.iter()
            .map(|(id, key)| ProviderConfig {
                id: id.to_string(),
                display_name: id.to_uppercase(),
                api_key: key.map(str::to_string),
                base_url: format!("https://{id}.example/v1"),
                model: format!("{id}-model"),
            })
            .collect()
    }

    fn manager(
        dir: &tempfile::TempDir,
        keys: &[(&str, Option<&str>)],
        backend: Arc<FakeBackend>,
    ) -> Arc<ModelManager> {
        let pool = init_db(dir.path(), &providers(keys)).unwrap();
        ModelManager::new(pool, backend)
    }

    const ALL_KEYS: &[(&str, Option<&str>)] =
        &[("deepseek", Some("k1")), ("groq", Some("k2")), ("openai", Some("k3"))];

    fn input() -> AiChatInput {
        AiChatInput {
            messages: vec![
                AiChatMessage::system("You are a pharmaceutical assistant."),
                AiChatMessage::user("What is metformin used for?"),
            ],
            temperature: Some(0.3),
            max_tokens: Some(200),
        }
    }

    #[tokio::test]
    async fn first_provider_success_calls_nobody_else() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::failing(&[]);
        let models = manager(&dir, ALL_KEYS, backend.clone());

        let response = models.chat(&input()).await.unwrap();
        assert_eq!(response.provider_id, "deepseek");
        assert_eq!(response.model, "deepseek-model");
        assert_eq!(response.content, "deepseek says hi");
        assert_eq!(backend.called(), vec!["deepseek"]);
    }

    #[tokio::test]
    async fn second_provider_serves_after_first_fails() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::failing(&["deepseek"]);
        let models = manager(&dir, ALL_KEYS, backend.clone());

        let response = models.chat(&input()).await.unwrap();
        assert_eq!(response.provider_id, "groq");
        assert_eq!(response.content, "groq says hi");
        assert_eq!(backend.called(), vec!["deepseek", "groq"]);

        // the payload handed to each attempt is identical to the caller's
        let calls = backend.calls.lock().unwrap();
        assert!(calls.iter().all(|(_, sent)| *sent == input()));
    }

    #[tokio::test]
    async fn exhausted_chain_reports_every_attempt_once() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::failing(&["deepseek", "groq", "openai"]);
        let models = manager(&dir, ALL_KEYS, backend.clone());

        let err = models.chat(&input()).await.unwrap_err();
        match err {
            GenieError::ProvidersExhausted(failures) => {
                let ids: Vec<_> = failures.iter().map(|f| f.provider_id.as_str()).collect();
                assert_eq!(ids, vec!["deepseek", "groq", "openai"]);
                assert!(failures[0].error.contains("429"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(backend.called(), vec!["deepseek", "groq", "openai"]);
    }

    #[tokio::test]
    async fn missing_credentials_fail_without_network_calls() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::failing(&[]);
        let models = manager(
            &dir,
            &[("deepseek", None), ("groq", None), ("openai", None)],
            backend.clone(),
        );

        let err = models.chat(&input()).await.unwrap_err();
        assert!(matches!(err, GenieError::NoProviderConfigured));
        assert!(backend.called().is_empty());
    }

    #[tokio::test]
    async fn providers_without_credentials_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::failing(&[]);
        let models = manager(
            &dir,
            &[("deepseek", None), ("groq", None), ("openai", Some("k3"))],
            backend.clone(),
        );

        let response = models.chat(&input()).await.unwrap();
        assert_eq!(response.provider_id, "openai");
        assert_eq!(backend.called(), vec!["openai"]);
    }

    #[tokio::test]
    async fn removing_a_credential_mid_session_skips_that_provider() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::failing(&["groq"]);
        let models = manager(&dir, ALL_KEYS, backend.clone());

        assert_eq!(models.chat(&input()).await.unwrap().provider_id, "deepseek");

        let info = models.clear_credential("deepseek").await.unwrap();
        assert!(!info.has_credentials);

        let response = models.chat(&input()).await.unwrap();
        assert_eq!(response.provider_id, "openai");
        assert_eq!(backend.called(), vec!["deepseek", "groq", "openai"]);
    }

    #[tokio::test]
    async fn invalid_input_is_rejected_before_any_call() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::failing(&[]);
        let models = manager(&dir, ALL_KEYS, backend.clone());

        let empty = AiChatInput {
            messages: vec![AiChatMessage::user("   ")],
            temperature: None,
            max_tokens: None,
        };
        let err = models.chat(&empty).await.unwrap_err();
        assert_eq!(err.code(), "REQ-1001");
        assert!(backend.called().is_empty());
    }

    #[tokio::test]
    async fn unknown_provider_credential_update_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let models = manager(&dir, ALL_KEYS, FakeBackend::failing(&[]));
        let err = models.set_credential("mistral", "key").await.unwrap_err();
        assert!(matches!(err, GenieError::NotFound(_)));
    }

    #[tokio::test]
    async fn attempts_are_recorded_in_the_event_log() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::failing(&["deepseek"]);
        let models = manager(&dir, ALL_KEYS, backend);
        models.chat(&input()).await.unwrap();

        let events = with_conn(&models.pool, |conn| {
            Ok(crate::logging::list_events(conn, Some("ai.runtime"), 10)?)
        })
        .await
        .unwrap();
        let codes: Vec<_> = events.iter().filter_map(|e| e.code.clone()).collect();
        assert!(codes.contains(&"AI-0201".to_string()));
        assert!(codes.contains(&"AI-0200".to_string()));
    }
}
