use serde::Serialize;
use thiserror::Error;

/// A single failed attempt recorded while walking the provider chain.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProviderFailure {
    pub provider_id: String,
    pub model: String,
    pub error: String,
}

#[derive(Debug, Error)]
pub enum GenieError {
    #[error("No AI provider credential is configured")] NoProviderConfigured,
    #[error("Invalid configuration: {0}")] InvalidConfig(String),
    #[error("All AI providers failed: {}", describe_failures(.0))] ProvidersExhausted(Vec<ProviderFailure>),
    #[error("Invalid request: {0}")] InvalidRequest(String),
    #[error("{source_name} unavailable: {message}")] SourceUnavailable { source_name: String, message: String },
    #[error("{0} not found")] NotFound(String),
    #[error("Database unavailable: {0}")] DbUnavailable(String),
    #[error("Unknown error: {0}")] Unknown(String),
}

impl GenieError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoProviderConfigured => "CFG-1001",
            Self::InvalidConfig(_) => "CFG-1002",
            Self::ProvidersExhausted(_) => "AI-1001",
            Self::InvalidRequest(_) => "REQ-1001",
            Self::SourceUnavailable { .. } => "SRC-1001",
            Self::NotFound(_) => "SRC-1004",
            Self::DbUnavailable(_) => "DB-1001",
            Self::Unknown(_) => "GEN-1000",
        }
    }
    pub fn explain(&self) -> &'static str {
        match self {
            Self::NoProviderConfigured => "Set DEEPSEEK_API_KEY, GROQ_API_KEY or OPENAI_API_KEY, or store a credential through the API.",
            Self::InvalidConfig(_) => "A configuration value could not be parsed.",
            Self::ProvidersExhausted(_) => "Every configured AI provider was tried once and each attempt failed.",
            Self::InvalidRequest(_) => "The request was rejected before any external call was made.",
            Self::SourceUnavailable { .. } => "An external data source could not be reached or returned an error.",
            Self::NotFound(_) => "The data source answered but holds no record for the query.",
            Self::DbUnavailable(_) => "The application could not access the SQLite database.",
            Self::Unknown(_) => "An unspecified error occurred.",
        }
    }

    pub fn db(err: impl std::fmt::Display) -> Self {
        Self::DbUnavailable(err.to_string())
    }

    pub fn unavailable(source_name: &str, err: impl std::fmt::Display) -> Self {
        Self::SourceUnavailable {
            source_name: source_name.to_string(),
            message: err.to_string(),
        }
    }
}

fn describe_failures(failures: &[ProviderFailure]) -> String {
    if failures.is_empty() {
        return "no attempts recorded".to_string();
    }
    failures
        .iter()
        .map(|f| format!("{} ({}): {}", f.provider_id, f.model, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_message_lists_every_provider() {
        let err = GenieError::ProvidersExhausted(vec![
            ProviderFailure {
                provider_id: "deepseek".into(),
                model: "deepseek-chat".into(),
                error: "401 Unauthorized".into(),
            },
            ProviderFailure {
                provider_id: "groq".into(),
                model: "llama-3.3-70b-versatile".into(),
                error: "timeout".into(),
            },
        ]);
        let text = err.to_string();
        assert!(text.contains("deepseek (deepseek-chat): 401 Unauthorized"));
        assert!(text.contains("groq"));
        assert_eq!(err.code(), "AI-1001");
    }
}
