//! Data-source agents.
//!
//! Each agent wraps one public biomedical API and reshapes its JSON into
//! typed records. They share a [`SourceClient`] that owns retries, rate
//! limit handling and the response cache.

pub mod clinical_trials;
pub mod openfda;
pub mod pubchem;
pub mod pubmed;
pub mod rxnav;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache;
use crate::config::SourceConfig;
use crate::db::{with_conn, DbPool};
use crate::errors::GenieError;

pub use clinical_trials::{ClinicalTrialsAgent, TrialSummary};
pub use openfda::{OpenFdaAgent, SafetyOverview};
pub use pubchem::{MolecularInfo, PubChemAgent};
pub use pubmed::{Article, PubMedAgent};
pub use rxnav::{DrugProfile, RxNavAgent};

/// Text shown in place of a section whose source failed or had no data.
pub const PLACEHOLDER: &str = "Information not available";

const USER_AGENT: &str = "PharmaGenieAI/1.0";
const MAX_BACKOFF_SECS: u64 = 10;
const DEFAULT_RETRY_AFTER_SECS: u64 = 5;
/// Expired cache rows are swept on the first write and every this many after.
const PURGE_EVERY_WRITES: u64 = 256;

/// Result of asking one source for one thing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceOutcome<T> {
    Available { data: T },
    NotFound { message: String },
    Unavailable { code: String, message: String },
}

impl<T> SourceOutcome<T> {
    /// Fold an agent call into an outcome. `Ok(None)` means the source
    /// answered without a matching record.
    pub fn from_result(result: Result<Option<T>, GenieError>, what: &str) -> Self {
        match result {
            Ok(Some(data)) => Self::Available { data },
            Ok(None) => Self::NotFound {
                message: format!("No record found for {what}"),
            },
            Err(GenieError::NotFound(subject)) => Self::NotFound {
                message: format!("{subject} not found"),
            },
            Err(err) => Self::Unavailable {
                code: err.code().to_string(),
                message: err.to_string(),
            },
        }
    }

    pub fn data(&self) -> Option<&T> {
        match self {
            Self::Available { data } => Some(data),
            _ => None,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// HTTP access shared by every agent.
#[derive(Clone)]
pub struct SourceClient {
    http: Client,
    cache: Option<DbPool>,
    max_retries: u32,
    cache_ttl: Duration,
    cache_writes: Arc<AtomicU64>,
}

impl SourceClient {
    pub fn new(config: &SourceConfig, cache: Option<DbPool>) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .user_agent(USER_AGENT)
            .build()
            .context("failed to construct source HTTP client")?;
        Ok(Self {
            http,
            cache,
            max_retries: config.max_retries.max(1),
            cache_ttl: config.cache_ttl,
            cache_writes: Arc::new(AtomicU64::new(0)),
        })
    }

    /// GET a JSON document. `Ok(None)` when the source answers 404.
    pub async fn get_json(
        &self,
        source: &str,
        base: &str,
        params: &[(&str, String)],
    ) -> Result<Option<Value>, GenieError> {
        let url = build_url(base, params)
            .map_err(|err| GenieError::unavailable(source, format!("{err:#}")))?;
        let key = cache::cache_key(source, url.as_str());

        if let Some(hit) = self.cached(&key).await {
            log::debug!(target: "agents", "{source}: cache hit for {url}");
            return Ok(Some(hit));
        }

        let mut last_error = String::from("no attempt made");
        for attempt in 0..self.max_retries {
            let is_last = attempt + 1 == self.max_retries;
            let response = match self
                .http
                .get(url.clone())
                .header(reqwest::header::ACCEPT, "application/json")
                .send()
                .await
            {
                Ok(response) => response,
                Err(err) => {
                    last_error = err.to_string();
                    log::warn!("{source}: attempt {} failed: {last_error}", attempt + 1);
                    if !is_last {
                        tokio::time::sleep(backoff(attempt)).await;
                    }
                    continue;
                }
            };

            let status = response.status();
            if status == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            if status == StatusCode::TOO_MANY_REQUESTS {
                let wait = retry_after(response.headers());
                last_error = format!("rate limited ({status})");
                log::warn!("{source}: rate limited, retrying after {}s", wait.as_secs());
                if !is_last {
                    tokio::time::sleep(wait).await;
                }
                continue;
            }
            if !status.is_success() {
                last_error = format!("HTTP {status}");
                log::warn!("{source}: attempt {} returned {status}", attempt + 1);
                if !is_last {
                    tokio::time::sleep(backoff(attempt)).await;
                }
                continue;
            }

            let body: Value = response
                .json()
                .await
                .map_err(|err| GenieError::unavailable(source, format!("malformed body: {err}")))?;
            self.store(&key, source, &body).await;
            return Ok(Some(body));
        }

        log::error!(
            "{source}: request failed after {} attempt(s): {last_error}",
            self.max_retries
        );
        Err(GenieError::unavailable(source, last_error))
    }

    async fn cached(&self, key: &str) -> Option<Value> {
        let pool = self.cache.as_ref()?;
        let key = key.to_string();
        let ttl = self.cache_ttl;
        with_conn(pool, move |conn| Ok(cache::get(conn, &key, ttl)?))
            .await
            .ok()
            .flatten()
    }

    async fn store(&self, key: &str, source: &str, body: &Value) {
        let Some(pool) = self.cache.as_ref() else {
            return;
        };
        let (key, source, body) = (key.to_string(), source.to_string(), body.clone());
        let sweep = self.cache_writes.fetch_add(1, Ordering::Relaxed) % PURGE_EVERY_WRITES == 0;
        let ttl = self.cache_ttl;
        let written = with_conn(pool, move |conn| {
            cache::put(conn, &key, &source, &body)?;
            Ok(if sweep { cache::purge_expired(conn, ttl)? } else { 0 })
        })
        .await;
        match written {
            Ok(0) => {}
            Ok(purged) => log::debug!(target: "agents", "purged {purged} expired cache row(s)"),
            Err(err) => log::debug!(target: "agents", "cache write skipped: {err}"),
        }
    }
}

fn build_url(base: &str, params: &[(&str, String)]) -> anyhow::Result<Url> {
    let mut url = Url::parse(base).with_context(|| format!("invalid URL '{base}'"))?;
    if !params.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in params {
            pairs.append_pair(key, value);
        }
    }
    Ok(url)
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempt).min(MAX_BACKOFF_SECS))
}

fn retry_after(headers: &reqwest::header::HeaderMap) -> Duration {
    let secs = headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
    Duration::from_secs(secs.min(MAX_BACKOFF_SECS))
}

/// First string of a JSON array field, or `None`.
pub(crate) fn first_str<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    match value.get(key)? {
        Value::Array(items) => items.first().and_then(Value::as_str),
        Value::String(s) => Some(s.as_str()),
        _ => None,
    }
}

/// All agents built over one shared client.
#[derive(Clone)]
pub struct Agents {
    pub rxnav: RxNavAgent,
    pub pubchem: PubChemAgent,
    pub trials: ClinicalTrialsAgent,
    pub fda: OpenFdaAgent,
    pub pubmed: PubMedAgent,
}

impl Agents {
    pub fn new(config: &SourceConfig, cache: Option<DbPool>) -> anyhow::Result<Self> {
        let client = SourceClient::new(config, cache)?;
        Ok(Self {
            rxnav: RxNavAgent::new(client.clone(), &config.rxnav_base),
            pubchem: PubChemAgent::new(client.clone(), &config.pubchem_base),
            trials: ClinicalTrialsAgent::new(client.clone(), &config.clinical_trials_base),
            fda: OpenFdaAgent::new(client.clone(), &config.openfda_base),
            pubmed: PubMedAgent::new(client, &config.pubmed_base),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Sources pointed at a closed local port with a single attempt.
    pub(crate) fn unreachable_config() -> SourceConfig {
        let dead = "http://127.0.0.1:1".to_string();
        SourceConfig {
            rxnav_base: dead.clone(),
            pubchem_base: dead.clone(),
            openfda_base: dead.clone(),
            clinical_trials_base: dead.clone(),
            pubmed_base: dead,
            timeout: Duration::from_secs(2),
            max_retries: 1,
            cache_ttl: Duration::from_secs(60),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff(0), Duration::from_secs(1));
        assert_eq!(backoff(1), Duration::from_secs(2));
        assert_eq!(backoff(3), Duration::from_secs(8));
        assert_eq!(backoff(4), Duration::from_secs(10));
        assert_eq!(backoff(40), Duration::from_secs(10));
    }

    #[test]
    fn retry_after_header_is_honoured_and_capped() {
        let mut headers = reqwest::header::HeaderMap::new();
        assert_eq!(retry_after(&headers), Duration::from_secs(5));
        headers.insert(reqwest::header::RETRY_AFTER, "3".parse().unwrap());
        assert_eq!(retry_after(&headers), Duration::from_secs(3));
        headers.insert(reqwest::header::RETRY_AFTER, "120".parse().unwrap());
        assert_eq!(retry_after(&headers), Duration::from_secs(10));
    }

    #[test]
    fn query_parameters_are_encoded() {
        let url = build_url(
            "https://api.fda.gov/drug/label.json",
            &[("search", "openfda.brand_name:\"Tylenol PM\"".into()), ("limit", "1".into())],
        )
        .unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.fda.gov/drug/label.json?search=openfda.brand_name%3A%22Tylenol+PM%22&limit=1"
        );
    }

    #[test]
    fn outcome_folds_results() {
        let ok: SourceOutcome<u32> = SourceOutcome::from_result(Ok(Some(7)), "aspirin");
        assert_eq!(ok.data(), Some(&7));

        let none: SourceOutcome<u32> = SourceOutcome::from_result(Ok(None), "aspirin");
        assert!(matches!(none, SourceOutcome::NotFound { .. }));

        let down: SourceOutcome<u32> = SourceOutcome::from_result(
            Err(GenieError::unavailable("pubchem", "HTTP 503")),
            "aspirin",
        );
        assert!(down.is_unavailable());
        let json = serde_json::to_value(&down).unwrap();
        assert_eq!(json["status"], "unavailable");
        assert_eq!(json["code"], "SRC-1001");
    }

    #[tokio::test]
    async fn unreachable_source_is_reported_unavailable() {
        let client = SourceClient::new(&unreachable_config(), None).unwrap();
        let err = client
            .get_json("rxnav", "http://127.0.0.1:1/rxcui.json", &[("name", "aspirin".into())])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SRC-1001");
    }

    #[tokio::test]
    async fn cached_responses_skip_the_network() {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::init_db(dir.path(), &[]).unwrap();
        let client = SourceClient::new(&unreachable_config(), Some(pool.clone())).unwrap();

        let base = "http://127.0.0.1:1/rxcui.json";
        let url = build_url(base, &[("name", "aspirin".into())]).unwrap();
        let key = cache::cache_key("rxnav", url.as_str());
        let body = serde_json::json!({ "idGroup": { "rxnormId": ["1191"] } });
        with_conn(&pool, move |conn| Ok(cache::put(conn, &key, "rxnav", &body)?))
            .await
            .unwrap();

        let hit = client
            .get_json("rxnav", base, &[("name", "aspirin".into())])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit["idGroup"]["rxnormId"][0], "1191");
    }

    #[tokio::test]
    async fn cache_writes_sweep_expired_rows() {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::init_db(dir.path(), &[]).unwrap();
        let client = SourceClient::new(&unreachable_config(), Some(pool.clone())).unwrap();
        {
            let conn = pool.get().unwrap();
            cache::put(&conn, "stale", "pubmed", &serde_json::json!([])).unwrap();
            conn.execute("UPDATE lookup_cache SET fetched_at = 0 WHERE key = 'stale'", [])
                .unwrap();
        }

        client.store("fresh", "pubmed", &serde_json::json!({ "ok": true })).await;

        let conn = pool.get().unwrap();
        let keys: Vec<String> = conn
            .prepare("SELECT key FROM lookup_cache")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(keys, vec!["fresh".to_string()]);
    }
}
