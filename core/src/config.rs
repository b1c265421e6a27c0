//! Application configuration assembled from the environment.
//!
//! Everything that used to be read ad hoc from environment variables is
//! gathered here once and handed to constructors. The provider list is kept
//! in fallback priority order.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::ai::providers::PROVIDER_SEEDS;
use crate::errors::GenieError;

pub const DEFAULT_BIND: &str = "127.0.0.1:8000";

#[derive(Clone)]
pub struct ProviderConfig {
    pub id: String,
    pub display_name: String,
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("id", &self.id)
            .field("display_name", &self.display_name)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish()
    }
}

/// Endpoints and HTTP behaviour shared by the data-source agents.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub rxnav_base: String,
    pub pubchem_base: String,
    pub openfda_base: String,
    pub clinical_trials_base: String,
    pub pubmed_base: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub cache_ttl: Duration,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            rxnav_base: "https://rxnav.nlm.nih.gov/REST".into(),
            pubchem_base: "https://pubchem.ncbi.nlm.nih.gov/rest/pug".into(),
            openfda_base: "https://api.fda.gov/drug".into(),
            clinical_trials_base: "https://clinicaltrials.gov/api/v2".into(),
            pubmed_base: "https://eutils.ncbi.nlm.nih.gov/entrez/eutils".into(),
            timeout: Duration::from_secs(10),
            max_retries: 3,
            cache_ttl: Duration::from_secs(6 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub providers: Vec<ProviderConfig>,
    pub sources: SourceConfig,
    pub bind_addr: String,
    pub data_dir: Option<PathBuf>,
    pub chat_timeout: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, GenieError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, GenieError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut providers: Vec<ProviderConfig> = PROVIDER_SEEDS
            .iter()
            .map(|seed| {
                let prefix = seed.id.to_uppercase();
                ProviderConfig {
                    id: seed.id.to_string(),
                    display_name: seed.display.to_string(),
                    api_key: get(seed.key_env),
                    base_url: get(&format!("{prefix}_BASE_URL"))
                        .unwrap_or_else(|| seed.base_url.to_string()),
                    model: get(&format!("{prefix}_MODEL"))
                        .unwrap_or_else(|| seed.model.to_string()),
                }
            })
            .collect();

        if let Some(order) = get("PHARMAGENIE_PROVIDER_ORDER") {
            providers = reorder_providers(providers, &order)?;
        }

        let defaults = SourceConfig::default();
        let sources = SourceConfig {
            rxnav_base: get("RXNAV_BASE_URL").unwrap_or(defaults.rxnav_base),
            pubchem_base: get("PUBCHEM_BASE_URL").unwrap_or(defaults.pubchem_base),
            openfda_base: get("OPENFDA_BASE_URL").unwrap_or(defaults.openfda_base),
            clinical_trials_base: get("CLINICALTRIALS_BASE_URL")
                .unwrap_or(defaults.clinical_trials_base),
            pubmed_base: get("PUBMED_BASE_URL").unwrap_or(defaults.pubmed_base),
            timeout: parse_secs(get("PHARMAGENIE_HTTP_TIMEOUT_SECS"), "PHARMAGENIE_HTTP_TIMEOUT_SECS")?
                .unwrap_or(defaults.timeout),
            max_retries: parse_number(get("PHARMAGENIE_MAX_RETRIES"), "PHARMAGENIE_MAX_RETRIES")?
                .map(|n: u32| n.max(1))
                .unwrap_or(defaults.max_retries),
            cache_ttl: parse_secs(get("PHARMAGENIE_CACHE_TTL_SECS"), "PHARMAGENIE_CACHE_TTL_SECS")?
                .unwrap_or(defaults.cache_ttl),
        };

        Ok(Self {
            providers,
            sources,
            bind_addr: get("PHARMAGENIE_BIND").unwrap_or_else(|| DEFAULT_BIND.to_string()),
            data_dir: get("PHARMAGENIE_DATA_DIR").map(PathBuf::from),
            chat_timeout: parse_secs(
                get("PHARMAGENIE_CHAT_TIMEOUT_SECS"),
                "PHARMAGENIE_CHAT_TIMEOUT_SECS",
            )?
            .unwrap_or(Duration::from_secs(45)),
        })
    }

    /// Providers that carry a credential, in priority order.
    pub fn configured_providers(&self) -> impl Iterator<Item = &ProviderConfig> {
        self.providers.iter().filter(|p| p.api_key.is_some())
    }
}

fn reorder_providers(
    providers: Vec<ProviderConfig>,
    order: &str,
) -> Result<Vec<ProviderConfig>, GenieError> {
    let mut seen = HashSet::new();
    let mut ordered = Vec::with_capacity(providers.len());
    for id in order.split(',').map(|s| s.trim().to_lowercase()).filter(|s| !s.is_empty()) {
        if !seen.insert(id.clone()) {
            return Err(GenieError::InvalidConfig(format!(
                "provider '{id}' listed twice in PHARMAGENIE_PROVIDER_ORDER"
            )));
        }
        let provider = providers
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or_else(|| GenieError::InvalidConfig(format!("unknown provider '{id}'")))?;
        ordered.push(provider);
    }
    // unlisted providers keep their relative order after the listed ones
    for provider in providers {
        if !seen.contains(&provider.id) {
            ordered.push(provider);
        }
    }
    Ok(ordered)
}

fn parse_number<T: std::str::FromStr>(
    value: Option<String>,
    key: &str,
) -> Result<Option<T>, GenieError> {
    value
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|_| GenieError::InvalidConfig(format!("{key} must be a number, got '{raw}'")))
        })
        .transpose()
}

fn parse_secs(value: Option<String>, key: &str) -> Result<Option<Duration>, GenieError> {
    Ok(parse_number::<u64>(value, key)?.map(Duration::from_secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_follow_builtin_priority() {
        let config = AppConfig::from_lookup(lookup(&[])).unwrap();
        let ids: Vec<_> = config.providers.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["deepseek", "groq", "openai"]);
        assert_eq!(config.configured_providers().count(), 0);
        assert_eq!(config.bind_addr, DEFAULT_BIND);
        assert_eq!(config.sources.max_retries, 3);
    }

    #[test]
    fn blank_credentials_are_treated_as_absent() {
        let config = AppConfig::from_lookup(lookup(&[
            ("GROQ_API_KEY", "gsk-test"),
            ("OPENAI_API_KEY", "   "),
        ]))
        .unwrap();
        let configured: Vec<_> = config.configured_providers().map(|p| p.id.as_str()).collect();
        assert_eq!(configured, vec!["groq"]);
    }

    #[test]
    fn overrides_and_reordering_apply() {
        let config = AppConfig::from_lookup(lookup(&[
            ("OPENAI_MODEL", "gpt-4o-mini"),
            ("GROQ_BASE_URL", "http://localhost:9000/v1"),
            ("PHARMAGENIE_PROVIDER_ORDER", "openai, groq"),
        ]))
        .unwrap();
        let ids: Vec<_> = config.providers.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["openai", "groq", "deepseek"]);
        assert_eq!(config.providers[0].model, "gpt-4o-mini");
        assert_eq!(config.providers[1].base_url, "http://localhost:9000/v1");
    }

    #[test]
    fn unknown_provider_in_order_is_rejected() {
        let err = AppConfig::from_lookup(lookup(&[("PHARMAGENIE_PROVIDER_ORDER", "mistral")]))
            .unwrap_err();
        assert_eq!(err.code(), "CFG-1002");
    }

    #[test]
    fn non_numeric_timeout_is_rejected() {
        let err = AppConfig::from_lookup(lookup(&[("PHARMAGENIE_HTTP_TIMEOUT_SECS", "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains("PHARMAGENIE_HTTP_TIMEOUT_SECS"));
    }

    #[test]
    fn debug_output_redacts_keys() {
        let config = AppConfig::from_lookup(lookup(&[("DEEPSEEK_API_KEY", "sk-secret")])).unwrap();
        let rendered = format!("{:?}", config.providers[0]);
        assert!(!rendered.contains("sk-secret"));
        assert!(rendered.contains("<redacted>"));
    }
}
