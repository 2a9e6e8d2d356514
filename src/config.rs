use std::collections::HashMap;

use serde::Deserialize;

use crate::error::{AppError, AppResult};

/// Application configuration loaded from environment variables
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Title availability API key
    pub title_api_key: String,

    /// Title availability API base URL
    #[serde(default = "default_title_api_url")]
    pub title_api_url: String,

    /// Country code used for availability lookups
    #[serde(default = "default_country")]
    pub country: String,

    /// Hard per-attempt timeout for upstream requests, in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Maximum upstream attempts before degrading to an empty result
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Hours before the bulk content cache is considered stale
    #[serde(default = "default_cache_staleness_hours")]
    pub cache_staleness_hours: i64,

    /// JSON object mapping internal service ids to upstream provider keys,
    /// e.g. `{"203":"netflix"}`. Falls back to the built-in table when unset.
    #[serde(default)]
    pub service_mapping_json: Option<String>,
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_title_api_url() -> String {
    "https://streaming-availability.p.rapidapi.com".to_string()
}

fn default_country() -> String {
    "us".to_string()
}

fn default_request_timeout_secs() -> u64 {
    8
}

fn default_max_retries() -> u32 {
    3
}

fn default_cache_staleness_hours() -> i64 {
    24
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        envy::from_env::<Config>().map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))
    }

    /// Resolves the service-id mapping table, either from the configured JSON
    /// override or the built-in defaults.
    pub fn service_mapping(&self) -> AppResult<ServiceMapping> {
        match &self.service_mapping_json {
            Some(json) => {
                let pairs: HashMap<String, String> = serde_json::from_str(json)?;
                if pairs.is_empty() {
                    return Err(AppError::InvalidInput(
                        "service mapping override is empty".to_string(),
                    ));
                }
                Ok(ServiceMapping::from_pairs(pairs))
            }
            None => Ok(ServiceMapping::default_table()),
        }
    }
}

/// Built-in mapping between internal service ids and upstream provider keys.
const DEFAULT_SERVICE_MAPPING: &[(&str, &str)] = &[
    ("203", "netflix"),
    ("26", "prime"),
    ("372", "disney"),
    ("157", "hulu"),
    ("387", "hbo"),
    ("444", "paramount"),
    ("389", "peacock"),
    ("371", "apple"),
    ("442", "discovery"),
    ("443", "espn"),
];

/// Bidirectional mapping between internal service ids (e.g. "203") and
/// upstream provider keys (e.g. "netflix").
#[derive(Debug, Clone)]
pub struct ServiceMapping {
    forward: HashMap<String, String>,
    reverse: HashMap<String, String>,
}

impl ServiceMapping {
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let forward: HashMap<String, String> = pairs.into_iter().collect();
        let reverse = forward
            .iter()
            .map(|(id, key)| (key.clone(), id.clone()))
            .collect();
        Self { forward, reverse }
    }

    pub fn default_table() -> Self {
        Self::from_pairs(
            DEFAULT_SERVICE_MAPPING
                .iter()
                .map(|(id, key)| (id.to_string(), key.to_string())),
        )
    }

    /// Upstream provider key for an internal service id
    pub fn provider_key(&self, service_id: &str) -> Option<&str> {
        self.forward.get(service_id).map(String::as_str)
    }

    /// Internal service id for an upstream provider key
    pub fn service_id(&self, provider_key: &str) -> Option<&str> {
        self.reverse.get(provider_key).map(String::as_str)
    }

    /// Maps internal service ids onto provider keys, dropping unknown ids
    pub fn provider_keys_for(&self, service_ids: &[String]) -> Vec<String> {
        service_ids
            .iter()
            .filter_map(|id| self.provider_key(id))
            .map(str::to_string)
            .collect()
    }

    /// All internal service ids in the table, sorted for determinism
    pub fn internal_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.forward.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}
