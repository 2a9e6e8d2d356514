/// Title availability API gateway
///
/// Wraps the external title availability API behind a typed, retrying client.
/// Exhausted retries always degrade to an empty result so read paths can fall
/// through to their cache tiers; callers must treat empty as "no data".
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::models::{ContentType, RawSearchItem, RawTitleDetails};

/// Retry budget for a request
///
/// Standard is the bulk refresh and detail-fetch budget. Quick trades
/// completeness for latency on the discovery live-fetch tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchProfile {
    Standard,
    Quick,
}

const QUICK_ATTEMPTS: u32 = 2;
const QUICK_TIMEOUT: Duration = Duration::from_secs(5);

/// Client seam for the external title availability API
#[async_trait]
pub trait TitleApi: Send + Sync {
    /// One page of popularity-sorted results for a provider. Empty on any
    /// failure.
    async fn search_popular(
        &self,
        provider_key: &str,
        content_type: ContentType,
        genre: Option<&str>,
        page: u32,
        profile: FetchProfile,
    ) -> Vec<RawSearchItem>;

    /// Detail record for one title. None on any failure.
    async fn get_details(
        &self,
        content_id: &str,
        content_type: ContentType,
    ) -> Option<RawTitleDetails>;
}

/// reqwest-backed implementation of the gateway
#[derive(Clone)]
pub struct AvailabilityApi {
    http_client: HttpClient,
    api_key: String,
    api_url: String,
    country: String,
    timeout: Duration,
    max_retries: u32,
}

impl AvailabilityApi {
    pub fn new(config: &Config) -> Self {
        Self {
            http_client: HttpClient::new(),
            api_key: config.title_api_key.clone(),
            api_url: config.title_api_url.clone(),
            country: config.country.clone(),
            timeout: Duration::from_secs(config.request_timeout_secs),
            max_retries: config.max_retries,
        }
    }

    fn budget(&self, profile: FetchProfile) -> (u32, Duration) {
        match profile {
            FetchProfile::Standard => (self.max_retries, self.timeout),
            FetchProfile::Quick => (QUICK_ATTEMPTS, QUICK_TIMEOUT),
        }
    }

    /// GET with bounded retries and exponential backoff. Each attempt runs
    /// under its own hard deadline; the connection is returned to the pool on
    /// both success and failure.
    async fn fetch_json(
        &self,
        url: &str,
        query: &[(&str, &str)],
        attempts: u32,
        timeout: Duration,
    ) -> Option<serde_json::Value> {
        for attempt in 0..attempts {
            match self.try_fetch(url, query, timeout).await {
                Ok(value) => return Some(value),
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        url = %url,
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        "Upstream request failed"
                    );
                    if attempt + 1 < attempts {
                        tokio::time::sleep(Duration::from_secs(1u64 << (attempt + 1))).await;
                    }
                }
            }
        }

        tracing::warn!(url = %url, "Upstream retries exhausted, degrading to empty result");
        None
    }

    async fn try_fetch(
        &self,
        url: &str,
        query: &[(&str, &str)],
        timeout: Duration,
    ) -> AppResult<serde_json::Value> {
        let response = self
            .http_client
            .get(url)
            .timeout(timeout)
            .header("x-rapidapi-key", &self.api_key)
            .query(query)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AppError::ExternalApi(format!(
                "upstream returned status {}",
                response.status()
            )));
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl TitleApi for AvailabilityApi {
    async fn search_popular(
        &self,
        provider_key: &str,
        content_type: ContentType,
        genre: Option<&str>,
        page: u32,
        profile: FetchProfile,
    ) -> Vec<RawSearchItem> {
        let (attempts, timeout) = self.budget(profile);
        let url = format!("{}/search/basic", self.api_url);
        let page = page.to_string();

        let mut query = vec![
            ("country", self.country.as_str()),
            ("service", provider_key),
            ("type", content_type.api_segment()),
            ("page", page.as_str()),
            ("language", "en"),
            ("sort_by", "popularity"),
        ];
        if let Some(genre) = genre {
            query.push(("genre", genre));
        }

        let results = match self.fetch_json(&url, &query, attempts, timeout).await {
            Some(value) => parse_search_results(&value),
            None => Vec::new(),
        };

        tracing::debug!(
            provider = %provider_key,
            content_type = %content_type,
            results = results.len(),
            "Title search completed"
        );

        results
    }

    async fn get_details(
        &self,
        content_id: &str,
        content_type: ContentType,
    ) -> Option<RawTitleDetails> {
        let url = format!(
            "{}/get/{}/id/{}",
            self.api_url,
            content_type.api_segment(),
            content_id
        );
        let query = [("country", self.country.as_str())];

        let value = self
            .fetch_json(&url, &query, self.max_retries, self.timeout)
            .await?;

        let details: RawTitleDetails = match serde_json::from_value(value) {
            Ok(details) => details,
            Err(e) => {
                tracing::warn!(error = %e, content_id = %content_id, "Undecodable detail payload");
                return None;
            }
        };

        // Error bodies come back as JSON objects without a title
        if details.title.is_empty() {
            return None;
        }

        Some(details)
    }
}

/// Pulls the `results` array out of a search payload, skipping entries that
/// do not deserialize
pub(crate) fn parse_search_results(value: &serde_json::Value) -> Vec<RawSearchItem> {
    value
        .get("results")
        .and_then(|results| results.as_array())
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| serde_json::from_value(entry.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_search_results_valid_payload() {
        let payload = serde_json::json!({
            "results": [
                {"imdbId": "tt1375666", "title": "Inception", "year": 2010},
                {"imdbId": "tt0468569", "title": "The Dark Knight", "year": 2008}
            ]
        });

        let results = parse_search_results(&payload);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].imdb_id.as_deref(), Some("tt1375666"));
        assert_eq!(results[1].title, "The Dark Knight");
    }

    #[test]
    fn test_parse_search_results_missing_results_key() {
        let payload = serde_json::json!({"message": "quota exceeded"});
        assert!(parse_search_results(&payload).is_empty());
    }

    #[test]
    fn test_parse_search_results_skips_malformed_entries() {
        let payload = serde_json::json!({
            "results": [
                {"imdbId": "tt1375666", "title": "Inception"},
                "not an object",
                {"imdbId": "tt0468569", "title": "The Dark Knight"}
            ]
        });

        let results = parse_search_results(&payload);
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn test_quick_budget_is_tighter_than_standard() {
        let api = AvailabilityApi {
            http_client: HttpClient::new(),
            api_key: "test_key".to_string(),
            api_url: "http://test.local".to_string(),
            country: "us".to_string(),
            timeout: Duration::from_secs(8),
            max_retries: 3,
        };

        let (standard_attempts, standard_timeout) = api.budget(FetchProfile::Standard);
        let (quick_attempts, quick_timeout) = api.budget(FetchProfile::Quick);

        assert_eq!(standard_attempts, 3);
        assert_eq!(standard_timeout, Duration::from_secs(8));
        assert_eq!(quick_attempts, 2);
        assert_eq!(quick_timeout, Duration::from_secs(5));
    }
}
