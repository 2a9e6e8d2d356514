use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ServiceMapping;
use crate::error::{AppError, AppResult};

/// Certification used when the upstream omits one
pub const NOT_RATED: &str = "Not Rated";

/// Type of content
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Movie,
    Show,
}

impl ContentType {
    /// Path segment the upstream API expects for this type
    pub fn api_segment(&self) -> &'static str {
        match self {
            ContentType::Movie => "movie",
            ContentType::Show => "series",
        }
    }
}

impl Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContentType::Movie => write!(f, "movie"),
            ContentType::Show => write!(f, "show"),
        }
    }
}

/// A single watch option on one subscription service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchSource {
    pub service_id: String,
    pub provider: String,
    pub option_type: String,
    pub link: String,
}

/// Canonical internal representation of a streaming movie or show
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContentItem {
    /// Canonical external identifier (IMDb-style string)
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub release_year: Option<i32>,
    pub content_type: ContentType,
    #[serde(default)]
    pub runtime_minutes: u32,
    #[serde(default = "default_certification")]
    pub rating_certification: String,
    #[serde(default)]
    pub poster_url: String,
    #[serde(default)]
    pub plot_overview: String,
    #[serde(default)]
    pub genre_names: Vec<String>,
    #[serde(default)]
    pub cast: Vec<String>,
    #[serde(default)]
    pub directors: Vec<String>,
    /// Subscription services offering this item. Set semantics: no duplicates.
    #[serde(default)]
    pub service_ids: Vec<String>,
    #[serde(default)]
    pub sources: Vec<WatchSource>,
    /// Popularity signal used by recommendation fallbacks
    #[serde(default)]
    pub rating_count: u32,
    /// True once a detail fetch populated sources, genres and cast
    #[serde(default)]
    pub details_cached: bool,
    pub cached_at: DateTime<Utc>,
}

fn default_certification() -> String {
    NOT_RATED.to_string()
}

impl ContentItem {
    /// Field-level merge for cache upserts. Fields the incoming record does
    /// not carry (still at their parse defaults) keep the stored value, so a
    /// search stub never erases data from an earlier detail fetch.
    pub fn merge_from(&mut self, incoming: ContentItem) {
        if !incoming.title.is_empty() {
            self.title = incoming.title;
        }
        if incoming.release_year.is_some() {
            self.release_year = incoming.release_year;
        }
        self.content_type = incoming.content_type;
        if incoming.runtime_minutes != 0 {
            self.runtime_minutes = incoming.runtime_minutes;
        }
        if incoming.rating_certification != NOT_RATED {
            self.rating_certification = incoming.rating_certification;
        }
        if !incoming.poster_url.is_empty() {
            self.poster_url = incoming.poster_url;
        }
        if !incoming.plot_overview.is_empty() {
            self.plot_overview = incoming.plot_overview;
        }
        if !incoming.genre_names.is_empty() {
            self.genre_names = incoming.genre_names;
        }
        if !incoming.cast.is_empty() {
            self.cast = incoming.cast;
        }
        if !incoming.directors.is_empty() {
            self.directors = incoming.directors;
        }
        if !incoming.sources.is_empty() {
            self.sources = incoming.sources;
        }
        for service_id in incoming.service_ids {
            if !self.service_ids.contains(&service_id) {
                self.service_ids.push(service_id);
            }
        }
        self.rating_count = self.rating_count.max(incoming.rating_count);
        self.details_cached = self.details_cached || incoming.details_cached;
        self.cached_at = incoming.cached_at;
    }

    /// Drops duplicate service ids, preserving first-seen order
    pub fn dedup_service_ids(&mut self) {
        let mut seen = HashSet::new();
        self.service_ids.retain(|id| seen.insert(id.clone()));
    }
}

/// A content item with the score a recommender assigned to it. Popularity
/// fallbacks carry no score.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredContent {
    #[serde(flatten)]
    pub item: ContentItem,
    pub similarity_score: Option<f64>,
}

/// Singleton record tracking the last bulk cache refresh
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RefreshMarker {
    pub timestamp: DateTime<Utc>,
}

/// User profile owned by the auth collaborator, consumed read-only here
/// except for like/dislike and rating writes
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UserProfile {
    pub id: String,
    #[serde(default)]
    pub subscribed_service_ids: Vec<String>,
    /// contentId -> rating on a 1-5 scale
    #[serde(default)]
    pub ratings: HashMap<String, u8>,
    #[serde(default)]
    pub liked_content_ids: Vec<String>,
    #[serde(default)]
    pub disliked_content_ids: Vec<String>,
    #[serde(default)]
    pub preferred_genres: Vec<String>,
}

impl UserProfile {
    /// Ids the user has already reacted to in the discovery feed
    pub fn seen_content(&self) -> HashSet<String> {
        self.liked_content_ids
            .iter()
            .chain(self.disliked_content_ids.iter())
            .cloned()
            .collect()
    }

    /// Ids the user rated 4 stars or higher
    pub fn highly_rated(&self) -> Vec<&str> {
        self.ratings
            .iter()
            .filter(|(_, rating)| **rating >= 4)
            .map(|(id, _)| id.as_str())
            .collect()
    }
}

/// Discovery feed reaction
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Preference {
    Like,
    Dislike,
}

/// Rejects ids that cannot be valid upstream identifiers
pub fn validate_content_id(id: &str) -> AppResult<()> {
    if id.is_empty() {
        return Err(AppError::InvalidInput("content id is empty".to_string()));
    }
    if id.chars().any(|c| c.is_whitespace() || c.is_control() || c == '/') {
        return Err(AppError::InvalidInput(format!(
            "malformed content id: {:?}",
            id
        )));
    }
    Ok(())
}

// ============================================================================
// Upstream Title API Payloads
// ============================================================================

/// Poster variants offered by the upstream API
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PosterUrls {
    #[serde(default)]
    pub original: Option<String>,
    #[serde(rename = "500", default)]
    pub size_500: Option<String>,
}

impl PosterUrls {
    /// Prefers the original poster, then the 500px variant
    pub fn best(&self) -> String {
        self.original
            .clone()
            .filter(|url| !url.is_empty())
            .or_else(|| self.size_500.clone())
            .unwrap_or_default()
    }
}

/// Named entity in a detail payload (genre, cast or crew entry)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawNamed {
    #[serde(default)]
    pub name: String,
}

/// One watch option inside `streamingInfo[region][provider]`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawStreamOption {
    #[serde(rename = "type", default)]
    pub option_type: String,
    #[serde(default)]
    pub link: String,
}

/// region -> provider -> watch options
pub type RawStreamingInfo = BTreeMap<String, BTreeMap<String, Vec<RawStreamOption>>>;

/// Raw search result from the title availability API
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawSearchItem {
    #[serde(rename = "imdbId", default)]
    pub imdb_id: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub runtime: u32,
    #[serde(default)]
    pub rating: Option<String>,
    #[serde(rename = "posterURLs", default)]
    pub poster_urls: PosterUrls,
    #[serde(default)]
    pub overview: String,
    #[serde(rename = "streamingInfo", default)]
    pub streaming_info: RawStreamingInfo,
}

impl RawSearchItem {
    /// Canonicalizes a search stub. Items without an IMDb id are unusable
    /// and dropped.
    pub fn into_item(
        self,
        content_type: ContentType,
        mapping: &ServiceMapping,
        country: &str,
    ) -> Option<ContentItem> {
        let id = self.imdb_id.filter(|id| !id.is_empty())?;
        let service_ids = service_ids_in_region(&self.streaming_info, mapping, country);

        Some(ContentItem {
            id,
            title: self.title,
            release_year: self.year,
            content_type,
            runtime_minutes: self.runtime,
            rating_certification: self.rating.unwrap_or_else(default_certification),
            poster_url: self.poster_urls.best(),
            plot_overview: self.overview,
            genre_names: Vec::new(),
            cast: Vec::new(),
            directors: Vec::new(),
            service_ids,
            sources: Vec::new(),
            rating_count: 0,
            details_cached: false,
            cached_at: Utc::now(),
        })
    }
}

/// Raw detail payload from the title availability API
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawTitleDetails {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub runtime: u32,
    #[serde(default)]
    pub rating: Option<String>,
    #[serde(rename = "posterURLs", default)]
    pub poster_urls: PosterUrls,
    #[serde(default)]
    pub overview: String,
    #[serde(default)]
    pub genres: Vec<RawNamed>,
    #[serde(default)]
    pub cast: Vec<RawNamed>,
    #[serde(default)]
    pub directors: Vec<RawNamed>,
    #[serde(rename = "streamingInfo", default)]
    pub streaming_info: RawStreamingInfo,
}

impl RawTitleDetails {
    /// Canonicalizes a detail payload for the given id. The result carries
    /// `details_cached = true` and populated watch sources.
    pub fn into_item(
        self,
        id: &str,
        content_type: ContentType,
        mapping: &ServiceMapping,
        country: &str,
    ) -> ContentItem {
        let mut service_ids = Vec::new();
        let mut sources = Vec::new();
        if let Some(per_provider) = self.streaming_info.get(country) {
            for (provider, options) in per_provider {
                let Some(service_id) = mapping.service_id(provider) else {
                    continue;
                };
                if !service_ids.contains(&service_id.to_string()) {
                    service_ids.push(service_id.to_string());
                }
                for option in options {
                    sources.push(WatchSource {
                        service_id: service_id.to_string(),
                        provider: provider.clone(),
                        option_type: option.option_type.clone(),
                        link: option.link.clone(),
                    });
                }
            }
        }

        ContentItem {
            id: id.to_string(),
            title: self.title,
            release_year: self.year,
            content_type,
            runtime_minutes: self.runtime,
            rating_certification: self.rating.unwrap_or_else(default_certification),
            poster_url: self.poster_urls.best(),
            plot_overview: self.overview,
            genre_names: named(self.genres),
            cast: named(self.cast),
            directors: named(self.directors),
            service_ids,
            sources,
            rating_count: 0,
            details_cached: true,
            cached_at: Utc::now(),
        }
    }
}

fn named(entries: Vec<RawNamed>) -> Vec<String> {
    entries
        .into_iter()
        .map(|entry| entry.name)
        .filter(|name| !name.is_empty())
        .collect()
}

/// Internal service ids offering an item in the given region
fn service_ids_in_region(
    info: &RawStreamingInfo,
    mapping: &ServiceMapping,
    country: &str,
) -> Vec<String> {
    let mut ids = Vec::new();
    if let Some(per_provider) = info.get(country) {
        for provider in per_provider.keys() {
            if let Some(service_id) = mapping.service_id(provider) {
                if !ids.contains(&service_id.to_string()) {
                    ids.push(service_id.to_string());
                }
            }
        }
    }
    ids
}
