/// Content cache store
///
/// Owns the cached catalog of content items and the bulk refresh protocol
/// against the upstream gateway. The gateway never writes here; all cache
/// population goes through this service.
use std::sync::Arc;

use chrono::{Duration, Utc};
use rand::seq::SliceRandom;

use crate::config::ServiceMapping;
use crate::db::ContentStore;
use crate::error::AppResult;
use crate::models::{
    validate_content_id, ContentItem, ContentType, RefreshMarker, UserProfile,
};
use crate::services::gateway::{FetchProfile, TitleApi};

/// Items transformed and cached per content type per refresh
const REFRESH_PAGE_SIZE: usize = 20;
/// Below this many cached matches, a service query triggers a refresh
const MIN_CACHED_FOR_SERVICES: usize = 10;

pub struct ContentCache {
    store: Arc<dyn ContentStore>,
    gateway: Arc<dyn TitleApi>,
    mapping: ServiceMapping,
    country: String,
    staleness: Duration,
}

impl ContentCache {
    pub fn new(
        store: Arc<dyn ContentStore>,
        gateway: Arc<dyn TitleApi>,
        mapping: ServiceMapping,
        country: String,
        staleness_hours: i64,
    ) -> Self {
        Self {
            store,
            gateway,
            mapping,
            country,
            staleness: Duration::hours(staleness_hours),
        }
    }

    /// True iff a refresh marker exists and is younger than the staleness
    /// window
    pub async fn is_fresh(&self) -> AppResult<bool> {
        Ok(match self.store.refresh_marker().await? {
            Some(marker) => Utc::now().signed_duration_since(marker.timestamp) < self.staleness,
            None => false,
        })
    }

    /// Overwrites the refresh marker with the current time
    pub async fn mark_refreshed(&self) -> AppResult<()> {
        self.store
            .set_refresh_marker(&RefreshMarker {
                timestamp: Utc::now(),
            })
            .await
    }

    /// Idempotent write keyed by id. Fields merge last-write-wins, except
    /// that parse defaults never clobber populated values and service_ids
    /// stays a set.
    pub async fn upsert(&self, item: ContentItem) -> AppResult<()> {
        let merged = match self.store.get_content(&item.id).await? {
            Some(mut existing) => {
                existing.merge_from(item);
                existing
            }
            None => {
                let mut item = item;
                item.dedup_service_ids();
                item
            }
        };
        self.store.put_content(&merged).await
    }

    /// Cached items whose service_ids intersect the filter (all items when
    /// the filter is empty), optionally narrowed by type
    pub async fn query_by_services(
        &self,
        service_ids: &[String],
        content_type: Option<ContentType>,
        limit: usize,
    ) -> AppResult<Vec<ContentItem>> {
        self.store
            .query_content(service_ids, content_type, limit)
            .await
    }

    /// Bulk refresh for the supplied services. Never raises; logs and
    /// reports success as a boolean.
    pub async fn refresh_for_services(&self, service_ids: &[String]) -> bool {
        match self.refresh_inner(service_ids, None).await {
            Ok(refreshed) => refreshed,
            Err(e) => {
                tracing::error!(error = %e, "Content refresh failed");
                false
            }
        }
    }

    /// Refresh biased by one of the user's preferred genres, chosen at
    /// random
    pub async fn refresh_for_user(&self, profile: &UserProfile) -> bool {
        let genre = {
            let mut rng = rand::thread_rng();
            profile
                .preferred_genres
                .choose(&mut rng)
                .map(|genre| genre.to_lowercase().replace(' ', "-"))
        };

        match self
            .refresh_inner(&profile.subscribed_service_ids, genre.as_deref())
            .await
        {
            Ok(refreshed) => refreshed,
            Err(e) => {
                tracing::error!(error = %e, user_id = %profile.id, "Content refresh failed");
                false
            }
        }
    }

    async fn refresh_inner(&self, service_ids: &[String], genre: Option<&str>) -> AppResult<bool> {
        if self.is_fresh().await? {
            tracing::debug!("Content cache is fresh, skipping refresh");
            return Ok(true);
        }

        // Refreshing every service in one call risks timeout cascades, so a
        // multi-service request refreshes exactly one, chosen at random.
        let chosen: Vec<String> = if service_ids.len() > 1 {
            let pick = {
                let mut rng = rand::thread_rng();
                service_ids.choose(&mut rng).cloned()
            };
            match pick {
                Some(service_id) => {
                    tracing::info!(
                        service_id = %service_id,
                        supplied = service_ids.len(),
                        "Multiple services supplied, refreshing one"
                    );
                    vec![service_id]
                }
                None => Vec::new(),
            }
        } else {
            service_ids.to_vec()
        };

        let providers = self.mapping.provider_keys_for(&chosen);
        let Some(provider) = providers.first() else {
            tracing::warn!("No mapped streaming services to refresh");
            return Ok(false);
        };

        let movies = self
            .gateway
            .search_popular(provider, ContentType::Movie, genre, 1, FetchProfile::Standard)
            .await;

        let mut cached_movies = 0usize;
        for raw in movies.iter().take(REFRESH_PAGE_SIZE) {
            if let Some(item) = raw
                .clone()
                .into_item(ContentType::Movie, &self.mapping, &self.country)
            {
                self.upsert(item).await?;
                cached_movies += 1;
            }
        }

        // Shows are only worth a second upstream call if the movie fetch
        // proved the provider reachable.
        let mut cached_shows = 0usize;
        if !movies.is_empty() {
            let shows = self
                .gateway
                .search_popular(provider, ContentType::Show, genre, 1, FetchProfile::Standard)
                .await;

            for raw in shows.iter().take(REFRESH_PAGE_SIZE) {
                if let Some(item) = raw
                    .clone()
                    .into_item(ContentType::Show, &self.mapping, &self.country)
                {
                    self.upsert(item).await?;
                    cached_shows += 1;
                }
            }
        }

        // Fresh-but-empty is a valid terminal state; marking it prevents a
        // refresh storm against a failing upstream.
        self.mark_refreshed().await?;

        tracing::info!(
            provider = %provider,
            movies = cached_movies,
            shows = cached_shows,
            "Content refresh complete"
        );
        Ok(true)
    }

    /// Cached content for the given services, refreshing once when the cache
    /// is thin. Read path: degrades to whatever is available.
    pub async fn get_content_for_services(
        &self,
        service_ids: &[String],
        content_type: Option<ContentType>,
        limit: usize,
    ) -> Vec<ContentItem> {
        let first = match self
            .query_by_services(service_ids, content_type, limit)
            .await
        {
            Ok(items) => items,
            Err(e) => {
                tracing::error!(error = %e, "Content query failed");
                return Vec::new();
            }
        };

        if first.len() >= MIN_CACHED_FOR_SERVICES || service_ids.is_empty() {
            return first;
        }

        tracing::info!(
            cached = first.len(),
            "Not enough cached content, refreshing"
        );
        self.refresh_for_services(service_ids).await;

        match self
            .query_by_services(service_ids, content_type, limit)
            .await
        {
            Ok(items) => items,
            Err(e) => {
                tracing::error!(error = %e, "Content re-query failed");
                first
            }
        }
    }

    /// Detailed record for one item. Served from cache when details are
    /// already populated; otherwise fetched upstream once, merged into the
    /// cache and returned. Malformed ids are rejected outright.
    pub async fn get_content_details(&self, content_id: &str) -> AppResult<Option<ContentItem>> {
        validate_content_id(content_id)?;

        let cached = self.store.get_content(content_id).await?;
        if let Some(item) = &cached {
            if item.details_cached {
                return Ok(cached);
            }
        }

        match cached {
            Some(stub) => {
                match self.gateway.get_details(content_id, stub.content_type).await {
                    Some(details) => {
                        let item = details.into_item(
                            content_id,
                            stub.content_type,
                            &self.mapping,
                            &self.country,
                        );
                        self.upsert(item).await?;
                        self.store.get_content(content_id).await
                    }
                    None => {
                        tracing::warn!(content_id = %content_id, "Detail fetch failed, serving stub");
                        Ok(Some(stub))
                    }
                }
            }
            None => {
                // Unknown id: the type is unknown too, so probe movie first,
                // then show.
                for content_type in [ContentType::Movie, ContentType::Show] {
                    if let Some(details) =
                        self.gateway.get_details(content_id, content_type).await
                    {
                        let item = details.into_item(
                            content_id,
                            content_type,
                            &self.mapping,
                            &self.country,
                        );
                        self.upsert(item).await?;
                        return self.store.get_content(content_id).await;
                    }
                }
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::models::{RawSearchItem, RawTitleDetails};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scripted gateway that records which providers were queried
    #[derive(Default)]
    struct ScriptedApi {
        search_results: HashMap<(String, ContentType), Vec<RawSearchItem>>,
        details: HashMap<String, RawTitleDetails>,
        search_calls: Mutex<Vec<String>>,
        detail_calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl TitleApi for ScriptedApi {
        async fn search_popular(
            &self,
            provider_key: &str,
            content_type: ContentType,
            _genre: Option<&str>,
            _page: u32,
            _profile: FetchProfile,
        ) -> Vec<RawSearchItem> {
            self.search_calls
                .lock()
                .unwrap()
                .push(provider_key.to_string());
            self.search_results
                .get(&(provider_key.to_string(), content_type))
                .cloned()
                .unwrap_or_default()
        }

        async fn get_details(
            &self,
            content_id: &str,
            _content_type: ContentType,
        ) -> Option<RawTitleDetails> {
            self.detail_calls.fetch_add(1, Ordering::SeqCst);
            self.details.get(content_id).cloned()
        }
    }

    fn raw_item(id: &str) -> RawSearchItem {
        RawSearchItem {
            imdb_id: Some(id.to_string()),
            title: format!("Title {}", id),
            year: Some(2020),
            ..Default::default()
        }
    }

    fn cache_with(store: Arc<MemoryStore>, api: Arc<ScriptedApi>) -> ContentCache {
        ContentCache::new(
            store,
            api,
            ServiceMapping::default_table(),
            "us".to_string(),
            24,
        )
    }

    #[tokio::test]
    async fn test_is_fresh_false_without_marker() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_with(store, Arc::new(ScriptedApi::default()));
        assert!(!cache.is_fresh().await.unwrap());
    }

    #[tokio::test]
    async fn test_is_fresh_false_after_staleness_window() {
        let store = Arc::new(MemoryStore::new());
        store
            .set_refresh_marker(&RefreshMarker {
                timestamp: Utc::now() - Duration::hours(25),
            })
            .await
            .unwrap();

        let cache = cache_with(store, Arc::new(ScriptedApi::default()));
        assert!(!cache.is_fresh().await.unwrap());
    }

    #[tokio::test]
    async fn test_is_fresh_true_within_window() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_with(store, Arc::new(ScriptedApi::default()));
        cache.mark_refreshed().await.unwrap();
        assert!(cache.is_fresh().await.unwrap());
    }

    #[tokio::test]
    async fn test_upsert_keeps_service_ids_a_set() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_with(store.clone(), Arc::new(ScriptedApi::default()));

        let mapping = ServiceMapping::default_table();
        for _ in 0..3 {
            let mut raw = raw_item("tt1");
            raw.streaming_info.insert(
                "us".to_string(),
                [("netflix".to_string(), Vec::new())].into_iter().collect(),
            );
            let item = raw.into_item(ContentType::Movie, &mapping, "us").unwrap();
            cache.upsert(item).await.unwrap();
        }

        let stored = store.get_content("tt1").await.unwrap().unwrap();
        assert_eq!(stored.service_ids, vec!["203".to_string()]);
    }

    #[tokio::test]
    async fn test_refresh_touches_one_service_for_multiple_ids() {
        let mut api = ScriptedApi::default();
        for provider in ["netflix", "hulu"] {
            api.search_results.insert(
                (provider.to_string(), ContentType::Movie),
                vec![raw_item(&format!("tt-m-{}", provider))],
            );
            api.search_results.insert(
                (provider.to_string(), ContentType::Show),
                vec![raw_item(&format!("tt-s-{}", provider))],
            );
        }
        let api = Arc::new(api);
        let store = Arc::new(MemoryStore::new());
        let cache = cache_with(store, api.clone());

        let refreshed = cache
            .refresh_for_services(&["203".to_string(), "157".to_string()])
            .await;
        assert!(refreshed);

        let calls = api.search_calls.lock().unwrap();
        // One movie fetch plus one show fetch, both against the same provider
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], calls[1]);
    }

    #[tokio::test]
    async fn test_refresh_skips_shows_when_movies_empty() {
        let api = Arc::new(ScriptedApi::default());
        let store = Arc::new(MemoryStore::new());
        let cache = cache_with(store.clone(), api.clone());

        let refreshed = cache.refresh_for_services(&["203".to_string()]).await;

        // Empty movie page means no show fetch, but the marker still lands so
        // a failing upstream cannot cause a refresh storm.
        assert!(refreshed);
        assert_eq!(api.search_calls.lock().unwrap().len(), 1);
        assert!(store.refresh_marker().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_refresh_skips_entirely_when_fresh() {
        let api = Arc::new(ScriptedApi::default());
        let store = Arc::new(MemoryStore::new());
        let cache = cache_with(store, api.clone());
        cache.mark_refreshed().await.unwrap();

        assert!(cache.refresh_for_services(&["203".to_string()]).await);
        assert!(api.search_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_without_mapped_services_reports_failure() {
        let api = Arc::new(ScriptedApi::default());
        let store = Arc::new(MemoryStore::new());
        let cache = cache_with(store.clone(), api);

        assert!(!cache.refresh_for_services(&["999".to_string()]).await);
        assert!(store.refresh_marker().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_details_round_trip_fetches_upstream_once() {
        let mut api = ScriptedApi::default();
        api.details.insert(
            "tt1".to_string(),
            RawTitleDetails {
                title: "Title tt1".to_string(),
                runtime: 120,
                genres: vec![crate::models::RawNamed {
                    name: "Drama".to_string(),
                }],
                streaming_info: [(
                    "us".to_string(),
                    [(
                        "netflix".to_string(),
                        vec![crate::models::RawStreamOption {
                            option_type: "subscription".to_string(),
                            link: "https://netflix.test/tt1".to_string(),
                        }],
                    )]
                    .into_iter()
                    .collect(),
                )]
                .into_iter()
                .collect(),
                ..Default::default()
            },
        );
        let api = Arc::new(api);
        let store = Arc::new(MemoryStore::new());
        let cache = cache_with(store.clone(), api.clone());

        let mapping = ServiceMapping::default_table();
        let stub = raw_item("tt1")
            .into_item(ContentType::Movie, &mapping, "us")
            .unwrap();
        cache.upsert(stub).await.unwrap();

        let first = cache.get_content_details("tt1").await.unwrap().unwrap();
        assert!(first.details_cached);
        assert_eq!(first.sources.len(), 1);
        assert_eq!(api.detail_calls.load(Ordering::SeqCst), 1);

        let second = cache.get_content_details("tt1").await.unwrap().unwrap();
        assert!(second.details_cached);
        assert_eq!(api.detail_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_details_rejects_malformed_id() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_with(store, Arc::new(ScriptedApi::default()));
        assert!(cache.get_content_details("tt1/../x").await.is_err());
        assert!(cache.get_content_details("").await.is_err());
    }

    #[tokio::test]
    async fn test_details_for_unknown_id_probes_both_types() {
        let api = Arc::new(ScriptedApi::default());
        let store = Arc::new(MemoryStore::new());
        let cache = cache_with(store, api.clone());

        let missing = cache.get_content_details("tt404").await.unwrap();
        assert!(missing.is_none());
        assert_eq!(api.detail_calls.load(Ordering::SeqCst), 2);
    }
}
