/// Discovery selector
///
/// Serves one item at a time for the swipe-style discovery feed. Selection
/// walks a fixed ladder of tiers, each catching its own failures and falling
/// through, so a read never surfaces an error: typed cache query, broad cache
/// query, live upstream search, untargeted cache query, and finally a small
/// built-in list. None comes back only when no tier has any data at all.
use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use rand::seq::SliceRandom;

use crate::config::ServiceMapping;
use crate::models::{ContentItem, ContentType};
use crate::services::content_cache::ContentCache;
use crate::services::gateway::{FetchProfile, TitleApi};

/// Retries the caller loop spends on an already-seen pick
const SEEN_RETRIES: usize = 5;
/// Cache results above this count are considered enough to pick from
const BROAD_QUERY_MIN: usize = 5;

const TYPED_QUERY_LIMIT: usize = 50;
const BROAD_QUERY_LIMIT: usize = 100;
const FALLBACK_QUERY_LIMIT: usize = 30;

pub struct DiscoverySelector {
    cache: Arc<ContentCache>,
    gateway: Arc<dyn TitleApi>,
    mapping: ServiceMapping,
    country: String,
}

impl DiscoverySelector {
    pub fn new(
        cache: Arc<ContentCache>,
        gateway: Arc<dyn TitleApi>,
        mapping: ServiceMapping,
        country: String,
    ) -> Self {
        Self {
            cache,
            gateway,
            mapping,
            country,
        }
    }

    /// One discovery candidate for the user, or None when no content exists
    /// anywhere
    pub async fn get_discover_content(&self, user_service_ids: &[String]) -> Option<ContentItem> {
        let mut content_types_seen: Vec<ContentType> = Vec::new();

        if !user_service_ids.is_empty() {
            // Tier 1: type-filtered cache queries, each type attempted with a
            // coin flip so movies and shows alternate over a session.
            let mut order = [ContentType::Movie, ContentType::Show];
            {
                let mut rng = rand::thread_rng();
                order.shuffle(&mut rng);
            }
            for content_type in order {
                if !rand::random::<bool>() {
                    continue;
                }
                if let Ok(items) = self
                    .cache
                    .query_by_services(user_service_ids, Some(content_type), TYPED_QUERY_LIMIT)
                    .await
                {
                    if let Some(item) = choose(&items) {
                        content_types_seen.push(content_type);
                        return Some(item);
                    }
                }
            }

            // Tier 2: any type, as long as the pool is big enough to vary
            if let Ok(items) = self
                .cache
                .query_by_services(user_service_ids, None, BROAD_QUERY_LIMIT)
                .await
            {
                if items.len() > BROAD_QUERY_MIN {
                    if let Some(item) = choose(&items) {
                        return Some(item);
                    }
                }
            }

            // Tier 3: live upstream search against one of the user's
            // services, low retry budget
            if let Some(item) = self
                .live_fetch(user_service_ids, &mut content_types_seen)
                .await
            {
                return Some(item);
            }
        }

        // Tier 4: untargeted cache sample, typed first, then anything
        let typed = {
            let mut rng = rand::thread_rng();
            *[ContentType::Movie, ContentType::Show]
                .choose(&mut rng)
                .unwrap_or(&ContentType::Movie)
        };
        if let Ok(items) = self
            .cache
            .query_by_services(&[], Some(typed), FALLBACK_QUERY_LIMIT)
            .await
        {
            if let Some(item) = choose(&items) {
                return Some(item);
            }
        }
        if let Ok(items) = self
            .cache
            .query_by_services(&[], None, FALLBACK_QUERY_LIMIT)
            .await
        {
            if let Some(item) = choose(&items) {
                return Some(item);
            }
        }

        // Tier 5: built-in defaults, biased toward the type not yet shown
        self.fallback_pick(user_service_ids, &content_types_seen)
    }

    /// Re-queries for the user until the pick is outside their seen set, up
    /// to a bounded number of attempts
    pub async fn next_unseen(
        &self,
        user_service_ids: &[String],
        seen: &HashSet<String>,
    ) -> Option<ContentItem> {
        let mut candidate = self.get_discover_content(user_service_ids).await;

        if let Some(item) = &candidate {
            if seen.contains(&item.id) {
                for _ in 0..SEEN_RETRIES {
                    if let Some(retry) = self.get_discover_content(user_service_ids).await {
                        if !seen.contains(&retry.id) {
                            candidate = Some(retry);
                            break;
                        }
                    }
                }
            }
        }

        candidate
    }

    async fn live_fetch(
        &self,
        user_service_ids: &[String],
        content_types_seen: &mut Vec<ContentType>,
    ) -> Option<ContentItem> {
        let providers = self.mapping.provider_keys_for(user_service_ids);
        let provider = {
            let mut rng = rand::thread_rng();
            providers.choose(&mut rng).cloned()
        }?;

        let mut order = [ContentType::Movie, ContentType::Show];
        {
            let mut rng = rand::thread_rng();
            order.shuffle(&mut rng);
        }

        for content_type in order {
            let results = self
                .gateway
                .search_popular(&provider, content_type, None, 1, FetchProfile::Quick)
                .await;

            let Some(raw) = results.into_iter().next() else {
                continue;
            };
            let Some(mut item) = raw.into_item(content_type, &self.mapping, &self.country) else {
                continue;
            };

            // Search pages do not always carry availability, but the item
            // was found by querying this provider.
            if item.service_ids.is_empty() {
                if let Some(service_id) = self.mapping.service_id(&provider) {
                    item.service_ids.push(service_id.to_string());
                }
            }

            if let Err(e) = self.cache.upsert(item.clone()).await {
                tracing::warn!(error = %e, content_id = %item.id, "Failed to cache live pick");
            }

            content_types_seen.push(content_type);
            return Some(item);
        }

        None
    }

    fn fallback_pick(
        &self,
        user_service_ids: &[String],
        content_types_seen: &[ContentType],
    ) -> Option<ContentItem> {
        let fallbacks = default_fallbacks(user_service_ids);
        let movies: Vec<&ContentItem> = fallbacks
            .iter()
            .filter(|item| item.content_type == ContentType::Movie)
            .collect();
        let shows: Vec<&ContentItem> = fallbacks
            .iter()
            .filter(|item| item.content_type == ContentType::Show)
            .collect();

        let pool = if content_types_seen.is_empty() {
            if rand::random::<bool>() {
                &movies
            } else {
                &shows
            }
        } else if content_types_seen.contains(&ContentType::Movie) {
            &shows
        } else {
            &movies
        };

        let pick = {
            let mut rng = rand::thread_rng();
            pool.choose(&mut rng).copied().cloned()
        };
        // A type-biased pool can only be empty if the whole list is
        pick.or_else(|| {
            let mut rng = rand::thread_rng();
            fallbacks.choose(&mut rng).cloned()
        })
    }
}

fn choose(items: &[ContentItem]) -> Option<ContentItem> {
    let mut rng = rand::thread_rng();
    items.choose(&mut rng).cloned()
}

/// Last-resort picks when the cache and upstream are both empty
fn default_fallbacks(user_service_ids: &[String]) -> Vec<ContentItem> {
    let entries: [(&str, &str, i32, ContentType, u32, &str, &str); 5] = [
        (
            "tt0111161",
            "The Shawshank Redemption",
            1994,
            ContentType::Movie,
            142,
            "R",
            "Two imprisoned men bond over a number of years, finding solace and eventual redemption through acts of common decency.",
        ),
        (
            "tt0068646",
            "The Godfather",
            1972,
            ContentType::Movie,
            175,
            "R",
            "The aging patriarch of an organized crime dynasty transfers control of his clandestine empire to his reluctant son.",
        ),
        (
            "tt0944947",
            "Game of Thrones",
            2011,
            ContentType::Show,
            60,
            "TV-MA",
            "Nine noble families fight for control over the lands of Westeros, while an ancient enemy returns after being dormant for millennia.",
        ),
        (
            "tt0108778",
            "Friends",
            1994,
            ContentType::Show,
            22,
            "TV-14",
            "Follows the personal and professional lives of six twenty to thirty-something-year-old friends living in Manhattan.",
        ),
        (
            "tt0455275",
            "The Office",
            2005,
            ContentType::Show,
            22,
            "TV-14",
            "A mockumentary on a group of typical office workers, where the workday consists of ego clashes, inappropriate behavior, and tedium.",
        ),
    ];

    entries
        .into_iter()
        .map(
            |(id, title, year, content_type, runtime, certification, overview)| ContentItem {
                id: id.to_string(),
                title: title.to_string(),
                release_year: Some(year),
                content_type,
                runtime_minutes: runtime,
                rating_certification: certification.to_string(),
                poster_url: String::new(),
                plot_overview: overview.to_string(),
                genre_names: Vec::new(),
                cast: Vec::new(),
                directors: Vec::new(),
                service_ids: user_service_ids.to_vec(),
                sources: Vec::new(),
                rating_count: 0,
                details_cached: false,
                cached_at: Utc::now(),
            },
        )
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ContentStore, MemoryStore};
    use crate::models::{RawSearchItem, RawTitleDetails};
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedApi {
        search_results: HashMap<ContentType, Vec<RawSearchItem>>,
        search_calls: Mutex<usize>,
    }

    #[async_trait::async_trait]
    impl TitleApi for ScriptedApi {
        async fn search_popular(
            &self,
            _provider_key: &str,
            content_type: ContentType,
            _genre: Option<&str>,
            _page: u32,
            _profile: FetchProfile,
        ) -> Vec<RawSearchItem> {
            *self.search_calls.lock().unwrap() += 1;
            self.search_results
                .get(&content_type)
                .cloned()
                .unwrap_or_default()
        }

        async fn get_details(
            &self,
            _content_id: &str,
            _content_type: ContentType,
        ) -> Option<RawTitleDetails> {
            None
        }
    }

    fn selector(store: Arc<MemoryStore>, api: Arc<ScriptedApi>) -> DiscoverySelector {
        let mapping = ServiceMapping::default_table();
        let cache = Arc::new(ContentCache::new(
            store,
            api.clone(),
            mapping.clone(),
            "us".to_string(),
            24,
        ));
        DiscoverySelector::new(cache, api, mapping, "us".to_string())
    }

    fn cached_item(id: &str, content_type: ContentType) -> ContentItem {
        ContentItem {
            id: id.to_string(),
            title: format!("Title {}", id),
            release_year: Some(2020),
            content_type,
            runtime_minutes: 100,
            rating_certification: "PG".to_string(),
            poster_url: String::new(),
            plot_overview: String::new(),
            genre_names: Vec::new(),
            cast: Vec::new(),
            directors: Vec::new(),
            service_ids: vec!["203".to_string()],
            sources: Vec::new(),
            rating_count: 0,
            details_cached: false,
            cached_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_returns_cached_item_for_user_services() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..8 {
            store
                .put_content(&cached_item(&format!("tt{}", i), ContentType::Movie))
                .await
                .unwrap();
        }
        let selector = selector(store, Arc::new(ScriptedApi::default()));

        let pick = selector
            .get_discover_content(&["203".to_string()])
            .await
            .unwrap();
        assert!(pick.id.starts_with("tt"));
        assert_eq!(pick.service_ids, vec!["203".to_string()]);
    }

    #[tokio::test]
    async fn test_live_fetch_caches_and_returns_first_result() {
        let mut api = ScriptedApi::default();
        let raw = RawSearchItem {
            imdb_id: Some("tt9999".to_string()),
            title: "Fresh Pick".to_string(),
            year: Some(2024),
            ..Default::default()
        };
        api.search_results.insert(ContentType::Movie, vec![raw.clone()]);
        api.search_results.insert(ContentType::Show, vec![raw]);
        let api = Arc::new(api);

        let store = Arc::new(MemoryStore::new());
        let selector = selector(store.clone(), api);

        // Empty cache for the user's services forces the live tier. The pick
        // has to land in the cache too.
        let pick = selector
            .get_discover_content(&["203".to_string()])
            .await
            .unwrap();
        assert_eq!(pick.id, "tt9999");
        assert_eq!(pick.service_ids, vec!["203".to_string()]);
        assert!(store.get_content("tt9999").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_everything_empty_falls_back_to_defaults() {
        let store = Arc::new(MemoryStore::new());
        let selector = selector(store, Arc::new(ScriptedApi::default()));

        let pick = selector.get_discover_content(&[]).await.unwrap();
        let fallback_ids: Vec<String> = default_fallbacks(&[])
            .into_iter()
            .map(|item| item.id)
            .collect();
        assert!(fallback_ids.contains(&pick.id));
    }

    #[tokio::test]
    async fn test_default_fallbacks_cover_both_types() {
        let fallbacks = default_fallbacks(&[]);
        let movies = fallbacks
            .iter()
            .filter(|i| i.content_type == ContentType::Movie)
            .count();
        let shows = fallbacks
            .iter()
            .filter(|i| i.content_type == ContentType::Show)
            .count();
        assert!(movies >= 2);
        assert!(shows >= 2);
    }

    #[tokio::test]
    async fn test_next_unseen_avoids_seen_ids() {
        let store = Arc::new(MemoryStore::new());
        // One seen item among plenty of unseen ones
        store
            .put_content(&cached_item("tt-seen", ContentType::Movie))
            .await
            .unwrap();
        for i in 0..11 {
            store
                .put_content(&cached_item(&format!("tt-new-{}", i), ContentType::Movie))
                .await
                .unwrap();
        }
        let selector = selector(store, Arc::new(ScriptedApi::default()));

        let seen: HashSet<String> = ["tt-seen".to_string()].into_iter().collect();
        for _ in 0..10 {
            let pick = selector
                .next_unseen(&["203".to_string()], &seen)
                .await
                .unwrap();
            assert_ne!(pick.id, "tt-seen");
        }
    }
}
