use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::db::{ContentStore, ModelStore, UserDirectory};
use crate::error::{AppError, AppResult};
use crate::models::{ContentItem, ContentType, RefreshMarker, UserProfile};

/// In-memory document store for tests and local development. Collections are
/// ordered by key so queries are deterministic.
#[derive(Default)]
pub struct MemoryStore {
    content: RwLock<BTreeMap<String, ContentItem>>,
    users: RwLock<BTreeMap<String, UserProfile>>,
    models: RwLock<BTreeMap<String, serde_json::Value>>,
    marker: RwLock<Option<RefreshMarker>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned(collection: &str) -> AppError {
    AppError::Internal(format!("memory store lock poisoned: {}", collection))
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn get_content(&self, id: &str) -> AppResult<Option<ContentItem>> {
        let content = self.content.read().map_err(|_| poisoned("content"))?;
        Ok(content.get(id).cloned())
    }

    async fn put_content(&self, item: &ContentItem) -> AppResult<()> {
        let mut content = self.content.write().map_err(|_| poisoned("content"))?;
        content.insert(item.id.clone(), item.clone());
        Ok(())
    }

    async fn list_content(&self, limit: usize) -> AppResult<Vec<ContentItem>> {
        let content = self.content.read().map_err(|_| poisoned("content"))?;
        Ok(content.values().take(limit).cloned().collect())
    }

    async fn query_content(
        &self,
        service_ids: &[String],
        content_type: Option<ContentType>,
        limit: usize,
    ) -> AppResult<Vec<ContentItem>> {
        let content = self.content.read().map_err(|_| poisoned("content"))?;
        Ok(content
            .values()
            .filter(|item| {
                service_ids.is_empty()
                    || item.service_ids.iter().any(|id| service_ids.contains(id))
            })
            .filter(|item| content_type.map_or(true, |t| item.content_type == t))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn top_by_rating_count(&self, limit: usize) -> AppResult<Vec<ContentItem>> {
        let content = self.content.read().map_err(|_| poisoned("content"))?;
        let mut items: Vec<ContentItem> = content.values().cloned().collect();
        items.sort_by(|a, b| b.rating_count.cmp(&a.rating_count).then(a.id.cmp(&b.id)));
        items.truncate(limit);
        Ok(items)
    }

    async fn distinct_service_ids(&self) -> AppResult<Vec<String>> {
        let content = self.content.read().map_err(|_| poisoned("content"))?;
        let mut ids: Vec<String> = content
            .values()
            .flat_map(|item| item.service_ids.clone())
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn refresh_marker(&self) -> AppResult<Option<RefreshMarker>> {
        let marker = self.marker.read().map_err(|_| poisoned("marker"))?;
        Ok(marker.clone())
    }

    async fn set_refresh_marker(&self, marker: &RefreshMarker) -> AppResult<()> {
        let mut slot = self.marker.write().map_err(|_| poisoned("marker"))?;
        *slot = Some(marker.clone());
        Ok(())
    }
}

#[async_trait]
impl UserDirectory for MemoryStore {
    async fn get_user(&self, user_id: &str) -> AppResult<Option<UserProfile>> {
        let users = self.users.read().map_err(|_| poisoned("users"))?;
        Ok(users.get(user_id).cloned())
    }

    async fn put_user(&self, profile: &UserProfile) -> AppResult<()> {
        let mut users = self.users.write().map_err(|_| poisoned("users"))?;
        users.insert(profile.id.clone(), profile.clone());
        Ok(())
    }

    async fn users_with_ratings(&self) -> AppResult<Vec<UserProfile>> {
        let users = self.users.read().map_err(|_| poisoned("users"))?;
        Ok(users
            .values()
            .filter(|user| !user.ratings.is_empty())
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ModelStore for MemoryStore {
    async fn load_model(&self, key: &str) -> AppResult<Option<serde_json::Value>> {
        let models = self.models.read().map_err(|_| poisoned("models"))?;
        Ok(models.get(key).cloned())
    }

    async fn store_model(&self, key: &str, blob: &serde_json::Value) -> AppResult<()> {
        let mut models = self.models.write().map_err(|_| poisoned("models"))?;
        models.insert(key.to_string(), blob.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn item(id: &str, content_type: ContentType, service_ids: &[&str]) -> ContentItem {
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
            service_ids: service_ids.iter().map(|s| s.to_string()).collect(),
            sources: Vec::new(),
            rating_count: 0,
            details_cached: false,
            cached_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_query_filters_by_service_intersection() {
        let store = MemoryStore::new();
        store
            .put_content(&item("tt1", ContentType::Movie, &["203"]))
            .await
            .unwrap();
        store
            .put_content(&item("tt2", ContentType::Movie, &["157"]))
            .await
            .unwrap();
        store
            .put_content(&item("tt3", ContentType::Show, &["203", "157"]))
            .await
            .unwrap();

        let matched = store
            .query_content(&["203".to_string()], None, 10)
            .await
            .unwrap();
        let ids: Vec<&str> = matched.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["tt1", "tt3"]);
    }

    #[tokio::test]
    async fn test_query_empty_filter_returns_all_types_narrowed() {
        let store = MemoryStore::new();
        store
            .put_content(&item("tt1", ContentType::Movie, &["203"]))
            .await
            .unwrap();
        store
            .put_content(&item("tt2", ContentType::Show, &["157"]))
            .await
            .unwrap();

        let shows = store
            .query_content(&[], Some(ContentType::Show), 10)
            .await
            .unwrap();
        assert_eq!(shows.len(), 1);
        assert_eq!(shows[0].id, "tt2");
    }

    #[tokio::test]
    async fn test_top_by_rating_count_orders_descending() {
        let store = MemoryStore::new();
        let mut a = item("tt1", ContentType::Movie, &["203"]);
        a.rating_count = 2;
        let mut b = item("tt2", ContentType::Movie, &["203"]);
        b.rating_count = 9;
        store.put_content(&a).await.unwrap();
        store.put_content(&b).await.unwrap();

        let top = store.top_by_rating_count(2).await.unwrap();
        assert_eq!(top[0].id, "tt2");
        assert_eq!(top[1].id, "tt1");
    }

    #[tokio::test]
    async fn test_distinct_service_ids() {
        let store = MemoryStore::new();
        store
            .put_content(&item("tt1", ContentType::Movie, &["203", "157"]))
            .await
            .unwrap();
        store
            .put_content(&item("tt2", ContentType::Show, &["203"]))
            .await
            .unwrap();

        let ids = store.distinct_service_ids().await.unwrap();
        assert_eq!(ids, vec!["157".to_string(), "203".to_string()]);
    }

    #[tokio::test]
    async fn test_users_with_ratings_excludes_unrated() {
        let store = MemoryStore::new();
        let rated = UserProfile {
            id: "u1".to_string(),
            ratings: [("tt1".to_string(), 5u8)].into_iter().collect(),
            ..Default::default()
        };
        let unrated = UserProfile {
            id: "u2".to_string(),
            ..Default::default()
        };
        store.put_user(&rated).await.unwrap();
        store.put_user(&unrated).await.unwrap();

        let users = store.users_with_ratings().await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].id, "u1");
    }
}
