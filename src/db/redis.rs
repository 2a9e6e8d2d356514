use async_trait::async_trait;
use redis::{AsyncCommands, Client};

use crate::db::{ContentStore, ModelStore, UserDirectory};
use crate::error::{AppError, AppResult};
use crate::models::{ContentItem, ContentType, RefreshMarker, UserProfile};

/// Hash holding content items, keyed by content id
const CONTENT_HASH: &str = "content";
/// Hash holding user profiles, keyed by user id
const USERS_HASH: &str = "users";
/// Hash holding persisted model snapshots, keyed by model name
const MODELS_HASH: &str = "models";
/// Singleton key for the bulk refresh marker
const REFRESH_MARKER_KEY: &str = "meta:last_refresh";

/// Creates a Redis client for the document store
///
/// Uses connection pooling via the connection-manager feature.
pub fn create_redis_client(redis_url: &str) -> anyhow::Result<Client> {
    let client = Client::open(redis_url)?;
    Ok(client)
}

/// Document store backed by Redis. Each collection is one hash of JSON
/// documents; filters and distinct queries are evaluated client-side, which
/// is acceptable because the content cache is bounded by the refresh policy.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
}

impl RedisStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn hash_values<T: serde::de::DeserializeOwned>(&self, hash: &str) -> AppResult<Vec<T>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let raw: Vec<String> = conn.hvals(hash).await?;

        let mut values = Vec::with_capacity(raw.len());
        for json in raw {
            match serde_json::from_str(&json) {
                Ok(value) => values.push(value),
                Err(e) => {
                    tracing::warn!(error = %e, hash = %hash, "Skipping undecodable document")
                }
            }
        }
        Ok(values)
    }

    async fn hash_get<T: serde::de::DeserializeOwned>(
        &self,
        hash: &str,
        key: &str,
    ) -> AppResult<Option<T>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let raw: Option<String> = conn.hget(hash, key).await?;

        match raw {
            Some(json) => {
                let value = serde_json::from_str(&json).map_err(|e| {
                    AppError::Internal(format!("Document deserialization error: {}", e))
                })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn hash_put<T: serde::Serialize>(
        &self,
        hash: &str,
        key: &str,
        value: &T,
    ) -> AppResult<()> {
        let json = serde_json::to_string(value)?;
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = conn.hset(hash, key, json).await?;
        Ok(())
    }
}

#[async_trait]
impl ContentStore for RedisStore {
    async fn get_content(&self, id: &str) -> AppResult<Option<ContentItem>> {
        self.hash_get(CONTENT_HASH, id).await
    }

    async fn put_content(&self, item: &ContentItem) -> AppResult<()> {
        self.hash_put(CONTENT_HASH, &item.id, item).await
    }

    async fn list_content(&self, limit: usize) -> AppResult<Vec<ContentItem>> {
        let mut items: Vec<ContentItem> = self.hash_values(CONTENT_HASH).await?;
        items.truncate(limit);
        Ok(items)
    }

    async fn query_content(
        &self,
        service_ids: &[String],
        content_type: Option<ContentType>,
        limit: usize,
    ) -> AppResult<Vec<ContentItem>> {
        let items: Vec<ContentItem> = self.hash_values(CONTENT_HASH).await?;
        let mut matched: Vec<ContentItem> = items
            .into_iter()
            .filter(|item| {
                service_ids.is_empty()
                    || item.service_ids.iter().any(|id| service_ids.contains(id))
            })
            .filter(|item| content_type.map_or(true, |t| item.content_type == t))
            .collect();
        matched.truncate(limit);
        Ok(matched)
    }

    async fn top_by_rating_count(&self, limit: usize) -> AppResult<Vec<ContentItem>> {
        let mut items: Vec<ContentItem> = self.hash_values(CONTENT_HASH).await?;
        items.sort_by(|a, b| b.rating_count.cmp(&a.rating_count).then(a.id.cmp(&b.id)));
        items.truncate(limit);
        Ok(items)
    }

    async fn distinct_service_ids(&self) -> AppResult<Vec<String>> {
        let items: Vec<ContentItem> = self.hash_values(CONTENT_HASH).await?;
        let mut ids: Vec<String> = items
            .into_iter()
            .flat_map(|item| item.service_ids)
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn refresh_marker(&self) -> AppResult<Option<RefreshMarker>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let raw: Option<String> = conn.get(REFRESH_MARKER_KEY).await?;

        match raw {
            Some(json) => {
                let marker = serde_json::from_str(&json).map_err(|e| {
                    AppError::Internal(format!("Refresh marker deserialization error: {}", e))
                })?;
                Ok(Some(marker))
            }
            None => Ok(None),
        }
    }

    async fn set_refresh_marker(&self, marker: &RefreshMarker) -> AppResult<()> {
        let json = serde_json::to_string(marker)?;
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = conn.set(REFRESH_MARKER_KEY, json).await?;
        Ok(())
    }
}

#[async_trait]
impl UserDirectory for RedisStore {
    async fn get_user(&self, user_id: &str) -> AppResult<Option<UserProfile>> {
        self.hash_get(USERS_HASH, user_id).await
    }

    async fn put_user(&self, profile: &UserProfile) -> AppResult<()> {
        self.hash_put(USERS_HASH, &profile.id, profile).await
    }

    async fn users_with_ratings(&self) -> AppResult<Vec<UserProfile>> {
        let users: Vec<UserProfile> = self.hash_values(USERS_HASH).await?;
        Ok(users
            .into_iter()
            .filter(|user| !user.ratings.is_empty())
            .collect())
    }
}

#[async_trait]
impl ModelStore for RedisStore {
    async fn load_model(&self, key: &str) -> AppResult<Option<serde_json::Value>> {
        self.hash_get(MODELS_HASH, key).await
    }

    async fn store_model(&self, key: &str, blob: &serde_json::Value) -> AppResult<()> {
        self.hash_put(MODELS_HASH, key, blob).await
    }
}
