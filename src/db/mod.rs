pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::{create_redis_client, RedisStore};

use crate::error::AppResult;
use crate::models::{ContentItem, ContentType, RefreshMarker, UserProfile};

/// Document store collaborator, content collection plus the refresh marker.
///
/// The underlying store provides per-document atomicity; no cross-document
/// transactions are assumed anywhere in the crate.
#[async_trait::async_trait]
pub trait ContentStore: Send + Sync {
    async fn get_content(&self, id: &str) -> AppResult<Option<ContentItem>>;

    async fn put_content(&self, item: &ContentItem) -> AppResult<()>;

    async fn list_content(&self, limit: usize) -> AppResult<Vec<ContentItem>>;

    /// Items whose service_ids intersect `service_ids`, or all items when the
    /// filter is empty, optionally narrowed by type, capped at `limit`.
    async fn query_content(
        &self,
        service_ids: &[String],
        content_type: Option<ContentType>,
        limit: usize,
    ) -> AppResult<Vec<ContentItem>>;

    /// Items ordered by rating_count descending
    async fn top_by_rating_count(&self, limit: usize) -> AppResult<Vec<ContentItem>>;

    /// Distinct service ids across all cached items
    async fn distinct_service_ids(&self) -> AppResult<Vec<String>>;

    async fn refresh_marker(&self) -> AppResult<Option<RefreshMarker>>;

    async fn set_refresh_marker(&self, marker: &RefreshMarker) -> AppResult<()>;
}

/// User profile collaborator. Profiles are owned by the auth service; this
/// crate reads them and writes back preference and rating changes.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait UserDirectory: Send + Sync {
    async fn get_user(&self, user_id: &str) -> AppResult<Option<UserProfile>>;

    async fn put_user(&self, profile: &UserProfile) -> AppResult<()>;

    /// All users with at least one rating, in stable load order
    async fn users_with_ratings(&self) -> AppResult<Vec<UserProfile>>;
}

/// Opaque model snapshot storage, keyed by a fixed model name
#[async_trait::async_trait]
pub trait ModelStore: Send + Sync {
    async fn load_model(&self, key: &str) -> AppResult<Option<serde_json::Value>>;

    async fn store_model(&self, key: &str, blob: &serde_json::Value) -> AppResult<()>;
}
