pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;

pub use config::Config;
pub use error::{AppError, AppResult};

use std::sync::Arc;

use crate::config::ServiceMapping;
use crate::db::{ContentStore, ModelStore, RedisStore, UserDirectory};
use crate::services::{
    AvailabilityApi, CollaborativeRecommender, ContentBasedRecommender, ContentCache,
    DiscoverySelector, TitleApi, UserService,
};

/// Shared application state: every core service constructed once at process
/// start and handed around by reference. No module-level globals.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub content_cache: Arc<ContentCache>,
    pub discovery: Arc<DiscoverySelector>,
    pub users: Arc<UserService>,
    pub content_based: Arc<ContentBasedRecommender>,
    pub collaborative: Arc<CollaborativeRecommender>,
    content_store: Arc<dyn ContentStore>,
}

impl AppState {
    /// Builds the state against the configured Redis document store
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let client = db::create_redis_client(&config.redis_url)?;
        let store = Arc::new(RedisStore::new(client));
        let gateway: Arc<dyn TitleApi> = Arc::new(AvailabilityApi::new(&config));
        Self::assemble(config, store.clone(), store.clone(), store, gateway)
    }

    /// Wires the services against explicit collaborator handles. Tests hand
    /// in an in-memory store and a scripted gateway here.
    pub fn assemble(
        config: Config,
        content: Arc<dyn ContentStore>,
        users: Arc<dyn UserDirectory>,
        models: Arc<dyn ModelStore>,
        gateway: Arc<dyn TitleApi>,
    ) -> anyhow::Result<Self> {
        let mapping: ServiceMapping = config.service_mapping()?;

        let content_cache = Arc::new(ContentCache::new(
            content.clone(),
            gateway.clone(),
            mapping.clone(),
            config.country.clone(),
            config.cache_staleness_hours,
        ));
        let discovery = Arc::new(DiscoverySelector::new(
            content_cache.clone(),
            gateway,
            mapping,
            config.country.clone(),
        ));
        let user_service = Arc::new(UserService::new(users.clone(), content.clone()));
        let content_based = Arc::new(ContentBasedRecommender::new(
            content.clone(),
            users.clone(),
            models.clone(),
        ));
        let collaborative = Arc::new(CollaborativeRecommender::new(
            content.clone(),
            users,
            models,
        ));

        Ok(Self {
            config: Arc::new(config),
            content_cache,
            discovery,
            users: user_service,
            content_based,
            collaborative,
            content_store: content,
        })
    }

    /// Records a rating and runs the collaborative model's staleness check.
    /// The check failing never fails the write.
    pub async fn record_rating(
        &self,
        user_id: &str,
        content_id: &str,
        rating: u8,
    ) -> AppResult<()> {
        self.users.record_rating(user_id, content_id, rating).await?;

        if let Err(e) = self.collaborative.maybe_rebuild().await {
            tracing::error!(error = %e, "Collaborative model refresh check failed");
        }
        Ok(())
    }

    /// Service ids worth refreshing: whatever the cache already knows about,
    /// or the whole mapping table before first population
    pub async fn known_service_ids(&self) -> Vec<String> {
        match self.content_store.distinct_service_ids().await {
            Ok(ids) if !ids.is_empty() => ids,
            Ok(_) => self.mapped_service_ids(),
            Err(e) => {
                tracing::warn!(error = %e, "Distinct service query failed, using mapping table");
                self.mapped_service_ids()
            }
        }
    }

    fn mapped_service_ids(&self) -> Vec<String> {
        self.config
            .service_mapping()
            .map(|mapping| mapping.internal_ids())
            .unwrap_or_default()
    }
}

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}
