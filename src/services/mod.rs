pub mod content_cache;
pub mod discovery;
pub mod gateway;
pub mod recommender;
pub mod users;

pub use content_cache::ContentCache;
pub use discovery::DiscoverySelector;
pub use gateway::{AvailabilityApi, FetchProfile, TitleApi};
pub use recommender::{CollaborativeRecommender, ContentBasedRecommender};
pub use users::UserService;
