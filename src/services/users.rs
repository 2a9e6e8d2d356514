/// User profile service consumption
///
/// Profiles are owned by the auth collaborator. This service reads them for
/// the discovery and recommendation paths and writes back the two signals the
/// core produces: discovery feed reactions and ratings.
use std::collections::HashSet;
use std::sync::Arc;

use crate::db::{ContentStore, UserDirectory};
use crate::error::{AppError, AppResult};
use crate::models::{validate_content_id, Preference, UserProfile};

pub struct UserService {
    users: Arc<dyn UserDirectory>,
    content: Arc<dyn ContentStore>,
}

impl UserService {
    pub fn new(users: Arc<dyn UserDirectory>, content: Arc<dyn ContentStore>) -> Self {
        Self { users, content }
    }

    pub async fn get_profile(&self, user_id: &str) -> AppResult<Option<UserProfile>> {
        validate_user_id(user_id)?;
        self.users.get_user(user_id).await
    }

    /// Ids the user has already reacted to in the discovery feed
    pub async fn seen_content(&self, user_id: &str) -> AppResult<HashSet<String>> {
        Ok(self
            .get_profile(user_id)
            .await?
            .map(|profile| profile.seen_content())
            .unwrap_or_default())
    }

    /// Records a like or dislike. The two sets are mutually exclusive:
    /// adding to one removes the id from the other in the same operation.
    pub async fn record_preference(
        &self,
        user_id: &str,
        content_id: &str,
        preference: Preference,
    ) -> AppResult<()> {
        validate_user_id(user_id)?;
        validate_content_id(content_id)?;

        let mut profile = self
            .users
            .get_user(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("user {}", user_id)))?;

        match preference {
            Preference::Like => {
                profile.disliked_content_ids.retain(|id| id != content_id);
                if !profile.liked_content_ids.iter().any(|id| id == content_id) {
                    profile.liked_content_ids.push(content_id.to_string());
                }
            }
            Preference::Dislike => {
                profile.liked_content_ids.retain(|id| id != content_id);
                if !profile
                    .disliked_content_ids
                    .iter()
                    .any(|id| id == content_id)
                {
                    profile.disliked_content_ids.push(content_id.to_string());
                }
            }
        }

        self.users.put_user(&profile).await?;

        tracing::debug!(
            user_id = %user_id,
            content_id = %content_id,
            preference = ?preference,
            "Preference recorded"
        );
        Ok(())
    }

    /// Records a rating on the 1-5 scale, clamping out-of-range values.
    /// First-time ratings bump the item's popularity counter. Callers should
    /// follow a successful write with the collaborative model's staleness
    /// check; the write itself never retrains.
    pub async fn record_rating(&self, user_id: &str, content_id: &str, rating: u8) -> AppResult<()> {
        validate_user_id(user_id)?;
        validate_content_id(content_id)?;
        let rating = rating.clamp(1, 5);

        let mut profile = self
            .users
            .get_user(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("user {}", user_id)))?;

        let previous = profile.ratings.insert(content_id.to_string(), rating);
        self.users.put_user(&profile).await?;

        if previous.is_none() {
            if let Some(mut item) = self.content.get_content(content_id).await? {
                item.rating_count += 1;
                self.content.put_content(&item).await?;
            }
        }

        tracing::debug!(
            user_id = %user_id,
            content_id = %content_id,
            rating,
            "Rating recorded"
        );
        Ok(())
    }
}

fn validate_user_id(user_id: &str) -> AppResult<()> {
    if user_id.is_empty() || user_id.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(AppError::InvalidInput(format!(
            "malformed user id: {:?}",
            user_id
        )));
    }
    Ok(())
}
