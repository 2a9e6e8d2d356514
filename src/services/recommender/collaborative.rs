/// Collaborative recommender
///
/// User-based collaborative filtering over the shared rating matrix. Rows
/// are users, columns the union of rated content ids; an unrated cell is 0,
/// which the model cannot distinguish from a zero rating (accepted
/// approximation). Neighbors are found by cosine similarity between user
/// rows, and both row and id lookups go through direct index maps.
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::db::{ContentStore, ModelStore, UserDirectory};
use crate::error::AppResult;
use crate::models::ScoredContent;
use crate::services::recommender::{
    popular_content, cosine_similarity_matrix, to_nested, top_neighbors, MODEL_SCHEMA_VERSION,
    NEIGHBORHOOD, USER_MODEL_KEY,
};

/// Ratings at or above this count as an endorsement worth propagating
const ENDORSEMENT_THRESHOLD: f64 = 4.0;

/// Persisted user similarity snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSimilarityModel {
    pub schema_version: u32,
    /// Dense user x item rating matrix; 0 means unrated
    pub ratings: Vec<Vec<f64>>,
    /// Full pairwise user cosine similarity
    pub similarity: Vec<Vec<f64>>,
    /// column index -> content id
    pub content_ids: Vec<String>,
    /// user id -> row index
    pub user_index: HashMap<String, usize>,
    /// row index -> user id
    pub user_ids: Vec<String>,
    pub built_at: DateTime<Utc>,
}

pub struct CollaborativeRecommender {
    content_store: Arc<dyn ContentStore>,
    users: Arc<dyn UserDirectory>,
    models: Arc<dyn ModelStore>,
    rebuild_lock: Mutex<()>,
    cached: RwLock<Option<Arc<UserSimilarityModel>>>,
}

impl CollaborativeRecommender {
    pub fn new(
        content_store: Arc<dyn ContentStore>,
        users: Arc<dyn UserDirectory>,
        models: Arc<dyn ModelStore>,
    ) -> Self {
        Self {
            content_store,
            users,
            models,
            rebuild_lock: Mutex::new(()),
            cached: RwLock::new(None),
        }
    }

    /// Rebuilds the user similarity model from every user holding at least
    /// one rating and replaces the persisted snapshot. Returns false when no
    /// ratings exist yet. Guarded so at most one rebuild runs at a time.
    pub async fn build_model(&self) -> AppResult<bool> {
        let _guard = self.rebuild_lock.lock().await;

        let users = self.users.users_with_ratings().await?;
        if users.is_empty() {
            tracing::warn!("No rated content to train the collaborative model on");
            return Ok(false);
        }

        // Fix the column ordering before filling the matrix
        let columns: BTreeSet<String> = users
            .iter()
            .flat_map(|user| user.ratings.keys().cloned())
            .collect();
        let content_ids: Vec<String> = columns.into_iter().collect();
        let column_index: HashMap<&str, usize> = content_ids
            .iter()
            .enumerate()
            .map(|(index, id)| (id.as_str(), index))
            .collect();

        let mut matrix = Array2::<f64>::zeros((users.len(), content_ids.len()));
        let mut user_index = HashMap::with_capacity(users.len());
        let mut user_ids = Vec::with_capacity(users.len());
        for (row, user) in users.iter().enumerate() {
            user_index.insert(user.id.clone(), row);
            user_ids.push(user.id.clone());
            for (content_id, rating) in &user.ratings {
                if let Some(&column) = column_index.get(content_id.as_str()) {
                    matrix[[row, column]] = f64::from(*rating);
                }
            }
        }

        let similarity = cosine_similarity_matrix(&matrix);

        let model = UserSimilarityModel {
            schema_version: MODEL_SCHEMA_VERSION,
            ratings: to_nested(&matrix),
            similarity: to_nested(&similarity),
            content_ids,
            user_index,
            user_ids,
            built_at: Utc::now(),
        };

        self.models
            .store_model(USER_MODEL_KEY, &serde_json::to_value(&model)?)
            .await?;
        let trained_users = model.user_ids.len();
        let trained_items = model.content_ids.len();
        *self.cached.write().await = Some(Arc::new(model));

        tracing::info!(
            users = trained_users,
            items = trained_items,
            "Collaborative model built"
        );
        Ok(true)
    }

    /// Staleness check callers run after recording a rating: rebuilds when
    /// no snapshot exists or the last build is at least a day old. Returns
    /// whether a rebuild ran.
    pub async fn maybe_rebuild(&self) -> AppResult<bool> {
        let built_at = match self.cached.read().await.clone() {
            Some(model) => Some(model.built_at),
            None => match self.load_snapshot().await? {
                Some(model) => {
                    let model = Arc::new(model);
                    let built_at = model.built_at;
                    *self.cached.write().await = Some(model);
                    Some(built_at)
                }
                None => None,
            },
        };

        let stale = match built_at {
            Some(timestamp) => {
                Utc::now().signed_duration_since(timestamp) >= Duration::days(1)
            }
            None => true,
        };

        if stale {
            self.build_model().await
        } else {
            Ok(false)
        }
    }

    /// Ranked recommendations for a user, padded with popularity-ranked
    /// items when the neighborhood yields fewer than `limit`
    pub async fn get_recommendations(&self, user_id: &str, limit: usize) -> Vec<ScoredContent> {
        let Some(model) = self.model().await else {
            return popular_content(self.content_store.as_ref(), limit).await;
        };
        let Some(&user_row) = model.user_index.get(user_id) else {
            return popular_content(self.content_store.as_ref(), limit).await;
        };

        // Exclusions come from the live profile so post-build ratings are
        // respected; the matrix row covers the store being unreachable.
        let target_rated: HashSet<String> = match self.users.get_user(user_id).await {
            Ok(Some(profile)) => profile.ratings.keys().cloned().collect(),
            _ => model.ratings[user_row]
                .iter()
                .enumerate()
                .filter(|(_, rating)| **rating > 0.0)
                .map(|(column, _)| model.content_ids[column].clone())
                .collect(),
        };

        let mut scores: HashMap<&str, f64> = HashMap::new();
        for (neighbor_row, similarity) in
            top_neighbors(&model.similarity[user_row], user_row, NEIGHBORHOOD)
        {
            if similarity <= 0.0 {
                continue;
            }
            for (column, &rating) in model.ratings[neighbor_row].iter().enumerate() {
                if rating < ENDORSEMENT_THRESHOLD {
                    continue;
                }
                let candidate = model.content_ids[column].as_str();
                if target_rated.contains(candidate) {
                    continue;
                }
                *scores.entry(candidate).or_insert(0.0) += similarity * rating;
            }
        }

        let mut ranked: Vec<(&str, f64)> = scores.into_iter().collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        ranked.truncate(limit);

        let mut recommendations = Vec::with_capacity(limit);
        for (id, score) in ranked {
            match self.content_store.get_content(id).await {
                Ok(Some(item)) => recommendations.push(ScoredContent {
                    item,
                    similarity_score: Some(score),
                }),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(error = %e, content_id = %id, "Skipping unhydratable recommendation")
                }
            }
        }

        // Pad with popularity, keeping neighbor-derived picks first and ids
        // unique
        if recommendations.len() < limit {
            let padding = popular_content(self.content_store.as_ref(), limit).await;
            for scored in padding {
                if recommendations.len() >= limit {
                    break;
                }
                if recommendations
                    .iter()
                    .any(|existing| existing.item.id == scored.item.id)
                {
                    continue;
                }
                recommendations.push(scored);
            }
        }

        recommendations
    }

    /// In-process model handle: loads the persisted snapshot, building one
    /// on first use when none exists
    async fn model(&self) -> Option<Arc<UserSimilarityModel>> {
        if let Some(model) = self.cached.read().await.clone() {
            return Some(model);
        }

        match self.load_snapshot().await {
            Ok(Some(model)) => {
                let model = Arc::new(model);
                *self.cached.write().await = Some(model.clone());
                Some(model)
            }
            Ok(None) => match self.build_model().await {
                Ok(true) => self.cached.read().await.clone(),
                Ok(false) => None,
                Err(e) => {
                    tracing::error!(error = %e, "Collaborative model build failed");
                    None
                }
            },
            Err(e) => {
                tracing::error!(error = %e, "Collaborative model load failed");
                None
            }
        }
    }

    async fn load_snapshot(&self) -> AppResult<Option<UserSimilarityModel>> {
        let Some(blob) = self.models.load_model(USER_MODEL_KEY).await? else {
            return Ok(None);
        };

        match serde_json::from_value::<UserSimilarityModel>(blob) {
            Ok(model) if model.schema_version == MODEL_SCHEMA_VERSION => Ok(Some(model)),
            Ok(model) => {
                tracing::warn!(
                    found = model.schema_version,
                    expected = MODEL_SCHEMA_VERSION,
                    "Stale collaborative model schema, rebuilding"
                );
                Ok(None)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Undecodable collaborative model snapshot, rebuilding");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::models::{ContentItem, ContentType, UserProfile, NOT_RATED};

    fn item(id: &str, rating_count: u32) -> ContentItem {
        ContentItem {
            id: id.to_string(),
            title: format!("Title {}", id),
            release_year: Some(2020),
            content_type: ContentType::Movie,
            runtime_minutes: 100,
            rating_certification: NOT_RATED.to_string(),
            poster_url: String::new(),
            plot_overview: String::new(),
            genre_names: Vec::new(),
            cast: Vec::new(),
            directors: Vec::new(),
            service_ids: vec!["203".to_string()],
            sources: Vec::new(),
            rating_count,
            details_cached: false,
            cached_at: Utc::now(),
        }
    }

    fn user(id: &str, ratings: &[(&str, u8)]) -> UserProfile {
        UserProfile {
            id: id.to_string(),
            ratings: ratings
                .iter()
                .map(|(content_id, rating)| (content_id.to_string(), *rating))
                .collect(),
            ..Default::default()
        }
    }

    async fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        // Popularity pool: p00 has the highest rating_count
        for i in 0..12 {
            store
                .put_content(&item(&format!("p{:02}", i), 40 - i as u32))
                .await
                .unwrap();
        }
        for id in ["s1", "s2", "r1", "r2", "r3"] {
            store.put_content(&item(id, 0)).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_unknown_user_falls_back_to_popularity() {
        let store = seeded_store().await;
        store
            .put_user(&user("other", &[("s1", 5)]))
            .await
            .unwrap();

        let recommender =
            CollaborativeRecommender::new(store.clone(), store.clone(), store.clone());
        let recommendations = recommender.get_recommendations("ghost", 3).await;

        let ids: Vec<&str> = recommendations.iter().map(|r| r.item.id.as_str()).collect();
        assert_eq!(ids, vec!["p00", "p01", "p02"]);
        assert!(recommendations.iter().all(|r| r.similarity_score.is_none()));
    }

    #[tokio::test]
    async fn test_neighbor_recommendations_are_padded_to_limit() {
        let store = seeded_store().await;
        // Shared taste on s1/s2 makes bob alice's neighbor; bob endorses
        // r1, r2 and r3, which alice has not rated.
        store
            .put_user(&user("alice", &[("s1", 5), ("s2", 4)]))
            .await
            .unwrap();
        store
            .put_user(&user(
                "bob",
                &[("s1", 5), ("s2", 4), ("r1", 5), ("r2", 4), ("r3", 4)],
            ))
            .await
            .unwrap();

        let recommender =
            CollaborativeRecommender::new(store.clone(), store.clone(), store.clone());
        assert!(recommender.build_model().await.unwrap());

        let recommendations = recommender.get_recommendations("alice", 10).await;
        assert_eq!(recommendations.len(), 10);

        // First three are the neighbor-derived picks in score order
        let scored: Vec<&ScoredContent> = recommendations
            .iter()
            .filter(|r| r.similarity_score.is_some())
            .collect();
        assert_eq!(scored.len(), 3);
        assert_eq!(recommendations[0].item.id, "r1");
        let mut last = f64::INFINITY;
        for rec in &scored {
            let score = rec.similarity_score.unwrap();
            assert!(score <= last);
            last = score;
        }

        // Padding region has no duplicates
        let mut ids: Vec<&str> = recommendations.iter().map(|r| r.item.id.as_str()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 10);
    }

    #[tokio::test]
    async fn test_negative_or_zero_similarity_neighbors_are_ignored() {
        let store = seeded_store().await;
        // Disjoint rating vectors give zero cosine similarity
        store.put_user(&user("alice", &[("s1", 5)])).await.unwrap();
        store.put_user(&user("carol", &[("r1", 5)])).await.unwrap();

        let recommender =
            CollaborativeRecommender::new(store.clone(), store.clone(), store.clone());
        assert!(recommender.build_model().await.unwrap());

        let recommendations = recommender.get_recommendations("alice", 5).await;
        // carol contributes nothing, so everything is popularity padding
        assert!(recommendations.iter().all(|r| r.similarity_score.is_none()));
        assert_eq!(recommendations.len(), 5);
    }

    #[tokio::test]
    async fn test_maybe_rebuild_honors_one_day_staleness() {
        let store = seeded_store().await;
        store.put_user(&user("alice", &[("s1", 5)])).await.unwrap();

        let recommender =
            CollaborativeRecommender::new(store.clone(), store.clone(), store.clone());

        // No snapshot yet: the check builds one
        assert!(recommender.maybe_rebuild().await.unwrap());
        // Fresh snapshot: nothing to do
        assert!(!recommender.maybe_rebuild().await.unwrap());

        // Age the snapshot past the window
        {
            let mut model = (*recommender.model().await.unwrap()).clone();
            model.built_at = Utc::now() - Duration::days(2);
            *recommender.cached.write().await = Some(Arc::new(model));
        }
        assert!(recommender.maybe_rebuild().await.unwrap());
    }

    #[tokio::test]
    async fn test_rebuild_replaces_persisted_snapshot() {
        let store = seeded_store().await;
        store.put_user(&user("alice", &[("s1", 5)])).await.unwrap();

        let recommender =
            CollaborativeRecommender::new(store.clone(), store.clone(), store.clone());
        assert!(recommender.build_model().await.unwrap());

        store
            .put_user(&user("bob", &[("s1", 4), ("r1", 5)]))
            .await
            .unwrap();
        assert!(recommender.build_model().await.unwrap());

        let blob = crate::db::ModelStore::load_model(store.as_ref(), USER_MODEL_KEY)
            .await
            .unwrap()
            .unwrap();
        let snapshot: UserSimilarityModel = serde_json::from_value(blob).unwrap();
        assert_eq!(snapshot.user_ids.len(), 2);
    }
}
