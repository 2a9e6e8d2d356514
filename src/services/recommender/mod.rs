/// Recommendation engines
///
/// Two scoring engines share the same lifecycle: models are rebuilt in full
/// on demand, persisted as versioned blobs in the document store, and loaded
/// lazily on first use. Both accumulate candidate scores by summation across
/// evidence sources, and both degrade to popularity ranking whenever a model
/// or a user is missing.
pub mod collaborative;
pub mod content_based;

pub use collaborative::CollaborativeRecommender;
pub use content_based::ContentBasedRecommender;

use std::cmp::Ordering;

use ndarray::Array2;

use crate::db::ContentStore;
use crate::models::ScoredContent;

/// Fixed storage key for the content-based model snapshot
pub const CONTENT_MODEL_KEY: &str = "content_similarity";
/// Fixed storage key for the collaborative model snapshot
pub const USER_MODEL_KEY: &str = "user_similarity";
/// Bumped whenever a persisted snapshot changes shape; mismatches are
/// treated as model-absent
pub const MODEL_SCHEMA_VERSION: u32 = 1;
/// Neighbors consulted per evidence source at inference time
pub const NEIGHBORHOOD: usize = 20;

/// Popularity ranking used as the cold-start fallback
pub(crate) async fn popular_content(store: &dyn ContentStore, limit: usize) -> Vec<ScoredContent> {
    match store.top_by_rating_count(limit).await {
        Ok(items) => items
            .into_iter()
            .map(|item| ScoredContent {
                item,
                similarity_score: None,
            })
            .collect(),
        Err(e) => {
            tracing::error!(error = %e, "Popularity fallback query failed");
            Vec::new()
        }
    }
}

/// Full pairwise cosine similarity over the rows of a matrix. Zero rows get
/// zero similarity everywhere instead of NaN.
pub(crate) fn cosine_similarity_matrix(rows: &Array2<f64>) -> Array2<f64> {
    let n = rows.nrows();
    let norms: Vec<f64> = rows
        .outer_iter()
        .map(|row| row.dot(&row).sqrt())
        .collect();

    let mut similarity = rows.dot(&rows.t());
    for i in 0..n {
        for j in 0..n {
            let denominator = norms[i] * norms[j];
            similarity[[i, j]] = if denominator == 0.0 {
                0.0
            } else {
                similarity[[i, j]] / denominator
            };
        }
    }
    similarity
}

/// The k highest-scoring entries of a similarity row, excluding the row's
/// own index, sorted descending
pub(crate) fn top_neighbors(row: &[f64], exclude: usize, k: usize) -> Vec<(usize, f64)> {
    let mut pairs: Vec<(usize, f64)> = row
        .iter()
        .copied()
        .enumerate()
        .filter(|(index, _)| *index != exclude)
        .collect();
    pairs.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
    pairs.truncate(k);
    pairs
}

/// Serializes an ndarray matrix as nested vectors for the JSON snapshot
pub(crate) fn to_nested(matrix: &Array2<f64>) -> Vec<Vec<f64>> {
    matrix.outer_iter().map(|row| row.to_vec()).collect()
}
