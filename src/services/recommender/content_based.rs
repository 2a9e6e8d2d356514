/// Content-based recommender
///
/// Builds a TF-IDF feature matrix over the cached catalog and a full pairwise
/// cosine similarity matrix on top of it. Rebuilds are O(n^2) in catalog
/// size, which stays acceptable because the catalog is bounded by the cache
/// refresh policy rather than the live upstream catalog.
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::db::{ContentStore, ModelStore, UserDirectory};
use crate::error::AppResult;
use crate::models::{ContentItem, ScoredContent};
use crate::services::recommender::{
    popular_content, cosine_similarity_matrix, to_nested, top_neighbors, CONTENT_MODEL_KEY,
    MODEL_SCHEMA_VERSION, NEIGHBORHOOD,
};

/// Tokens shorter than this are dropped by the vectorizer
const MIN_TOKEN_LEN: usize = 2;

/// English stopwords excluded from the feature vocabulary
const STOPWORDS: &[&str] = &[
    "a", "about", "after", "all", "also", "an", "and", "any", "are", "as", "at", "be", "because",
    "been", "but", "by", "can", "could", "did", "do", "does", "for", "from", "had", "has", "have",
    "he", "her", "his", "how", "if", "in", "into", "is", "it", "its", "just", "like", "more",
    "most", "my", "no", "not", "of", "on", "one", "only", "or", "other", "our", "out", "over",
    "she", "so", "some", "such", "than", "that", "the", "their", "them", "then", "there", "these",
    "they", "this", "to", "up", "was", "we", "were", "what", "when", "where", "which", "while",
    "who", "will", "with", "would", "you", "your",
];

/// Persisted content similarity snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarityModel {
    pub schema_version: u32,
    /// term -> column index of the fitted vectorizer
    pub vocabulary: HashMap<String, usize>,
    /// Inverse document frequency per vocabulary column
    pub idf: Vec<f64>,
    /// Full pairwise cosine similarity, row per item
    pub similarity: Vec<Vec<f64>>,
    /// content id -> row index
    pub content_index: HashMap<String, usize>,
    /// row index -> content id
    pub content_ids: Vec<String>,
}

pub struct ContentBasedRecommender {
    content_store: Arc<dyn ContentStore>,
    users: Arc<dyn UserDirectory>,
    models: Arc<dyn ModelStore>,
    rebuild_lock: Mutex<()>,
    cached: RwLock<Option<Arc<SimilarityModel>>>,
}

impl ContentBasedRecommender {
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

    /// Rebuilds the similarity model from the full cached catalog and
    /// replaces the persisted snapshot. Returns false when there is nothing
    /// to train on. At most one rebuild runs at a time; a concurrent caller
    /// waits and then rebuilds against the latest catalog.
    pub async fn build_model(&self) -> AppResult<bool> {
        let _guard = self.rebuild_lock.lock().await;

        let items = self.content_store.list_content(usize::MAX).await?;
        if items.is_empty() {
            tracing::warn!("No cached content to train the content model on");
            return Ok(false);
        }

        let documents: Vec<String> = items.iter().map(feature_text).collect();
        let (vocabulary, idf, tfidf) = fit_tfidf(&documents);
        let similarity = cosine_similarity_matrix(&tfidf);

        let content_ids: Vec<String> = items.iter().map(|item| item.id.clone()).collect();
        let content_index: HashMap<String, usize> = content_ids
            .iter()
            .enumerate()
            .map(|(index, id)| (id.clone(), index))
            .collect();

        let model = SimilarityModel {
            schema_version: MODEL_SCHEMA_VERSION,
            vocabulary,
            idf,
            similarity: to_nested(&similarity),
            content_index,
            content_ids,
        };

        self.models
            .store_model(CONTENT_MODEL_KEY, &serde_json::to_value(&model)?)
            .await?;
        let items_trained = model.content_ids.len();
        let terms = model.vocabulary.len();
        *self.cached.write().await = Some(Arc::new(model));

        tracing::info!(items = items_trained, terms, "Content similarity model built");
        Ok(true)
    }

    /// Ranked recommendations for a user. Users without high ratings, and
    /// any failure to produce a model, fall back to popularity ranking.
    pub async fn get_recommendations(&self, user_id: &str, limit: usize) -> Vec<ScoredContent> {
        let profile = match self.users.get_user(user_id).await {
            Ok(Some(profile)) => profile,
            Ok(None) => return popular_content(self.content_store.as_ref(), limit).await,
            Err(e) => {
                tracing::error!(error = %e, user_id = %user_id, "User lookup failed");
                return popular_content(self.content_store.as_ref(), limit).await;
            }
        };

        let liked = profile.highly_rated();
        if liked.is_empty() {
            return popular_content(self.content_store.as_ref(), limit).await;
        }

        let Some(model) = self.model().await else {
            return popular_content(self.content_store.as_ref(), limit).await;
        };

        // Scores sum across the user's liked source items, matching the
        // collaborative engine's accumulation policy.
        let mut scores: HashMap<&str, f64> = HashMap::new();
        for liked_id in &liked {
            let Some(&row) = model.content_index.get(*liked_id) else {
                continue;
            };
            for (neighbor, score) in top_neighbors(&model.similarity[row], row, NEIGHBORHOOD) {
                let candidate = model.content_ids[neighbor].as_str();
                if profile.ratings.contains_key(candidate) {
                    continue;
                }
                *scores.entry(candidate).or_insert(0.0) += score;
            }
        }

        let mut ranked: Vec<(&str, f64)> = scores.into_iter().collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        ranked.truncate(limit);

        let mut recommendations = Vec::with_capacity(ranked.len());
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
        recommendations
    }

    /// In-process model handle: loads the persisted snapshot, building one
    /// on first use when none exists
    async fn model(&self) -> Option<Arc<SimilarityModel>> {
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
                    tracing::error!(error = %e, "Content model build failed");
                    None
                }
            },
            Err(e) => {
                tracing::error!(error = %e, "Content model load failed");
                None
            }
        }
    }

    async fn load_snapshot(&self) -> AppResult<Option<SimilarityModel>> {
        let Some(blob) = self.models.load_model(CONTENT_MODEL_KEY).await? else {
            return Ok(None);
        };

        match serde_json::from_value::<SimilarityModel>(blob) {
            Ok(model) if model.schema_version == MODEL_SCHEMA_VERSION => Ok(Some(model)),
            Ok(model) => {
                tracing::warn!(
                    found = model.schema_version,
                    expected = MODEL_SCHEMA_VERSION,
                    "Stale content model schema, rebuilding"
                );
                Ok(None)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Undecodable content model snapshot, rebuilding");
                Ok(None)
            }
        }
    }
}

/// Concatenated text features for one item. The title is repeated to
/// upweight exact-title matches.
fn feature_text(item: &ContentItem) -> String {
    let mut parts: Vec<&str> = Vec::with_capacity(7);
    for _ in 0..3 {
        parts.push(&item.title);
    }
    parts.push(&item.plot_overview);

    let genres = item.genre_names.join(" ");
    let directors = item.directors.join(" ");
    let cast = item.cast.join(" ");
    parts.push(&genres);
    parts.push(&directors);
    parts.push(&cast);

    parts.join(" ").to_lowercase()
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.len() >= MIN_TOKEN_LEN)
        .filter(|token| !STOPWORDS.contains(token))
        .map(str::to_string)
        .collect()
}

/// Fits a smoothed TF-IDF encoding over the documents and returns the
/// vocabulary, per-term idf and the L2-normalized document-term matrix
fn fit_tfidf(documents: &[String]) -> (HashMap<String, usize>, Vec<f64>, Array2<f64>) {
    let tokenized: Vec<Vec<String>> = documents.iter().map(|doc| tokenize(doc)).collect();

    let terms: BTreeSet<&str> = tokenized
        .iter()
        .flat_map(|tokens| tokens.iter().map(String::as_str))
        .collect();
    let vocabulary: HashMap<String, usize> = terms
        .into_iter()
        .enumerate()
        .map(|(index, term)| (term.to_string(), index))
        .collect();

    let n_docs = documents.len();
    let mut document_frequency = vec![0usize; vocabulary.len()];
    let mut counts: Vec<BTreeMap<usize, f64>> = Vec::with_capacity(n_docs);
    for tokens in &tokenized {
        let mut row: BTreeMap<usize, f64> = BTreeMap::new();
        for token in tokens {
            if let Some(&column) = vocabulary.get(token.as_str()) {
                *row.entry(column).or_insert(0.0) += 1.0;
            }
        }
        for &column in row.keys() {
            document_frequency[column] += 1;
        }
        counts.push(row);
    }

    let idf: Vec<f64> = document_frequency
        .iter()
        .map(|&df| ((1.0 + n_docs as f64) / (1.0 + df as f64)).ln() + 1.0)
        .collect();

    let mut matrix = Array2::<f64>::zeros((n_docs, vocabulary.len()));
    for (doc, row) in counts.into_iter().enumerate() {
        for (column, count) in row {
            matrix[[doc, column]] = count * idf[column];
        }
    }

    // L2 normalize each document vector; empty documents stay zero
    for mut row in matrix.outer_iter_mut() {
        let norm = row.dot(&row).sqrt();
        if norm > 0.0 {
            row.mapv_inplace(|value| value / norm);
        }
    }

    (vocabulary, idf, matrix)
}
