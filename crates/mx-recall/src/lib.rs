//! Hybrid retrieval engine: recall dispatch, dense+sparse fusion, task-type
//! boosting, query expansion, MMR reranking, and result caching.
//!
//! Read-only and stateless apart from the LRU cache; safe to invoke
//! concurrently. Degrades gracefully: no vector adapter (or a failing one)
//! means FTS-only scoring, and if the store side fails too the engine
//! returns an empty result rather than an error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use mx_core::access::{can_access, project_scope_matches};
use mx_core::types::{Learning, SearchRecord, Session};
use mx_store::{LearningFilter, Store, StoreError};
use mx_vector::{MetadataFilter, VectorAdapter, VectorError};
use tracing::warn;

pub mod cache;
pub mod classify;
pub mod expand;
pub mod mmr;

pub use cache::{CacheKey, RecallCache, CACHE_CAPACITY, CACHE_TTL};
pub use classify::{category_boost, classify_query, detect_task_type, QueryKind, TaskType};
pub use expand::{QueryExpander, QueryVariant, MULTI_VARIANT_BONUS, VARIANT_WEIGHT};
pub use mmr::{mmr_rerank, MmrCandidate, MMR_LAMBDA};

/// Default blend: keyword-leaning, per operator tuning data.
pub const DEFAULT_VECTOR_WEIGHT: f64 = 0.36;
pub const DEFAULT_KEYWORD_WEIGHT: f64 = 0.64;

/// Collection holding learning embeddings.
pub const LEARNINGS_COLLECTION: &str = "learnings";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RecallError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Vector(#[from] VectorError),
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RecallRequest {
    pub query: String,
    pub limit: usize,
    pub agent_id: Option<i64>,
    pub project_path: Option<String>,
    pub include_shared: bool,
}

impl RecallRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            limit: 5,
            agent_id: None,
            project_path: None,
            include_shared: true,
        }
    }
}

/// A ranked hit with the signal scores that produced it.
#[derive(Debug, Clone)]
pub struct ScoredLearning {
    pub learning: Learning,
    pub score: f64,
    pub vector_score: f64,
    pub keyword_score: f64,
}

impl MmrCandidate for ScoredLearning {
    fn score(&self) -> f64 {
        self.score
    }
    fn vector_score(&self) -> f64 {
        self.vector_score
    }
    fn keyword_score(&self) -> f64 {
        self.keyword_score
    }
}

#[derive(Debug, Clone)]
pub enum RecallResponse {
    Session(Box<Session>),
    Learning(Box<Learning>),
    Learnings(Vec<ScoredLearning>),
    Empty,
}

// ---------------------------------------------------------------------------
// RecallEngine
// ---------------------------------------------------------------------------

pub struct RecallEngine {
    store: Store,
    vector: Option<Arc<VectorAdapter>>,
    vector_weight: f64,
    keyword_weight: f64,
    expander: Option<QueryExpander>,
    cache: RecallCache<Vec<ScoredLearning>>,
}

impl RecallEngine {
    pub fn new(store: Store, vector: Option<Arc<VectorAdapter>>) -> Self {
        Self {
            store,
            vector,
            vector_weight: DEFAULT_VECTOR_WEIGHT,
            keyword_weight: DEFAULT_KEYWORD_WEIGHT,
            expander: Some(QueryExpander::default()),
            cache: RecallCache::new(),
        }
    }

    pub fn with_weights(mut self, vector_weight: f64, keyword_weight: f64) -> Self {
        self.vector_weight = vector_weight;
        self.keyword_weight = keyword_weight;
        self
    }

    /// Disable query expansion (searches only the raw query).
    pub fn without_expansion(mut self) -> Self {
        self.expander = None;
        self
    }

    /// Drop all cached result lists. Call whenever a learning is created or
    /// updated.
    pub async fn invalidate_cache(&self) {
        self.cache.clear().await;
    }

    /// Hook for write paths: queue the learning for embedding and clear the
    /// cache so subsequent searches see it.
    pub async fn on_learning_saved(&self, learning: &Learning) {
        self.invalidate_cache().await;
        if let Some(vector) = &self.vector {
            let text = format!(
                "{}\n{}\n{}",
                learning.title,
                learning.description,
                learning.lesson.as_deref().unwrap_or("")
            );
            let metadata = serde_json::json!({
                "agent_id": learning.agent_id,
                "visibility": learning.visibility.to_string(),
                "project_path": learning.project_path,
                "category": learning.category,
            });
            let id = format!("learning_{}", learning.id);
            if let Err(e) = vector.upsert(LEARNINGS_COLLECTION, &id, &text, metadata) {
                warn!(error = %e, learning_id = learning.id, "vector upsert enqueue failed");
            }
        }
    }

    /// Entry point: classify the query and dispatch.
    pub async fn recall(&self, request: &RecallRequest) -> Result<RecallResponse, RecallError> {
        match classify_query(&request.query) {
            QueryKind::Recent => {
                let session = self
                    .store
                    .latest_session(request.agent_id, request.project_path.as_deref())
                    .await?;
                self.log_search(request, "recent", session.is_some() as i64, 0)
                    .await;
                Ok(match session {
                    Some(s) => RecallResponse::Session(Box::new(s)),
                    None => RecallResponse::Empty,
                })
            }
            QueryKind::SessionId(id) => {
                // Exact fetches skip project scoping but keep the ACL.
                let session = self.store.get_session(&id).await?.filter(|s| {
                    can_access(request.agent_id, s.agent_id, s.visibility)
                });
                self.log_search(request, "exact_session", session.is_some() as i64, 0)
                    .await;
                Ok(match session {
                    Some(s) => RecallResponse::Session(Box::new(s)),
                    None => RecallResponse::Empty,
                })
            }
            QueryKind::LearningId(id) => {
                let learning = self.store.get_learning(id).await?.filter(|l| {
                    can_access(request.agent_id, l.agent_id, l.visibility)
                });
                self.log_search(request, "exact_learning", learning.is_some() as i64, 0)
                    .await;
                Ok(match learning {
                    Some(l) => RecallResponse::Learning(Box::new(l)),
                    None => RecallResponse::Empty,
                })
            }
            QueryKind::Hybrid => {
                let hits = self.search_learnings(request).await?;
                Ok(if hits.is_empty() {
                    RecallResponse::Empty
                } else {
                    RecallResponse::Learnings(hits)
                })
            }
        }
    }

    /// Hybrid search with expansion, boosting, MMR, and caching.
    pub async fn search_learnings(
        &self,
        request: &RecallRequest,
    ) -> Result<Vec<ScoredLearning>, RecallError> {
        let key = CacheKey {
            query: request.query.clone(),
            limit: request.limit,
            agent_id: request.agent_id,
            shared: request.include_shared,
            project_path: request.project_path.clone(),
        };
        if let Some(cached) = self.cache.get(&key).await {
            self.log_search_src(request, "hybrid", cached.len() as i64, 0, "cache")
                .await;
            return Ok(cached);
        }

        let started = Instant::now();
        let variants = match &self.expander {
            Some(expander) => expander.expand(&request.query),
            None => vec![QueryVariant {
                text: request.query.clone(),
                weight: 1.0,
            }],
        };

        // Search every variant, merging by learning id with the best
        // weighted score; entities found by ≥ 2 variants get a bonus.
        let mut merged: HashMap<i64, (f64, f64, f64, usize)> = HashMap::new();
        for variant in &variants {
            let ranked = self.fused_scores(&variant.text, request).await?;
            for (id, score, vector_score, keyword_score) in ranked {
                let weighted = score * variant.weight;
                let entry = merged.entry(id).or_insert((0.0, 0.0, 0.0, 0));
                entry.0 = entry.0.max(weighted);
                entry.1 = entry.1.max(vector_score);
                entry.2 = entry.2.max(keyword_score);
                entry.3 += 1;
            }
        }

        // Hydrate rows, apply ACL + project scope, then the category boost.
        let task_type = detect_task_type(&request.query);
        let mut hits: Vec<ScoredLearning> = Vec::new();
        for (id, (mut score, vector_score, keyword_score)) in merged
            .into_iter()
            .map(|(id, (s, v, k, n))| (id, (if n >= 2 { s * MULTI_VARIANT_BONUS } else { s }, v, k)))
        {
            let Some(learning) = self.store.get_learning(id).await? else {
                continue;
            };
            if !can_access(request.agent_id, learning.agent_id, learning.visibility) {
                continue;
            }
            if !project_scope_matches(
                request.project_path.as_deref(),
                learning.project_path.as_deref(),
            ) {
                continue;
            }
            score *= category_boost(task_type, &learning.category);
            hits.push(ScoredLearning {
                learning,
                score,
                vector_score,
                keyword_score,
            });
        }
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        let hits = mmr_rerank(hits, request.limit, MMR_LAMBDA);

        let latency = started.elapsed().as_millis() as i64;
        self.log_search(request, "hybrid", hits.len() as i64, latency)
            .await;
        self.cache.put(key, hits.clone()).await;
        Ok(hits)
    }

    /// One fused dense+sparse pass for a single query string. Returns
    /// `(id, combined, vector_score, keyword_score)` tuples, unsorted.
    async fn fused_scores(
        &self,
        query: &str,
        request: &RecallRequest,
    ) -> Result<Vec<(i64, f64, f64, f64)>, RecallError> {
        let fetch = request.limit * 2;
        let meta_filter =
            MetadataFilter::for_agent(request.agent_id, request.project_path.clone());
        let mut learning_filter = LearningFilter::for_agent(request.agent_id);
        learning_filter.project_path = request.project_path.clone();
        learning_filter.include_shared = request.include_shared;

        let dense_fut = async {
            match &self.vector {
                Some(vector) => {
                    match vector
                        .query(LEARNINGS_COLLECTION, query, fetch, &meta_filter)
                        .await
                    {
                        Ok(points) => points,
                        Err(e) => {
                            warn!(error = %e, "vector search unavailable, degrading to FTS-only");
                            Vec::new()
                        }
                    }
                }
                None => Vec::new(),
            }
        };
        let sparse_fut = async {
            match self.store.keyword_search(query, fetch, &learning_filter).await {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(error = %e, "keyword search failed");
                    Vec::new()
                }
            }
        };
        let (dense_points, sparse_rows) = tokio::join!(dense_fut, sparse_fut);

        // Deduplicate chunks by parent, keeping the best (lowest) distance.
        let mut dense: HashMap<i64, f64> = HashMap::new();
        for point in dense_points {
            let parent = mx_vector::parent_id(&point.id);
            let Some(id) = parent
                .strip_prefix("learning_")
                .and_then(|raw| raw.parse::<i64>().ok())
            else {
                continue;
            };
            let similarity = 1.0 - point.distance;
            dense
                .entry(id)
                .and_modify(|s| *s = s.max(similarity))
                .or_insert(similarity);
        }

        let sparse: HashMap<i64, f64> = sparse_rows.into_iter().collect();

        let mut out = Vec::new();
        let ids: std::collections::HashSet<i64> =
            dense.keys().chain(sparse.keys()).copied().collect();
        for id in ids {
            let vector_score = dense.get(&id).copied().unwrap_or(0.0);
            let keyword_score = sparse.get(&id).copied().unwrap_or(0.0);
            let combined =
                self.vector_weight * vector_score + self.keyword_weight * keyword_score;
            out.push((id, combined, vector_score, keyword_score));
        }
        Ok(out)
    }

    async fn log_search(
        &self,
        request: &RecallRequest,
        query_type: &str,
        result_count: i64,
        latency_ms: i64,
    ) {
        self.log_search_src(request, query_type, result_count, latency_ms, "learnings")
            .await;
    }

    async fn log_search_src(
        &self,
        request: &RecallRequest,
        query_type: &str,
        result_count: i64,
        latency_ms: i64,
        source: &str,
    ) {
        let record = SearchRecord {
            query: request.query.clone(),
            query_type: query_type.to_string(),
            result_count,
            latency_ms,
            source: source.to_string(),
            agent_id: request.agent_id,
            recorded_at: Utc::now(),
        };
        if let Err(e) = self.store.record_search(&record).await {
            warn!(error = %e, "search telemetry write failed");
        }
    }
}
