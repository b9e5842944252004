//! Facade over the external embedding function and ANN store.
//!
//! No other crate talks to either directly: the adapter owns the write
//! queue, the chunking rules, and the metadata filter contract. Vector
//! failures never block store writes — they are logged and the missing
//! entries are backfilled by `reindex`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

pub mod chunk;
pub mod embedder;
pub mod index;
mod queue;

pub use chunk::{chunk_text, parent_id};
pub use embedder::{Embedder, HashEmbedder, HttpEmbedder};
pub use index::{AnnIndex, MemoryAnnIndex, RestAnnIndex, ScoredPoint, VectorPoint};
pub use queue::{UpsertJob, DEFAULT_BATCH_SIZE, DEFAULT_FLUSH_INTERVAL};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum VectorError {
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },
    #[error("parse error: {0}")]
    Parse(String),
    #[error("request timed out")]
    Timeout,
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("queue closed")]
    QueueClosed,
}

impl From<reqwest::Error> for VectorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            VectorError::Timeout
        } else if err.is_connect() {
            VectorError::Unavailable(err.to_string())
        } else {
            VectorError::Http(err.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// MetadataFilter
// ---------------------------------------------------------------------------

/// Boolean conjunction over point metadata, mirroring the store-side scope
/// rules: `(agent matches ∨ visibility ∈ {shared, public}) ∧ project scope`.
#[derive(Debug, Clone, Default)]
pub struct MetadataFilter {
    /// Caller agent id; `None` = orchestrator (no access clause).
    pub agent_id: Option<i64>,
    /// Project path scope; rows without one always pass.
    pub project_path: Option<String>,
}

impl MetadataFilter {
    pub fn for_agent(agent_id: Option<i64>, project_path: Option<String>) -> Self {
        Self {
            agent_id,
            project_path,
        }
    }

    /// Evaluate against a point's metadata object.
    pub fn matches(&self, metadata: &serde_json::Value) -> bool {
        if let Some(caller) = self.agent_id {
            let owner = metadata.get("agent_id").and_then(|v| v.as_i64());
            let visibility = metadata.get("visibility").and_then(|v| v.as_str());
            let allowed = match owner {
                None => true,
                Some(o) if o == caller => true,
                Some(_) => matches!(visibility, Some("shared") | Some("public")),
            };
            if !allowed {
                return false;
            }
        }
        if let Some(project) = &self.project_path {
            match metadata.get("project_path").and_then(|v| v.as_str()) {
                None => {}
                Some(p) if p == project => {}
                Some(_) => return false,
            }
        }
        true
    }

    /// Qdrant-style filter JSON, or `None` when unconstrained.
    pub fn to_qdrant_filter(&self) -> Option<serde_json::Value> {
        let mut must = Vec::new();
        if let Some(caller) = self.agent_id {
            must.push(serde_json::json!({
                "should": [
                    { "key": "agent_id", "match": { "value": caller } },
                    { "is_empty": { "key": "agent_id" } },
                    { "key": "visibility", "match": { "any": ["shared", "public"] } },
                ]
            }));
        }
        if let Some(project) = &self.project_path {
            must.push(serde_json::json!({
                "should": [
                    { "key": "project_path", "match": { "value": project } },
                    { "is_empty": { "key": "project_path" } },
                ]
            }));
        }
        if must.is_empty() {
            None
        } else {
            Some(serde_json::json!({ "must": must }))
        }
    }
}

// ---------------------------------------------------------------------------
// VectorAdapter
// ---------------------------------------------------------------------------

/// The one component the rest of the fabric calls for anything vector.
pub struct VectorAdapter {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn AnnIndex>,
    queue: flume::Sender<queue::QueueCmd>,
}

impl VectorAdapter {
    pub fn new(embedder: Arc<dyn Embedder>, index: Arc<dyn AnnIndex>) -> Self {
        Self::with_batching(embedder, index, DEFAULT_BATCH_SIZE, DEFAULT_FLUSH_INTERVAL)
    }

    pub fn with_batching(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn AnnIndex>,
        batch_size: usize,
        flush_interval: Duration,
    ) -> Self {
        let queue = queue::spawn_worker(
            embedder.clone(),
            index.clone(),
            batch_size,
            flush_interval,
        );
        Self {
            embedder,
            index,
            queue,
        }
    }

    /// Queue a document for embedding and upsert. Returns immediately; the
    /// background worker batches the actual work.
    pub fn upsert(
        &self,
        collection: &str,
        id: &str,
        text: &str,
        metadata: serde_json::Value,
    ) -> Result<(), VectorError> {
        self.queue
            .send(queue::QueueCmd::Upsert(UpsertJob {
                collection: collection.into(),
                id: id.into(),
                text: text.into(),
                metadata,
            }))
            .map_err(|_| VectorError::QueueClosed)
    }

    /// Embed the query text and run k-NN. `distance` ∈ [0, 2]; similarity is
    /// `1 − distance`.
    pub async fn query(
        &self,
        collection: &str,
        text: &str,
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<ScoredPoint>, VectorError> {
        let vector = self.embedder.embed(text).await?;
        self.index.query(collection, &vector, k, filter).await
    }

    /// Drop and recreate a collection.
    pub async fn reset_collection(&self, collection: &str) -> Result<(), VectorError> {
        self.index.reset_collection(collection).await
    }

    pub async fn health_check(&self) -> Result<(), VectorError> {
        self.index.health_check().await
    }

    /// Synchronous backfill path: embed and upsert rows directly, bypassing
    /// the queue. Used by the indexer daemon and operator reindex runs.
    pub async fn reindex(
        &self,
        collection: &str,
        rows: Vec<(String, String, serde_json::Value)>,
    ) -> Result<usize, VectorError> {
        let mut written = 0;
        for (id, text, metadata) in rows {
            let chunks = chunk_text(&text);
            let total = chunks.len();
            let vectors = self.embedder.embed_batch(&chunks).await?;
            let points: Vec<VectorPoint> = vectors
                .into_iter()
                .enumerate()
                .map(|(i, vector)| VectorPoint {
                    id: chunk::chunk_id(&id, i, total),
                    vector,
                    metadata: metadata.clone(),
                })
                .collect();
            written += points.len();
            self.index.upsert_points(collection, points).await?;
        }
        Ok(written)
    }

    /// Flush everything buffered in the write queue.
    pub async fn flush(&self) -> Result<(), VectorError> {
        let (ack, done) = oneshot::channel();
        self.queue
            .send(queue::QueueCmd::Flush(ack))
            .map_err(|_| VectorError::QueueClosed)?;
        done.await.map_err(|_| VectorError::QueueClosed)
    }

    /// Drain the queue and stop the worker. The adapter is unusable for
    /// writes afterwards; call on process shutdown.
    pub async fn close(&self) -> Result<(), VectorError> {
        let (ack, done) = oneshot::channel();
        self.queue
            .send(queue::QueueCmd::Shutdown(ack))
            .map_err(|_| VectorError::QueueClosed)?;
        done.await.map_err(|_| VectorError::QueueClosed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> (VectorAdapter, Arc<MemoryAnnIndex>) {
        let index = Arc::new(MemoryAnnIndex::new());
        let adapter = VectorAdapter::with_batching(
            Arc::new(HashEmbedder::default()),
            index.clone(),
            4,
            Duration::from_millis(20),
        );
        (adapter, index)
    }

    #[tokio::test]
    async fn queued_upserts_become_queryable_after_flush() {
        let (adapter, index) = adapter();
        adapter
            .upsert("learnings", "learning_1", "typography guidelines", serde_json::json!({}))
            .unwrap();
        adapter.flush().await.unwrap();

        assert_eq!(index.len("learnings").await, 1);
        let hits = adapter
            .query("learnings", "typography", 5, &MetadataFilter::default())
            .await
            .unwrap();
        assert_eq!(hits[0].id, "learning_1");
    }

    #[tokio::test]
    async fn interval_flush_happens_without_explicit_flush() {
        let (adapter, index) = adapter();
        adapter
            .upsert("learnings", "learning_2", "busy timeout", serde_json::json!({}))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(index.len("learnings").await, 1);
    }

    #[tokio::test]
    async fn large_documents_are_chunked_with_parent_ids() {
        let (adapter, index) = adapter();
        let long_text = (0..40)
            .map(|i| format!("line {i} {}", "pad ".repeat(20)))
            .collect::<Vec<_>>()
            .join("\n");
        adapter
            .upsert("learnings", "learning_3", &long_text, serde_json::json!({}))
            .unwrap();
        adapter.flush().await.unwrap();

        assert!(index.len("learnings").await > 1);
        let hits = adapter
            .query("learnings", "line pad", 10, &MetadataFilter::default())
            .await
            .unwrap();
        assert!(hits.iter().all(|h| parent_id(&h.id) == "learning_3"));
    }

    #[tokio::test]
    async fn close_drains_pending_writes() {
        let (adapter, index) = adapter();
        for i in 0..3 {
            adapter
                .upsert(
                    "learnings",
                    &format!("learning_{i}"),
                    "drained on shutdown",
                    serde_json::json!({}),
                )
                .unwrap();
        }
        adapter.close().await.unwrap();
        assert_eq!(index.len("learnings").await, 3);
    }

    #[tokio::test]
    async fn reindex_writes_directly() {
        let (adapter, index) = adapter();
        let written = adapter
            .reindex(
                "learnings",
                vec![
                    ("learning_9".into(), "backfilled row".into(), serde_json::json!({})),
                ],
            )
            .await
            .unwrap();
        assert_eq!(written, 1);
        assert_eq!(index.len("learnings").await, 1);
    }

    #[test]
    fn filter_matches_access_rules() {
        let filter = MetadataFilter::for_agent(Some(1), Some("/p".into()));
        assert!(filter.matches(&serde_json::json!({"agent_id": 1, "visibility": "private"})));
        assert!(filter.matches(&serde_json::json!({"visibility": "private"})));
        assert!(filter.matches(&serde_json::json!({"agent_id": 2, "visibility": "shared"})));
        assert!(!filter.matches(&serde_json::json!({"agent_id": 2, "visibility": "private"})));
        assert!(!filter.matches(
            &serde_json::json!({"agent_id": 1, "project_path": "/other"})
        ));
        assert!(filter.matches(&serde_json::json!({"agent_id": 1, "project_path": "/p"})));
    }

    #[test]
    fn qdrant_filter_shape() {
        let filter = MetadataFilter::for_agent(Some(3), None);
        let json = filter.to_qdrant_filter().unwrap();
        assert!(json["must"].is_array());
        assert!(MetadataFilter::default().to_qdrant_filter().is_none());
    }
}
