//! Background write queue.
//!
//! Embedding is the expensive step, so writes are batched: jobs accumulate
//! until the batch bound or the flush interval, whichever comes first. A
//! failed batch is logged and dropped — the store row stays searchable via
//! FTS and the vector entry is backfilled on the next reindex.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::chunk::{chunk_id, chunk_text};
use crate::embedder::Embedder;
use crate::index::{AnnIndex, VectorPoint};

/// Default batch bound.
pub const DEFAULT_BATCH_SIZE: usize = 32;
/// Default flush interval.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// One pending upsert.
#[derive(Debug, Clone)]
pub struct UpsertJob {
    pub collection: String,
    pub id: String,
    pub text: String,
    pub metadata: serde_json::Value,
}

pub(crate) enum QueueCmd {
    Upsert(UpsertJob),
    /// Flush everything buffered, then ack.
    Flush(oneshot::Sender<()>),
    /// Flush and stop the worker.
    Shutdown(oneshot::Sender<()>),
}

/// Spawn the queue worker; returns the submit side.
pub(crate) fn spawn_worker(
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn AnnIndex>,
    batch_size: usize,
    flush_interval: Duration,
) -> flume::Sender<QueueCmd> {
    let (tx, rx) = flume::unbounded::<QueueCmd>();
    tokio::spawn(async move {
        let mut batch: Vec<UpsertJob> = Vec::new();
        loop {
            let cmd = tokio::time::timeout(flush_interval, rx.recv_async()).await;
            match cmd {
                Ok(Ok(QueueCmd::Upsert(job))) => {
                    batch.push(job);
                    if batch.len() >= batch_size {
                        flush_batch(&*embedder, &*index, &mut batch).await;
                    }
                }
                Ok(Ok(QueueCmd::Flush(ack))) => {
                    flush_batch(&*embedder, &*index, &mut batch).await;
                    let _ = ack.send(());
                }
                Ok(Ok(QueueCmd::Shutdown(ack))) => {
                    flush_batch(&*embedder, &*index, &mut batch).await;
                    let _ = ack.send(());
                    break;
                }
                Ok(Err(_)) => {
                    // All senders gone: drain and exit.
                    flush_batch(&*embedder, &*index, &mut batch).await;
                    break;
                }
                Err(_) => {
                    if !batch.is_empty() {
                        flush_batch(&*embedder, &*index, &mut batch).await;
                    }
                }
            }
        }
        debug!("vector write queue stopped");
    });
    tx
}

async fn flush_batch(embedder: &dyn Embedder, index: &dyn AnnIndex, batch: &mut Vec<UpsertJob>) {
    if batch.is_empty() {
        return;
    }
    let jobs = std::mem::take(batch);
    let count = jobs.len();

    // Expand jobs into chunk-level texts, keeping job/chunk provenance.
    let mut texts = Vec::new();
    let mut slots: Vec<(usize, String)> = Vec::new();
    for (job_idx, job) in jobs.iter().enumerate() {
        let chunks = chunk_text(&job.text);
        let total = chunks.len();
        for (i, chunk) in chunks.into_iter().enumerate() {
            slots.push((job_idx, chunk_id(&job.id, i, total)));
            texts.push(chunk);
        }
    }

    let vectors = match embedder.embed_batch(&texts).await {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, jobs = count, "embedding failed, dropping batch (reindex will backfill)");
            return;
        }
    };

    // Group points per collection for the upsert call.
    let mut per_collection: std::collections::HashMap<String, Vec<VectorPoint>> =
        std::collections::HashMap::new();
    for ((job_idx, point_id), vector) in slots.into_iter().zip(vectors) {
        let job = &jobs[job_idx];
        per_collection
            .entry(job.collection.clone())
            .or_default()
            .push(VectorPoint {
                id: point_id,
                vector,
                metadata: job.metadata.clone(),
            });
    }

    for (collection, points) in per_collection {
        let n = points.len();
        if let Err(e) = index.upsert_points(&collection, points).await {
            warn!(error = %e, collection = %collection, points = n,
                  "vector upsert failed, dropping batch (reindex will backfill)");
        } else {
            debug!(collection = %collection, points = n, "vector batch flushed");
        }
    }
}
