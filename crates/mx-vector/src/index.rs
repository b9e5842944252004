//! ANN index backends.
//!
//! [`RestAnnIndex`] speaks a Qdrant-style REST surface; [`MemoryAnnIndex`]
//! is an exact in-process k-NN used by tests and as a scratch index. Both
//! report distances in [0, 2] (cosine distance; similarity = 1 − distance).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::{MetadataFilter, VectorError};

/// A stored point: id, vector, and the metadata the filter contract runs on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub metadata: serde_json::Value,
}

/// A query hit. `distance` ∈ [0, 2].
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPoint {
    pub id: String,
    pub distance: f64,
}

/// k-NN store of id → vector with metadata filtering.
#[async_trait]
pub trait AnnIndex: Send + Sync {
    async fn upsert_points(
        &self,
        collection: &str,
        points: Vec<VectorPoint>,
    ) -> Result<(), VectorError>;

    async fn query(
        &self,
        collection: &str,
        vector: &[f32],
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<ScoredPoint>, VectorError>;

    /// Drop and recreate a collection.
    async fn reset_collection(&self, collection: &str) -> Result<(), VectorError>;

    async fn health_check(&self) -> Result<(), VectorError>;
}

// ---------------------------------------------------------------------------
// RestAnnIndex
// ---------------------------------------------------------------------------

/// Qdrant-style REST client.
pub struct RestAnnIndex {
    client: reqwest::Client,
    base_url: String,
    dimensions: usize,
}

impl RestAnnIndex {
    pub fn new(base_url: impl Into<String>, dimensions: usize) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .expect("reqwest client"),
            base_url: base_url.into(),
            dimensions,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn ensure_collection(&self, collection: &str) -> Result<(), VectorError> {
        let body = serde_json::json!({
            "vectors": { "size": self.dimensions, "distance": "Cosine" }
        });
        // PUT is idempotent on existing collections of the same shape; a 409
        // from an older server is also fine.
        let response = self
            .client
            .put(self.url(&format!("/collections/{collection}")))
            .json(&body)
            .send()
            .await?;
        if response.status().is_success() || response.status().as_u16() == 409 {
            Ok(())
        } else {
            Err(VectorError::Api {
                status: response.status().as_u16(),
                message: response.text().await.unwrap_or_default(),
            })
        }
    }
}

#[derive(Deserialize)]
struct SearchResponse {
    result: Vec<SearchHit>,
}

#[derive(Deserialize)]
struct SearchHit {
    id: serde_json::Value,
    score: f64,
    payload: Option<serde_json::Value>,
}

#[async_trait]
impl AnnIndex for RestAnnIndex {
    async fn upsert_points(
        &self,
        collection: &str,
        points: Vec<VectorPoint>,
    ) -> Result<(), VectorError> {
        self.ensure_collection(collection).await?;
        let body = serde_json::json!({
            "points": points
                .iter()
                .map(|p| {
                    let mut payload = p.metadata.clone();
                    if let Some(obj) = payload.as_object_mut() {
                        obj.insert("point_id".into(), serde_json::json!(p.id));
                    }
                    serde_json::json!({
                        // Point ids must be numeric or UUID on the wire; the
                        // caller id travels in the payload.
                        "id": uuid_for(&p.id),
                        "vector": p.vector,
                        "payload": payload,
                    })
                })
                .collect::<Vec<_>>(),
        });
        let response = self
            .client
            .put(self.url(&format!("/collections/{collection}/points?wait=true")))
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(VectorError::Api {
                status: response.status().as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        vector: &[f32],
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<ScoredPoint>, VectorError> {
        let mut body = serde_json::json!({
            "vector": vector,
            "limit": k,
            "with_payload": true,
        });
        if let Some(f) = filter.to_qdrant_filter() {
            body["filter"] = f;
        }
        let response = self
            .client
            .post(self.url(&format!("/collections/{collection}/points/search")))
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(VectorError::Api {
                status: response.status().as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        let body: SearchResponse = response
            .json()
            .await
            .map_err(|e| VectorError::Parse(e.to_string()))?;
        Ok(body
            .result
            .into_iter()
            .map(|hit| {
                let id = hit
                    .payload
                    .as_ref()
                    .and_then(|p| p.get("point_id"))
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| hit.id.to_string());
                // Cosine similarity in [-1, 1] → distance in [0, 2].
                ScoredPoint {
                    id,
                    distance: (1.0 - hit.score).clamp(0.0, 2.0),
                }
            })
            .collect())
    }

    async fn reset_collection(&self, collection: &str) -> Result<(), VectorError> {
        let response = self
            .client
            .delete(self.url(&format!("/collections/{collection}")))
            .send()
            .await?;
        // 404 = nothing to drop.
        if !response.status().is_success() && response.status().as_u16() != 404 {
            return Err(VectorError::Api {
                status: response.status().as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        self.ensure_collection(collection).await
    }

    async fn health_check(&self) -> Result<(), VectorError> {
        let response = self.client.get(self.url("/collections")).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(VectorError::Unavailable(format!(
                "ann store returned {}",
                response.status()
            )))
        }
    }
}

/// Deterministic UUID for an arbitrary string id (the wire id Qdrant needs).
fn uuid_for(id: &str) -> String {
    // FNV-1a folded into 128 bits; stable, collision-negligible at our scale.
    let mut hi: u64 = 0xcbf2_9ce4_8422_2325;
    let mut lo: u64 = 0x84_22_23_25_cb_f2_9c_e4u64.rotate_left(7);
    for byte in id.bytes() {
        hi ^= u64::from(byte);
        hi = hi.wrapping_mul(0x0000_0100_0000_01b3);
        lo ^= hi;
        lo = lo.rotate_left(13).wrapping_mul(0x9e37_79b9_7f4a_7c15);
    }
    format!(
        "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
        (hi >> 32) as u32,
        (hi >> 16) as u16,
        hi as u16,
        (lo >> 48) as u16,
        lo & 0xffff_ffff_ffff
    )
}

// ---------------------------------------------------------------------------
// MemoryAnnIndex
// ---------------------------------------------------------------------------

/// Exact in-process k-NN; the test double behind the same trait.
#[derive(Default)]
pub struct MemoryAnnIndex {
    collections: RwLock<HashMap<String, HashMap<String, VectorPoint>>>,
}

impl MemoryAnnIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .await
            .get(collection)
            .map(|c| c.len())
            .unwrap_or(0)
    }
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 1.0;
    }
    (1.0 - f64::from(dot / (na * nb))).clamp(0.0, 2.0)
}

#[async_trait]
impl AnnIndex for MemoryAnnIndex {
    async fn upsert_points(
        &self,
        collection: &str,
        points: Vec<VectorPoint>,
    ) -> Result<(), VectorError> {
        let mut collections = self.collections.write().await;
        let entry = collections.entry(collection.to_string()).or_default();
        for point in points {
            entry.insert(point.id.clone(), point);
        }
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        vector: &[f32],
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<ScoredPoint>, VectorError> {
        let collections = self.collections.read().await;
        let Some(points) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        let mut hits: Vec<ScoredPoint> = points
            .values()
            .filter(|p| filter.matches(&p.metadata))
            .map(|p| ScoredPoint {
                id: p.id.clone(),
                distance: cosine_distance(vector, &p.vector),
            })
            .collect();
        hits.sort_by(|a, b| a.distance.partial_cmp(&b.distance).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);
        Ok(hits)
    }

    async fn reset_collection(&self, collection: &str) -> Result<(), VectorError> {
        self.collections.write().await.remove(collection);
        Ok(())
    }

    async fn health_check(&self) -> Result<(), VectorError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(id: &str, vector: Vec<f32>, meta: serde_json::Value) -> VectorPoint {
        VectorPoint {
            id: id.into(),
            vector,
            metadata: meta,
        }
    }

    #[tokio::test]
    async fn memory_index_ranks_by_distance() {
        let index = MemoryAnnIndex::new();
        index
            .upsert_points(
                "learnings",
                vec![
                    point("a", vec![1.0, 0.0], serde_json::json!({})),
                    point("b", vec![0.0, 1.0], serde_json::json!({})),
                    point("c", vec![0.9, 0.1], serde_json::json!({})),
                ],
            )
            .await
            .unwrap();

        let hits = index
            .query("learnings", &[1.0, 0.0], 2, &MetadataFilter::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "a");
        assert_eq!(hits[1].id, "c");
        assert!(hits[0].distance < hits[1].distance);
        assert!(hits.iter().all(|h| (0.0..=2.0).contains(&h.distance)));
    }

    #[tokio::test]
    async fn memory_index_applies_filter() {
        let index = MemoryAnnIndex::new();
        index
            .upsert_points(
                "learnings",
                vec![
                    point(
                        "mine",
                        vec![1.0, 0.0],
                        serde_json::json!({"agent_id": 1, "visibility": "private"}),
                    ),
                    point(
                        "theirs",
                        vec![1.0, 0.0],
                        serde_json::json!({"agent_id": 2, "visibility": "private"}),
                    ),
                    point(
                        "shared",
                        vec![1.0, 0.0],
                        serde_json::json!({"agent_id": 2, "visibility": "shared"}),
                    ),
                ],
            )
            .await
            .unwrap();

        let filter = MetadataFilter::for_agent(Some(1), None);
        let hits = index.query("learnings", &[1.0, 0.0], 10, &filter).await.unwrap();
        let mut ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec!["mine", "shared"]);
    }

    #[tokio::test]
    async fn reset_collection_empties_it() {
        let index = MemoryAnnIndex::new();
        index
            .upsert_points("scratch", vec![point("a", vec![1.0], serde_json::json!({}))])
            .await
            .unwrap();
        assert_eq!(index.len("scratch").await, 1);
        index.reset_collection("scratch").await.unwrap();
        assert_eq!(index.len("scratch").await, 0);
    }

    #[test]
    fn uuid_for_is_stable_and_formatted() {
        let a = uuid_for("learning_7_chunk_2");
        let b = uuid_for("learning_7_chunk_2");
        assert_eq!(a, b);
        assert_eq!(a.len(), 36);
        assert_ne!(a, uuid_for("learning_7_chunk_3"));
    }
}
