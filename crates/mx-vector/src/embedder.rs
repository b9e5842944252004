//! Embedding providers.
//!
//! The embedding model itself is external; this module only knows how to
//! call it. [`HttpEmbedder`] speaks the OpenAI-compatible `/v1/embeddings`
//! shape most providers expose. [`HashEmbedder`] is a deterministic local
//! fallback used by tests and degraded environments — not a real model, but
//! stable and cheap, which is all the plumbing needs.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::VectorError;

/// Opaque `embed(text) -> vector` function.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, VectorError>;

    /// Batch variant; the default loops, providers may override with a real
    /// batched call.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, VectorError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    /// Dimensionality of the produced vectors.
    fn dimensions(&self) -> usize;
}

// ---------------------------------------------------------------------------
// HttpEmbedder
// ---------------------------------------------------------------------------

/// OpenAI-compatible embeddings endpoint client.
pub struct HttpEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    dimensions: usize,
}

impl HttpEmbedder {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .expect("reqwest client"),
            base_url: base_url.into(),
            model: model.into(),
            api_key: None,
            dimensions: 1536,
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_dimensions(mut self, dims: usize) -> Self {
        self.dimensions = dims;
        self
    }
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Deserialize)]
struct EmbeddingRow {
    embedding: Vec<f32>,
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, VectorError> {
        let batch = self.embed_batch(&[text.to_string()]).await?;
        batch
            .into_iter()
            .next()
            .ok_or_else(|| VectorError::Parse("empty embeddings response".into()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, VectorError> {
        let url = format!("{}/v1/embeddings", self.base_url.trim_end_matches('/'));
        let mut request = self.client.post(&url).json(&serde_json::json!({
            "model": self.model,
            "input": texts,
        }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(VectorError::Api {
                status: status.as_u16(),
                message,
            });
        }
        let body: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|e| VectorError::Parse(e.to_string()))?;
        if body.data.len() != texts.len() {
            return Err(VectorError::Parse(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                body.data.len()
            )));
        }
        Ok(body.data.into_iter().map(|r| r.embedding).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

// ---------------------------------------------------------------------------
// HashEmbedder
// ---------------------------------------------------------------------------

/// Deterministic token-hash embedder.
///
/// Tokens are lowercased, hashed into a fixed number of buckets, and the
/// bucket-count vector is L2-normalized. Similar texts share buckets, which
/// is enough for the retrieval plumbing to behave realistically in tests.
pub struct HashEmbedder {
    dimensions: usize,
}

impl HashEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(64)
    }
}

fn bucket(token: &str, dims: usize) -> usize {
    // FNV-1a; stable across runs and platforms.
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in token.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    (hash % dims as u64) as usize
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, VectorError> {
        let mut vec = vec![0f32; self.dimensions];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            vec[bucket(&token.to_lowercase(), self.dimensions)] += 1.0;
        }
        let norm = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vec {
                *v /= norm;
            }
        }
        Ok(vec)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_embedder_is_deterministic() {
        let e = HashEmbedder::default();
        let a = e.embed("typography guidelines").await.unwrap();
        let b = e.embed("typography guidelines").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn similar_texts_are_closer_than_unrelated() {
        let e = HashEmbedder::default();
        let a = e.embed("typography guidelines for headings").await.unwrap();
        let b = e.embed("typography guidelines").await.unwrap();
        let c = e.embed("sqlite busy timeout handling").await.unwrap();

        let dot = |x: &[f32], y: &[f32]| x.iter().zip(y).map(|(a, b)| a * b).sum::<f32>();
        assert!(dot(&a, &b) > dot(&a, &c));
    }

    #[tokio::test]
    async fn vectors_are_normalized() {
        let e = HashEmbedder::default();
        let v = e.embed("a b c d e").await.unwrap();
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }
}
