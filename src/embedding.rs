//! Pluggable text embedding.
//!
//! The store never computes embeddings itself; it calls an [`Embedder`]
//! outside its critical sections and checks that every vector it accepts has
//! the same dimensionality.

use crate::error::{Error, Result};
use crate::similarity::words;
use async_trait::async_trait;
use sha2::{Digest, Sha256};

/// Default dimensionality of [`HashingEmbedder`].
pub const DEFAULT_HASHING_DIMENSIONS: usize = 256;

/// Generates fixed-length embeddings for text.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Length of every vector this embedder produces.
    fn dimensions(&self) -> usize;

    /// Model name/identifier.
    fn model_name(&self) -> &str;

    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed several texts. The default embeds one at a time.
    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }
}

/// Feature-hashing bag-of-words embedder.
///
/// Each normalized word is hashed into one signed bucket and the result is
/// L2-normalized, so texts sharing most of their words land close together.
/// Deterministic and offline; good enough for tests and as a fallback, not a
/// semantic model.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    /// Create an embedder producing vectors of the given length.
    pub fn new(dimensions: usize) -> Result<Self> {
        if dimensions == 0 {
            return Err(Error::config("embedding dimensions must be positive"));
        }
        Ok(Self { dimensions })
    }

    fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];

        for word in words(text) {
            let digest = Sha256::digest(word.as_bytes());
            let mut bucket_bytes = [0u8; 8];
            bucket_bytes.copy_from_slice(&digest[..8]);
            let bucket = (u64::from_le_bytes(bucket_bytes) % self.dimensions as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }
        vector
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_HASHING_DIMENSIONS,
        }
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        "hashing-bow"
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::similarity::cosine_similarity;

    #[test]
    fn test_zero_dimensions_rejected() {
        assert!(HashingEmbedder::new(0).is_err());
    }

    #[tokio::test]
    async fn test_embedding_has_fixed_length() {
        let embedder = HashingEmbedder::new(32).unwrap();
        let v = embedder.embed("the quick brown fox").await.unwrap();
        assert_eq!(v.len(), 32);
        assert_eq!(embedder.dimensions(), 32);
    }

    #[tokio::test]
    async fn test_embedding_is_deterministic_and_normalized() {
        let embedder = HashingEmbedder::default();
        let a = embedder.embed("Use Redis for caching").await.unwrap();
        let b = embedder.embed("use redis for caching!").await.unwrap();
        assert_eq!(a, b);

        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_related_texts_are_closer() {
        let embedder = HashingEmbedder::default();
        let base = embedder.embed("postgres connection pool size").await.unwrap();
        let near = embedder
            .embed("postgres connection pool size tuning")
            .await
            .unwrap();
        let far = embedder.embed("frontend button colors").await.unwrap();

        let near_sim = cosine_similarity(&base, &near).unwrap();
        let far_sim = cosine_similarity(&base, &far).unwrap();
        assert!(near_sim > far_sim);
    }

    #[tokio::test]
    async fn test_empty_text_embeds_to_zero_vector() {
        let embedder = HashingEmbedder::new(8).unwrap();
        let v = embedder.embed("").await.unwrap();
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[tokio::test]
    async fn test_embed_batch_default() {
        let embedder = HashingEmbedder::new(16).unwrap();
        let out = embedder.embed_batch(&["a b", "c d", "e"]).await.unwrap();
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|v| v.len() == 16));
    }
}
