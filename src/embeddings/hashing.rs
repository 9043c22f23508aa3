//! Offline embedding provider based on feature hashing.
//!
//! Each tokenizer token is hashed into one of `dimension` buckets with a
//! hash-derived sign; the result is L2-normalized. Deterministic and
//! dependency-free, so it also backs hermetic tests. The model name carries
//! the tokenizer fingerprint, since a different stop-word set changes every
//! vector.

use super::EmbeddingProvider;
use crate::text::Tokenizer;
use crate::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::Arc;

pub struct HashingEmbedding {
    tokenizer: Arc<Tokenizer>,
    dimension: usize,
    model: String,
}

impl HashingEmbedding {
    pub fn new(tokenizer: Arc<Tokenizer>, dimension: usize) -> Self {
        let dimension = dimension.max(1);
        let model = format!("hashing-{dimension}-{}", tokenizer.fingerprint());
        Self { tokenizer, dimension, model }
    }

    fn vectorize(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];

        for token in self.tokenizer.tokenize(text) {
            let digest = Sha256::digest(token.as_bytes());
            let bucket = u64::from_le_bytes([
                digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
            ]) as usize
                % self.dimension;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }

        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.vectorize(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.vectorize(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn provider_name(&self) -> &str {
        "Hashing"
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::cosine_similarity;

    #[tokio::test]
    async fn test_hashing_is_deterministic_and_normalized() {
        let provider = HashingEmbedding::new(Arc::new(Tokenizer::default()), 64);
        let a = provider.embed("高血压 治疗").await.unwrap();
        let b = provider.embed("高血压 治疗").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_shared_tokens_increase_similarity() {
        let provider = HashingEmbedding::new(Arc::new(Tokenizer::default()), 256);
        let query = provider.embed("糖尿病并发症").await.unwrap();
        let close = provider.embed("糖尿病的慢性并发症").await.unwrap();
        let far = provider.embed("骨折愈合过程").await.unwrap();
        assert!(cosine_similarity(&query, &close) > cosine_similarity(&query, &far));
    }

    #[test]
    fn test_model_name_tracks_tokenizer() {
        let plain = HashingEmbedding::new(Arc::new(Tokenizer::new(["的"])), 64);
        let same = HashingEmbedding::new(Arc::new(Tokenizer::new(["的"])), 64);
        let other = HashingEmbedding::new(Arc::new(Tokenizer::new(["的", "是"])), 64);

        assert_eq!(plain.model_name(), same.model_name());
        assert_ne!(plain.model_name(), other.model_name());
        assert!(plain.model_name().starts_with("hashing-64-"));
    }
}
