pub mod hashing;
pub mod ollama;
pub mod openai;

use crate::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::warn;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// 0 until the provider has seen a response
    fn dimension(&self) -> usize;

    fn provider_name(&self) -> &str;

    fn model_name(&self) -> &str;
}

/// `provider/model (Nd)`, recorded next to persisted embeddings
pub fn model_identity(provider: &str, model: &str, dimension: usize) -> String {
    format!("{}/{} ({}d)", provider, model, dimension)
}

/// Embed one batch, retrying up to `max_attempts` times with linear backoff.
pub async fn embed_batch_with_retry(
    provider: &dyn EmbeddingProvider,
    texts: &[String],
    max_attempts: usize,
    backoff: Duration,
) -> Result<Vec<Vec<f32>>> {
    let attempts = max_attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        match provider.embed_batch(texts).await {
            Ok(vectors) if vectors.len() == texts.len() => return Ok(vectors),
            Ok(vectors) => {
                last_error = Some(Error::Embedding(format!(
                    "provider returned {} vectors for {} texts",
                    vectors.len(),
                    texts.len()
                )));
            }
            Err(e) => last_error = Some(e),
        }

        if attempt < attempts {
            if let Some(e) = &last_error {
                warn!("[EMBEDDINGS] Attempt {}/{} failed: {}. Retrying...", attempt, attempts, e);
            }
            tokio::time::sleep(backoff * attempt as u32).await;
        }
    }

    Err(last_error.unwrap_or_else(|| Error::Embedding("no attempts made".to_string())))
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a.sqrt() * norm_b.sqrt())
    }
}

pub use hashing::HashingEmbedding;
pub use ollama::OllamaEmbedding;
pub use openai::OpenAIEmbedding;
