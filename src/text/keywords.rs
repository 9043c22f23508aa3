//! Keyphrase extraction for retrieval queries
//!
//! Candidates are n-grams over tokenizer segments; a [`KeyphraseScorer`]
//! ranks them against the whole text and the best one becomes the query.

use super::tokenizer::Tokenizer;
use crate::embeddings::{cosine_similarity, EmbeddingProvider};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

const MAX_CANDIDATES: usize = 64;

/// Scores candidate phrases against their source text; higher is more salient.
#[async_trait]
pub trait KeyphraseScorer: Send + Sync {
    async fn score(&self, text: &str, candidates: &[String]) -> Result<Vec<f32>>;
}

/// Ranks phrases by embedding similarity to the full text
pub struct EmbeddingKeyphraseScorer {
    provider: Arc<dyn EmbeddingProvider>,
}

impl EmbeddingKeyphraseScorer {
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl KeyphraseScorer for EmbeddingKeyphraseScorer {
    async fn score(&self, text: &str, candidates: &[String]) -> Result<Vec<f32>> {
        let mut inputs = Vec::with_capacity(candidates.len() + 1);
        inputs.push(text.to_string());
        inputs.extend(candidates.iter().cloned());

        let embeddings = self.provider.embed_batch(&inputs).await?;
        if embeddings.len() != inputs.len() {
            return Err(Error::Extract(format!(
                "expected {} embeddings, got {}",
                inputs.len(),
                embeddings.len()
            )));
        }

        let (doc, phrases) = embeddings.split_at(1);
        Ok(phrases.iter().map(|p| cosine_similarity(&doc[0], p)).collect())
    }
}

/// Replace symbols and punctuation with spaces and collapse whitespace
pub fn clean_text(text: &str) -> String {
    text.chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub struct KeywordExtractor {
    tokenizer: Arc<Tokenizer>,
    scorer: Arc<dyn KeyphraseScorer>,
}

impl KeywordExtractor {
    pub fn new(tokenizer: Arc<Tokenizer>, scorer: Arc<dyn KeyphraseScorer>) -> Self {
        Self { tokenizer, scorer }
    }

    /// Candidate phrases of 1..=max_words segments, first-seen order
    pub fn candidates(&self, text: &str, max_words: usize) -> Vec<String> {
        let segments: Vec<String> = self
            .tokenizer
            .segments(text)
            .into_iter()
            .map(|s| s.as_str().to_string())
            .collect();

        let mut candidates: Vec<String> = Vec::new();
        for start in 0..segments.len() {
            for len in 1..=max_words.max(1) {
                if start + len > segments.len() {
                    break;
                }
                let phrase = segments[start..start + len].join(" ");
                if !candidates.contains(&phrase) {
                    candidates.push(phrase);
                }
                if candidates.len() >= MAX_CANDIDATES {
                    return candidates;
                }
            }
        }

        candidates
    }

    /// Most salient phrase of at most `max_words` segments
    pub async fn try_extract(&self, text: &str, max_words: usize) -> Result<String> {
        let candidates = self.candidates(text, max_words);
        if candidates.is_empty() {
            return Err(Error::Extract("no candidate phrases".to_string()));
        }

        let scores = self.scorer.score(text, &candidates).await?;
        if scores.len() != candidates.len() {
            return Err(Error::Extract(format!(
                "scorer returned {} scores for {} candidates",
                scores.len(),
                candidates.len()
            )));
        }

        let mut best = 0;
        for (i, score) in scores.iter().enumerate() {
            if *score > scores[best] {
                best = i;
            }
        }

        Ok(candidates[best].clone())
    }

    /// Extraction with fallback: any failure yields the cleaned input text
    pub async fn extract(&self, text: &str, max_words: usize) -> String {
        let cleaned = clean_text(text);
        if cleaned.is_empty() {
            return cleaned;
        }

        match self.try_extract(&cleaned, max_words).await {
            Ok(phrase) => {
                debug!("[KEYWORDS] '{}' -> '{}'", cleaned, phrase);
                phrase
            }
            Err(e) => {
                warn!("[KEYWORDS] Extraction failed ({}), using cleaned text", e);
                cleaned
            }
        }
    }
}
