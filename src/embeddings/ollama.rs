
use crate::{Error, Result};
use super::EmbeddingProvider;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

const DEFAULT_MODEL: &str = "qwen3-embedding:0.6b";
const DEFAULT_BASE_URL: &str = "http://127.0.0.1:11434";

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: Vec<String>,
    truncate: bool,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

pub struct OllamaEmbedding {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dimension: AtomicUsize,
    max_chars: usize,
}

impl OllamaEmbedding {
    pub fn new(base_url: Option<String>, model: Option<String>) -> Self {
        let model = model.unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let base_url = base_url
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        let max_chars = Self::context_chars_for_model(&model);

        Self {
            client: reqwest::Client::new(),
            base_url,
            model,
            dimension: AtomicUsize::new(0),
            max_chars,
        }
    }

    /// Rough character budget; CJK text runs close to one token per char
    fn context_chars_for_model(model: &str) -> usize {
        if model.contains("qwen3-embedding") || model.contains("bge-m3") {
            8192
        } else {
            2048
        }
    }

    fn prepare(&self, text: &str) -> String {
        if text.trim().is_empty() {
            return " ".to_string();
        }
        text.chars().take(self.max_chars).collect()
    }

    async fn request(&self, input: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let request = EmbedRequest { model: &self.model, input, truncate: true };
        let url = format!("{}/api/embed", self.base_url);

        let response = self.client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Embedding(format!("Ollama request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Embedding(format!("Ollama API error {status}: {body}")));
        }

        let parsed: EmbedResponse = response.json().await
            .map_err(|e| Error::Embedding(format!("Ollama JSON parse error: {e}")))?;

        if let Some(first) = parsed.embeddings.first() {
            self.dimension.store(first.len(), Ordering::Relaxed);
        }

        Ok(parsed.embeddings)
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.request(vec![self.prepare(text)])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Embedding("Ollama returned no embedding".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.request(texts.iter().map(|t| self.prepare(t)).collect()).await
    }

    fn dimension(&self) -> usize {
        self.dimension.load(Ordering::Relaxed)
    }

    fn provider_name(&self) -> &str {
        "Ollama"
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
