//! Language-model capability used by the inference workers

pub mod ollama;
pub mod openai;

use crate::config::{LlmConfig, LlmProvider};
use crate::Result;
use async_trait::async_trait;
use std::time::Duration;
use tracing::info;

pub use ollama::OllamaModel;
pub use openai::OpenAIChatModel;

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate(&self, prompt: &str, max_tokens: usize) -> Result<String>;

    fn model_name(&self) -> &str;
}

/// Produces one model instance per worker. Instances are never shared.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(&self, worker_id: usize) -> Result<Box<dyn LanguageModel>>;
}

/// Loads HTTP-backed models from [`LlmConfig`]
pub struct ConfiguredModelLoader {
    config: LlmConfig,
    request_timeout: Option<Duration>,
}

impl ConfiguredModelLoader {
    pub fn new(config: LlmConfig) -> Self {
        Self { config, request_timeout: None }
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[async_trait]
impl ModelLoader for ConfiguredModelLoader {
    async fn load(&self, worker_id: usize) -> Result<Box<dyn LanguageModel>> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = self.request_timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build()?;

        let model: Box<dyn LanguageModel> = match self.config.provider {
            LlmProvider::Ollama => Box::new(OllamaModel::new(client, &self.config)),
            LlmProvider::OpenAI => Box::new(OpenAIChatModel::new(client, &self.config)?),
        };

        info!("[WORKER {}] Loaded model {}", worker_id, model.model_name());
        Ok(model)
    }
}

/// Drop a leading `<think>...</think>` block some reasoning models emit
pub fn strip_reasoning(response: &str) -> &str {
    let trimmed = response.trim_start();
    if let Some(rest) = trimmed.strip_prefix("<think>") {
        if let Some(end) = rest.find("</think>") {
            return rest[end + "</think>".len()..].trim_start();
        }
    }
    response
}
