
use super::LanguageModel;
use crate::config::LlmConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:11434";

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    keep_alive: &'static str,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    num_predict: usize,
    num_ctx: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

pub struct OllamaModel {
    client: reqwest::Client,
    base_url: String,
    model: String,
    context_window: usize,
    temperature: Option<f32>,
}

impl OllamaModel {
    pub fn new(client: reqwest::Client, config: &LlmConfig) -> Self {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        Self {
            client,
            base_url,
            model: config.model.clone(),
            context_window: config.context_window,
            temperature: config.temperature,
        }
    }
}

#[async_trait]
impl LanguageModel for OllamaModel {
    async fn generate(&self, prompt: &str, max_tokens: usize) -> Result<String> {
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
            keep_alive: "1h",
            options: GenerateOptions {
                num_predict: max_tokens,
                num_ctx: self.context_window,
                temperature: self.temperature,
            },
        };

        let url = format!("{}/api/generate", self.base_url);
        let response = self.client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Inference(format!("Ollama request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Inference(format!("Ollama API error {status}: {body}")));
        }

        let parsed: GenerateResponse = response.json().await
            .map_err(|e| Error::Inference(format!("Ollama JSON parse error: {e}")))?;

        Ok(parsed.response)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
