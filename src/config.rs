use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Embedding provider configuration
    pub embedding: EmbeddingConfig,

    /// Language model used for answering
    pub llm: LlmConfig,

    /// Storage paths
    pub storage: StorageConfig,

    /// Retrieval and fusion configuration
    pub retrieval: RetrievalConfig,

    /// Batch inference configuration
    pub inference: InferenceConfig,

    /// Accuracy scoring configuration
    pub scoring: ScoringConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProvider,
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: Option<String>,
    /// Documents per provider call during index build
    pub batch_size: usize,
    /// Attempts per batch before the whole build fails
    pub max_attempts: usize,
    /// Dimension of the offline hashing provider
    pub hashing_dimension: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    OpenAI,
    Ollama,
    Hashing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub model: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub max_tokens: usize,
    pub context_window: usize,
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    Ollama,
    OpenAI,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub corpus_path: PathBuf,
    pub lexical_index: PathBuf,
    pub vectors_dir: PathBuf,
    pub manifest_path: PathBuf,
    pub stop_words_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalMode {
    Hybrid,
    Lexical,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FusionMethod {
    Rrf,
    MinMax,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub mode: RetrievalMode,
    pub lexical_k: usize,
    pub semantic_k: usize,
    /// Weights in member order: lexical, then semantic
    pub weights: Vec<f32>,
    pub fusion: FusionMethod,
    pub rrf_k: usize,
    /// Fused result size handed to the prompt
    pub top_k: usize,
    pub max_doc_length: usize,
    pub extract_keywords: bool,
    pub keyphrase_max_words: usize,
    pub bm25_k1: f32,
    pub bm25_b: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    pub num_workers: usize,
    /// Records buffered before each checkpoint flush
    pub batch_size: usize,
    pub retrieval_threads: usize,
    pub item_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    pub labels: String,
    pub id_field: String,
    pub id_delimiter: char,
    pub id_position: usize,
    pub answer_field: String,
    pub strip_reasoning: bool,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = PathBuf::from("./data");
        Self {
            embedding: EmbeddingConfig {
                provider: EmbeddingProvider::Ollama,
                api_key: None,
                model: "qwen3-embedding:0.6b".to_string(),
                base_url: None,
                batch_size: 1000,
                max_attempts: 3,
                hashing_dimension: 256,
            },
            llm: LlmConfig {
                provider: LlmProvider::Ollama,
                model: "qwen3:0.6b".to_string(),
                base_url: None,
                api_key: None,
                max_tokens: 512,
                context_window: 4096,
                temperature: None,
            },
            storage: StorageConfig::under(&data_dir, PathBuf::from("./corpus/all_books.txt")),
            retrieval: RetrievalConfig {
                mode: RetrievalMode::Hybrid,
                lexical_k: 2,
                semantic_k: 2,
                weights: vec![0.5, 0.5],
                fusion: FusionMethod::Rrf,
                rrf_k: 60,
                top_k: 4,
                max_doc_length: 800,
                extract_keywords: true,
                keyphrase_max_words: 3,
                bm25_k1: 1.5,
                bm25_b: 0.75,
            },
            inference: InferenceConfig {
                num_workers: 4,
                batch_size: 50,
                retrieval_threads: 8,
                item_timeout_secs: Some(300),
            },
            scoring: ScoringConfig {
                labels: "ABCDE".to_string(),
                id_field: "custom_id".to_string(),
                id_delimiter: '-',
                id_position: 2,
                answer_field: "answer".to_string(),
                strip_reasoning: true,
            },
        }
    }
}

impl StorageConfig {
    fn under(data_dir: &std::path::Path, corpus_path: PathBuf) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            corpus_path,
            lexical_index: data_dir.join("lexical").join("index.bin"),
            vectors_dir: data_dir.join("vectors"),
            manifest_path: data_dir.join("manifest.json"),
            stop_words_path: None,
        }
    }

    /// Same corpus and stop words, index files under another data directory
    pub fn relocated(&self, data_dir: &std::path::Path) -> Self {
        Self {
            stop_words_path: self.stop_words_path.clone(),
            ..Self::under(data_dir, self.corpus_path.clone())
        }
    }
}

impl Config {
    /// Load configuration from environment variables and .env file
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let mut config = Self::default();

        if let Ok(provider) = std::env::var("EMBEDDING_PROVIDER") {
            config.embedding.provider = match provider.to_lowercase().as_str() {
                "openai" => EmbeddingProvider::OpenAI,
                "hashing" => EmbeddingProvider::Hashing,
                _ => EmbeddingProvider::Ollama,
            };
        }

        if let Ok(api_key) = std::env::var("OPENAI_API_KEY") {
            config.embedding.api_key = Some(api_key);
        }

        if let Ok(model) = std::env::var("EMBEDDING_MODEL") {
            config.embedding.model = model;
        }

        if let Ok(base_url) = std::env::var("EMBEDDING_BASE_URL") {
            config.embedding.base_url = Some(base_url);
        }

        if let Some(batch_size) = env_parse("EMBEDDING_BATCH_SIZE") {
            config.embedding.batch_size = batch_size;
        }

        // Language model
        if let Ok(provider) = std::env::var("LLM_PROVIDER") {
            config.llm.provider = match provider.to_lowercase().as_str() {
                "openai" => LlmProvider::OpenAI,
                _ => LlmProvider::Ollama,
            };
        }

        if let Ok(model) = std::env::var("LLM_MODEL") {
            config.llm.model = model;
        }

        if let Ok(base_url) = std::env::var("LLM_BASE_URL") {
            config.llm.base_url = Some(base_url);
        }

        if let Ok(api_key) = std::env::var("LLM_API_KEY") {
            config.llm.api_key = Some(api_key);
        }

        if let Some(max_tokens) = env_parse("LLM_MAX_TOKENS") {
            config.llm.max_tokens = max_tokens;
        }

        // Storage configuration
        if let Ok(data_dir) = std::env::var("DATA_DIR") {
            config.storage = config.storage.relocated(&PathBuf::from(data_dir));
        }

        if let Ok(corpus_path) = std::env::var("CORPUS_PATH") {
            config.storage.corpus_path = PathBuf::from(corpus_path);
        }

        if let Ok(stop_words) = std::env::var("STOP_WORDS_PATH") {
            config.storage.stop_words_path = Some(PathBuf::from(stop_words));
        }

        // Retrieval
        if let Ok(mode) = std::env::var("RETRIEVAL_MODE") {
            config.retrieval.mode = match mode.to_lowercase().as_str() {
                "lexical" => RetrievalMode::Lexical,
                _ => RetrievalMode::Hybrid,
            };
        }

        if let Ok(fusion) = std::env::var("FUSION_METHOD") {
            config.retrieval.fusion = match fusion.to_lowercase().as_str() {
                "minmax" | "min-max" => FusionMethod::MinMax,
                _ => FusionMethod::Rrf,
            };
        }

        // Inference
        if let Some(workers) = env_parse("NUM_WORKERS") {
            config.inference.num_workers = workers;
        }

        if let Some(batch_size) = env_parse("CHECKPOINT_BATCH_SIZE") {
            config.inference.batch_size = batch_size;
        }

        if let Some(timeout) = env_parse::<u64>("ITEM_TIMEOUT_SECS") {
            config.inference.item_timeout_secs = if timeout == 0 { None } else { Some(timeout) };
        }

        Ok(config)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let value = std::env::var(key).ok()?;
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!("[CONFIG] Ignoring unparseable {}={}", key, value);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_follow_storage_layout() {
        let config = Config::default();
        assert_eq!(config.storage.lexical_index, PathBuf::from("./data/lexical/index.bin"));
        assert_eq!(config.storage.vectors_dir, PathBuf::from("./data/vectors"));
        assert_eq!(config.retrieval.weights, vec![0.5, 0.5]);
        assert_eq!(config.inference.batch_size, 50);
    }

    #[test]
    fn test_relocated_keeps_inputs() {
        let mut storage = Config::default().storage;
        storage.stop_words_path = Some(PathBuf::from("stop.txt"));
        let moved = storage.relocated(std::path::Path::new("/tmp/medrag"));
        assert_eq!(moved.manifest_path, PathBuf::from("/tmp/medrag/manifest.json"));
        assert_eq!(moved.corpus_path, storage.corpus_path);
        assert_eq!(moved.stop_words_path, Some(PathBuf::from("stop.txt")));
    }
}
