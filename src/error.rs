use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP request error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("Parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("Index build error: {0}")]
    IndexBuild(String),

    #[error("Tokenizer mismatch: index was built with '{expected}', query tokenizer is '{found}'")]
    TokenizerMismatch { expected: String, found: String },

    #[error("Embedding model mismatch: index was built with '{expected}', provider is '{found}'")]
    EmbeddingModelMismatch { expected: String, found: String },

    #[error("Invalid fusion weights: {0}")]
    InvalidWeights(String),

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("Validation error at line {line}: {message}")]
    Validation { line: usize, message: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Vector database error: {0}")]
    VectorDb(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Keyword extraction error: {0}")]
    Extract(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Index not built: {0}")]
    NotIndexed(String),

    #[error("Task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, Error>;
