pub mod batch;
pub mod corpus;
pub mod embeddings;
pub mod handlers;
pub mod llm;
pub mod manifest;
pub mod pipeline;
pub mod scoring;
pub mod search;
pub mod text;
pub mod vectordb;

pub mod error;
pub mod types;
pub mod config;

pub use error::{Error, Result};
pub use types::*;
pub use config::Config;
