pub mod bm25;
pub mod hybrid;

pub use bm25::{Bm25Params, LexicalIndex, LexicalRetriever};
pub use hybrid::{EnsembleMember, EnsembleRetriever, Normalization, RankFusion};

use crate::types::RetrievalResult;
use crate::Result;
use async_trait::async_trait;

/// Anything that can answer a top-k passage query.
///
/// Lexical, embedding and fused retrievers are interchangeable behind this.
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn query(&self, text: &str, k: usize) -> Result<RetrievalResult>;

    fn name(&self) -> &str;
}
