//! Handles the index_status MCP tool

use super::ToolHandlers;
use crate::manifest::{IndexEntry, IndexKind, ManifestManager};
use crate::Result;
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
pub struct IndexStatusArgs {}

impl ToolHandlers {
    /// Handle index_status tool call - returns JSON string
    pub async fn handle_index_status(&self, _args: IndexStatusArgs) -> Result<String> {
        let manifest = ManifestManager::new(self.config.storage.manifest_path.clone())?;
        let retrieval = self.context.config();

        let mut lines = vec![format!(
            "Retrieval: {:?} mode, {:?} fusion, lexical k={}, semantic k={}, weights {:?}",
            retrieval.mode, retrieval.fusion, retrieval.lexical_k, retrieval.semantic_k, retrieval.weights
        )];

        for kind in [IndexKind::Lexical, IndexKind::Embedding] {
            let line = match manifest.get(kind) {
                Some(IndexEntry::Built { documents, size, identity, built_at }) => {
                    let size_label = match kind {
                        IndexKind::Lexical => "terms",
                        IndexKind::Embedding => "dimensions",
                    };
                    format!(
                        "{:?} index: built, {} documents, {} {} ({}), built at {}",
                        kind, documents, size, size_label, identity, built_at
                    )
                }
                Some(IndexEntry::Building { started_at }) => {
                    format!("{:?} index: building since {}", kind, started_at)
                }
                Some(IndexEntry::Failed { error_message, last_updated }) => {
                    format!("{:?} index: failed at {}: {}", kind, last_updated, error_message)
                }
                None => format!("{:?} index: not built", kind),
            };
            lines.push(line);
        }

        let lexical = self.context.lexical();
        let embedding = self.context.embedding_manifest();

        Ok(serde_json::json!({
            "message": lines.join("\n"),
            "lexical": {
                "documents": lexical.len(),
                "vocabularySize": lexical.vocabulary_size(),
                "tokenizer": lexical.tokenizer_fingerprint(),
            },
            "embedding": embedding.map(|m| serde_json::json!({
                "documents": m.documents,
                "dimension": m.dimension,
                "model": m.identity(),
                "builtAt": m.built_at.to_rfc3339(),
            })),
        })
        .to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::{EmbeddingProvider, HashingEmbedding};
    use crate::pipeline::RetrievalContext;
    use crate::search::{Bm25Params, LexicalIndex};
    use crate::text::Tokenizer;
    use crate::types::Document;
    use crate::Config;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_status_reports_manifest_entries() {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.storage.manifest_path = dir.path().join("manifest.json");

        let tokenizer = Arc::new(Tokenizer::default());
        let provider: Arc<dyn EmbeddingProvider> = Arc::new(HashingEmbedding::new(tokenizer.clone(), 32));
        let lexical = Arc::new(
            LexicalIndex::build(&[Document::new(0, "高血压的诊断")], &tokenizer, Bm25Params::default()).unwrap(),
        );

        let mut manifest = ManifestManager::new(config.storage.manifest_path.clone()).unwrap();
        manifest.set_built(IndexKind::Lexical, 1, lexical.vocabulary_size(), lexical.tokenizer_fingerprint());
        manifest.save().unwrap();

        let context = RetrievalContext::new(config.retrieval.clone(), tokenizer, lexical, None, provider).unwrap();
        let handlers = ToolHandlers::new(config, Arc::new(context));

        let response = handlers.handle_index_status(IndexStatusArgs::default()).await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&response).unwrap();
        let message = json["message"].as_str().unwrap();

        assert!(message.contains("Lexical index: built, 1 documents"));
        assert!(message.contains("Embedding index: not built"));
        assert_eq!(json["lexical"]["documents"], 1);
        assert!(json["embedding"].is_null());
    }
}
