//! Handles the retrieve_passages MCP tool

use super::ToolHandlers;
use crate::Result;
use serde::Deserialize;
use tracing::info;

const MAX_LIMIT: usize = 50;

#[derive(Debug, Deserialize)]
pub struct RetrievePassagesArgs {
    pub query: String,
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Defaults to the configured behavior
    #[serde(default)]
    pub extract_keywords: Option<bool>,
}

fn default_limit() -> usize {
    4
}

impl ToolHandlers {
    /// Handle retrieve_passages tool call - returns JSON string
    pub async fn handle_retrieve_passages(&self, args: RetrievePassagesArgs) -> Result<String> {
        let RetrievePassagesArgs { query, limit, extract_keywords } = args;

        if query.trim().is_empty() {
            return Ok(serde_json::json!({ "error": "Query must not be empty" }).to_string());
        }

        let limit = limit.clamp(1, MAX_LIMIT);
        let extract = extract_keywords.unwrap_or(self.context.config().extract_keywords);

        let query_text = self.context.query_text(&query, extract).await;
        info!("[SEARCH] Query: \"{}\" -> \"{}\" (limit {})", query, query_text, limit);

        let result = self.context.retrieve(&query_text, limit).await?;
        info!("[SEARCH] Found {} passages", result.len());

        if result.is_empty() {
            return Ok(serde_json::json!({
                "message": format!("No passages found for query: \"{}\"", query),
                "query": query_text,
            })
            .to_string());
        }

        let passages: Vec<_> = result
            .iter()
            .enumerate()
            .map(|(rank, hit)| {
                serde_json::json!({
                    "rank": rank + 1,
                    "id": hit.document.id,
                    "score": hit.score,
                    "text": hit.document.text,
                })
            })
            .collect();

        Ok(serde_json::json!({
            "message": format!("Found {} passages for query: \"{}\"", passages.len(), query),
            "query": query_text,
            "results_count": passages.len(),
            "results": passages,
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

    fn handlers() -> ToolHandlers {
        let mut config = Config::default();
        config.retrieval.extract_keywords = false;

        let tokenizer = Arc::new(Tokenizer::default());
        let provider: Arc<dyn EmbeddingProvider> = Arc::new(HashingEmbedding::new(tokenizer.clone(), 64));
        let corpus = vec![
            Document::new(0, "急性心肌梗死最常见的死亡原因是心律失常"),
            Document::new(1, "糖尿病患者需要长期控制血糖"),
        ];
        let lexical = Arc::new(LexicalIndex::build(&corpus, &tokenizer, Bm25Params::default()).unwrap());
        let context = RetrievalContext::new(config.retrieval.clone(), tokenizer, lexical, None, provider).unwrap();

        ToolHandlers::new(config, Arc::new(context))
    }

    #[tokio::test]
    async fn test_retrieve_passages() {
        let args: RetrievePassagesArgs = serde_json::from_value(serde_json::json!({"query": "血糖控制"})).unwrap();
        let response = handlers().handle_retrieve_passages(args).await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&response).unwrap();

        assert_eq!(json["results_count"], 2);
        assert_eq!(json["results"][0]["id"], 1);
        assert_eq!(json["results"][1]["id"], 0);
        assert_eq!(json["results"][0]["rank"], 1);
    }

    #[tokio::test]
    async fn test_empty_query_is_reported() {
        let args = RetrievePassagesArgs { query: "  ".to_string(), limit: 4, extract_keywords: None };
        let response = handlers().handle_retrieve_passages(args).await.unwrap();
        assert!(response.contains("error"));
    }
}
