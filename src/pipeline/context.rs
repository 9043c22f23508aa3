//! Retrieval handles shared by the pipeline, the CLI and the MCP server.
//!
//! Indexes are built once, single-threaded, then opened read-only; the
//! context is cheap to share behind an `Arc`.

use super::prompt::PromptTemplate;
use crate::config::{Config, EmbeddingProvider as ProviderKind, FusionMethod, RetrievalConfig, RetrievalMode};
use crate::corpus::load_corpus;
use crate::embeddings::{EmbeddingProvider, HashingEmbedding, OllamaEmbedding, OpenAIEmbedding};
use crate::manifest::{IndexKind, ManifestManager};
use crate::search::{Bm25Params, EnsembleMember, EnsembleRetriever, LexicalIndex, LexicalRetriever, RankFusion, Retriever};
use crate::text::{EmbeddingKeyphraseScorer, KeywordExtractor, Tokenizer};
use crate::types::{IndexStats, QuestionRecord, RetrievalResult};
use crate::vectordb::{EmbedBuildOptions, EmbeddingIndex, EmbeddingManifest, EmbeddingRetriever};
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

pub fn load_tokenizer(config: &Config) -> Result<Tokenizer> {
    match &config.storage.stop_words_path {
        Some(path) => {
            let tokenizer = Tokenizer::from_stop_word_file(path)?;
            info!("[TOKENIZER] Stop words from {:?} ({})", path, tokenizer.fingerprint());
            Ok(tokenizer)
        }
        None => Ok(Tokenizer::default()),
    }
}

pub fn embedding_provider(config: &Config, tokenizer: Arc<Tokenizer>) -> Result<Arc<dyn EmbeddingProvider>> {
    let embedding = &config.embedding;
    let provider: Arc<dyn EmbeddingProvider> = match embedding.provider {
        ProviderKind::OpenAI => {
            let api_key = embedding
                .api_key
                .clone()
                .ok_or_else(|| Error::Config("OPENAI_API_KEY is required for the OpenAI embedding provider".to_string()))?;
            Arc::new(OpenAIEmbedding::new(api_key, Some(embedding.model.clone()), embedding.base_url.clone()))
        }
        ProviderKind::Ollama => {
            Arc::new(OllamaEmbedding::new(embedding.base_url.clone(), Some(embedding.model.clone())))
        }
        ProviderKind::Hashing => Arc::new(HashingEmbedding::new(tokenizer, embedding.hashing_dimension)),
    };

    info!("[EMBEDDINGS] Using {}/{}", provider.provider_name(), provider.model_name());
    Ok(provider)
}

/// Build and persist every index the configured retrieval mode needs
pub async fn build_indexes(config: &Config) -> Result<IndexStats> {
    let start = std::time::Instant::now();
    let storage = &config.storage;

    let tokenizer = Arc::new(load_tokenizer(config)?);
    let documents = Arc::new(load_corpus(&storage.corpus_path)?);
    let mut manifest = ManifestManager::new(storage.manifest_path.clone())?;

    manifest.set_building(IndexKind::Lexical);
    manifest.save()?;

    let params = Bm25Params { k1: config.retrieval.bm25_k1, b: config.retrieval.bm25_b };
    let lexical = {
        let tokenizer = tokenizer.clone();
        let documents = documents.clone();
        tokio::task::spawn_blocking(move || LexicalIndex::build(&documents, &tokenizer, params)).await?
    };
    let lexical = match lexical.and_then(|index| index.persist(&storage.lexical_index).map(|_| index)) {
        Ok(index) => index,
        Err(e) => {
            manifest.set_failed(IndexKind::Lexical, e.to_string());
            manifest.save()?;
            return Err(e);
        }
    };
    manifest.set_built(IndexKind::Lexical, lexical.len(), lexical.vocabulary_size(), lexical.tokenizer_fingerprint());
    manifest.save()?;

    let mut embedding_dimension = None;
    if config.retrieval.mode == RetrievalMode::Hybrid {
        manifest.set_building(IndexKind::Embedding);
        manifest.save()?;

        let provider = embedding_provider(config, tokenizer.clone())?;
        let options = EmbedBuildOptions {
            batch_size: config.embedding.batch_size,
            max_attempts: config.embedding.max_attempts,
            backoff: Duration::from_secs(2),
            checkpoint: None,
        }
        .checkpoint_in(&storage.vectors_dir);

        let built = match EmbeddingIndex::build(&documents, provider.as_ref(), &options).await {
            Ok(index) => index.persist(&storage.vectors_dir).map(|_| index),
            Err(e) => Err(e),
        };
        let index = match built {
            Ok(index) => index,
            Err(e) => {
                manifest.set_failed(IndexKind::Embedding, e.to_string());
                manifest.save()?;
                return Err(e);
            }
        };

        let info = index.manifest();
        manifest.set_built(IndexKind::Embedding, info.documents, info.dimension, info.identity());
        manifest.save()?;
        embedding_dimension = Some(info.dimension);
    }

    let stats = IndexStats {
        documents: lexical.len(),
        vocabulary_size: lexical.vocabulary_size(),
        embedding_dimension,
        elapsed_secs: start.elapsed().as_secs_f64(),
    };
    info!(
        "[INDEX] Built indexes for {} documents in {:.2}s",
        stats.documents, stats.elapsed_secs
    );
    Ok(stats)
}

pub struct RetrievalContext {
    config: RetrievalConfig,
    lexical: Arc<LexicalIndex>,
    embedding: Option<Arc<EmbeddingIndex>>,
    retriever: Arc<dyn Retriever>,
    extractor: KeywordExtractor,
}

impl RetrievalContext {
    pub fn new(
        config: RetrievalConfig,
        tokenizer: Arc<Tokenizer>,
        lexical: Arc<LexicalIndex>,
        embedding: Option<Arc<EmbeddingIndex>>,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        let fusion = match config.fusion {
            FusionMethod::Rrf => RankFusion::reciprocal_rank(config.rrf_k),
            FusionMethod::MinMax => RankFusion::min_max(),
        };

        let mut members = vec![EnsembleMember {
            retriever: Arc::new(LexicalRetriever::new(lexical.clone(), tokenizer.clone())?),
            k: config.lexical_k,
            weight: 1.0,
        }];

        if let Some(index) = &embedding {
            let &[lexical_weight, semantic_weight] = config.weights.as_slice() else {
                return Err(Error::InvalidWeights(format!(
                    "hybrid retrieval needs 2 weights, got {}",
                    config.weights.len()
                )));
            };
            members[0].weight = lexical_weight;
            members.push(EnsembleMember {
                retriever: Arc::new(EmbeddingRetriever::new(index.clone(), provider.clone())?),
                k: config.semantic_k,
                weight: semantic_weight,
            });
        }

        let retriever: Arc<dyn Retriever> = Arc::new(EnsembleRetriever::new(members, fusion)?);
        let extractor = KeywordExtractor::new(tokenizer, Arc::new(EmbeddingKeyphraseScorer::new(provider)));

        Ok(Self { config, lexical, embedding, retriever, extractor })
    }

    /// Load persisted indexes; fails with `NotIndexed` when they are missing
    pub fn open(config: &Config) -> Result<Self> {
        let storage = &config.storage;
        let tokenizer = Arc::new(load_tokenizer(config)?);

        if !storage.lexical_index.exists() {
            return Err(Error::NotIndexed(format!(
                "no lexical index at {}; run `medrag index` first",
                storage.lexical_index.display()
            )));
        }
        let lexical = Arc::new(LexicalIndex::load(&storage.lexical_index, &tokenizer)?);

        let embedding = match config.retrieval.mode {
            RetrievalMode::Lexical => None,
            RetrievalMode::Hybrid => {
                if !EmbeddingIndex::exists(&storage.vectors_dir) {
                    return Err(Error::NotIndexed(format!(
                        "no embedding index in {}; run `medrag index` first",
                        storage.vectors_dir.display()
                    )));
                }
                Some(Arc::new(EmbeddingIndex::load(&storage.vectors_dir)?))
            }
        };

        let provider = embedding_provider(config, tokenizer.clone())?;
        Self::new(config.retrieval.clone(), tokenizer, lexical, embedding, provider)
    }

    /// Open, building the indexes first when any is missing
    pub async fn open_or_build(config: &Config) -> Result<Self> {
        match Self::open(config) {
            Err(Error::NotIndexed(reason)) => {
                info!("[INDEX] {}; building now", reason);
                build_indexes(config).await?;
                Self::open(config)
            }
            other => other,
        }
    }

    /// Text actually sent to the retrievers
    pub async fn query_text(&self, question: &str, extract_keywords: bool) -> String {
        if extract_keywords {
            self.extractor.extract(question, self.config.keyphrase_max_words).await
        } else {
            question.to_string()
        }
    }

    pub async fn retrieve(&self, query: &str, k: usize) -> Result<RetrievalResult> {
        self.retriever.query(query, k).await
    }

    /// Retrieved passages for a question, joined and truncated for the prompt
    pub async fn context_for(&self, question: &str) -> Result<String> {
        let query = self.query_text(question, self.config.extract_keywords).await;
        let result = self.retrieve(&query, self.config.top_k).await?;
        Ok(result.to_context(self.config.max_doc_length))
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    pub fn lexical(&self) -> &LexicalIndex {
        &self.lexical
    }

    pub fn embedding_manifest(&self) -> Option<&EmbeddingManifest> {
        self.embedding.as_deref().map(EmbeddingIndex::manifest)
    }
}

/// A question ready for inference
#[derive(Debug, Clone)]
pub struct PreparedItem {
    /// Position in the input dataset
    pub index: usize,
    pub custom_id: String,
    pub prompt: String,
    pub answer: serde_json::Value,
}

/// Render prompts for every record, retrieving context on a bounded pool.
///
/// With no context the no-retrieval template is used. A failed retrieval
/// leaves that item's context empty.
pub async fn prepare_items(
    context: Option<Arc<RetrievalContext>>,
    records: &[QuestionRecord],
    threads: usize,
) -> Vec<PreparedItem> {
    let start = std::time::Instant::now();
    let mut contexts = vec![String::new(); records.len()];

    let template = match &context {
        Some(ctx) => {
            let semaphore = Arc::new(Semaphore::new(threads.max(1)));
            let mut tasks = JoinSet::new();

            for (index, record) in records.iter().enumerate() {
                let ctx = ctx.clone();
                let semaphore = semaphore.clone();
                let question = record.question.clone();
                tasks.spawn(async move {
                    let _permit = semaphore.acquire_owned().await;
                    (index, ctx.context_for(&question).await)
                });
            }

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((index, Ok(text))) => contexts[index] = text,
                    Ok((index, Err(e))) => warn!("[PREPARE] Retrieval failed for item {}: {}", index, e),
                    Err(e) => warn!("[PREPARE] Retrieval task failed: {}", e),
                }
            }

            PromptTemplate::Rag
        }
        None => PromptTemplate::Pure,
    };

    let items: Vec<PreparedItem> = records
        .iter()
        .zip(contexts)
        .enumerate()
        .map(|(index, (record, context))| PreparedItem {
            index,
            custom_id: record.request_id(index),
            prompt: template.render(record, &context),
            answer: record.ground_truth(),
        })
        .collect();

    info!(
        "[PREPARE] {} prompts ready ({:?} template) in {:.2}s",
        items.len(),
        template,
        start.elapsed().as_secs_f64()
    );
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Document;
    use tempfile::tempdir;

    fn corpus() -> Vec<Document> {
        vec![
            Document::new(0, "急性心肌梗死最常见的死亡原因是心律失常"),
            Document::new(1, "糖尿病患者需要长期控制血糖"),
            Document::new(2, "高血压可引起左心室肥厚"),
        ]
    }

    fn question(text: &str) -> QuestionRecord {
        serde_json::from_value(serde_json::json!({
            "question": text,
            "options": {"A": "心律失常", "B": "心力衰竭"},
            "answer_idx": "A",
            "answer": "心律失常",
            "meta_info": "step1",
        }))
        .unwrap()
    }

    async fn hybrid_context() -> RetrievalContext {
        let tokenizer = Arc::new(Tokenizer::default());
        let provider: Arc<dyn EmbeddingProvider> = Arc::new(HashingEmbedding::new(tokenizer.clone(), 128));
        let lexical = Arc::new(LexicalIndex::build(&corpus(), &tokenizer, Bm25Params::default()).unwrap());
        let embedding = EmbeddingIndex::build(&corpus(), provider.as_ref(), &EmbedBuildOptions::default())
            .await
            .unwrap();

        RetrievalContext::new(
            Config::default().retrieval,
            tokenizer,
            lexical,
            Some(Arc::new(embedding)),
            provider,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_hybrid_retrieval_finds_relevant_passage() {
        let ctx = hybrid_context().await;
        let result = ctx.retrieve("心肌梗死 死亡原因", 4).await.unwrap();
        assert_eq!(result.hits[0].document.id, 0);
    }

    #[tokio::test]
    async fn test_hybrid_requires_two_weights() {
        let tokenizer = Arc::new(Tokenizer::default());
        let provider: Arc<dyn EmbeddingProvider> = Arc::new(HashingEmbedding::new(tokenizer.clone(), 32));
        let lexical = Arc::new(LexicalIndex::build(&corpus(), &tokenizer, Bm25Params::default()).unwrap());
        let embedding = EmbeddingIndex::build(&corpus(), provider.as_ref(), &EmbedBuildOptions::default())
            .await
            .unwrap();

        let mut config = Config::default().retrieval;
        config.weights = vec![1.0];
        let result = RetrievalContext::new(config, tokenizer, lexical, Some(Arc::new(embedding)), provider);
        assert!(matches!(result, Err(Error::InvalidWeights(_))));
    }

    #[tokio::test]
    async fn test_prepare_keeps_one_item_per_record() {
        let ctx = Arc::new(hybrid_context().await);
        let records = vec![question("急性心肌梗死最常见的死亡原因"), question(""), question("血糖控制")];

        let items = prepare_items(Some(ctx), &records, 2).await;
        assert_eq!(items.len(), 3);
        assert_eq!(items.iter().map(|i| i.index).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(items[0].prompt.contains("心律失常"));
        assert_eq!(items[2].custom_id, "req-2-A");
        assert_eq!(items[2].answer, serde_json::json!(["A", "心律失常", "step1"]));
    }

    #[tokio::test]
    async fn test_prepare_without_context_uses_pure_template() {
        let items = prepare_items(None, &[question("血糖控制")], 4).await;
        assert!(!items[0].prompt.contains("相关的资料"));
    }

    #[tokio::test]
    async fn test_open_or_build_with_hashing_provider() {
        let dir = tempdir().unwrap();
        let corpus_path = dir.path().join("corpus.txt");
        std::fs::write(&corpus_path, "心肌梗死的病因\n\n糖尿病的诊断标准\n").unwrap();

        let mut config = Config::default();
        config.embedding.provider = ProviderKind::Hashing;
        config.storage.corpus_path = corpus_path;
        config.storage.lexical_index = dir.path().join("lexical").join("index.bin");
        config.storage.vectors_dir = dir.path().join("vectors");
        config.storage.manifest_path = dir.path().join("manifest.json");

        assert!(matches!(RetrievalContext::open(&config), Err(Error::NotIndexed(_))));

        let ctx = RetrievalContext::open_or_build(&config).await.unwrap();
        assert_eq!(ctx.lexical().len(), 2);
        assert_eq!(ctx.embedding_manifest().map(|m| m.dimension), Some(256));

        let manifest = ManifestManager::new(config.storage.manifest_path.clone()).unwrap();
        assert!(manifest.is_built(IndexKind::Lexical));
        assert!(manifest.is_built(IndexKind::Embedding));

        let result = ctx.retrieve("糖尿病", 2).await.unwrap();
        assert_eq!(result.hits[0].document.id, 2);
    }
}
