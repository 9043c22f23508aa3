//! Dense embedding index: stored vectors plus a USearch HNSW graph

pub mod partial;
pub mod usearch_db;

use crate::corpus::corpus_fingerprint;
use crate::embeddings::{embed_batch_with_retry, model_identity, EmbeddingProvider};
use crate::search::Retriever;
use crate::types::{Document, RetrievalResult, ScoredDocument};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use partial::{CheckpointHeader, EmbeddingCheckpoint, CHECKPOINT_FILE};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub use usearch_db::HnswGraph;

pub const EMBEDDINGS_FILE: &str = "embeddings.bin";
pub const GRAPH_FILE: &str = "index.usearch";
pub const EMBEDDING_FORMAT_VERSION: u32 = 1;

/// Identity of the model that produced the stored vectors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingManifest {
    pub format_version: u32,
    pub provider: String,
    pub model: String,
    pub dimension: usize,
    pub documents: usize,
    pub corpus: String,
    pub built_at: DateTime<Utc>,
}

impl EmbeddingManifest {
    pub fn identity(&self) -> String {
        model_identity(&self.provider, &self.model, self.dimension)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEmbeddings {
    pub manifest: EmbeddingManifest,
    pub documents: Vec<Document>,
    pub vectors: Vec<Vec<f32>>,
}

#[derive(Debug, Clone)]
pub struct EmbedBuildOptions {
    pub batch_size: usize,
    pub max_attempts: usize,
    pub backoff: Duration,
    /// Where completed batches are checkpointed; `None` disables resume
    pub checkpoint: Option<PathBuf>,
}

impl Default for EmbedBuildOptions {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            max_attempts: 3,
            backoff: Duration::from_secs(2),
            checkpoint: None,
        }
    }
}

impl EmbedBuildOptions {
    /// Checkpoint into the directory the index will be persisted to
    pub fn checkpoint_in(mut self, dir: &Path) -> Self {
        self.checkpoint = Some(dir.join(CHECKPOINT_FILE));
        self
    }
}

pub struct EmbeddingIndex {
    stored: StoredEmbeddings,
    graph: HnswGraph,
}

impl EmbeddingIndex {
    pub async fn build(
        documents: &[Document],
        provider: &dyn EmbeddingProvider,
        options: &EmbedBuildOptions,
    ) -> Result<Self> {
        if documents.is_empty() {
            return Err(Error::IndexBuild("corpus is empty".to_string()));
        }
        let start = std::time::Instant::now();
        let batch_size = options.batch_size.max(1);
        let corpus = corpus_fingerprint(documents);

        let mut checkpoint = None;
        let mut vectors: Vec<Vec<f32>> = Vec::with_capacity(documents.len());
        if let Some(path) = &options.checkpoint {
            let header = CheckpointHeader {
                provider: provider.provider_name().to_string(),
                model: provider.model_name().to_string(),
                corpus: corpus.clone(),
                batch_size,
            };
            let (opened, existing) = EmbeddingCheckpoint::open(path, &header)?;
            vectors = existing;
            checkpoint = Some(opened);
        }

        let total_batches = documents.len().div_ceil(batch_size);
        let first_batch = vectors.len() / batch_size;
        vectors.truncate(first_batch * batch_size);

        for (batch, chunk) in documents.chunks(batch_size).enumerate().skip(first_batch) {
            let texts: Vec<String> = chunk.iter().map(|d| d.text.clone()).collect();
            let embedded = embed_batch_with_retry(provider, &texts, options.max_attempts, options.backoff)
                .await
                .map_err(|e| Error::IndexBuild(format!(
                    "embedding batch {}/{} failed after {} attempts: {e}",
                    batch + 1,
                    total_batches,
                    options.max_attempts.max(1)
                )))?;

            if let Some(checkpoint) = checkpoint.as_mut() {
                checkpoint.append(batch, &embedded)?;
            }
            vectors.extend(embedded);

            info!("[EMBED-INDEX] Batch {}/{} done ({} vectors)", batch + 1, total_batches, vectors.len());
        }

        let dimension = vectors.first().map(Vec::len).unwrap_or(0);
        if dimension == 0 {
            return Err(Error::IndexBuild("provider returned empty vectors".to_string()));
        }
        if let Some(bad) = vectors.iter().position(|v| v.len() != dimension) {
            return Err(Error::IndexBuild(format!(
                "document {} has dimension {}, expected {dimension}",
                documents[bad].id,
                vectors[bad].len()
            )));
        }

        let manifest = EmbeddingManifest {
            format_version: EMBEDDING_FORMAT_VERSION,
            provider: provider.provider_name().to_string(),
            model: provider.model_name().to_string(),
            dimension,
            documents: documents.len(),
            corpus,
            built_at: Utc::now(),
        };
        let graph = HnswGraph::from_vectors(dimension, &vectors)?;

        info!(
            "[EMBED-INDEX] Embedded {} documents with {} in {:.2}s",
            documents.len(),
            manifest.identity(),
            start.elapsed().as_secs_f64()
        );

        Ok(Self {
            stored: StoredEmbeddings { manifest, documents: documents.to_vec(), vectors },
            graph,
        })
    }

    /// Writes `embeddings.bin` and `index.usearch` under `dir`, then drops the build checkpoint
    pub fn persist(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;

        let bytes = bincode::serde::encode_to_vec(&self.stored, bincode::config::standard())
            .map_err(|e| Error::Serialization(e.to_string()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(dir.join(EMBEDDINGS_FILE)).map_err(|e| Error::Io(e.error))?;

        self.graph.save(&dir.join(GRAPH_FILE))?;

        let checkpoint = dir.join(CHECKPOINT_FILE);
        if checkpoint.exists() {
            std::fs::remove_file(&checkpoint)?;
        }

        info!("[EMBED-INDEX] Persisted {} vectors to {:?}", self.len(), dir);
        Ok(())
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let bytes = std::fs::read(dir.join(EMBEDDINGS_FILE))?;
        let (stored, _len): (StoredEmbeddings, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                .map_err(|e| Error::Serialization(e.to_string()))?;

        if stored.manifest.format_version != EMBEDDING_FORMAT_VERSION {
            return Err(Error::IndexBuild(format!(
                "unsupported embedding index format {} (expected {})",
                stored.manifest.format_version, EMBEDDING_FORMAT_VERSION
            )));
        }
        if stored.vectors.len() != stored.documents.len() {
            return Err(Error::IndexBuild(format!(
                "{} vectors for {} documents",
                stored.vectors.len(),
                stored.documents.len()
            )));
        }

        let dimension = stored.manifest.dimension;
        let graph_path = dir.join(GRAPH_FILE);
        let graph = match HnswGraph::load(&graph_path, dimension) {
            Ok(graph) if graph.size() == stored.vectors.len() => graph,
            Ok(graph) => {
                warn!(
                    "[EMBED-INDEX] Graph holds {} vectors, expected {}; rebuilding",
                    graph.size(),
                    stored.vectors.len()
                );
                HnswGraph::from_vectors(dimension, &stored.vectors)?
            }
            Err(e) => {
                warn!("[EMBED-INDEX] Could not load {:?} ({}); rebuilding from stored vectors", graph_path, e);
                HnswGraph::from_vectors(dimension, &stored.vectors)?
            }
        };

        info!("[EMBED-INDEX] Loaded {} vectors ({})", stored.vectors.len(), stored.manifest.identity());
        Ok(Self { stored, graph })
    }

    /// Fails unless `provider` is the one the vectors were built with
    pub fn check_provider(&self, provider: &dyn EmbeddingProvider) -> Result<()> {
        let manifest = &self.stored.manifest;
        let same_model = provider.provider_name() == manifest.provider && provider.model_name() == manifest.model;
        let dimension = provider.dimension();
        let same_dimension = dimension == 0 || dimension == manifest.dimension;

        if !same_model || !same_dimension {
            return Err(Error::EmbeddingModelMismatch {
                expected: manifest.identity(),
                found: model_identity(provider.provider_name(), provider.model_name(), dimension),
            });
        }
        Ok(())
    }

    pub async fn query(&self, provider: &dyn EmbeddingProvider, text: &str, k: usize) -> Result<RetrievalResult> {
        self.check_provider(provider)?;
        if k == 0 {
            return Ok(RetrievalResult::empty(k));
        }

        let vector = provider.embed(text).await?;
        if vector.len() != self.stored.manifest.dimension {
            return Err(Error::EmbeddingModelMismatch {
                expected: self.stored.manifest.identity(),
                found: model_identity(provider.provider_name(), provider.model_name(), vector.len()),
            });
        }

        let hits = self
            .graph
            .search(&vector, k)?
            .into_iter()
            .filter_map(|(key, score)| {
                self.stored
                    .documents
                    .get(key as usize)
                    .map(|doc| ScoredDocument { document: doc.clone(), score })
            })
            .collect();

        let result = RetrievalResult::new(hits, k);
        debug!("[EMBED-INDEX] Query -> {} hits", result.len());
        Ok(result)
    }

    pub fn manifest(&self) -> &EmbeddingManifest {
        &self.stored.manifest
    }

    pub fn stored(&self) -> &StoredEmbeddings {
        &self.stored
    }

    pub fn len(&self) -> usize {
        self.stored.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stored.documents.is_empty()
    }

    pub fn exists(dir: &Path) -> bool {
        dir.join(EMBEDDINGS_FILE).exists()
    }
}

pub struct EmbeddingRetriever {
    index: Arc<EmbeddingIndex>,
    provider: Arc<dyn EmbeddingProvider>,
}

impl EmbeddingRetriever {
    pub fn new(index: Arc<EmbeddingIndex>, provider: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        index.check_provider(provider.as_ref())?;
        Ok(Self { index, provider })
    }
}

#[async_trait]
impl Retriever for EmbeddingRetriever {
    async fn query(&self, text: &str, k: usize) -> Result<RetrievalResult> {
        self.index.query(self.provider.as_ref(), text, k).await
    }

    fn name(&self) -> &str {
        "embedding"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::HashingEmbedding;
    use crate::text::Tokenizer;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn corpus() -> Vec<Document> {
        vec![
            Document::new(0, "急性心肌梗死的典型症状是胸痛"),
            Document::new(1, "糖尿病患者需要长期控制血糖"),
            Document::new(2, "高血压可引起左心室肥厚"),
            Document::new(4, "骨折愈合分为血肿机化期和骨痂形成期"),
            Document::new(5, "肺炎链球菌是社区获得性肺炎的常见病原体"),
        ]
    }

    fn hashing(dimension: usize) -> HashingEmbedding {
        HashingEmbedding::new(Arc::new(Tokenizer::default()), dimension)
    }

    fn options(batch_size: usize) -> EmbedBuildOptions {
        EmbedBuildOptions { batch_size, max_attempts: 1, backoff: Duration::from_millis(1), checkpoint: None }
    }

    /// Counts batch calls and fails every call from `fail_from` on
    struct CountingProvider {
        inner: HashingEmbedding,
        calls: AtomicUsize,
        fail_from: Option<usize>,
    }

    #[async_trait]
    impl EmbeddingProvider for CountingProvider {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            self.inner.embed(text).await
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_from.is_some_and(|from| call >= from) {
                return Err(Error::Embedding("provider went away".to_string()));
            }
            self.inner.embed_batch(texts).await
        }

        fn dimension(&self) -> usize {
            self.inner.dimension()
        }

        fn provider_name(&self) -> &str {
            self.inner.provider_name()
        }

        fn model_name(&self) -> &str {
            self.inner.model_name()
        }
    }

    #[tokio::test]
    async fn test_build_rejects_empty_corpus() {
        let result = EmbeddingIndex::build(&[], &hashing(32), &options(2)).await;
        assert!(matches!(result, Err(Error::IndexBuild(_))));
    }

    #[tokio::test]
    async fn test_query_finds_similar_passage() {
        let provider = hashing(256);
        let index = EmbeddingIndex::build(&corpus(), &provider, &options(2)).await.unwrap();

        let result = index.query(&provider, "糖尿病血糖控制", 2).await.unwrap();
        assert!(result.len() <= 2);
        assert_eq!(result.hits[0].document.id, 1);
        assert!(result.hits.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[tokio::test]
    async fn test_persist_load_round_trip() {
        let dir = tempdir().unwrap();
        let provider = hashing(64);

        let index = EmbeddingIndex::build(&corpus(), &provider, &options(2)).await.unwrap();
        index.persist(dir.path()).unwrap();
        let loaded = EmbeddingIndex::load(dir.path()).unwrap();

        assert_eq!(index.stored(), loaded.stored());
        let query = "高血压 左心室";
        assert_eq!(
            index.query(&provider, query, 3).await.unwrap().ids(),
            loaded.query(&provider, query, 3).await.unwrap().ids()
        );
    }

    #[tokio::test]
    async fn test_missing_graph_is_rebuilt() {
        let dir = tempdir().unwrap();
        let provider = hashing(64);

        EmbeddingIndex::build(&corpus(), &provider, &options(10)).await.unwrap().persist(dir.path()).unwrap();
        std::fs::remove_file(dir.path().join(GRAPH_FILE)).unwrap();

        let loaded = EmbeddingIndex::load(dir.path()).unwrap();
        assert_eq!(loaded.len(), 5);
        assert!(!loaded.query(&provider, "肺炎", 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_model_mismatch_is_rejected() {
        let index = Arc::new(EmbeddingIndex::build(&corpus(), &hashing(64), &options(2)).await.unwrap());
        let other: Arc<dyn EmbeddingProvider> = Arc::new(hashing(32));

        let result = index.query(other.as_ref(), "肺炎", 1).await;
        assert!(matches!(result, Err(Error::EmbeddingModelMismatch { .. })));
        assert!(EmbeddingRetriever::new(index, other).is_err());
    }

    #[tokio::test]
    async fn test_tokenizer_change_is_rejected() {
        let index = EmbeddingIndex::build(&corpus(), &hashing(64), &options(2)).await.unwrap();
        let other = HashingEmbedding::new(Arc::new(Tokenizer::new(["肺炎"])), 64);

        match index.check_provider(&other) {
            Err(Error::EmbeddingModelMismatch { expected, found }) => {
                assert!(expected.starts_with("Hashing/hashing-64-"));
                assert!(expected.ends_with("(64d)"));
                assert_ne!(expected, found);
            }
            outcome => panic!("expected model mismatch, got {outcome:?}"),
        }
    }

    #[tokio::test]
    async fn test_failed_build_resumes_from_checkpoint() {
        let dir = tempdir().unwrap();
        let opts = options(2).checkpoint_in(dir.path());

        let flaky = CountingProvider { inner: hashing(64), calls: AtomicUsize::new(0), fail_from: Some(1) };
        let result = EmbeddingIndex::build(&corpus(), &flaky, &opts).await;
        assert!(matches!(result, Err(Error::IndexBuild(_))));
        assert!(dir.path().join(CHECKPOINT_FILE).exists());

        let healthy = CountingProvider { inner: hashing(64), calls: AtomicUsize::new(0), fail_from: None };
        let index = EmbeddingIndex::build(&corpus(), &healthy, &opts).await.unwrap();
        assert_eq!(healthy.calls.load(Ordering::SeqCst), 2);
        assert_eq!(index.len(), 5);

        index.persist(dir.path()).unwrap();
        assert!(!dir.path().join(CHECKPOINT_FILE).exists());
    }
}
