//! BM25 lexical index over tokenizer output

use super::Retriever;
use crate::text::Tokenizer;
use crate::types::{Document, RetrievalResult, ScoredDocument};
use crate::{Error, Result};
use async_trait::async_trait;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Bumped whenever the persisted layout changes
pub const INDEX_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bm25Params {
    pub k1: f32,
    pub b: f32,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.5, b: 0.75 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct Posting {
    /// Position in `documents`
    doc: u32,
    term_frequency: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LexicalIndex {
    format_version: u32,
    tokenizer_fingerprint: String,
    params: Bm25Params,
    documents: Vec<Document>,
    doc_lengths: Vec<u32>,
    avg_doc_length: f32,
    postings: BTreeMap<String, Vec<Posting>>,
    idf: BTreeMap<String, f32>,
}

impl LexicalIndex {
    pub fn build(documents: &[Document], tokenizer: &Tokenizer, params: Bm25Params) -> Result<Self> {
        if documents.is_empty() {
            return Err(Error::IndexBuild("corpus is empty".to_string()));
        }
        let start = std::time::Instant::now();

        let tokenized: Vec<Vec<String>> = documents
            .par_iter()
            .map(|doc| tokenizer.tokenize(&doc.text))
            .collect();

        let mut postings: BTreeMap<String, Vec<Posting>> = BTreeMap::new();
        let mut doc_lengths = Vec::with_capacity(documents.len());
        let mut total_length: u64 = 0;

        for (position, tokens) in tokenized.into_iter().enumerate() {
            let doc = u32::try_from(position)
                .map_err(|_| Error::IndexBuild("corpus exceeds u32 documents".to_string()))?;

            doc_lengths.push(tokens.len() as u32);
            total_length += tokens.len() as u64;

            let mut frequencies: BTreeMap<String, u32> = BTreeMap::new();
            for token in tokens {
                *frequencies.entry(token).or_insert(0) += 1;
            }
            for (term, term_frequency) in frequencies {
                postings.entry(term).or_default().push(Posting { doc, term_frequency });
            }
        }

        let n = documents.len() as f32;
        let idf = postings
            .iter()
            .map(|(term, list)| {
                let df = list.len() as f32;
                (term.clone(), ((n - df + 0.5) / (df + 0.5) + 1.0).ln())
            })
            .collect();

        let index = Self {
            format_version: INDEX_FORMAT_VERSION,
            tokenizer_fingerprint: tokenizer.fingerprint().to_string(),
            params,
            documents: documents.to_vec(),
            doc_lengths,
            avg_doc_length: total_length as f32 / n,
            postings,
            idf,
        };

        info!(
            "[LEXICAL] Indexed {} documents, {} terms in {:.2}s",
            index.len(),
            index.vocabulary_size(),
            start.elapsed().as_secs_f64()
        );

        Ok(index)
    }

    /// Write to a temp file next to `path`, then rename over it
    pub fn persist(&self, path: &Path) -> Result<()> {
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(parent)?;

        let bytes = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| Error::Serialization(e.to_string()))?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| Error::Io(e.error))?;

        info!("[LEXICAL] Persisted index to {:?} ({} bytes)", path, bytes.len());
        Ok(())
    }

    pub fn load(path: &Path, tokenizer: &Tokenizer) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let (index, _len): (Self, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                .map_err(|e| Error::Serialization(e.to_string()))?;

        if index.format_version != INDEX_FORMAT_VERSION {
            return Err(Error::IndexBuild(format!(
                "unsupported lexical index format {} (expected {})",
                index.format_version, INDEX_FORMAT_VERSION
            )));
        }
        index.check_tokenizer(tokenizer)?;

        info!("[LEXICAL] Loaded {} documents from {:?}", index.len(), path);
        Ok(index)
    }

    pub fn check_tokenizer(&self, tokenizer: &Tokenizer) -> Result<()> {
        if tokenizer.fingerprint() != self.tokenizer_fingerprint {
            return Err(Error::TokenizerMismatch {
                expected: self.tokenizer_fingerprint.clone(),
                found: tokenizer.fingerprint().to_string(),
            });
        }
        Ok(())
    }

    pub fn query(&self, tokenizer: &Tokenizer, text: &str, k: usize) -> Result<RetrievalResult> {
        self.check_tokenizer(tokenizer)?;

        let terms: BTreeSet<String> = tokenizer.tokenize(text).into_iter().collect();
        if terms.is_empty() || k == 0 {
            return Ok(RetrievalResult::empty(k));
        }

        let Bm25Params { k1, b } = self.params;
        let avgdl = self.avg_doc_length.max(f32::EPSILON);
        let mut scores: HashMap<u32, f32> = HashMap::new();

        for term in &terms {
            let (Some(list), Some(idf)) = (self.postings.get(term), self.idf.get(term)) else {
                continue;
            };
            for posting in list {
                let dl = self.doc_lengths[posting.doc as usize] as f32;
                let tf = posting.term_frequency as f32;
                let tf_norm = (tf * (k1 + 1.0)) / (tf + k1 * (1.0 - b + b * dl / avgdl));
                *scores.entry(posting.doc).or_insert(0.0) += idf * tf_norm;
            }
        }

        if scores.is_empty() {
            return Ok(RetrievalResult::empty(k));
        }

        let mut hits: Vec<ScoredDocument> = scores
            .iter()
            .map(|(&doc, &score)| ScoredDocument { document: self.documents[doc as usize].clone(), score })
            .collect();

        // pad with unmatched documents in corpus order
        if hits.len() < k {
            let padding = self
                .documents
                .iter()
                .enumerate()
                .filter(|(position, _)| !scores.contains_key(&(*position as u32)))
                .take(k - hits.len())
                .map(|(_, document)| ScoredDocument { document: document.clone(), score: 0.0 });
            hits.extend(padding);
        }

        let result = RetrievalResult::new(hits, k);
        debug!("[LEXICAL] {} terms -> {} hits", terms.len(), result.len());
        Ok(result)
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn vocabulary_size(&self) -> usize {
        self.postings.len()
    }

    pub fn tokenizer_fingerprint(&self) -> &str {
        &self.tokenizer_fingerprint
    }

    pub fn documents(&self) -> &[Document] {
        &self.documents
    }
}

pub struct LexicalRetriever {
    index: Arc<LexicalIndex>,
    tokenizer: Arc<Tokenizer>,
}

impl LexicalRetriever {
    pub fn new(index: Arc<LexicalIndex>, tokenizer: Arc<Tokenizer>) -> Result<Self> {
        index.check_tokenizer(&tokenizer)?;
        Ok(Self { index, tokenizer })
    }
}

#[async_trait]
impl Retriever for LexicalRetriever {
    async fn query(&self, text: &str, k: usize) -> Result<RetrievalResult> {
        self.index.query(&self.tokenizer, text, k)
    }

    fn name(&self) -> &str {
        "bm25"
    }
}
