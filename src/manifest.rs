use crate::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    Lexical,
    Embedding,
}

/// Catalog of built indexes (v1 format)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "formatVersion")]
enum ManifestFile {
    #[serde(rename = "v1")]
    V1 {
        indexes: BTreeMap<IndexKind, IndexEntry>,
        #[serde(rename = "lastUpdated")]
        last_updated: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum IndexEntry {
    #[serde(rename = "built")]
    Built {
        documents: usize,
        /// Vocabulary size for lexical indexes, vector dimension for embedding indexes
        size: usize,
        /// Tokenizer fingerprint or embedding model identity
        identity: String,
        #[serde(rename = "builtAt")]
        built_at: String,
    },
    #[serde(rename = "building")]
    Building {
        #[serde(rename = "startedAt")]
        started_at: String,
    },
    #[serde(rename = "failed")]
    Failed {
        #[serde(rename = "errorMessage")]
        error_message: String,
        #[serde(rename = "lastUpdated")]
        last_updated: String,
    },
}

pub struct ManifestManager {
    path: PathBuf,
    indexes: BTreeMap<IndexKind, IndexEntry>,
}

impl ManifestManager {
    pub fn new(path: PathBuf) -> Result<Self> {
        let mut manager = Self {
            path,
            indexes: BTreeMap::new(),
        };

        if manager.path.exists() {
            manager.load()?;
        }

        Ok(manager)
    }

    pub fn load(&mut self) -> Result<()> {
        let content = std::fs::read_to_string(&self.path)?;
        let ManifestFile::V1 { indexes, .. } = serde_json::from_str(&content)?;
        self.indexes = indexes;
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let manifest = ManifestFile::V1 {
            indexes: self.indexes.clone(),
            last_updated: Utc::now().to_rfc3339(),
        };

        std::fs::write(&self.path, serde_json::to_string_pretty(&manifest)?)?;
        Ok(())
    }

    pub fn set_building(&mut self, kind: IndexKind) {
        self.indexes.insert(kind, IndexEntry::Building { started_at: Utc::now().to_rfc3339() });
    }

    pub fn set_built(&mut self, kind: IndexKind, documents: usize, size: usize, identity: impl Into<String>) {
        self.indexes.insert(
            kind,
            IndexEntry::Built {
                documents,
                size,
                identity: identity.into(),
                built_at: Utc::now().to_rfc3339(),
            },
        );
    }

    pub fn set_failed(&mut self, kind: IndexKind, error: impl Into<String>) {
        self.indexes.insert(
            kind,
            IndexEntry::Failed {
                error_message: error.into(),
                last_updated: Utc::now().to_rfc3339(),
            },
        );
    }

    pub fn get(&self, kind: IndexKind) -> Option<&IndexEntry> {
        self.indexes.get(&kind)
    }

    pub fn is_built(&self, kind: IndexKind) -> bool {
        matches!(self.indexes.get(&kind), Some(IndexEntry::Built { .. }))
    }

    pub fn entries(&self) -> impl Iterator<Item = (&IndexKind, &IndexEntry)> {
        self.indexes.iter()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
