//! Append-only checkpoint of completed embedding batches.
//!
//! The first line is a header naming the provider, model, corpus and batch
//! size; each following line holds one batch. A restarted build whose header
//! matches continues after the last intact batch.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing::{info, warn};

pub const CHECKPOINT_FILE: &str = "embeddings.partial.jsonl";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointHeader {
    pub provider: String,
    pub model: String,
    pub corpus: String,
    pub batch_size: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointBatch {
    batch: usize,
    vectors: Vec<Vec<f32>>,
}

pub struct EmbeddingCheckpoint {
    file: File,
    completed_batches: usize,
}

impl EmbeddingCheckpoint {
    /// Open for appending; returns the vectors of batches already on disk
    pub fn open(path: &Path, header: &CheckpointHeader) -> Result<(Self, Vec<Vec<f32>>)> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let (vectors, completed_batches, valid_len) = match std::fs::read_to_string(path) {
            Ok(content) => Self::replay(&content, header),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (Vec::new(), 0, 0),
            Err(e) => return Err(e.into()),
        };

        let file = if valid_len == 0 {
            let mut file = File::create(path)?;
            writeln!(file, "{}", serde_json::to_string(header)?)?;
            file
        } else {
            // drop a torn trailing line before appending
            OpenOptions::new().write(true).open(path)?.set_len(valid_len as u64)?;
            OpenOptions::new().append(true).open(path)?
        };

        if completed_batches > 0 {
            info!(
                "[EMBED-INDEX] Resuming from checkpoint: {} batches ({} vectors) already embedded",
                completed_batches,
                vectors.len()
            );
        }

        Ok((Self { file, completed_batches }, vectors))
    }

    /// `(vectors, batches, byte length of the intact prefix)`; 0 bytes means start over
    fn replay(content: &str, header: &CheckpointHeader) -> (Vec<Vec<f32>>, usize, usize) {
        let mut lines = content.split_inclusive('\n');

        let Some(first) = lines.next() else {
            return (Vec::new(), 0, 0);
        };
        match serde_json::from_str::<CheckpointHeader>(first.trim_end()) {
            Ok(found) if &found == header && first.ends_with('\n') => {}
            Ok(_) => {
                warn!("[EMBED-INDEX] Checkpoint belongs to a different build, starting over");
                return (Vec::new(), 0, 0);
            }
            Err(_) => return (Vec::new(), 0, 0),
        }

        let mut vectors = Vec::new();
        let mut batches = 0;
        let mut valid_len = first.len();

        for line in lines {
            if !line.ends_with('\n') {
                break;
            }
            match serde_json::from_str::<CheckpointBatch>(line.trim_end()) {
                Ok(batch) if batch.batch == batches => {
                    vectors.extend(batch.vectors);
                    batches += 1;
                    valid_len += line.len();
                }
                _ => break,
            }
        }

        (vectors, batches, valid_len)
    }

    pub fn completed_batches(&self) -> usize {
        self.completed_batches
    }

    pub fn append(&mut self, batch: usize, vectors: &[Vec<f32>]) -> Result<()> {
        let line = serde_json::to_string(&CheckpointBatch { batch, vectors: vectors.to_vec() })?;
        writeln!(self.file, "{line}")?;
        self.file.sync_data()?;
        self.completed_batches = batch + 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn header(corpus: &str) -> CheckpointHeader {
        CheckpointHeader {
            provider: "Hashing".to_string(),
            model: "hashing-4".to_string(),
            corpus: corpus.to_string(),
            batch_size: 2,
        }
    }

    #[test]
    fn test_resume_after_append() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE);

        {
            let (mut checkpoint, existing) = EmbeddingCheckpoint::open(&path, &header("c1")).unwrap();
            assert!(existing.is_empty());
            checkpoint.append(0, &[vec![0.5; 4], vec![0.25; 4]]).unwrap();
        }

        let (checkpoint, existing) = EmbeddingCheckpoint::open(&path, &header("c1")).unwrap();
        assert_eq!(checkpoint.completed_batches(), 1);
        assert_eq!(existing, vec![vec![0.5; 4], vec![0.25; 4]]);
    }

    #[test]
    fn test_header_mismatch_starts_over() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE);

        {
            let (mut checkpoint, _) = EmbeddingCheckpoint::open(&path, &header("c1")).unwrap();
            checkpoint.append(0, &[vec![1.0; 4]]).unwrap();
        }

        let (checkpoint, existing) = EmbeddingCheckpoint::open(&path, &header("c2")).unwrap();
        assert_eq!(checkpoint.completed_batches(), 0);
        assert!(existing.is_empty());
    }

    #[test]
    fn test_torn_line_is_discarded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE);

        {
            let (mut checkpoint, _) = EmbeddingCheckpoint::open(&path, &header("c1")).unwrap();
            checkpoint.append(0, &[vec![1.0; 4]]).unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        write!(file, "{{\"batch\":1,\"vec").unwrap();
        drop(file);

        let (mut checkpoint, existing) = EmbeddingCheckpoint::open(&path, &header("c1")).unwrap();
        assert_eq!(existing.len(), 1);
        checkpoint.append(1, &[vec![0.5; 4]]).unwrap();
        drop(checkpoint);

        let (_, existing) = EmbeddingCheckpoint::open(&path, &header("c1")).unwrap();
        assert_eq!(existing.len(), 2);
    }
}
