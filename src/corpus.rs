//! Corpus and dataset loading
//!
//! The corpus is one passage per line; blank lines are skipped but still
//! advance the line counter, so a document id always points back at its line.
//! Newline-delimited JSON inputs are read leniently: a malformed line is
//! logged and skipped.

use crate::types::{DocId, Document, QuestionRecord};
use crate::{Error, Result};
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use std::io::BufRead;
use std::path::Path;
use tracing::{info, warn};

pub fn load_corpus(path: &Path) -> Result<Vec<Document>> {
    let file = std::fs::File::open(path)?;
    let documents = read_corpus(std::io::BufReader::new(file))?;
    info!("[CORPUS] Loaded {} passages from {}", documents.len(), path.display());
    Ok(documents)
}

pub fn read_corpus<R: BufRead>(reader: R) -> Result<Vec<Document>> {
    let mut documents = Vec::new();

    for (line_idx, line) in reader.lines().enumerate() {
        let line = line?;
        let text = line.trim_end();
        if text.trim().is_empty() {
            continue;
        }

        let id = DocId::try_from(line_idx)
            .map_err(|_| Error::IndexBuild(format!("corpus exceeds {} lines", DocId::MAX)))?;
        documents.push(Document::new(id, text));
    }

    Ok(documents)
}

/// Short content hash of a corpus, used to tie derived artifacts to their source
pub fn corpus_fingerprint(documents: &[Document]) -> String {
    let mut hasher = Sha256::new();
    for doc in documents {
        hasher.update(doc.id.to_le_bytes());
        hasher.update(doc.text.as_bytes());
        hasher.update(b"\n");
    }
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

/// Outcome of a lenient JSONL read
#[derive(Debug)]
pub struct JsonlRead<T> {
    /// `(1-based line number, record)` in file order
    pub records: Vec<(usize, T)>,
    pub skipped: usize,
}

pub fn read_jsonl_lenient<T, R>(reader: R) -> Result<JsonlRead<T>>
where
    T: DeserializeOwned,
    R: BufRead,
{
    let mut records = Vec::new();
    let mut skipped = 0;

    for (line_idx, bytes) in reader.split(b'\n').enumerate() {
        let line_num = line_idx + 1;
        let parsed = decode_line(line_num, &bytes?).and_then(|line| {
            if line.trim().is_empty() {
                return Ok(None);
            }
            serde_json::from_str::<T>(line)
                .map(Some)
                .map_err(|e| Error::Parse { line: line_num, message: e.to_string() })
        });

        match parsed {
            Ok(Some(record)) => records.push((line_num, record)),
            Ok(None) => {}
            Err(err) => {
                warn!("[JSONL] Skipping line: {}", err);
                skipped += 1;
            }
        }
    }

    Ok(JsonlRead { records, skipped })
}

/// One raw line as UTF-8 without its line terminator
pub(crate) fn decode_line(line_num: usize, bytes: &[u8]) -> Result<&str> {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    std::str::from_utf8(bytes).map_err(|e| Error::Parse {
        line: line_num,
        message: format!("invalid UTF-8: {}", e),
    })
}

pub fn load_questions(path: &Path) -> Result<Vec<QuestionRecord>> {
    let file = std::fs::File::open(path)?;
    let read = read_jsonl_lenient::<QuestionRecord, _>(std::io::BufReader::new(file))?;

    info!(
        "[DATASET] Loaded {} questions from {} ({} malformed lines skipped)",
        read.records.len(),
        path.display(),
        read.skipped
    );

    Ok(read.records.into_iter().map(|(_, record)| record).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_corpus_ids_follow_line_numbers() {
        let docs = read_corpus(Cursor::new("first passage\n\n  \nsecond passage\n")).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0], Document::new(0, "first passage"));
        assert_eq!(docs[1], Document::new(3, "second passage"));
    }

    #[test]
    fn test_corpus_fingerprint_changes_with_content() {
        let a = vec![Document::new(0, "alpha"), Document::new(1, "beta")];
        let b = vec![Document::new(0, "alpha"), Document::new(1, "gamma")];
        assert_eq!(corpus_fingerprint(&a), corpus_fingerprint(&a.clone()));
        assert_ne!(corpus_fingerprint(&a), corpus_fingerprint(&b));
        assert_eq!(corpus_fingerprint(&a).len(), 16);
    }

    #[test]
    fn test_lenient_reader_skips_malformed_lines() {
        let input = "{\"question\":\"a\"}\nnot json\n\n{\"question\":\"b\"}\n";
        let read = read_jsonl_lenient::<QuestionRecord, _>(Cursor::new(input)).unwrap();
        assert_eq!(read.skipped, 1);
        assert_eq!(read.records.len(), 2);
        assert_eq!(read.records[1].0, 4);
        assert_eq!(read.records[1].1.question, "b");
    }

    #[test]
    fn test_lenient_reader_skips_invalid_utf8() {
        let mut input = b"{\"question\":\"a\"}\r\n".to_vec();
        input.extend_from_slice(b"\xff\xfe garbage\n");
        input.extend_from_slice("{\"question\":\"心肌\"}".as_bytes());

        let read = read_jsonl_lenient::<QuestionRecord, _>(Cursor::new(input)).unwrap();
        assert_eq!(read.skipped, 1);
        assert_eq!(read.records.iter().map(|(line, _)| *line).collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(read.records[1].1.question, "心肌");
    }
}
