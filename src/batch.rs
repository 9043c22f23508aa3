//! Request files for hosted batch-inference APIs.
//!
//! One JSON object per line: `{custom_id, body: {messages, max_tokens,
//! temperature, top_p}}`. The validator fails on the first bad line with its
//! line number; hosted APIs reject a whole file for a single bad request.

use crate::corpus::decode_line;
use crate::pipeline::prompt::LETTER_ONLY_INSTRUCTION;
use crate::pipeline::PreparedItem;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::io::{BufRead, BufWriter, Write};
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestBody {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: usize,
    pub temperature: f32,
    pub top_p: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub custom_id: String,
    pub body: RequestBody,
}

/// Sampling settings written into every request body
#[derive(Debug, Clone, Copy)]
pub struct BatchSettings {
    pub max_tokens: usize,
    pub temperature: f32,
    pub top_p: f32,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self { max_tokens: 1024, temperature: 0.01, top_p: 1.0 }
    }
}

impl BatchRequest {
    pub fn from_item(item: &PreparedItem, settings: &BatchSettings) -> Self {
        Self {
            custom_id: item.custom_id.clone(),
            body: RequestBody {
                messages: vec![ChatMessage {
                    role: "user".to_string(),
                    content: format!("{}{}", item.prompt, LETTER_ONLY_INSTRUCTION),
                }],
                max_tokens: settings.max_tokens,
                temperature: settings.temperature,
                top_p: settings.top_p,
            },
        }
    }
}

/// Write one request per prepared item; returns the number written
pub fn write_batch_file(path: &Path, items: &[PreparedItem], settings: &BatchSettings) -> Result<usize> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut writer = BufWriter::new(std::fs::File::create(path)?);
    for item in items {
        serde_json::to_writer(&mut writer, &BatchRequest::from_item(item, settings))?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;

    info!("[BATCH] Wrote {} requests to {}", items.len(), path.display());
    Ok(items.len())
}

pub fn validate_batch_file(path: &Path) -> Result<usize> {
    let file = std::fs::File::open(path)?;
    let count = validate_batch(std::io::BufReader::new(file))?;
    info!("[BATCH] {} is valid: {} requests", path.display(), count);
    Ok(count)
}

/// Check every non-blank line; returns the number of records
pub fn validate_batch<R: BufRead>(reader: R) -> Result<usize> {
    let mut seen = HashSet::new();
    let mut count = 0;

    for (line_idx, bytes) in reader.split(b'\n').enumerate() {
        let line_num = line_idx + 1;
        let bytes = bytes?;
        let invalid = |message: String| Error::Validation { line: line_num, message };

        let line = decode_line(line_num, &bytes).map_err(|e| invalid(e.to_string()))?;
        if line.trim().is_empty() {
            continue;
        }

        let record: Value =
            serde_json::from_str(line).map_err(|e| invalid(format!("invalid JSON: {}", e)))?;

        let custom_id = match record.get("custom_id") {
            None => return Err(invalid("missing custom_id".to_string())),
            Some(Value::String(id)) if id.trim().is_empty() => {
                return Err(invalid("custom_id is empty".to_string()))
            }
            Some(Value::String(id)) => id.clone(),
            Some(other) => return Err(invalid(format!("custom_id must be a string, got {}", other))),
        };

        if !matches!(record.get("body"), Some(Value::Object(_))) {
            return Err(invalid(format!("body of '{}' must be an object", custom_id)));
        }

        if !seen.insert(custom_id.clone()) {
            return Err(invalid(format!("duplicate custom_id '{}'", custom_id)));
        }
        count += 1;
    }

    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::tempdir;

    fn item(index: usize, label: &str) -> PreparedItem {
        PreparedItem {
            index,
            custom_id: format!("req-{index}-{label}"),
            prompt: "这是你要回答的问题: 心肌梗死".to_string(),
            answer: serde_json::json!([label, "", ""]),
        }
    }

    #[test]
    fn test_generated_file_validates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("batch").join("requests.jsonl");

        let written = write_batch_file(&path, &[item(0, "A"), item(1, "C")], &BatchSettings::default()).unwrap();
        assert_eq!(written, 2);
        assert_eq!(validate_batch_file(&path).unwrap(), 2);

        let first: BatchRequest =
            serde_json::from_str(std::fs::read_to_string(&path).unwrap().lines().next().unwrap()).unwrap();
        assert_eq!(first.custom_id, "req-0-A");
        assert_eq!(first.body.max_tokens, 1024);
        assert_eq!(first.body.messages[0].role, "user");
        assert!(first.body.messages[0].content.ends_with(LETTER_ONLY_INSTRUCTION));
    }

    #[test]
    fn test_single_valid_line() {
        let input = r#"{"custom_id":"req-1-A","body":{"messages":[]}}"#;
        assert_eq!(validate_batch(Cursor::new(input)).unwrap(), 1);
    }

    #[test]
    fn test_duplicate_id_reports_line() {
        let input = concat!(
            r#"{"custom_id":"req-1-A","body":{}}"#,
            "\n",
            r#"{"custom_id":"req-1-A","body":{}}"#,
            "\n",
        );
        let err = validate_batch(Cursor::new(input)).unwrap_err();
        assert!(matches!(err, Error::Validation { line: 2, .. }));
    }

    #[test]
    fn test_invalid_utf8_reports_line() {
        let mut input = b"{\"custom_id\":\"req-0-A\",\"body\":{}}\n".to_vec();
        input.extend_from_slice(b"{\"custom_id\":\"req-1-\xff\",\"body\":{}}\n");

        let err = validate_batch(Cursor::new(input)).unwrap_err();
        assert!(matches!(err, Error::Validation { line: 2, .. }));
    }

    #[test]
    fn test_schema_violations() {
        let cases = [
            ("\n\nnot json", 3),
            (r#"{"body":{}}"#, 1),
            (r#"{"custom_id":"  ","body":{}}"#, 1),
            (r#"{"custom_id":7,"body":{}}"#, 1),
            (r#"{"custom_id":"req-0-A","body":"text"}"#, 1),
            (r#"{"custom_id":"req-0-A"}"#, 1),
        ];

        for (input, expected_line) in cases {
            match validate_batch(Cursor::new(input)) {
                Err(Error::Validation { line, .. }) => assert_eq!(line, expected_line, "input: {input}"),
                other => panic!("expected validation error for {input}, got {other:?}"),
            }
        }
    }
}
