use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Position of a passage in the corpus file (0-based line number).
pub type DocId = u32;

/// A corpus passage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocId,
    pub text: String,
}

impl Document {
    pub fn new(id: DocId, text: impl Into<String>) -> Self {
        Self { id, text: text.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredDocument {
    pub document: Document,
    pub score: f32,
}

/// Ranked retrieval output.
///
/// Hits are sorted by descending score; equal scores keep corpus order
/// (ascending document id). `limit` is the `k` the list was requested with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub hits: Vec<ScoredDocument>,
    pub limit: usize,
}

impl RetrievalResult {
    pub fn new(mut hits: Vec<ScoredDocument>, limit: usize) -> Self {
        hits.sort_by(compare_hits);
        hits.truncate(limit);
        Self { hits, limit }
    }

    pub fn empty(limit: usize) -> Self {
        Self { hits: Vec::new(), limit }
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScoredDocument> {
        self.hits.iter()
    }

    pub fn ids(&self) -> Vec<DocId> {
        self.hits.iter().map(|h| h.document.id).collect()
    }

    /// Join passage texts with newlines, cut at `max_chars` characters.
    pub fn to_context(&self, max_chars: usize) -> String {
        let joined = self
            .hits
            .iter()
            .map(|h| h.document.text.trim_end())
            .collect::<Vec<_>>()
            .join("\n");

        if joined.chars().count() > max_chars {
            let truncated: String = joined.chars().take(max_chars).collect();
            format!("{truncated}...(truncated)")
        } else {
            joined
        }
    }
}

pub(crate) fn compare_hits(a: &ScoredDocument, b: &ScoredDocument) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.document.id.cmp(&b.document.id))
}

/// One line of the question dataset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionRecord {
    pub question: String,
    #[serde(default)]
    pub options: serde_json::Value,
    #[serde(default)]
    pub answer_idx: Option<String>,
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default)]
    pub meta_info: Option<String>,
}

impl QuestionRecord {
    /// Options rendered for the prompt
    pub fn options_text(&self) -> String {
        match &self.options {
            serde_json::Value::Null => String::new(),
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Object(map) => map
                .iter()
                .map(|(key, value)| match value {
                    serde_json::Value::String(s) => format!("{key}. {s}"),
                    other => format!("{key}. {other}"),
                })
                .collect::<Vec<_>>()
                .join("\n"),
            other => other.to_string(),
        }
    }

    /// `req-{index}-{answer_idx}`; the label segment is `unknown` when absent
    pub fn request_id(&self, index: usize) -> String {
        let label = self
            .answer_idx
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or("unknown");
        format!("req-{index}-{label}")
    }

    /// Ground truth as persisted in result files: `[answer_idx, answer, meta_info]`
    pub fn ground_truth(&self) -> serde_json::Value {
        serde_json::json!([
            self.answer_idx.clone().unwrap_or_default(),
            self.answer.clone().unwrap_or_default(),
            self.meta_info.clone().unwrap_or_default(),
        ])
    }
}

/// Marker written as the response of an item whose inference failed
pub const ERROR_RESPONSE: &str = "ERROR";

/// One line of a result file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_id: Option<String>,
    pub response: String,
    pub answer: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl ResultRecord {
    pub fn is_error(&self) -> bool {
        self.response == ERROR_RESPONSE
    }
}

/// Per-sample scoring detail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleDetail {
    pub line: usize,
    pub id: Option<String>,
    pub true_label: String,
    pub predicted_label: Option<String>,
    pub is_correct: bool,
}

/// Aggregate accuracy statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreReport {
    #[serde(rename = "total_samples")]
    pub total: usize,
    #[serde(rename = "correct_predictions")]
    pub correct: usize,
    pub valid_format_count: usize,
    pub skipped: usize,
    pub accuracy: f64,
    #[serde(rename = "results")]
    pub details: Vec<SampleDetail>,
}

/// Index build statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexStats {
    pub documents: usize,
    pub vocabulary_size: usize,
    pub embedding_dimension: Option<usize>,
    pub elapsed_secs: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(id: DocId, score: f32) -> ScoredDocument {
        ScoredDocument { document: Document::new(id, format!("doc {id}")), score }
    }

    #[test]
    fn test_result_sorts_and_breaks_ties_by_corpus_order() {
        let result = RetrievalResult::new(vec![hit(3, 1.0), hit(1, 2.0), hit(0, 1.0)], 10);
        assert_eq!(result.ids(), vec![1, 0, 3]);
    }

    #[test]
    fn test_result_truncates_to_limit() {
        let result = RetrievalResult::new(vec![hit(0, 0.1), hit(1, 0.9), hit(2, 0.5)], 2);
        assert_eq!(result.ids(), vec![1, 2]);
        assert_eq!(result.limit, 2);
    }

    #[test]
    fn test_context_truncation() {
        let result = RetrievalResult::new(vec![hit(0, 1.0), hit(1, 0.5)], 2);
        assert_eq!(result.to_context(100), "doc 0\ndoc 1");
        assert_eq!(result.to_context(3), "doc...(truncated)");
    }

    #[test]
    fn test_question_ground_truth_shape() {
        let record: QuestionRecord = serde_json::from_str(
            r#"{"question":"q","options":{"A":"x","B":"y"},"answer_idx":"B","answer":"y","meta_info":"step1"}"#,
        )
        .unwrap();
        assert_eq!(record.ground_truth(), serde_json::json!(["B", "y", "step1"]));
        assert_eq!(record.options_text(), "A. x\nB. y");
        assert_eq!(record.request_id(7), "req-7-B");
    }

    #[test]
    fn test_request_id_without_label() {
        let record: QuestionRecord = serde_json::from_str(r#"{"question":"q"}"#).unwrap();
        assert_eq!(record.request_id(0), "req-0-unknown");
    }
}
