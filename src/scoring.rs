//! Accuracy scoring of result files.
//!
//! Each line yields a ground-truth label (from an answer field or a segment of
//! an id) and a predicted label (the first answer letter on the first line of
//! the response). Malformed lines and lines without a usable ground truth are
//! skipped; responses without a letter still count, as incorrect.

use crate::config::ScoringConfig;
use crate::corpus::read_jsonl_lenient;
use crate::llm::strip_reasoning;
use crate::types::{SampleDetail, ScoreReport};
use crate::{Error, Result};
use regex::Regex;
use serde_json::Value;
use std::io::BufRead;
use std::path::Path;
use tracing::{info, warn};

/// Where the ground-truth label comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelRule {
    /// `field` holds a list (first element is the label) or a plain string
    AnswerField { field: String },
    /// `field` is split on `delimiter`; the segment at `position` is the label
    IdSegment { field: String, delimiter: char, position: usize },
}

impl Default for LabelRule {
    fn default() -> Self {
        LabelRule::AnswerField { field: "answer".to_string() }
    }
}

impl LabelRule {
    pub fn answer_field(config: &ScoringConfig) -> Self {
        LabelRule::AnswerField { field: config.answer_field.clone() }
    }

    pub fn id_segment(config: &ScoringConfig) -> Self {
        LabelRule::IdSegment {
            field: config.id_field.clone(),
            delimiter: config.id_delimiter,
            position: config.id_position,
        }
    }

    fn extract(&self, record: &Value) -> Option<String> {
        let raw = match self {
            LabelRule::AnswerField { field } => match record.get(field)? {
                Value::Array(items) => items.first()?.as_str()?.to_string(),
                Value::String(s) => s.clone(),
                _ => return None,
            },
            LabelRule::IdSegment { field, delimiter, position } => {
                record.get(field)?.as_str()?.split(*delimiter).nth(*position)?.to_string()
            }
        };
        Some(raw.trim().to_uppercase())
    }

    fn id_of(&self, record: &Value) -> Option<String> {
        let field = match self {
            LabelRule::IdSegment { field, .. } => field.as_str(),
            LabelRule::AnswerField { .. } => "custom_id",
        };
        record.get(field).and_then(Value::as_str).map(str::to_string)
    }
}

pub struct AccuracyScorer {
    rule: LabelRule,
    labels: Vec<char>,
    pattern: Regex,
    strip_reasoning: bool,
}

impl AccuracyScorer {
    pub fn new(rule: LabelRule, labels: &str, strip_reasoning: bool) -> Result<Self> {
        let labels: Vec<char> = labels.chars().filter(|c| !c.is_whitespace()).collect();
        if labels.is_empty() {
            return Err(Error::Config("label alphabet is empty".to_string()));
        }

        let class: String = labels.iter().map(|c| regex::escape(&c.to_string())).collect();
        let pattern = Regex::new(&format!(r"(?:^|[^A-Za-z])([{class}])(?:[^A-Za-z]|$)"))
            .map_err(|e| Error::Config(format!("invalid label alphabet '{}': {}", class, e)))?;

        Ok(Self { rule, labels, pattern, strip_reasoning })
    }

    pub fn from_config(config: &ScoringConfig, rule: LabelRule) -> Result<Self> {
        Self::new(rule, &config.labels, config.strip_reasoning)
    }

    /// First label letter on the first non-empty line of a response
    pub fn predicted_label(&self, response: &str) -> Option<char> {
        let text = if self.strip_reasoning { strip_reasoning(response) } else { response };
        let first_line = text.lines().map(str::trim).find(|l| !l.is_empty())?;

        self.pattern
            .captures(first_line)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().chars().next())
    }

    fn true_label(&self, record: &Value) -> Option<char> {
        let label = self.rule.extract(record)?;
        let mut chars = label.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) if self.labels.contains(&c) => Some(c),
            _ => None,
        }
    }

    pub fn score_file(&self, path: &Path) -> Result<ScoreReport> {
        let file = std::fs::File::open(path)?;
        let report = self.score(std::io::BufReader::new(file))?;
        info!(
            "[SCORER] {}: {}/{} correct ({:.2}%), {} format-compliant, {} skipped",
            path.display(),
            report.correct,
            report.total,
            report.accuracy * 100.0,
            report.valid_format_count,
            report.skipped
        );
        Ok(report)
    }

    pub fn score<R: BufRead>(&self, reader: R) -> Result<ScoreReport> {
        let read = read_jsonl_lenient::<Value, _>(reader)?;
        let mut skipped = read.skipped;
        let mut details = Vec::with_capacity(read.records.len());

        for (line, record) in read.records {
            let Some(true_label) = self.true_label(&record) else {
                warn!("[SCORER] Line {}: no usable ground-truth label, skipping", line);
                skipped += 1;
                continue;
            };

            let predicted = response_text(&record).and_then(|text| self.predicted_label(text));
            details.push(SampleDetail {
                line,
                id: self.rule.id_of(&record),
                true_label: true_label.to_string(),
                predicted_label: predicted.map(String::from),
                is_correct: predicted == Some(true_label),
            });
        }

        let total = details.len();
        let correct = details.iter().filter(|d| d.is_correct).count();
        let valid_format_count = details.iter().filter(|d| d.predicted_label.is_some()).count();
        let accuracy = if total == 0 { 0.0 } else { correct as f64 / total as f64 };

        Ok(ScoreReport { total, correct, valid_format_count, skipped, accuracy, details })
    }
}

/// `response` as a plain string, or the hosted batch shape
/// `response.body.choices[0].message.content`
fn response_text(record: &Value) -> Option<&str> {
    match record.get("response")? {
        Value::String(s) => Some(s),
        hosted => hosted
            .pointer("/body/choices/0/message/content")
            .and_then(Value::as_str),
    }
}

pub fn write_report(path: &Path, report: &ScoreReport) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(report)?)?;
    info!("[SCORER] Report written to {}", path.display());
    Ok(())
}
