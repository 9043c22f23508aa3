//! Lexical tokenizer for mixed CJK / Latin prose.
//!
//! Text is NFKC-normalized and lowercased, then split at Unicode word
//! boundaries. Consecutive CJK characters form a run (punctuation and
//! whitespace end it); stop words are cut out of runs and each remaining run
//! is emitted as overlapping character bigrams. Latin words are kept whole.
//!
//! Persisted lexical indexes are keyed by this output, so any change to the
//! algorithm must bump [`TOKENIZER_VERSION`].

use crate::Result;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::path::Path;
use unicode_normalization::UnicodeNormalization;
use unicode_segmentation::UnicodeSegmentation;

pub const TOKENIZER_VERSION: &str = "cjk-bigram-v1";

const DEFAULT_STOP_WORDS: &[&str] = &[
    // Chinese function words
    "的", "了", "和", "是", "在", "也", "就", "都", "而", "及", "与", "着", "或", "之", "其",
    "为", "以", "于", "对", "等", "被", "把", "让", "从", "向", "这", "那", "有", "个", "中",
    "则", "即", "但", "并", "很", "将", "所", "该", "各", "此", "如", "若", "由", "因", "又",
    "一个", "没有", "我们", "你们", "他们", "它们", "这个", "那个", "这些", "那些", "因为",
    "所以", "但是", "如果", "可以", "以及", "或者", "什么", "怎么", "哪些",
    // exam phrasing
    "下列", "以下", "哪项", "哪个", "哪一项", "属于", "不是", "正确", "错误", "描述", "说法",
    "选项", "最", "患者",
    // English
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "if", "in", "into", "is",
    "it", "no", "not", "of", "on", "or", "such", "that", "the", "their", "then", "there",
    "these", "they", "this", "to", "was", "will", "with", "which", "following", "most",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// A stop-word-free run of CJK characters
    Cjk(String),
    Word(String),
}

impl Segment {
    pub fn as_str(&self) -> &str {
        match self {
            Segment::Cjk(s) | Segment::Word(s) => s,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Tokenizer {
    stop_words: BTreeSet<String>,
    max_stop_chars: usize,
    fingerprint: String,
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::new(DEFAULT_STOP_WORDS.iter().copied())
    }
}

impl Tokenizer {
    pub fn new<I, S>(stop_words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let stop_words: BTreeSet<String> = stop_words
            .into_iter()
            .map(|w| normalize(w.as_ref().trim()))
            .filter(|w| !w.is_empty())
            .collect();

        let max_stop_chars = stop_words
            .iter()
            .map(|w| w.chars().count())
            .max()
            .unwrap_or(0);

        let mut hasher = Sha256::new();
        hasher.update(TOKENIZER_VERSION.as_bytes());
        for word in &stop_words {
            hasher.update(b"\n");
            hasher.update(word.as_bytes());
        }
        let digest = format!("{:x}", hasher.finalize());
        let fingerprint = format!("{TOKENIZER_VERSION}:{}", &digest[..16]);

        Self { stop_words, max_stop_chars, fingerprint }
    }

    /// Load a stop-word list with one entry per line
    pub fn from_stop_word_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::new(content.lines()))
    }

    /// Identifies this tokenizer's version and stop-word set
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Phrase-level segments before bigram expansion
    pub fn segments(&self, text: &str) -> Vec<Segment> {
        let normalized = normalize(text);
        let mut segments = Vec::new();
        let mut run: Vec<char> = Vec::new();

        for piece in normalized.split_word_bounds() {
            if piece.chars().all(is_cjk) {
                run.extend(piece.chars());
                continue;
            }

            self.flush_run(&mut run, &mut segments);

            if piece.chars().any(char::is_alphanumeric)
                && piece.chars().count() > 1
                && !self.stop_words.contains(piece)
            {
                segments.push(Segment::Word(piece.to_string()));
            }
        }
        self.flush_run(&mut run, &mut segments);

        segments
    }

    pub fn tokenize(&self, text: &str) -> Vec<String> {
        let mut tokens = Vec::new();

        for segment in self.segments(text) {
            match segment {
                Segment::Word(word) => tokens.push(word),
                Segment::Cjk(run) => {
                    let chars: Vec<char> = run.chars().collect();
                    if chars.len() == 1 {
                        tokens.push(run);
                    } else {
                        tokens.extend(chars.windows(2).map(|pair| pair.iter().collect::<String>()));
                    }
                }
            }
        }

        tokens
    }

    /// Cut stop words (longest match first) out of a CJK run
    fn flush_run(&self, run: &mut Vec<char>, segments: &mut Vec<Segment>) {
        if run.is_empty() {
            return;
        }

        let mut start = 0;
        let mut i = 0;
        while i < run.len() {
            let longest = self.max_stop_chars.min(run.len() - i);
            let matched = (1..=longest)
                .rev()
                .find(|&len| self.stop_words.contains(&run[i..i + len].iter().collect::<String>()));

            match matched {
                Some(len) => {
                    if start < i {
                        segments.push(Segment::Cjk(run[start..i].iter().collect()));
                    }
                    i += len;
                    start = i;
                }
                None => i += 1,
            }
        }
        if start < run.len() {
            segments.push(Segment::Cjk(run[start..].iter().collect()));
        }

        run.clear();
    }
}

fn normalize(text: &str) -> String {
    text.nfkc().collect::<String>().to_lowercase()
}

pub fn is_cjk(c: char) -> bool {
    matches!(
        c as u32,
        0x3040..=0x30FF      // Hiragana, Katakana
            | 0x3400..=0x4DBF // CJK Extension A
            | 0x4E00..=0x9FFF // CJK Unified Ideographs
            | 0xAC00..=0xD7AF // Hangul syllables
            | 0xF900..=0xFAFF // CJK Compatibility Ideographs
            | 0x20000..=0x2EBEF
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cjk_runs_become_bigrams() {
        let tokenizer = Tokenizer::new(Vec::<&str>::new());
        assert_eq!(tokenizer.tokenize("心肌梗死"), vec!["心肌", "肌梗", "梗死"]);
    }

    #[test]
    fn test_punctuation_breaks_runs() {
        let tokenizer = Tokenizer::new(Vec::<&str>::new());
        assert_eq!(tokenizer.tokenize("高血压，糖尿病"), vec!["高血", "血压", "糖尿", "尿病"]);
    }

    #[test]
    fn test_stop_words_are_cut_out_of_runs() {
        let tokenizer = Tokenizer::new(["的"]);
        let segments = tokenizer.segments("肝脏的功能");
        assert_eq!(
            segments,
            vec![Segment::Cjk("肝脏".to_string()), Segment::Cjk("功能".to_string())]
        );
        assert_eq!(tokenizer.tokenize("肝脏的功能"), vec!["肝脏", "功能"]);
    }

    #[test]
    fn test_single_character_run_is_kept() {
        let tokenizer = Tokenizer::new(["的"]);
        assert_eq!(tokenizer.tokenize("肝的"), vec!["肝"]);
    }

    #[test]
    fn test_latin_words_and_normalization() {
        let tokenizer = Tokenizer::default();
        let tokens = tokenizer.tokenize("The ＡＣＥ inhibitor and β-blocker");
        assert!(tokens.contains(&"ace".to_string()));
        assert!(tokens.contains(&"inhibitor".to_string()));
        assert!(!tokens.contains(&"the".to_string()));
        assert!(!tokens.contains(&"and".to_string()));
    }

    #[test]
    fn test_mixed_script_text() {
        let tokenizer = Tokenizer::new(Vec::<&str>::new());
        assert_eq!(tokenizer.tokenize("维生素B12缺乏"), vec!["维生", "生素", "b12", "缺乏"]);
    }

    #[test]
    fn test_deterministic_output() {
        let tokenizer = Tokenizer::default();
        let text = "急性心肌梗死患者最常见的死亡原因是什么？";
        assert_eq!(tokenizer.tokenize(text), tokenizer.tokenize(text));
    }

    #[test]
    fn test_fingerprint_tracks_stop_words() {
        let a = Tokenizer::new(["的", "了"]);
        let b = Tokenizer::new(["了", "的"]);
        let c = Tokenizer::new(["的"]);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert!(a.fingerprint().starts_with(TOKENIZER_VERSION));
    }

    #[test]
    fn test_empty_text() {
        assert!(Tokenizer::default().tokenize("").is_empty());
    }
}
