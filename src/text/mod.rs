pub mod keywords;
pub mod tokenizer;

pub use keywords::{clean_text, EmbeddingKeyphraseScorer, KeyphraseScorer, KeywordExtractor};
pub use tokenizer::{Tokenizer, TOKENIZER_VERSION};
