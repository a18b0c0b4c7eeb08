pub mod bio_tags;
pub mod tokenizer;
pub mod viterbi;

pub use bio_tags::{extract_spans, Span, Tag, TagPrefix, OUTSIDE};
pub use tokenizer::{RegexTokenizer, Token, Tokenizer};
pub use viterbi::{argmax, ViterbiDecoder};
