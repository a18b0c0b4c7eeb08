//! # Tokenizer
//!
//! Splits raw text into word tokens with byte offsets so predicted spans can
//! be mapped back onto the source text.

use regex::Regex;

use crate::error::Result;

/// A token extracted from raw text with positional information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// The token text content
    pub text: String,
    /// Start byte offset in the original string
    pub start: usize,
    /// End byte offset (exclusive) in the original string
    pub end: usize,
    /// Token index in the sequence
    pub index: usize,
}

/// Turns raw text into an ordered sequence of tokens.
pub trait Tokenizer {
    fn tokenize(&self, input: &str) -> Vec<Token>;
}

/// Word runs (letters, digits, underscore, inner apostrophes and hyphens)
/// or any single other non-space character.
const DEFAULT_PATTERN: &str = r"[\p{L}\p{N}_]+(?:['’\-][\p{L}\p{N}_]+)*|[^\s\p{L}\p{N}_]";

/// Regex based tokenizer. Every match becomes a token.
#[derive(Debug, Clone)]
pub struct RegexTokenizer {
    pattern: Regex,
}

impl RegexTokenizer {
    /// Create a tokenizer with the default word/punctuation pattern.
    pub fn new() -> Result<Self> {
        Self::with_pattern(DEFAULT_PATTERN)
    }

    /// Create a tokenizer from a custom pattern.
    pub fn with_pattern(pattern: &str) -> Result<Self> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
        })
    }

    /// Get the original text span for an inclusive range of tokens.
    pub fn get_span(tokens: &[Token], start_idx: usize, end_idx: usize) -> Option<(usize, usize)> {
        if start_idx > end_idx || end_idx >= tokens.len() {
            return None;
        }
        Some((tokens[start_idx].start, tokens[end_idx].end))
    }
}

impl Tokenizer for RegexTokenizer {
    /// # Examples
    /// ```
    /// use seqlab_core::parser::{RegexTokenizer, Tokenizer};
    ///
    /// let tokenizer = RegexTokenizer::new().unwrap();
    /// let tokens = tokenizer.tokenize("Anna Karenina went to Moscow.");
    /// assert_eq!(tokens.len(), 6);
    /// ```
    fn tokenize(&self, input: &str) -> Vec<Token> {
        self.pattern
            .find_iter(input)
            .enumerate()
            .map(|(index, m)| Token {
                text: m.as_str().to_string(),
                start: m.start(),
                end: m.end(),
                index,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(tokens: &[Token]) -> Vec<&str> {
        tokens.iter().map(|t| t.text.as_str()).collect()
    }

    #[test]
    fn test_tokenize_basic() {
        let tokenizer = RegexTokenizer::new().unwrap();
        let tokens = tokenizer.tokenize("Anna Karenina went to Moscow.");

        assert_eq!(
            texts(&tokens),
            vec!["Anna", "Karenina", "went", "to", "Moscow", "."]
        );
        assert_eq!(tokens[1].start, 5);
        assert_eq!(tokens[1].end, 13);
        assert_eq!(tokens[5].index, 5);
    }

    #[test]
    fn test_tokenize_keeps_case_and_inner_hyphens() {
        let tokenizer = RegexTokenizer::new().unwrap();
        let tokens = tokenizer.tokenize("Jean-Paul's (2019) e-mail");
        assert_eq!(
            texts(&tokens),
            vec!["Jean-Paul's", "(", "2019", ")", "e-mail"]
        );
    }

    #[test]
    fn test_offsets_are_bytes() {
        let tokenizer = RegexTokenizer::new().unwrap();
        let input = "Zoë visited Köln";
        let tokens = tokenizer.tokenize(input);
        assert_eq!(texts(&tokens), vec!["Zoë", "visited", "Köln"]);
        for token in &tokens {
            assert_eq!(&input[token.start..token.end], token.text);
        }
    }

    #[test]
    fn test_tokenize_empty() {
        let tokenizer = RegexTokenizer::new().unwrap();
        assert!(tokenizer.tokenize("").is_empty());
        assert!(tokenizer.tokenize("   \n\t").is_empty());
    }

    #[test]
    fn test_get_span() {
        let tokenizer = RegexTokenizer::new().unwrap();
        let tokens = tokenizer.tokenize("Anna Karenina went");
        assert_eq!(RegexTokenizer::get_span(&tokens, 0, 1), Some((0, 13)));
        assert_eq!(RegexTokenizer::get_span(&tokens, 2, 5), None);
        assert_eq!(RegexTokenizer::get_span(&tokens, 2, 1), None);
    }
}
