//! # Tagger
//!
//! Inference over raw or pre-tokenized text: tokenize, encode, run the model
//! in batches, decode tags and group them into entities.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::batch::BatchGenerator;
use crate::embeddings::EmbeddingProvider;
use crate::error::{Result, SeqLabError};
use crate::model::SequenceModel;
use crate::parser::bio_tags::extract_spans;
use crate::parser::tokenizer::{RegexTokenizer, Token, Tokenizer};
use crate::preprocess::Preprocessor;

const DEFAULT_BATCH_SIZE: usize = 32;

/// Shape of the tagging output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Flat list of entities with character offsets.
    #[default]
    Entities,
    /// Every token with its tag.
    Tokens,
}

impl FromStr for OutputFormat {
    type Err = SeqLabError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "entities" | "json" => Ok(OutputFormat::Entities),
            "tokens" => Ok(OutputFormat::Tokens),
            other => Err(SeqLabError::Configuration(format!(
                "unknown output format {other:?} (expected entities or tokens)"
            ))),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Entities => write!(f, "entities"),
            OutputFormat::Tokens => write!(f, "tokens"),
        }
    }
}

/// An entity found in a text. Offsets count characters; `end` is exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaggedEntity {
    pub category: String,
    pub text: String,
    pub start: usize,
    pub end: usize,
}

/// A token with its predicted tag. Offsets as in [`TaggedEntity`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaggedToken {
    pub text: String,
    pub tag: String,
    pub start: usize,
    pub end: usize,
}

/// Tagging result for one input text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaggedText {
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<TaggedEntity>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tokens: Vec<TaggedToken>,
}

/// Borrows a trained model and its preprocessor for inference.
///
/// Either may be missing, in which case every call fails with
/// [`SeqLabError::NotFitted`].
pub struct Tagger<'a, M: SequenceModel + ?Sized> {
    model: Option<&'a M>,
    preprocessor: Option<&'a Preprocessor>,
    embeddings: Option<&'a dyn EmbeddingProvider>,
    tokenizer: Box<dyn Tokenizer + 'a>,
    batch_size: usize,
}

impl<'a, M: SequenceModel + ?Sized> Tagger<'a, M> {
    pub fn new(model: Option<&'a M>, preprocessor: Option<&'a Preprocessor>) -> Result<Self> {
        Ok(Self {
            model,
            preprocessor,
            embeddings: None,
            tokenizer: Box::new(RegexTokenizer::new()?),
            batch_size: DEFAULT_BATCH_SIZE,
        })
    }

    pub fn with_embeddings(mut self, provider: Option<&'a dyn EmbeddingProvider>) -> Self {
        self.embeddings = provider;
        self
    }

    pub fn with_tokenizer(mut self, tokenizer: impl Tokenizer + 'a) -> Self {
        self.tokenizer = Box::new(tokenizer);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Tag raw texts. Output order matches input order; entities are
    /// ordered by start offset.
    pub fn tag<S: AsRef<str>>(&self, texts: &[S], format: OutputFormat) -> Result<Vec<TaggedText>> {
        self.ensure_fitted()?;
        let tokenized: Vec<Vec<Token>> = texts
            .iter()
            .map(|t| self.tokenizer.tokenize(t.as_ref()))
            .collect();
        let labels = self.label(&tokenized)?;

        Ok(texts
            .iter()
            .zip(&tokenized)
            .zip(&labels)
            .map(|((text, tokens), tags)| assemble(text.as_ref(), tokens, tags, format))
            .collect())
    }

    /// Tag pre-tokenized sentences. Tokens are joined with single spaces to
    /// form the reported text and offsets.
    pub fn tag_tokens(&self, sentences: &[Vec<String>], format: OutputFormat) -> Result<Vec<TaggedText>> {
        self.ensure_fitted()?;
        let (texts, tokenized): (Vec<String>, Vec<Vec<Token>>) =
            sentences.iter().map(|s| join_tokens(s)).unzip();
        let labels = self.label(&tokenized)?;

        Ok(texts
            .iter()
            .zip(&tokenized)
            .zip(&labels)
            .map(|((text, tokens), tags)| assemble(text, tokens, tags, format))
            .collect())
    }

    fn ensure_fitted(&self) -> Result<()> {
        if self.model.is_none() || self.preprocessor.is_none() {
            return Err(SeqLabError::NotFitted("tagging"));
        }
        Ok(())
    }

    /// Tag labels for every sentence; empty sentences get no labels.
    fn label(&self, tokenized: &[Vec<Token>]) -> Result<Vec<Vec<String>>> {
        let (Some(model), Some(preprocessor)) = (self.model, self.preprocessor) else {
            return Err(SeqLabError::NotFitted("tagging"));
        };

        let sentences: Vec<Vec<String>> = tokenized
            .iter()
            .map(|tokens| tokens.iter().map(|t| t.text.clone()).collect())
            .collect();
        let mut labels = vec![Vec::new(); sentences.len()];

        let mut generator = BatchGenerator::new(&sentences, None, preprocessor, self.batch_size)?;
        if let Some(provider) = self.embeddings {
            generator = generator.with_embeddings(provider);
        }

        for batch in generator.epoch() {
            let batch = batch?;
            let predicted = model.predict(&batch)?;
            for (row, tags) in predicted.iter().enumerate() {
                labels[batch.sentence_indices[row]] = preprocessor.decode_tags(tags);
            }
        }

        debug!(sentences = sentences.len(), "tagged");
        Ok(labels)
    }
}

fn join_tokens(tokens: &[String]) -> (String, Vec<Token>) {
    let mut text = String::new();
    let mut out = Vec::with_capacity(tokens.len());
    for (index, token) in tokens.iter().enumerate() {
        if index > 0 {
            text.push(' ');
        }
        let start = text.len();
        text.push_str(token);
        out.push(Token {
            text: token.clone(),
            start,
            end: text.len(),
            index,
        });
    }
    (text, out)
}

fn assemble(text: &str, tokens: &[Token], tags: &[String], format: OutputFormat) -> TaggedText {
    let char_offset = |byte: usize| text[..byte].chars().count();

    let mut tagged = TaggedText {
        text: text.to_string(),
        entities: Vec::new(),
        tokens: Vec::new(),
    };

    match format {
        OutputFormat::Entities => {
            for span in extract_spans(tags) {
                let Some((start, end)) = RegexTokenizer::get_span(tokens, span.start, span.end) else {
                    continue;
                };
                tagged.entities.push(TaggedEntity {
                    category: span.category,
                    text: text[start..end].to_string(),
                    start: char_offset(start),
                    end: char_offset(end),
                });
            }
        }
        OutputFormat::Tokens => {
            tagged.tokens = tokens
                .iter()
                .zip(tags)
                .map(|(token, tag)| TaggedToken {
                    text: token.text.clone(),
                    tag: tag.clone(),
                    start: char_offset(token.start),
                    end: char_offset(token.end),
                })
                .collect();
        }
    }

    tagged
}
