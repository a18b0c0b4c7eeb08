use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during seqlab operations.
#[derive(Debug, Error)]
pub enum SeqLabError {
    /// `fit` was called without a single sentence.
    #[error("input is empty: at least one sentence is required")]
    EmptyInput,

    /// Tokens and tags are not aligned, or similar malformed input.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Invalid architecture, embedding or training parameter combination.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// An operation needs a trained model (or fitted preprocessor) that does not exist yet.
    #[error("could not find a model: {0} requires a trained model")]
    NotFitted(&'static str),

    /// A persisted bundle or checkpoint is missing or corrupt.
    #[error("persistence error at {path:?}: {reason}")]
    Persistence {
        /// Offending file or directory.
        path: PathBuf,
        /// Human readable cause.
        reason: String,
    },

    /// Tensor backend error.
    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Filesystem error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A tokenizer pattern failed to compile (should not happen with static patterns).
    #[error("regex compilation error: {0}")]
    Regex(#[from] regex::Error),
}

impl SeqLabError {
    /// Builds a [`SeqLabError::Persistence`] for `path`.
    pub fn persistence(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Persistence {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for seqlab operations.
pub type Result<T> = std::result::Result<T, SeqLabError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let err = SeqLabError::EmptyInput;
        assert!(err.to_string().contains("at least one sentence"));

        let err = SeqLabError::NotFitted("tag");
        assert_eq!(
            err.to_string(),
            "could not find a model: tag requires a trained model"
        );

        let err = SeqLabError::persistence("/tmp/model", "missing config.json");
        assert!(err.to_string().contains("missing config.json"));
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SeqLabError>();
    }
}
