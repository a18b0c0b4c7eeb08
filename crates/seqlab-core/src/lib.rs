//! # seqlab core
//!
//! Building blocks for neural sequence labelling (named-entity recognition
//! and similar tagging tasks): vocabularies and case features, padded batch
//! generation, a BiLSTM tagger with optional CRF head, entity-level F1
//! evaluation and text tagging.
//!
//! ## Quick Start
//!
//! ```rust
//! use seqlab_core::parser::extract_spans;
//! use seqlab_core::eval::evaluate_tags;
//!
//! let spans = extract_spans(&["B-PER", "I-PER", "O", "B-LOC"]);
//! assert_eq!(spans.len(), 2);
//! assert_eq!((spans[0].start, spans[0].end), (0, 1));
//!
//! let report = evaluate_tags(&[vec!["B-PER", "O"]], &[vec!["B-PER", "O"]]);
//! assert_eq!(report.f1(), 1.0);
//! ```
pub mod batch;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod eval;
pub mod model;
pub mod parser;
pub mod preprocess;
pub mod tagger;

// Re-export primary API
pub use batch::{Batch, BatchGenerator};
pub use config::{ModelConfig, ModelConfigDraft, ModelVariant, OptimizerKind, TrainingConfig};
pub use embeddings::{EmbeddingProvider, StaticEmbeddings};
pub use error::{Result, SeqLabError};
pub use eval::{evaluate_tags, EvaluationReport, Evaluator, Score};
pub use model::{build_model, EmissionScores, NeuralTagger, SequenceModel};
pub use parser::{extract_spans, RegexTokenizer, Span, Tokenizer, ViterbiDecoder};
pub use preprocess::{Preprocessor, PreprocessorOptions};
pub use tagger::{OutputFormat, TaggedEntity, TaggedText, TaggedToken, Tagger};
