//! # seqlab
//!
//! Neural sequence labelling for named-entity recognition and similar
//! tagging tasks.
//!
//! [`Sequence`] ties the pieces together: it fits vocabularies, trains a
//! BiLSTM tagger (optionally with a character CNN/BiLSTM and a CRF head) or a
//! k-fold ensemble of them, evaluates with entity-level F1, tags raw text and
//! persists everything as a model bundle directory.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use seqlab::{load_conll, ModelConfigDraft, ModelVariant, OutputFormat, Sequence, TrainingConfig};
//!
//! let train = load_conll("data/train.conll")?;
//! let valid = load_conll("data/valid.conll")?;
//!
//! let draft = ModelConfigDraft::new("ner").with_variant(ModelVariant::BiLstmCnnCrf);
//! let mut sequence = Sequence::new(draft, TrainingConfig::default());
//! sequence.fit(&train, Some(&valid))?;
//!
//! let tagged = sequence.tag(&["Anna Karenina went to Moscow"], OutputFormat::Entities)?;
//! for entity in &tagged[0].entities {
//!     println!("{} {}", entity.category, entity.text);
//! }
//! sequence.save("models/ner")?;
//! # Ok::<(), seqlab::SeqLabError>(())
//! ```

pub mod sequence;

pub use sequence::Sequence;

// Re-export primary API
pub use seqlab_core::{
    evaluate_tags, extract_spans, EmbeddingProvider, EvaluationReport, ModelConfig,
    ModelConfigDraft, ModelVariant, OptimizerKind, OutputFormat, Preprocessor, Result, Score,
    SeqLabError, SequenceModel, StaticEmbeddings, TaggedEntity, TaggedText, TaggedToken,
    TrainingConfig,
};
pub use seqlab_trainer::{load_conll, Dataset, EnsembleSummary, EpochRecord, TrainingOutcome};

pub use seqlab_core;
pub use seqlab_trainer;
