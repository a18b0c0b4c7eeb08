//! # Model and Training Configuration
//!
//! The model configuration is built in two phases: a user-editable
//! [`ModelConfigDraft`] is finalized into a frozen [`ModelConfig`] once the
//! preprocessor has been fitted and the vocabulary sizes are known.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SeqLabError};
use crate::preprocess::{Preprocessor, PreprocessorOptions};

/// Architecture variants. All share a word-level BiLSTM; they differ in the
/// character encoder and the output layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelVariant {
    /// Character BiLSTM, CRF output.
    #[serde(rename = "BidLSTM_CRF")]
    BiLstmCrf,
    /// Character CNN, softmax output.
    #[serde(rename = "BidLSTM_CNN")]
    BiLstmCnn,
    /// Character CNN, CRF output.
    #[serde(rename = "BidLSTM_CNN_CRF")]
    BiLstmCnnCrf,
}

impl ModelVariant {
    pub fn uses_crf(&self) -> bool {
        matches!(self, ModelVariant::BiLstmCrf | ModelVariant::BiLstmCnnCrf)
    }

    pub fn uses_char_cnn(&self) -> bool {
        matches!(self, ModelVariant::BiLstmCnn | ModelVariant::BiLstmCnnCrf)
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelVariant::BiLstmCrf => write!(f, "BidLSTM_CRF"),
            ModelVariant::BiLstmCnn => write!(f, "BidLSTM_CNN"),
            ModelVariant::BiLstmCnnCrf => write!(f, "BidLSTM_CNN_CRF"),
        }
    }
}

/// Architecture parameters chosen by the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfigDraft {
    pub model_name: String,
    pub variant: ModelVariant,
    /// Name of the pretrained embeddings. `None` trains a word embedding table.
    pub embeddings_name: Option<String>,
    /// Trainable word embedding size; replaced by the provider dimension
    /// when pretrained embeddings are used.
    pub word_embedding_size: usize,
    pub char_embedding_size: usize,
    /// Hidden units of the character LSTM (per direction) or CNN filters.
    pub char_lstm_units: usize,
    pub max_char_length: usize,
    pub case_embedding_size: usize,
    /// Hidden units of the word LSTM, per direction.
    pub word_lstm_units: usize,
    pub dropout: f32,
    /// Applied between the word BiLSTM and the output layer (candle's LSTM
    /// has no recurrent dropout).
    pub recurrent_dropout: f32,
    pub use_char_feature: bool,
    pub lowercase: bool,
    /// Forbid `O -> I-X` style transitions when decoding with the CRF.
    pub constrain_transitions: bool,
    pub fold_number: usize,
}

impl Default for ModelConfigDraft {
    fn default() -> Self {
        Self {
            model_name: "ner".to_string(),
            variant: ModelVariant::BiLstmCrf,
            embeddings_name: None,
            word_embedding_size: 100,
            char_embedding_size: 25,
            char_lstm_units: 25,
            max_char_length: 30,
            case_embedding_size: 8,
            word_lstm_units: 100,
            dropout: 0.5,
            recurrent_dropout: 0.25,
            use_char_feature: true,
            lowercase: false,
            constrain_transitions: false,
            fold_number: 1,
        }
    }
}

impl ModelConfigDraft {
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            ..Self::default()
        }
    }

    pub fn with_variant(mut self, variant: ModelVariant) -> Self {
        self.variant = variant;
        self
    }

    pub fn with_embeddings(mut self, name: impl Into<String>) -> Self {
        self.embeddings_name = Some(name.into());
        self
    }

    pub fn with_word_lstm_units(mut self, units: usize) -> Self {
        self.word_lstm_units = units;
        self
    }

    pub fn with_word_embedding_size(mut self, size: usize) -> Self {
        self.word_embedding_size = size;
        self
    }

    pub fn with_char_sizes(mut self, embedding: usize, hidden: usize) -> Self {
        self.char_embedding_size = embedding;
        self.char_lstm_units = hidden;
        self
    }

    pub fn with_dropout(mut self, dropout: f32, recurrent_dropout: f32) -> Self {
        self.dropout = dropout;
        self.recurrent_dropout = recurrent_dropout;
        self
    }

    pub fn with_char_feature(mut self, enabled: bool) -> Self {
        self.use_char_feature = enabled;
        self
    }

    pub fn with_lowercase(mut self, lowercase: bool) -> Self {
        self.lowercase = lowercase;
        self
    }

    pub fn with_constrained_transitions(mut self, enabled: bool) -> Self {
        self.constrain_transitions = enabled;
        self
    }

    pub fn with_fold_number(mut self, folds: usize) -> Self {
        self.fold_number = folds;
        self
    }

    /// Options the preprocessor must be fitted with for this model.
    pub fn preprocessor_options(&self) -> PreprocessorOptions {
        PreprocessorOptions::default()
            .with_lowercase(self.lowercase)
            .with_max_char_length(self.max_char_length)
    }

    /// Check the architecture/embedding combination.
    pub fn validate(&self) -> Result<()> {
        if self.model_name.trim().is_empty() {
            return Err(SeqLabError::Configuration("model name is empty".into()));
        }
        if self.variant.uses_char_cnn() && !self.use_char_feature {
            return Err(SeqLabError::Configuration(format!(
                "{} needs character features",
                self.variant
            )));
        }
        if self.word_lstm_units == 0 || self.case_embedding_size == 0 {
            return Err(SeqLabError::Configuration(
                "hidden and case embedding sizes must be positive".into(),
            ));
        }
        if self.embeddings_name.is_none() && self.word_embedding_size == 0 {
            return Err(SeqLabError::Configuration(
                "word embedding size must be positive without pretrained embeddings".into(),
            ));
        }
        if self.use_char_feature
            && (self.char_embedding_size == 0 || self.char_lstm_units == 0 || self.max_char_length == 0)
        {
            return Err(SeqLabError::Configuration(
                "character sizes must be positive when character features are enabled".into(),
            ));
        }
        for (name, p) in [("dropout", self.dropout), ("recurrent_dropout", self.recurrent_dropout)] {
            if !(0.0..1.0).contains(&p) {
                return Err(SeqLabError::Configuration(format!(
                    "{name} must be in [0, 1), got {p}"
                )));
            }
        }
        if self.fold_number == 0 {
            return Err(SeqLabError::Configuration("fold number must be at least 1".into()));
        }
        Ok(())
    }

    /// Freeze the configuration once vocabularies exist.
    ///
    /// `embedding_dim` is the dimension of the pretrained embedding provider,
    /// required exactly when `embeddings_name` is set.
    pub fn finalize(
        mut self,
        preprocessor: &Preprocessor,
        embedding_dim: Option<usize>,
    ) -> Result<ModelConfig> {
        self.validate()?;

        match (&self.embeddings_name, embedding_dim) {
            (Some(_), Some(dim)) if dim > 0 => self.word_embedding_size = dim,
            (Some(name), _) => {
                return Err(SeqLabError::Configuration(format!(
                    "embeddings {name:?} are configured but no provider was supplied"
                )));
            }
            (None, Some(_)) => {
                return Err(SeqLabError::Configuration(
                    "an embedding provider was supplied but no embeddings name is configured".into(),
                ));
            }
            (None, None) => {}
        }

        if preprocessor.options() != &self.preprocessor_options() {
            return Err(SeqLabError::Configuration(
                "preprocessor options do not match the model configuration".into(),
            ));
        }

        Ok(ModelConfig {
            params: self,
            vocab: VocabSizes {
                words: preprocessor.word_vocab_size(),
                chars: preprocessor.char_vocab_size(),
                cases: preprocessor.case_vocab_size(),
                tags: preprocessor.num_tags(),
            },
        })
    }
}

/// Vocabulary sizes recorded at finalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VocabSizes {
    pub words: usize,
    pub chars: usize,
    pub cases: usize,
    pub tags: usize,
}

/// Frozen model configuration. Only obtainable through
/// [`ModelConfigDraft::finalize`] or [`ModelConfig::load`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(flatten)]
    params: ModelConfigDraft,
    vocab: VocabSizes,
}

impl ModelConfig {
    pub fn params(&self) -> &ModelConfigDraft {
        &self.params
    }

    pub fn vocab(&self) -> &VocabSizes {
        &self.vocab
    }

    pub fn model_name(&self) -> &str {
        &self.params.model_name
    }

    pub fn variant(&self) -> ModelVariant {
        self.params.variant
    }

    pub fn num_tags(&self) -> usize {
        self.vocab.tags
    }

    pub fn fold_number(&self) -> usize {
        self.params.fold_number
    }

    pub fn uses_pretrained_embeddings(&self) -> bool {
        self.params.embeddings_name.is_some()
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| SeqLabError::persistence(path, format!("cannot read config: {e}")))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| SeqLabError::persistence(path, format!("corrupt config: {e}")))?;
        config
            .params
            .validate()
            .map_err(|e| SeqLabError::persistence(path, e.to_string()))?;
        Ok(config)
    }
}

/// Optimizer choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Adam,
    Sgd,
}

/// Training hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub batch_size: usize,
    pub optimizer: OptimizerKind,
    pub learning_rate: f64,
    /// Multiplier applied to the learning rate after every epoch.
    pub lr_decay: f64,
    /// Global gradient L2 norm limit. `0` disables clipping.
    pub clip_gradients: f64,
    pub max_epoch: usize,
    pub early_stop: bool,
    pub patience: usize,
    pub max_checkpoints_to_keep: usize,
    pub seed: u64,
    /// Where epoch checkpoints are written. A temporary directory is used
    /// when unset.
    pub checkpoint_dir: Option<PathBuf>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            optimizer: OptimizerKind::Adam,
            learning_rate: 0.001,
            lr_decay: 0.9,
            clip_gradients: 5.0,
            max_epoch: 50,
            early_stop: true,
            patience: 5,
            max_checkpoints_to_keep: 5,
            seed: 7,
            checkpoint_dir: None,
        }
    }
}

impl TrainingConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_optimizer(mut self, optimizer: OptimizerKind, learning_rate: f64) -> Self {
        self.optimizer = optimizer;
        self.learning_rate = learning_rate;
        self
    }

    pub fn with_max_epoch(mut self, max_epoch: usize) -> Self {
        self.max_epoch = max_epoch;
        self
    }

    pub fn with_early_stop(mut self, early_stop: bool, patience: usize) -> Self {
        self.early_stop = early_stop;
        self.patience = patience;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = Some(dir.into());
        self
    }

    pub fn with_max_checkpoints(mut self, keep: usize) -> Self {
        self.max_checkpoints_to_keep = keep;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(SeqLabError::Configuration("batch size must be positive".into()));
        }
        if !(self.learning_rate > 0.0) {
            return Err(SeqLabError::Configuration("learning rate must be positive".into()));
        }
        if !(self.lr_decay > 0.0 && self.lr_decay <= 1.0) {
            return Err(SeqLabError::Configuration("lr decay must be in (0, 1]".into()));
        }
        if self.clip_gradients < 0.0 {
            return Err(SeqLabError::Configuration("clip norm must not be negative".into()));
        }
        if self.max_epoch == 0 {
            return Err(SeqLabError::Configuration("max epoch must be at least 1".into()));
        }
        if self.early_stop && self.patience == 0 {
            return Err(SeqLabError::Configuration("patience must be at least 1".into()));
        }
        if self.max_checkpoints_to_keep == 0 {
            return Err(SeqLabError::Configuration(
                "at least one checkpoint must be kept".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::tests::corpus;

    fn fitted(draft: &ModelConfigDraft) -> Preprocessor {
        let (tokens, tags) = corpus();
        Preprocessor::fit(draft.preprocessor_options(), &tokens, &tags).unwrap()
    }

    #[test]
    fn test_finalize_records_vocab_sizes() {
        let draft = ModelConfigDraft::new("toy");
        let p = fitted(&draft);
        let config = draft.finalize(&p, None).unwrap();

        assert_eq!(config.vocab().words, p.word_vocab_size());
        assert_eq!(config.vocab().chars, p.char_vocab_size());
        assert_eq!(config.num_tags(), p.num_tags());
        assert_eq!(config.params().word_embedding_size, 100);
    }

    #[test]
    fn test_finalize_takes_provider_dimension() {
        let draft = ModelConfigDraft::new("toy").with_embeddings("glove");
        let p = fitted(&draft);
        let config = draft.clone().finalize(&p, Some(50)).unwrap();
        assert_eq!(config.params().word_embedding_size, 50);
        assert!(config.uses_pretrained_embeddings());

        let err = draft.finalize(&p, None).unwrap_err();
        assert!(matches!(err, SeqLabError::Configuration(_)));
    }

    #[test]
    fn test_provider_without_name_rejected() {
        let draft = ModelConfigDraft::new("toy");
        let p = fitted(&draft);
        assert!(draft.finalize(&p, Some(50)).is_err());
    }

    #[test]
    fn test_invalid_combinations() {
        let cnn_without_chars = ModelConfigDraft::new("toy")
            .with_variant(ModelVariant::BiLstmCnnCrf)
            .with_char_feature(false);
        assert!(cnn_without_chars.validate().is_err());

        let crf_without_chars = ModelConfigDraft::new("toy").with_char_feature(false);
        assert!(crf_without_chars.validate().is_ok());

        assert!(ModelConfigDraft::new("toy").with_dropout(1.0, 0.0).validate().is_err());
        assert!(ModelConfigDraft::new("toy").with_fold_number(0).validate().is_err());
        assert!(ModelConfigDraft::new(" ").validate().is_err());
    }

    #[test]
    fn test_variant_names() {
        let json = serde_json::to_string(&ModelVariant::BiLstmCnnCrf).unwrap();
        assert_eq!(json, "\"BidLSTM_CNN_CRF\"");
        assert!(ModelVariant::BiLstmCrf.uses_crf());
        assert!(!ModelVariant::BiLstmCnn.uses_crf());
        assert!(!ModelVariant::BiLstmCrf.uses_char_cnn());
    }

    #[test]
    fn test_config_save_load() {
        let draft = ModelConfigDraft::new("toy").with_variant(ModelVariant::BiLstmCnn);
        let p = fitted(&draft);
        let config = draft.finalize(&p, None).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        config.save(&path).unwrap();
        let json = std::fs::read_to_string(&path).unwrap();
        let loaded = ModelConfig::load(&path).unwrap();

        assert!(json.contains("\"variant\": \"BidLSTM_CNN\""));
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_training_config_validation() {
        assert!(TrainingConfig::default().validate().is_ok());
        assert!(TrainingConfig::default().with_batch_size(0).validate().is_err());
        assert!(TrainingConfig::default().with_max_epoch(0).validate().is_err());
        assert!(TrainingConfig::default().with_early_stop(true, 0).validate().is_err());
        assert!(TrainingConfig::default().with_early_stop(false, 0).validate().is_ok());
        assert!(TrainingConfig::default()
            .with_optimizer(OptimizerKind::Sgd, 0.0)
            .validate()
            .is_err());
    }
}
