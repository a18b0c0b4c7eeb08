//! # seqlab Trainer
//!
//! Training orchestration for seqlab sequence models: CoNLL loading and
//! dataset splits, the epoch loop with validation F1, learning-rate decay,
//! checkpoint retention and early stopping, and k-fold ensembles.

pub mod checkpoint;
pub mod data;
pub mod early_stop;
pub mod ensemble;
pub mod trainer;

pub use checkpoint::CheckpointManager;
pub use data::{
    check_validation_source, fold_split, holdout_split, kfold_partitions, load_conll,
    training_splits, Dataset,
};
pub use early_stop::{EarlyStopping, StopDecision};
pub use ensemble::{
    evaluate_folds, select_best_fold, summarize, train_folds, EnsembleSummary, FoldRun, FoldScore,
};
pub use trainer::{EpochRecord, Split, Trainer, TrainerState, TrainingOutcome};
