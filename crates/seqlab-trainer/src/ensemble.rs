//! k-fold ensembles: sequential fold training, test-set evaluation and best
//! fold selection.

use std::fmt;

use serde::{Deserialize, Serialize};
use seqlab_core::{
    BatchGenerator, EmbeddingProvider, EvaluationReport, Evaluator, Preprocessor, Result,
    SeqLabError, SequenceModel, TrainingConfig,
};
use tracing::info;

use crate::data::{check_validation_source, training_splits, Dataset};
use crate::trainer::{Split, Trainer, TrainingOutcome};

/// A trained fold.
pub struct FoldRun<M> {
    pub fold: usize,
    pub model: M,
    pub outcome: TrainingOutcome,
}

/// Test scores of one fold model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoldScore {
    pub fold: usize,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

/// Per-fold test scores, the selected fold and macro averages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleSummary {
    pub folds: Vec<FoldScore>,
    /// Fold with the highest test F1; ties keep the lowest index.
    pub best_fold: usize,
    pub macro_precision: f64,
    pub macro_recall: f64,
    pub macro_f1: f64,
}

impl fmt::Display for EnsembleSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:>8}  {:>9}  {:>9}  {:>9}", "fold", "precision", "recall", "f1-score")?;
        for score in &self.folds {
            let marker = if score.fold == self.best_fold { " *" } else { "" };
            writeln!(
                f,
                "{:>8}  {:>9.4}  {:>9.4}  {:>9.4}{marker}",
                score.fold, score.precision, score.recall, score.f1
            )?;
        }
        writeln!(
            f,
            "{:>8}  {:>9.4}  {:>9.4}  {:>9.4}",
            "average", self.macro_precision, self.macro_recall, self.macro_f1
        )
    }
}

/// Index of the highest score. Ties keep the lowest index.
pub fn select_best_fold(f1_scores: &[f64]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, &score) in f1_scores.iter().enumerate() {
        if best.is_none_or(|b| score > f1_scores[b]) {
            best = Some(i);
        }
    }
    best
}

/// Combine per-fold test reports.
pub fn summarize(reports: &[EvaluationReport]) -> Option<EnsembleSummary> {
    let f1_scores: Vec<f64> = reports.iter().map(EvaluationReport::f1).collect();
    let best_fold = select_best_fold(&f1_scores)?;
    let n = reports.len() as f64;
    let mean = |f: fn(&EvaluationReport) -> f64| reports.iter().map(f).sum::<f64>() / n;

    Some(EnsembleSummary {
        folds: reports
            .iter()
            .enumerate()
            .map(|(fold, r)| FoldScore {
                fold,
                precision: r.precision(),
                recall: r.recall(),
                f1: r.f1(),
            })
            .collect(),
        best_fold,
        macro_precision: mean(EvaluationReport::precision),
        macro_recall: mean(EvaluationReport::recall),
        macro_f1: mean(EvaluationReport::f1),
    })
}

/// Train `folds` models one after another.
///
/// Fold `k` is built by `build(k, config)` where `config` carries seed
/// `seed + k`. Without a validation set fold `k` validates on partition `k`
/// of the training data (or on a 10% holdout when there is a single fold).
pub fn train_folds<'a, M, F>(
    mut build: F,
    preprocessor: &'a Preprocessor,
    config: &TrainingConfig,
    folds: usize,
    train: &Dataset,
    valid: Option<&Dataset>,
    embeddings: Option<&'a dyn EmbeddingProvider>,
) -> Result<Vec<FoldRun<M>>>
where
    M: SequenceModel,
    F: FnMut(usize, &TrainingConfig) -> Result<M>,
{
    if folds == 0 {
        return Err(SeqLabError::Configuration("fold number must be at least 1".into()));
    }
    check_validation_source(train, valid, folds)?;

    let mut runs = Vec::with_capacity(folds);
    for fold in 0..folds {
        let fold_config = config.clone().with_seed(config.seed.wrapping_add(fold as u64));
        let (fold_train, fold_valid) = training_splits(train, valid, folds, fold, config.seed);
        info!(
            fold,
            of = folds,
            train = fold_train.len(),
            valid = fold_valid.len(),
            "training fold"
        );

        let model = build(fold, &fold_config)?;
        let mut trainer = Trainer::new(model, preprocessor, fold_config)?
            .with_embeddings(embeddings)
            .with_fold(fold);
        let outcome = trainer.train(fold_train.as_split(), fold_valid.as_split())?;
        runs.push(FoldRun {
            fold,
            model: trainer.into_model(),
            outcome,
        });
    }
    Ok(runs)
}

/// Evaluate every fold model on the shared test split.
pub fn evaluate_folds<M: SequenceModel>(
    models: &[&M],
    preprocessor: &Preprocessor,
    test: Split<'_>,
    embeddings: Option<&dyn EmbeddingProvider>,
    batch_size: usize,
) -> Result<(Vec<EvaluationReport>, EnsembleSummary)> {
    let mut reports = Vec::with_capacity(models.len());
    for (fold, model) in models.iter().enumerate() {
        let mut generator = BatchGenerator::new(test.0, Some(test.1), preprocessor, batch_size)?;
        if let Some(provider) = embeddings {
            generator = generator.with_embeddings(provider);
        }
        let report = Evaluator::evaluate(*model, &mut generator)?;
        info!(fold, f1 = report.f1(), "fold evaluated");
        reports.push(report);
    }

    let summary = summarize(&reports).ok_or(SeqLabError::NotFitted("fold evaluation"))?;
    info!(
        best_fold = summary.best_fold,
        macro_f1 = summary.macro_f1,
        "ensemble evaluated"
    );
    Ok((reports, summary))
}
