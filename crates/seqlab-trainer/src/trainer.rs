//! Epoch loop with validation, checkpoints, learning-rate decay and early
//! stopping.

use serde::{Deserialize, Serialize};
use seqlab_core::{
    BatchGenerator, EmbeddingProvider, EvaluationReport, Evaluator, Preprocessor, Result,
    SeqLabError, SequenceModel, TrainingConfig,
};
use tracing::{info, warn};

use crate::checkpoint::CheckpointManager;
use crate::early_stop::{EarlyStopping, StopDecision};

/// Lifecycle of one training run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrainerState {
    Idle,
    Training { epoch: usize },
    EarlyStopped { best_epoch: usize },
    Exhausted,
    Done,
}

/// Metrics of one finished epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    /// Mean training loss over the epoch's batches.
    pub loss: f32,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    /// Learning rate the epoch was trained with.
    pub learning_rate: f64,
}

/// Result of a training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingOutcome {
    pub history: Vec<EpochRecord>,
    /// Epoch with the highest validation F1; `None` if no epoch finished.
    pub best_epoch: Option<usize>,
    pub best_f1: Option<f64>,
    pub stopped_early: bool,
    /// Epoch whose weights the model holds after training.
    pub final_epoch: usize,
}

/// A labelled split: parallel tokens and tags.
pub type Split<'d> = (&'d [Vec<String>], &'d [Vec<String>]);

/// Drives one model through `Idle -> Training -> {EarlyStopped | Exhausted}
/// -> Done`.
pub struct Trainer<'a, M: SequenceModel> {
    model: M,
    preprocessor: &'a Preprocessor,
    embeddings: Option<&'a dyn EmbeddingProvider>,
    config: TrainingConfig,
    fold: usize,
    state: TrainerState,
}

impl<'a, M: SequenceModel> Trainer<'a, M> {
    pub fn new(model: M, preprocessor: &'a Preprocessor, config: TrainingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            model,
            preprocessor,
            embeddings: None,
            config,
            fold: 0,
            state: TrainerState::Idle,
        })
    }

    pub fn with_embeddings(mut self, provider: Option<&'a dyn EmbeddingProvider>) -> Self {
        self.embeddings = provider;
        self
    }

    /// Fold index, used for the checkpoint sub-directory.
    pub fn with_fold(mut self, fold: usize) -> Self {
        self.fold = fold;
        self
    }

    pub fn state(&self) -> TrainerState {
        self.state
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    /// Train on `train`, selecting on `valid` F1.
    ///
    /// With early stopping the best checkpoint is restored at the end (after
    /// the patience ran out or after the last epoch); without it the final
    /// weights are kept.
    pub fn train(&mut self, train: Split<'_>, valid: Split<'_>) -> Result<TrainingOutcome> {
        if self.state != TrainerState::Idle {
            return Err(SeqLabError::Configuration(
                "a trainer can only run once".into(),
            ));
        }
        if train.0.is_empty() {
            return Err(SeqLabError::EmptyInput);
        }
        if valid.0.is_empty() {
            return Err(SeqLabError::InvalidInput("validation split is empty".into()));
        }

        let mut train_gen =
            self.generator(train, self.config.batch_size)?.with_shuffle(self.config.seed);
        let mut valid_gen = self.generator(valid, self.config.batch_size)?;
        let mut checkpoints = CheckpointManager::new(
            self.config.checkpoint_dir.as_deref(),
            self.fold,
            self.config.max_checkpoints_to_keep,
        )?;
        let mut stopper = EarlyStopping::new(self.config.patience);
        let mut history = Vec::new();
        let mut best_f1: Option<f64> = None;

        info!(
            fold = self.fold,
            train = train.0.len(),
            valid = valid.0.len(),
            max_epoch = self.config.max_epoch,
            "starting training"
        );

        for epoch in 1..=self.config.max_epoch {
            self.state = TrainerState::Training { epoch };
            let learning_rate = self.model.learning_rate();

            let mut total_loss = 0.0f32;
            let mut steps = 0usize;
            for batch in train_gen.epoch() {
                total_loss += self.model.train_step(&batch?)?;
                steps += 1;
            }
            let loss = total_loss / steps.max(1) as f32;
            if !loss.is_finite() {
                warn!(epoch, loss, "training loss is not finite");
            }

            let report: EvaluationReport = Evaluator::evaluate(&self.model, &mut valid_gen)?;
            let improved = best_f1.is_none_or(|best| report.f1() > best);
            if improved {
                best_f1 = Some(report.f1());
            }
            checkpoints.save(&self.model, epoch, improved)?;

            info!(
                epoch,
                loss,
                precision = report.precision(),
                recall = report.recall(),
                f1 = report.f1(),
                learning_rate,
                "epoch finished"
            );
            history.push(EpochRecord {
                epoch,
                loss,
                precision: report.precision(),
                recall: report.recall(),
                f1: report.f1(),
                learning_rate,
            });

            self.model
                .set_learning_rate(learning_rate * self.config.lr_decay);

            if self.config.early_stop && stopper.observe(epoch, report.f1()) == StopDecision::Stop {
                let best_epoch = checkpoints.restore_best(&mut self.model)?;
                self.state = TrainerState::EarlyStopped { best_epoch };
                info!(epoch, best_epoch, "early stopping");
                break;
            }
        }

        let stopped_early = matches!(self.state, TrainerState::EarlyStopped { .. });
        let final_epoch = if stopped_early {
            checkpoints.best_epoch().unwrap_or(history.len())
        } else {
            self.state = TrainerState::Exhausted;
            if self.config.early_stop {
                checkpoints.restore_best(&mut self.model)?
            } else {
                history.len()
            }
        };

        self.state = TrainerState::Done;
        Ok(TrainingOutcome {
            history,
            best_epoch: checkpoints.best_epoch(),
            best_f1,
            stopped_early,
            final_epoch,
        })
    }

    fn generator<'d>(&self, split: Split<'d>, batch_size: usize) -> Result<BatchGenerator<'d>>
    where
        'a: 'd,
    {
        let generator = BatchGenerator::new(split.0, Some(split.1), self.preprocessor, batch_size)?;
        Ok(match self.embeddings {
            Some(provider) => generator.with_embeddings(provider),
            None => generator,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{plan_fixture, CountingModel};

    #[test]
    fn test_early_stop_restores_best_epoch() {
        // validation F1 per epoch: 0.5, 0.6, 0.6, 0.6, 0.6, ...
        let fixture = plan_fixture(&[5, 6, 6, 6, 6, 6, 6, 6]);
        let model = fixture.model();
        let config = TrainingConfig::default()
            .with_max_epoch(8)
            .with_early_stop(true, 3)
            .with_batch_size(100);

        let mut trainer = Trainer::new(model, &fixture.preprocessor, config).unwrap();
        assert_eq!(trainer.state(), TrainerState::Idle);
        let outcome = trainer.train(fixture.train(), fixture.valid()).unwrap();

        assert_eq!(trainer.state(), TrainerState::Done);
        assert!(outcome.stopped_early);
        assert_eq!(outcome.history.len(), 5);
        assert_eq!(outcome.best_epoch, Some(2));
        assert_eq!(outcome.final_epoch, 2);
        assert!((outcome.history[0].f1 - 0.5).abs() < 1e-9);
        assert!((outcome.best_f1.unwrap() - 0.6).abs() < 1e-9);
        // weights of epoch 2 are back in place
        assert_eq!(trainer.model().version, 2);
    }

    #[test]
    fn test_without_early_stop_runs_all_epochs() {
        let fixture = plan_fixture(&[6, 5, 4]);
        let config = TrainingConfig::default()
            .with_max_epoch(3)
            .with_early_stop(false, 0)
            .with_batch_size(100);

        let mut trainer = Trainer::new(fixture.model(), &fixture.preprocessor, config).unwrap();
        let outcome = trainer.train(fixture.train(), fixture.valid()).unwrap();

        assert!(!outcome.stopped_early);
        assert_eq!(outcome.history.len(), 3);
        assert_eq!(outcome.best_epoch, Some(1));
        assert_eq!(outcome.final_epoch, 3);
        assert_eq!(trainer.into_model().version, 3);
    }

    #[test]
    fn test_learning_rate_decays_each_epoch() {
        let fixture = plan_fixture(&[1, 2, 3]);
        let mut config = TrainingConfig::default()
            .with_max_epoch(3)
            .with_early_stop(false, 0)
            .with_batch_size(100);
        config.lr_decay = 0.5;

        let mut model = fixture.model();
        model.lr = 0.8;
        let mut trainer = Trainer::new(model, &fixture.preprocessor, config).unwrap();
        let outcome = trainer.train(fixture.train(), fixture.valid()).unwrap();

        let rates: Vec<f64> = outcome.history.iter().map(|r| r.learning_rate).collect();
        assert_eq!(rates, vec![0.8, 0.4, 0.2]);
        assert!((trainer.model().lr - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_trainer_runs_once() {
        let fixture = plan_fixture(&[1]);
        let config = TrainingConfig::default().with_max_epoch(1).with_batch_size(100);
        let mut trainer = Trainer::new(fixture.model(), &fixture.preprocessor, config).unwrap();
        trainer.train(fixture.train(), fixture.valid()).unwrap();
        assert!(trainer.train(fixture.train(), fixture.valid()).is_err());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let fixture = plan_fixture(&[1]);
        let config = TrainingConfig::default().with_batch_size(0);
        assert!(Trainer::new(fixture.model(), &fixture.preprocessor, config).is_err());
    }
}
