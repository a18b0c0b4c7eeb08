//! The `Sequence` facade: fit, evaluate, tag and persist a tagger or a
//! k-fold ensemble of taggers.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use seqlab_core::{
    build_model, BatchGenerator, EmbeddingProvider, EvaluationReport, Evaluator, ModelConfig,
    ModelConfigDraft, NeuralTagger, OutputFormat, Preprocessor, Result, SeqLabError,
    SequenceModel, TaggedText, Tagger, TrainingConfig,
};
use seqlab_trainer::{
    check_validation_source, evaluate_folds, select_best_fold, train_folds, Dataset,
    EnsembleSummary, TrainingOutcome,
};
use tracing::info;

const PREPROCESSOR_FILE: &str = "preprocessor.json";
const CONFIG_FILE: &str = "config.json";
const WEIGHTS_FILE: &str = "model.safetensors";

/// Contents of `config.json` in a model bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BundleManifest {
    #[serde(flatten)]
    model: ModelConfig,
    selected_fold: usize,
    training: TrainingConfig,
}

struct Fitted {
    preprocessor: Preprocessor,
    config: ModelConfig,
    models: Vec<NeuralTagger>,
    selected: usize,
    outcomes: Vec<TrainingOutcome>,
    summary: Option<EnsembleSummary>,
}

impl Fitted {
    fn selected_model(&self) -> &NeuralTagger {
        &self.models[self.selected]
    }
}

/// A sequence labeller: configuration, optional pretrained embeddings and,
/// once fitted or loaded, the preprocessor and trained model(s).
pub struct Sequence {
    draft: ModelConfigDraft,
    training: TrainingConfig,
    embeddings: Option<Box<dyn EmbeddingProvider>>,
    fitted: Option<Fitted>,
}

impl Sequence {
    pub fn new(draft: ModelConfigDraft, training: TrainingConfig) -> Self {
        Self {
            draft,
            training,
            embeddings: None,
            fitted: None,
        }
    }

    /// Use pretrained word vectors. The draft's embeddings name is set to
    /// the provider's name.
    pub fn with_embeddings(mut self, provider: impl EmbeddingProvider + 'static) -> Self {
        self.draft.embeddings_name = Some(provider.name().to_string());
        self.embeddings = Some(Box::new(provider));
        self
    }

    pub fn is_fitted(&self) -> bool {
        self.fitted.is_some()
    }

    pub fn training_config(&self) -> &TrainingConfig {
        &self.training
    }

    /// Frozen configuration of the fitted model.
    pub fn config(&self) -> Option<&ModelConfig> {
        self.fitted.as_ref().map(|f| &f.config)
    }

    pub fn preprocessor(&self) -> Option<&Preprocessor> {
        self.fitted.as_ref().map(|f| &f.preprocessor)
    }

    /// Index of the fold used for tagging and saving.
    pub fn selected_fold(&self) -> Option<usize> {
        self.fitted.as_ref().map(|f| f.selected)
    }

    /// Training outcomes, one per fold (empty after `load`).
    pub fn outcomes(&self) -> &[TrainingOutcome] {
        self.fitted.as_ref().map_or(&[], |f| f.outcomes.as_slice())
    }

    /// Fold comparison from the last ensemble evaluation.
    pub fn ensemble_summary(&self) -> Option<&EnsembleSummary> {
        self.fitted.as_ref().and_then(|f| f.summary.as_ref())
    }

    /// Fit vocabularies and train a single model.
    pub fn fit(&mut self, train: &Dataset, valid: Option<&Dataset>) -> Result<&TrainingOutcome> {
        let draft = self.draft.clone().with_fold_number(1);
        self.fit_folds(draft, train, valid)?;
        self.outcomes()
            .first()
            .ok_or(SeqLabError::NotFitted("training"))
    }

    /// Fit vocabularies and train `fold_number` models, one per fold.
    ///
    /// Until [`Sequence::evaluate`] runs on a test set the fold with the best
    /// validation F1 is selected.
    pub fn fit_ensemble(
        &mut self,
        train: &Dataset,
        valid: Option<&Dataset>,
    ) -> Result<&[TrainingOutcome]> {
        self.fit_folds(self.draft.clone(), train, valid)?;
        Ok(self.outcomes())
    }

    fn fit_folds(
        &mut self,
        draft: ModelConfigDraft,
        train: &Dataset,
        valid: Option<&Dataset>,
    ) -> Result<()> {
        if train.is_empty() {
            return Err(SeqLabError::EmptyInput);
        }
        draft.validate()?;
        self.training.validate()?;
        check_validation_source(train, valid, draft.fold_number)?;

        let mut splits = vec![train.as_split()];
        if let Some(valid) = valid {
            splits.push(valid.as_split());
        }
        let preprocessor = Preprocessor::fit_splits(draft.preprocessor_options(), &splits)?;
        let config = draft.finalize(&preprocessor, self.embeddings.as_ref().map(|e| e.dim()))?;
        info!(
            model = config.model_name(),
            variant = %config.variant(),
            folds = config.fold_number(),
            "fitting"
        );

        let runs = train_folds(
            |_, training| build_model(&config, preprocessor.tag_labels(), training),
            &preprocessor,
            &self.training,
            config.fold_number(),
            train,
            valid,
            self.embeddings.as_deref(),
        )?;

        let best_f1: Vec<f64> = runs
            .iter()
            .map(|run| run.outcome.best_f1.unwrap_or(0.0))
            .collect();
        let selected = select_best_fold(&best_f1).unwrap_or(0);
        let (models, outcomes): (Vec<_>, Vec<_>) =
            runs.into_iter().map(|run| (run.model, run.outcome)).unzip();

        self.fitted = Some(Fitted {
            preprocessor,
            config,
            models,
            selected,
            outcomes,
            summary: None,
        });
        Ok(())
    }

    /// Evaluate on a labelled test set.
    ///
    /// A single model is scored directly. For an ensemble every fold is
    /// scored, the best fold becomes the selected model and the fold
    /// comparison is kept in [`Sequence::ensemble_summary`]. The returned
    /// report is the selected model's.
    pub fn evaluate(&mut self, test: &Dataset) -> Result<EvaluationReport> {
        let fitted = self.fitted.as_mut().ok_or(SeqLabError::NotFitted("evaluation"))?;
        if test.is_empty() {
            return Err(SeqLabError::EmptyInput);
        }
        let embeddings = self.embeddings.as_deref();

        if fitted.models.len() == 1 {
            let mut generator = BatchGenerator::new(
                &test.tokens,
                Some(&test.tags),
                &fitted.preprocessor,
                self.training.batch_size,
            )?;
            if let Some(provider) = embeddings {
                generator = generator.with_embeddings(provider);
            }
            let report = Evaluator::evaluate(fitted.selected_model(), &mut generator)?;
            info!(f1 = report.f1(), "evaluated");
            return Ok(report);
        }

        let models: Vec<&NeuralTagger> = fitted.models.iter().collect();
        let (mut reports, summary) = evaluate_folds(
            &models,
            &fitted.preprocessor,
            test.as_split(),
            embeddings,
            self.training.batch_size,
        )?;
        fitted.selected = summary.best_fold;
        fitted.summary = Some(summary);
        Ok(reports.swap_remove(fitted.selected))
    }

    /// Tag raw texts with the selected model.
    pub fn tag<S: AsRef<str>>(&self, texts: &[S], format: OutputFormat) -> Result<Vec<TaggedText>> {
        self.tagger()?.tag(texts, format)
    }

    /// Tag pre-tokenized sentences with the selected model.
    pub fn tag_tokens(&self, sentences: &[Vec<String>], format: OutputFormat) -> Result<Vec<TaggedText>> {
        self.tagger()?.tag_tokens(sentences, format)
    }

    fn tagger(&self) -> Result<Tagger<'_, NeuralTagger>> {
        let fitted = self.fitted.as_ref().ok_or(SeqLabError::NotFitted("tagging"))?;
        Ok(Tagger::new(Some(fitted.selected_model()), Some(&fitted.preprocessor))?
            .with_embeddings(self.embeddings.as_deref())
            .with_batch_size(self.training.batch_size))
    }

    /// Write the bundle: `preprocessor.json`, `config.json` and the selected
    /// model as `model.safetensors`; ensembles also get
    /// `fold_K/model.safetensors` per fold.
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        let fitted = self.fitted.as_ref().ok_or(SeqLabError::NotFitted("saving"))?;
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .map_err(|e| SeqLabError::persistence(dir, format!("cannot create bundle directory: {e}")))?;

        fitted.preprocessor.save(dir.join(PREPROCESSOR_FILE))?;
        let manifest = BundleManifest {
            model: fitted.config.clone(),
            selected_fold: fitted.selected,
            training: self.training.clone(),
        };
        fs::write(dir.join(CONFIG_FILE), serde_json::to_string_pretty(&manifest)?)?;
        fitted.selected_model().save(&dir.join(WEIGHTS_FILE))?;

        if fitted.models.len() > 1 {
            for (fold, model) in fitted.models.iter().enumerate() {
                let fold_dir = dir.join(format!("fold_{fold}"));
                fs::create_dir_all(&fold_dir)?;
                model.save(&fold_dir.join(WEIGHTS_FILE))?;
            }
        }
        info!(dir = %dir.display(), folds = fitted.models.len(), "saved model bundle");
        Ok(())
    }

    /// Load a bundle written by [`Sequence::save`].
    ///
    /// A bundle trained with pretrained embeddings needs a provider of the
    /// same dimension.
    pub fn load(dir: impl AsRef<Path>, embeddings: Option<Box<dyn EmbeddingProvider>>) -> Result<Self> {
        let dir = dir.as_ref();
        let config_path = dir.join(CONFIG_FILE);
        let content = fs::read_to_string(&config_path)
            .map_err(|e| SeqLabError::persistence(&config_path, format!("cannot read config: {e}")))?;
        let manifest: BundleManifest = serde_json::from_str(&content)
            .map_err(|e| SeqLabError::persistence(&config_path, format!("corrupt config: {e}")))?;
        manifest
            .model
            .params()
            .validate()
            .map_err(|e| SeqLabError::persistence(&config_path, e.to_string()))?;

        check_embeddings(&manifest.model, embeddings.as_deref())?;

        let preprocessor = Preprocessor::load(dir.join(PREPROCESSOR_FILE))?;
        if preprocessor.num_tags() != manifest.model.num_tags() {
            return Err(SeqLabError::persistence(
                dir,
                "preprocessor and config disagree on the tag set",
            ));
        }

        let config = manifest.model;
        let fold_paths: Vec<_> = (0..config.fold_number())
            .map(|fold| dir.join(format!("fold_{fold}")).join(WEIGHTS_FILE))
            .collect();
        let (paths, selected) = if config.fold_number() > 1 && fold_paths.iter().all(|p| p.exists()) {
            (fold_paths, manifest.selected_fold)
        } else {
            (vec![dir.join(WEIGHTS_FILE)], 0)
        };
        if selected >= paths.len() {
            return Err(SeqLabError::persistence(&config_path, "selected fold out of range"));
        }

        let mut models = Vec::with_capacity(paths.len());
        for path in &paths {
            let mut model = build_model(&config, preprocessor.tag_labels(), &manifest.training)?;
            model.load(path)?;
            models.push(model);
        }
        info!(dir = %dir.display(), folds = models.len(), selected, "loaded model bundle");

        Ok(Self {
            draft: config.params().clone(),
            training: manifest.training,
            embeddings,
            fitted: Some(Fitted {
                preprocessor,
                config,
                models,
                selected,
                outcomes: Vec::new(),
                summary: None,
            }),
        })
    }
}

fn check_embeddings(config: &ModelConfig, provider: Option<&dyn EmbeddingProvider>) -> Result<()> {
    let expected = config.params().word_embedding_size;
    match (&config.params().embeddings_name, provider) {
        (Some(_), Some(provider)) if provider.dim() == expected => Ok(()),
        (Some(_), Some(provider)) => Err(SeqLabError::Configuration(format!(
            "embedding provider {:?} has dimension {} but the model was trained with {expected}",
            provider.name(),
            provider.dim()
        ))),
        (Some(name), None) => Err(SeqLabError::Configuration(format!(
            "model was trained with embeddings {name:?}; a provider is required"
        ))),
        (None, Some(_)) => Err(SeqLabError::Configuration(
            "model was trained without pretrained embeddings".into(),
        )),
        (None, None) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use seqlab_core::{ModelVariant, StaticEmbeddings};
    use tempfile::tempdir;

    fn dataset(lines: &[(&str, &str)]) -> Dataset {
        let split = |s: &str| s.split_whitespace().map(String::from).collect::<Vec<_>>();
        Dataset::new(
            lines.iter().map(|(t, _)| split(t)).collect(),
            lines.iter().map(|(_, g)| split(g)).collect(),
        )
        .unwrap()
    }

    fn corpus() -> Dataset {
        dataset(&[
            ("Anna went to Moscow", "B-PER O O B-LOC"),
            ("Levin lives in Pokrovskoe", "B-PER O O B-LOC"),
            ("Anna Karenina met Levin", "B-PER I-PER O B-PER"),
            ("Moscow is far", "B-LOC O O"),
            ("Levin went to Moscow", "B-PER O O B-LOC"),
            ("Kitty lives in Moscow", "B-PER O O B-LOC"),
        ])
    }

    fn small_draft() -> ModelConfigDraft {
        ModelConfigDraft::new("toy")
            .with_variant(ModelVariant::BiLstmCnnCrf)
            .with_word_embedding_size(8)
            .with_word_lstm_units(8)
            .with_char_sizes(4, 4)
            .with_dropout(0.0, 0.0)
    }

    fn small_training() -> TrainingConfig {
        TrainingConfig::default()
            .with_batch_size(3)
            .with_optimizer(seqlab_core::OptimizerKind::Adam, 0.05)
            .with_max_epoch(3)
            .with_seed(11)
    }

    #[test]
    fn test_unfitted_operations_fail_fast() {
        let mut sequence = Sequence::new(small_draft(), small_training());
        assert!(!sequence.is_fitted());
        assert!(matches!(
            sequence.tag(&["Anna"], OutputFormat::Entities),
            Err(SeqLabError::NotFitted(_))
        ));
        assert!(matches!(
            sequence.evaluate(&corpus()),
            Err(SeqLabError::NotFitted(_))
        ));
        let dir = tempdir().unwrap();
        assert!(matches!(
            sequence.save(dir.path().join("unfitted")),
            Err(SeqLabError::NotFitted(_))
        ));
    }

    #[test]
    fn test_fit_without_enough_sentences_for_validation() {
        let one = dataset(&[("Anna went to Moscow", "B-PER O O B-LOC")]);
        let mut sequence = Sequence::new(small_draft(), small_training());
        assert!(matches!(
            sequence.fit(&one, None),
            Err(SeqLabError::Configuration(msg)) if msg.contains("1 training sentence")
        ));
        assert!(!sequence.is_fitted());
        sequence.fit(&one, Some(&one)).unwrap();

        let three = dataset(&[
            ("Anna went to Moscow", "B-PER O O B-LOC"),
            ("Moscow is far", "B-LOC O O"),
            ("Kitty lives in Moscow", "B-PER O O B-LOC"),
        ]);
        let mut ensemble = Sequence::new(small_draft().with_fold_number(5), small_training());
        assert!(matches!(
            ensemble.fit_ensemble(&three, None),
            Err(SeqLabError::Configuration(msg)) if msg.contains("fold number 5") && msg.contains("3 training")
        ));
    }

    #[test]
    fn test_fit_save_load_reproduces_tagging() {
        let data = corpus();
        let mut sequence = Sequence::new(small_draft(), small_training());
        let outcome = sequence.fit(&data, Some(&data)).unwrap();
        assert_eq!(outcome.history.len(), 3);
        assert_eq!(sequence.selected_fold(), Some(0));

        let report = sequence.evaluate(&data).unwrap();
        assert!((0.0..=1.0).contains(&report.f1()));

        let texts = ["Anna went to Moscow", "Levin and Zoltan"];
        let before = sequence.tag(&texts, OutputFormat::Tokens).unwrap();
        assert_eq!(before.len(), 2);
        assert_eq!(before[1].tokens.len(), 3);

        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("roundtrip");
        sequence.save(&dir).unwrap();
        assert!(dir.join(PREPROCESSOR_FILE).exists());
        assert!(dir.join(WEIGHTS_FILE).exists());

        let loaded = Sequence::load(&dir, None).unwrap();
        assert_eq!(loaded.config(), sequence.config());
        assert_eq!(loaded.tag(&texts, OutputFormat::Tokens).unwrap(), before);
    }

    #[test]
    fn test_ensemble_selects_best_fold() {
        let data = corpus();
        let draft = small_draft().with_fold_number(2);
        let training = small_training().with_max_epoch(2);
        let mut sequence = Sequence::new(draft, training);

        let outcomes = sequence.fit_ensemble(&data, None).unwrap();
        assert_eq!(outcomes.len(), 2);

        sequence.evaluate(&data).unwrap();
        let summary = sequence.ensemble_summary().unwrap();
        assert_eq!(summary.folds.len(), 2);
        assert_eq!(sequence.selected_fold(), Some(summary.best_fold));

        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("ensemble");
        sequence.save(&dir).unwrap();
        assert!(dir.join("fold_0").join(WEIGHTS_FILE).exists());
        assert!(dir.join("fold_1").join(WEIGHTS_FILE).exists());

        let loaded = Sequence::load(&dir, None).unwrap();
        assert_eq!(loaded.selected_fold(), Some(summary.best_fold));
    }

    #[test]
    fn test_embedding_dimension_checked_at_load() {
        let vectors: HashMap<String, Vec<f32>> = [
            ("Anna".to_string(), vec![1.0, 0.0, 0.0]),
            ("Moscow".to_string(), vec![0.0, 1.0, 0.0]),
        ]
        .into_iter()
        .collect();
        let provider = StaticEmbeddings::from_map("toy", vectors).unwrap();

        let data = corpus();
        let mut sequence = Sequence::new(small_draft(), small_training().with_max_epoch(1))
            .with_embeddings(provider);
        sequence.fit(&data, Some(&data)).unwrap();
        assert_eq!(sequence.config().unwrap().params().word_embedding_size, 3);

        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("embeddings");
        sequence.save(&dir).unwrap();

        assert!(matches!(
            Sequence::load(&dir, None),
            Err(SeqLabError::Configuration(_))
        ));
        let wrong = StaticEmbeddings::from_map(
            "wide",
            [("Anna".to_string(), vec![1.0; 5])].into_iter().collect(),
        )
        .unwrap();
        assert!(matches!(
            Sequence::load(&dir, Some(Box::new(wrong))),
            Err(SeqLabError::Configuration(_))
        ));
    }

    #[test]
    fn test_load_missing_bundle() {
        assert!(matches!(
            Sequence::load("/nonexistent/seqlab-bundle", None),
            Err(SeqLabError::Persistence { .. })
        ));
    }
}
