//! seqlab command line
//!
//! Train, evaluate and apply sequence labelling models on CoNLL-style data.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use seqlab::{
    load_conll, EmbeddingProvider, ModelConfigDraft, ModelVariant, OptimizerKind, OutputFormat,
    Sequence, StaticEmbeddings, TrainingConfig,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "seqlab-train")]
#[command(about = "Train and apply BiLSTM-CRF sequence labellers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a model (or a k-fold ensemble) and save the bundle
    Train(TrainArgs),
    /// Evaluate a saved bundle on a labelled file
    Eval {
        /// Model bundle directory
        #[arg(short, long)]
        model: PathBuf,
        /// CoNLL test file
        #[arg(short, long)]
        test: PathBuf,
        /// Pretrained embeddings the model was trained with
        #[arg(short, long)]
        embeddings: Option<PathBuf>,
    },
    /// Tag raw text (one text per line) and print JSON
    Tag {
        /// Model bundle directory
        #[arg(short, long)]
        model: PathBuf,
        /// Input file; stdin when omitted
        #[arg(short, long)]
        input: Option<PathBuf>,
        #[arg(short, long, value_enum, default_value_t = Format::Entities)]
        format: Format,
        /// Pretrained embeddings the model was trained with
        #[arg(short, long)]
        embeddings: Option<PathBuf>,
    },
}

#[derive(clap::Args)]
struct TrainArgs {
    /// CoNLL training file
    #[arg(long)]
    train: PathBuf,
    /// CoNLL validation file; a holdout of the training data when omitted
    #[arg(long)]
    valid: Option<PathBuf>,
    /// CoNLL test file evaluated after training
    #[arg(long)]
    test: Option<PathBuf>,
    /// Output bundle directory
    #[arg(short, long)]
    output: PathBuf,
    #[arg(long, default_value = "ner")]
    name: String,
    #[arg(long, value_enum, default_value_t = Variant::BilstmCrf)]
    variant: Variant,
    /// GloVe/word2vec text file with pretrained word vectors
    #[arg(short, long)]
    embeddings: Option<PathBuf>,
    /// Number of folds; more than one trains an ensemble
    #[arg(long, default_value_t = 1)]
    folds: usize,
    #[arg(long, default_value_t = 50)]
    max_epoch: usize,
    #[arg(long, default_value_t = 20)]
    batch_size: usize,
    #[arg(long, value_enum, default_value_t = Optimizer::Adam)]
    optimizer: Optimizer,
    #[arg(long, default_value_t = 0.001)]
    learning_rate: f64,
    #[arg(long, default_value_t = 5)]
    patience: usize,
    /// Run all epochs and keep the final weights
    #[arg(long)]
    no_early_stop: bool,
    #[arg(long, default_value_t = 7)]
    seed: u64,
    /// Keep epoch checkpoints here instead of a temporary directory
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,
    /// Lowercase words before vocabulary lookup
    #[arg(long)]
    lowercase: bool,
    /// Forbid invalid BIO transitions when decoding
    #[arg(long)]
    constrain: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum Variant {
    BilstmCrf,
    BilstmCnn,
    BilstmCnnCrf,
}

impl From<Variant> for ModelVariant {
    fn from(variant: Variant) -> Self {
        match variant {
            Variant::BilstmCrf => ModelVariant::BiLstmCrf,
            Variant::BilstmCnn => ModelVariant::BiLstmCnn,
            Variant::BilstmCnnCrf => ModelVariant::BiLstmCnnCrf,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Optimizer {
    Adam,
    Sgd,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Entities,
    Tokens,
}

fn load_embeddings(path: &Path) -> Result<StaticEmbeddings> {
    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("embeddings")
        .to_string();
    StaticEmbeddings::from_text_file(name, path)
        .with_context(|| format!("loading embeddings from {}", path.display()))
}

fn load_bundle(model: &Path, embeddings: Option<&Path>) -> Result<Sequence> {
    let provider = match embeddings {
        Some(path) => Some(Box::new(load_embeddings(path)?) as Box<dyn EmbeddingProvider>),
        None => None,
    };
    Sequence::load(model, provider).with_context(|| format!("loading model from {}", model.display()))
}

fn train(args: TrainArgs) -> Result<()> {
    if args.folds == 0 {
        bail!("--folds must be at least 1");
    }
    let train = load_conll(&args.train)?;
    let valid = args.valid.as_deref().map(load_conll).transpose()?;
    let test = args.test.as_deref().map(load_conll).transpose()?;

    let draft = ModelConfigDraft::new(args.name)
        .with_variant(args.variant.into())
        .with_lowercase(args.lowercase)
        .with_constrained_transitions(args.constrain)
        .with_fold_number(args.folds);
    let optimizer = match args.optimizer {
        Optimizer::Adam => OptimizerKind::Adam,
        Optimizer::Sgd => OptimizerKind::Sgd,
    };
    let mut training = TrainingConfig::default()
        .with_batch_size(args.batch_size)
        .with_optimizer(optimizer, args.learning_rate)
        .with_max_epoch(args.max_epoch)
        .with_early_stop(!args.no_early_stop, args.patience)
        .with_seed(args.seed);
    if let Some(dir) = args.checkpoint_dir {
        training = training.with_checkpoint_dir(dir);
    }

    let mut sequence = Sequence::new(draft, training);
    if let Some(path) = &args.embeddings {
        sequence = sequence.with_embeddings(load_embeddings(path)?);
    }

    if args.folds > 1 {
        let outcomes = sequence.fit_ensemble(&train, valid.as_ref())?;
        for (fold, outcome) in outcomes.iter().enumerate() {
            info!(fold, best_epoch = ?outcome.best_epoch, best_f1 = ?outcome.best_f1, "fold trained");
        }
    } else {
        let outcome = sequence.fit(&train, valid.as_ref())?;
        info!(
            epochs = outcome.history.len(),
            best_epoch = ?outcome.best_epoch,
            best_f1 = ?outcome.best_f1,
            stopped_early = outcome.stopped_early,
            "model trained"
        );
    }

    if let Some(test) = &test {
        let report = sequence.evaluate(test)?;
        if let Some(summary) = sequence.ensemble_summary() {
            println!("{summary}");
        }
        println!("{report}");
    }

    sequence
        .save(&args.output)
        .with_context(|| format!("saving model to {}", args.output.display()))?;
    info!(output = %args.output.display(), "done");
    Ok(())
}

fn evaluate(model: &Path, test: &Path, embeddings: Option<&Path>) -> Result<()> {
    let mut sequence = load_bundle(model, embeddings)?;
    let test = load_conll(test)?;
    let report = sequence.evaluate(&test)?;
    if let Some(summary) = sequence.ensemble_summary() {
        println!("{summary}");
    }
    println!("{report}");
    Ok(())
}

fn tag(model: &Path, input: Option<&Path>, format: Format, embeddings: Option<&Path>) -> Result<()> {
    let sequence = load_bundle(model, embeddings)?;
    let reader: Box<dyn BufRead> = match input {
        Some(path) => Box::new(BufReader::new(
            File::open(path).with_context(|| format!("opening {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(io::stdin())),
    };
    let texts: Vec<String> = reader.lines().collect::<io::Result<_>>()?;
    let format = match format {
        Format::Entities => OutputFormat::Entities,
        Format::Tokens => OutputFormat::Tokens,
    };

    for tagged in sequence.tag(&texts, format)? {
        println!("{}", serde_json::to_string(&tagged)?);
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Train(args) => train(args),
        Commands::Eval {
            model,
            test,
            embeddings,
        } => evaluate(&model, &test, embeddings.as_deref()),
        Commands::Tag {
            model,
            input,
            format,
            embeddings,
        } => tag(&model, input.as_deref(), format, embeddings.as_deref()),
    }
}
