use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::fs;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use squaresight::config::{
    AugmentConfig, ExperimentConfig, SplitConfig, StoreConfig,
};
use squaresight::data::{write_augmented_copies, DatasetBuilder, ImageStore, LabelAugmenter};
use squaresight::experiment::{evaluate_partition, ExperimentRunner};
use squaresight::model::{MlpBuilder, ModelBuilder};
use squaresight::synth::{generate_batch, SyntheticKind};
use squaresight::Dataset;

#[derive(Debug, Parser)]
#[command(author, version, about = "Square-marker dataset and training CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Generate synthetic background images
    Generate(GenerateArgs),
    /// Build a labeled, split dataset artifact from a directory of raw images
    BuildDataset(BuildDatasetArgs),
    /// Train a classifier on a dataset artifact
    Train(TrainArgs),
    /// Evaluate a checkpoint on a dataset's test partition
    Eval(EvalArgs),
}

#[derive(Debug, Args)]
struct GenerateArgs {
    /// Background kind to generate
    #[arg(value_enum)]
    kind: SyntheticKind,
    /// Number of images
    count: usize,
    /// Output directory
    out_dir: PathBuf,
    /// Square image side in pixels
    #[arg(long, default_value_t = 64)]
    size: u32,
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

#[derive(Debug, Args)]
struct BuildDatasetArgs {
    /// Directory of raw source images
    raw_dir: PathBuf,
    /// Directory to write augmented (marker-overlaid) copies into
    augmented_dir: PathBuf,
    /// Output dataset artifact directory
    output: PathBuf,
    #[arg(long, default_value_t = 42)]
    seed: u64,
    /// Probability of overlaying the marker
    #[arg(long, default_value_t = 0.5)]
    probability: f64,
    #[arg(long, default_value_t = 16)]
    min_side: u32,
    #[arg(long, default_value_t = 16)]
    max_side: u32,
    /// Target resolution (images are resized to resolution x resolution)
    #[arg(long, default_value_t = 64)]
    resolution: u32,
    #[arg(long, default_value_t = 0.8)]
    train: f32,
    #[arg(long, default_value_t = 0.1)]
    validation: f32,
    #[arg(long, default_value_t = 0.1)]
    test: f32,
    /// Optional decode cache directory
    #[arg(long)]
    cache_dir: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct TrainArgs {
    /// Dataset artifact directory
    dataset: PathBuf,
    /// Output directory for history, report, and checkpoints
    out_dir: PathBuf,
    /// Epoch budget
    max_epochs: usize,
    /// Path to an experiment configuration JSON file
    #[arg(long)]
    config: Option<PathBuf>,
    /// Hidden layer widths, e.g. --hidden 128,64
    #[arg(long, value_delimiter = ',')]
    hidden: Option<Vec<usize>>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    learning_rate: Option<f64>,
}

#[derive(Debug, Args)]
struct EvalArgs {
    /// Dataset artifact directory
    dataset: PathBuf,
    /// Checkpoint metadata file (checkpoint_epoch_*.json)
    checkpoint: PathBuf,
    /// Hidden layer widths the checkpointed model was built with
    #[arg(long, value_delimiter = ',')]
    hidden: Option<Vec<usize>>,
    #[arg(long, default_value_t = 100)]
    batch_size: usize,
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Generate(args) => generate_command(args),
        Commands::BuildDataset(args) => build_dataset_command(args),
        Commands::Train(args) => train_command(args),
        Commands::Eval(args) => eval_command(args),
    }
}

fn generate_command(args: GenerateArgs) -> Result<()> {
    generate_batch(args.kind, args.count, &args.out_dir, args.size, args.seed)?;
    Ok(())
}

fn build_dataset_command(args: BuildDatasetArgs) -> Result<()> {
    let store_config = StoreConfig {
        width: args.resolution,
        height: args.resolution,
        cache_dir: args.cache_dir.clone(),
        ..StoreConfig::default()
    };
    let store = ImageStore::new(&args.raw_dir, store_config);
    let (images, stats) = store.decode_all()?;
    if stats.skipped > 0 {
        info!("{} files were skipped during decoding", stats.skipped);
    }

    let augmenter = LabelAugmenter::new(AugmentConfig {
        probability: args.probability,
        min_side: args.min_side,
        max_side: args.max_side,
        ..AugmentConfig::default()
    });
    let examples = augmenter.augment_all(images, args.seed);
    write_augmented_copies(&examples, &args.augmented_dir)?;

    let split = SplitConfig {
        train: args.train,
        validation: args.validation,
        test: args.test,
    };
    let dataset = DatasetBuilder::new(split, args.seed)?
        .with_source_dirs(vec![args.raw_dir.to_string_lossy().into_owned()])
        .build(examples)?;
    dataset.save(&args.output)?;
    Ok(())
}

fn train_command(args: TrainArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => {
            let json = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            serde_json::from_str::<ExperimentConfig>(&json)
                .with_context(|| "Failed to parse config JSON")?
        }
        None => ExperimentConfig::default(),
    };
    config.training.max_epochs = args.max_epochs;
    if let Some(hidden) = args.hidden {
        config.model.hidden = hidden;
    }
    if let Some(batch_size) = args.batch_size {
        config.training.batch_size = batch_size;
    }
    if let Some(learning_rate) = args.learning_rate {
        config.model.learning_rate = learning_rate;
    }
    config.validate();

    let builder = MlpBuilder::new(config.model.clone());
    let runner = ExperimentRunner::new(&args.dataset, &args.out_dir, config);
    let (summary, report) = runner.run(&builder)?;

    info!(
        "Training finished: {:?} after {} epochs",
        summary.termination, report.epochs_completed
    );
    if summary.failed() {
        let detail = summary
            .failure
            .map(|f| f.to_string())
            .unwrap_or_else(|| "training diverged".to_string());
        anyhow::bail!("training failed: {detail}");
    }
    Ok(())
}

fn eval_command(args: EvalArgs) -> Result<()> {
    let dataset = Dataset::load(&args.dataset)?;

    let mut model_config = squaresight::config::ModelConfig::default();
    if let Some(hidden) = args.hidden {
        model_config.hidden = hidden;
    }
    let mut model = MlpBuilder::new(model_config).build(dataset.shape())?;
    let data = squaresight::checkpoint::load_checkpoint(&args.checkpoint, model.as_mut())?;

    match evaluate_partition(model.as_mut(), &dataset.test, args.batch_size)? {
        Some((loss, accuracy)) => {
            info!(
                "Checkpoint from epoch {}: test loss {:.6}, test accuracy {:.3}",
                data.epoch, loss, accuracy
            );
        }
        None => info!("Dataset has an empty test partition; nothing to evaluate"),
    }
    Ok(())
}
