use std::path::PathBuf;

use anyhow::Result;
use candle_core::Device;
use clap::{Parser, Subcommand};
use serde::Serialize;

use molview_common::{BatchDataset, GraphDataset, ModelConfig};
use molview_core::model_stats;
use molview_train::{fit, test, Trainer, TrainerConfig};

#[derive(Parser, Debug)]
#[command(name = "molview", about = "Train and evaluate multi-view molecular graph models")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write the default model config.
    Init(InitArgs),
    /// Train a model on featurised graphs (JSONL).
    Train(TrainArgs),
    /// Evaluate a trained model directory on a labelled dataset.
    Test(TestArgs),
}

// ── Init ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct InitArgs {
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// Overwrite an existing file.
    #[arg(long)]
    force: bool,
}

// ── Train ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct TrainArgs {
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// JSONL file or directory of JSONL files.
    #[arg(long)]
    train_data: PathBuf,
    /// Without this, validation (and test) graphs are split off the training data.
    #[arg(long)]
    val_data: Option<PathBuf>,
    #[arg(long)]
    test_data: Option<PathBuf>,
    #[arg(long, default_value_t = 0.1)]
    val_fraction: f64,
    /// Only used when splitting and no --test-data is given.
    #[arg(long, default_value_t = 0.1)]
    test_fraction: f64,
    #[arg(long, default_value = "logs")]
    output_dir: PathBuf,
    #[arg(long, default_value_t = 1e-4)]
    lr: f64,
    #[arg(long, default_value_t = 0.0)]
    weight_decay: f64,
    #[arg(long, default_value_t = 0.8)]
    lr_factor: f64,
    #[arg(long, default_value_t = 10)]
    lr_patience: usize,
    #[arg(long, default_value_t = 1e-6)]
    lr_min: f64,
    #[arg(long, default_value_t = 0)]
    lr_warmup_steps: usize,
    #[arg(long, default_value_t = 32)]
    batch_size: usize,
    #[arg(long, default_value_t = 64)]
    inference_batch_size: usize,
    #[arg(long, default_value_t = 300)]
    max_epochs: usize,
    /// 0 = unlimited.
    #[arg(long, default_value_t = 0)]
    max_steps: usize,
    #[arg(long, default_value_t = 2)]
    num_sanity_val_steps: usize,
    /// Evaluate the test set every N epochs during training (0 = never).
    #[arg(long, default_value_t = 10)]
    test_interval: usize,
    /// 0 disables early stopping.
    #[arg(long, default_value_t = 30)]
    early_stopping_patience: usize,
    /// 0 disables gradient clipping.
    #[arg(long, default_value_t = 0.0)]
    grad_clip_max_norm: f64,
    #[arg(long, default_value_t = 1)]
    seed: u64,
    #[arg(long, default_value_t = 50)]
    log_every: usize,
    #[arg(long)]
    no_progress_bar: bool,
}

// ── Test ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct TestArgs {
    /// Directory holding config.json and model.safetensors.
    #[arg(long)]
    model_dir: PathBuf,
    #[arg(long)]
    data: PathBuf,
    /// Weights to load instead of <model-dir>/model.safetensors.
    #[arg(long)]
    checkpoint: Option<PathBuf>,
    #[arg(long, default_value_t = 64)]
    batch_size: usize,
}

#[derive(Serialize)]
struct TestReport {
    checkpoint: PathBuf,
    num_graphs: usize,
    test_loss: Option<f64>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Init(args) => cmd_init(args),
        Command::Train(args) => cmd_train(args),
        Command::Test(args) => cmd_test(args),
    }
}

// ── Command implementations ────────────────────────────────────────────────────

fn cmd_init(args: InitArgs) -> Result<()> {
    if args.config.exists() && !args.force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            args.config.display()
        );
    }
    let config = ModelConfig::default();
    config.save(&args.config)?;
    let stats = model_stats(&config);
    eprintln!(
        "Wrote default config to {} ({} parameters)",
        args.config.display(),
        stats.total_params
    );
    Ok(())
}

fn cmd_train(args: TrainArgs) -> Result<()> {
    let model_config = if args.config.exists() {
        ModelConfig::load(&args.config)?
    } else {
        let default = ModelConfig::default();
        default.save(&args.config)?;
        eprintln!("Created default config at {}", args.config.display());
        default
    };

    let train_all = GraphDataset::load(&args.train_data)?;
    train_all.validate(&model_config)?;

    let test_data = match &args.test_data {
        Some(p) => {
            let ds = GraphDataset::load(p)?;
            ds.validate(&model_config)?;
            Some(ds)
        }
        None => None,
    };

    let (train_ds, val_ds, test_ds) = match &args.val_data {
        Some(p) => {
            let val = GraphDataset::load(p)?;
            val.validate(&model_config)?;
            (train_all, val, test_data)
        }
        None => {
            let test_fraction = if test_data.is_some() {
                0.0
            } else {
                args.test_fraction
            };
            let (train, val, split_test) =
                train_all.split(args.val_fraction, test_fraction, args.seed)?;
            let test = test_data.or((!split_test.is_empty()).then_some(split_test));
            (train, val, test)
        }
    };
    tracing::info!(
        train = train_ds.len(),
        val = val_ds.len(),
        test = test_ds.as_ref().map_or(0, |t| t.len()),
        "Loaded graphs"
    );
    if train_ds.is_empty() {
        anyhow::bail!("no training graphs");
    }

    let trainer_config = TrainerConfig {
        lr: args.lr,
        weight_decay: args.weight_decay,
        lr_factor: args.lr_factor,
        lr_patience: args.lr_patience,
        lr_min: args.lr_min,
        lr_warmup_steps: args.lr_warmup_steps,
        batch_size: args.batch_size,
        inference_batch_size: args.inference_batch_size,
        max_epochs: args.max_epochs,
        max_steps: args.max_steps,
        num_sanity_val_steps: args.num_sanity_val_steps,
        test_interval: args.test_interval,
        early_stopping_patience: args.early_stopping_patience,
        grad_clip_max_norm: args.grad_clip_max_norm,
        seed: args.seed,
        output_dir: args.output_dir.clone(),
        progress_bar: !args.no_progress_bar,
        log_every: args.log_every,
    };

    let device = Device::cuda_if_available(0)?;
    let mut trainer = Trainer::new(model_config, trainer_config, device)?;
    trainer.save_hyperparameters()?;

    let test_ref = test_ds.as_ref().map(|t| t as &dyn BatchDataset);
    let summary = fit(&mut trainer, &train_ds, &val_ds, test_ref)?;
    tracing::info!(
        epochs = summary.epochs,
        steps = summary.global_step,
        best_val_loss = ?summary.best_val_loss,
        "Training done"
    );

    let best = args.output_dir.join("best.safetensors");
    if best.exists() {
        trainer.load_weights(&best)?;
    }
    let path = trainer.save_final()?;
    tracing::info!(path = %path.display(), "Saved final model");

    if let Some(test_ds) = &test_ds {
        let metrics = test(&mut trainer, test_ds)?;
        println!("{}", serde_json::to_string_pretty(&metrics)?);
    }
    Ok(())
}

fn cmd_test(args: TestArgs) -> Result<()> {
    let model_config = ModelConfig::load(&args.model_dir.join("config.json"))?;
    let checkpoint = args
        .checkpoint
        .unwrap_or_else(|| args.model_dir.join("model.safetensors"));

    let dataset = GraphDataset::load(&args.data)?;
    dataset.validate(&model_config)?;

    let trainer_config = TrainerConfig {
        inference_batch_size: args.batch_size,
        output_dir: args.model_dir.clone(),
        progress_bar: false,
        ..Default::default()
    };
    let device = Device::cuda_if_available(0)?;
    let mut trainer = Trainer::new(model_config, trainer_config, device)?;
    trainer.load_weights(&checkpoint)?;

    let metrics = test(&mut trainer, &dataset)?;
    let report = TestReport {
        checkpoint,
        num_graphs: dataset.len(),
        test_loss: metrics.test_loss,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
