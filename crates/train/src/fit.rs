//! Epoch loop driving a [`Trainer`]: sanity check, train, validate,
//! periodic test, checkpointing and early stopping.

use indicatif::{ProgressBar, ProgressStyle};
use rand::{rngs::StdRng, SeedableRng};

use molview_common::BatchDataset;

use crate::losses::Stage;
use crate::metrics::{EpochMetrics, MetricsLogger, TestMetrics};
use crate::trainer::Trainer;

/// Outcome of [`fit`].
#[derive(Debug, Clone)]
pub struct FitSummary {
    /// Epochs actually run.
    pub epochs: usize,
    pub global_step: usize,
    pub best_val_loss: Option<f64>,
    pub history: Vec<EpochMetrics>,
}

/// Train until `max_epochs`, `max_steps` or early stopping.
///
/// Writes `metrics.csv`, `last.safetensors` every epoch and
/// `best.safetensors` whenever `val_loss` improves.
pub fn fit(
    trainer: &mut Trainer,
    train: &dyn BatchDataset,
    val: &dyn BatchDataset,
    test: Option<&dyn BatchDataset>,
) -> anyhow::Result<FitSummary> {
    let cfg = trainer.config.clone();
    std::fs::create_dir_all(&cfg.output_dir)?;
    trainer.set_metrics_logger(MetricsLogger::create(&cfg.output_dir.join("metrics.csv"))?);

    tracing::info!(
        train = train.num_graphs(),
        val = val.num_graphs(),
        test = test.map(|t| t.num_graphs()).unwrap_or(0),
        "Starting fit"
    );

    // Sanity check
    if cfg.num_sanity_val_steps > 0 {
        trainer.sanity_checking = true;
        evaluate(trainer, val, Stage::Val, Some(cfg.num_sanity_val_steps))?;
        trainer.on_validation_epoch_end()?;
        trainer.sanity_checking = false;
    }

    let pb = if cfg.progress_bar {
        ProgressBar::new(cfg.max_epochs as u64)
    } else {
        ProgressBar::hidden()
    };
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} epochs {msg}")?
            .progress_chars("=>-"),
    );

    let mut history = Vec::new();
    let mut best_val_loss: Option<f64> = None;
    let mut bad_epochs = 0usize;
    let mut epochs = 0usize;

    for epoch in 0..cfg.max_epochs {
        trainer.current_epoch = epoch;
        epochs = epoch + 1;

        let mut rng = StdRng::seed_from_u64(cfg.seed.wrapping_add(epoch as u64));
        let mut hit_max_steps = false;
        for batch in train.shuffled_batches(cfg.batch_size, &mut rng) {
            let batch = batch?.to_tensors(trainer.device())?;
            let Some(loss) = trainer.training_step(&batch)? else {
                continue;
            };
            let m = trainer.optimizer_step(&loss)?;
            if cfg.log_every > 0 && m.step % cfg.log_every == 0 {
                tracing::info!(
                    step = m.step,
                    epoch,
                    loss = m.loss,
                    lr = m.lr,
                    grad_norm = ?m.grad_norm,
                    "train"
                );
            }
            if cfg.max_steps > 0 && trainer.global_step >= cfg.max_steps {
                hit_max_steps = true;
                break;
            }
        }

        evaluate(trainer, val, Stage::Val, None)?;
        if let Some(test) = test {
            if cfg.test_interval > 0 && (epoch + 1) % cfg.test_interval == 0 {
                evaluate(trainer, test, Stage::Test, None)?;
            }
        }

        let Some(metrics) = trainer.on_validation_epoch_end()? else {
            continue;
        };
        trainer.save_checkpoint("last")?;

        let improved = match (metrics.val_loss, best_val_loss) {
            (Some(v), Some(best)) => v < best,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if improved {
            best_val_loss = metrics.val_loss;
            bad_epochs = 0;
            let path = trainer.save_checkpoint("best")?;
            tracing::debug!(epoch, path = %path.display(), "new best checkpoint");
        } else {
            bad_epochs += 1;
        }

        if let Some(v) = metrics.val_loss {
            pb.set_message(format!("val_loss {v:.4}"));
        }
        pb.inc(1);
        history.push(metrics);

        if cfg.early_stopping_patience > 0 && bad_epochs >= cfg.early_stopping_patience {
            tracing::info!(epoch, bad_epochs, "Early stopping");
            break;
        }
        if hit_max_steps {
            tracing::info!(step = trainer.global_step, "Reached max_steps");
            break;
        }
    }
    pb.finish_with_message("done");

    Ok(FitSummary {
        epochs,
        global_step: trainer.global_step,
        best_val_loss,
        history,
    })
}

/// Run eval steps for `stage` over `dataset`, optionally limited to the
/// first `max_batches` batches. Returns the number of batches seen.
pub fn evaluate(
    trainer: &mut Trainer,
    dataset: &dyn BatchDataset,
    stage: Stage,
    max_batches: Option<usize>,
) -> anyhow::Result<usize> {
    if stage.is_train() {
        anyhow::bail!("evaluate runs val or test stages only");
    }
    let limit = max_batches.unwrap_or(usize::MAX);
    let batch_size = trainer.config.inference_batch_size;
    let mut seen = 0usize;
    for batch in dataset.batches(batch_size).take(limit) {
        let batch = batch?.to_tensors(trainer.device())?;
        trainer.step(&batch, stage)?;
        seen += 1;
    }
    Ok(seen)
}

/// Run the test stage over `dataset` and close the test epoch.
pub fn test(trainer: &mut Trainer, dataset: &dyn BatchDataset) -> anyhow::Result<TestMetrics> {
    evaluate(trainer, dataset, Stage::Test, None)?;
    Ok(trainer.on_test_epoch_end())
}
