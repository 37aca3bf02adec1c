//! Trainer: owns the model, the optimiser and the learning-rate schedules.
//!
//! The compute graph (forward + masked L1 loss) is kept apart from the
//! optimisation step (warmup, backward, gradient clipping, AdamW). The fit
//! loop in [`crate::fit`] calls these hooks in order:
//!
//! ```text
//! training_step → optimizer_step      (per train batch)
//! validation_step / test_step         (per eval batch)
//! on_validation_epoch_end             (per epoch: log, plateau, reset)
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context;
use candle_core::{backprop::GradStore, DType, Device, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};

use molview_common::{BatchTensors, ModelConfig};
use molview_core::{model_stats, num_parameters, MultiViewRepresentation};

use crate::losses::{l1_loss, masked_select, LossBook, Stage};
use crate::metrics::{EpochMetrics, MetricsLogger, TestMetrics};
use crate::scheduler::{LinearWarmup, PlateauMode, ReduceLrOnPlateau};

// ── Config ──────────────────────────────────────────────────────────────────

/// All training hyper-parameters (CLI-level knobs).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub lr: f64,
    pub weight_decay: f64,
    /// Plateau multiplier applied to the learning rate.
    pub lr_factor: f64,
    /// Epochs without `val_loss` improvement before the plateau reduction.
    pub lr_patience: usize,
    pub lr_min: f64,
    pub lr_warmup_steps: usize,
    pub batch_size: usize,
    /// Batch size for validation and test.
    pub inference_batch_size: usize,
    pub max_epochs: usize,
    /// Stop after this many optimiser steps (0 = unlimited).
    pub max_steps: usize,
    pub num_sanity_val_steps: usize,
    /// Run the test set every `test_interval` epochs during fit (0 = never).
    pub test_interval: usize,
    /// Epochs without `val_loss` improvement before stopping (0 = disabled).
    pub early_stopping_patience: usize,
    /// Global L2 gradient clip (0 = disabled).
    pub grad_clip_max_norm: f64,
    pub seed: u64,
    pub output_dir: PathBuf,
    pub progress_bar: bool,
    pub log_every: usize,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            lr: 1e-4,
            weight_decay: 0.0,
            lr_factor: 0.8,
            lr_patience: 10,
            lr_min: 1e-6,
            lr_warmup_steps: 0,
            batch_size: 32,
            inference_batch_size: 64,
            max_epochs: 300,
            max_steps: 0,
            num_sanity_val_steps: 2,
            test_interval: 10,
            early_stopping_patience: 30,
            grad_clip_max_norm: 0.0,
            seed: 1,
            output_dir: PathBuf::from("logs"),
            progress_bar: true,
            log_every: 50,
        }
    }
}

/// Metrics returned after each optimiser step.
#[derive(Debug, Clone)]
pub struct StepMetrics {
    pub step: usize,
    pub loss: f32,
    pub lr: f64,
    /// Pre-clip global gradient norm, when clipping is enabled.
    pub grad_norm: Option<f64>,
}

#[derive(Serialize)]
struct Hyperparameters<'a> {
    model: &'a ModelConfig,
    trainer: &'a TrainerConfig,
}

// ── Trainer ─────────────────────────────────────────────────────────────────

/// The training engine. Owns the model, optimiser, schedules and loss book.
pub struct Trainer {
    pub model: MultiViewRepresentation,
    pub varmap: VarMap,
    vars: Vec<Var>,
    optimizer: AdamW,
    plateau: ReduceLrOnPlateau,
    warmup: LinearWarmup,
    losses: LossBook,
    pub config: TrainerConfig,
    model_config: ModelConfig,
    pub global_step: usize,
    pub current_epoch: usize,
    pub sanity_checking: bool,
    metrics_logger: Option<MetricsLogger>,
    device: Device,
}

impl Trainer {
    /// Build the model, AdamW and the plateau scheduler (monitoring
    /// `val_loss`, mode `min`).
    pub fn new(
        model_config: ModelConfig,
        trainer_config: TrainerConfig,
        device: Device,
    ) -> anyhow::Result<Self> {
        model_config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = MultiViewRepresentation::new(vb, &model_config)?;
        let vars = trainable_vars(&varmap)?;

        let stats = model_stats(&model_config);
        tracing::info!(
            total_params = stats.total_params,
            encoder_params = stats.encoder_params,
            conv_params = stats.conv_params,
            readout_params = stats.readout_params,
            trainable = num_parameters(&varmap)?,
            "Model stats"
        );

        let optimizer = AdamW::new(
            vars.clone(),
            ParamsAdamW {
                lr: trainer_config.lr,
                weight_decay: trainer_config.weight_decay,
                ..Default::default()
            },
        )?;
        let plateau = ReduceLrOnPlateau::new(
            PlateauMode::Min,
            trainer_config.lr_factor,
            trainer_config.lr_patience,
            trainer_config.lr_min,
        )?;
        let warmup = LinearWarmup::new(trainer_config.lr, trainer_config.lr_warmup_steps);

        Ok(Self {
            model,
            varmap,
            vars,
            optimizer,
            plateau,
            warmup,
            losses: LossBook::default(),
            config: trainer_config,
            model_config,
            global_step: 0,
            current_epoch: 0,
            sanity_checking: false,
            metrics_logger: None,
            device,
        })
    }

    pub fn forward(&self, batch: &BatchTensors, train: bool) -> anyhow::Result<Tensor> {
        Ok(self.model.forward_t(batch, train)?)
    }

    pub fn training_step(&mut self, batch: &BatchTensors) -> anyhow::Result<Option<Tensor>> {
        self.step(batch, Stage::Train)
    }

    pub fn validation_step(&mut self, batch: &BatchTensors) -> anyhow::Result<Option<Tensor>> {
        self.step(batch, Stage::Val)
    }

    pub fn test_step(&mut self, batch: &BatchTensors) -> anyhow::Result<Option<Tensor>> {
        self.step(batch, Stage::Test)
    }

    /// Masked L1 loss of one batch, recorded under `stage`.
    ///
    /// Only [`Stage::Train`] runs the model in training mode; eval losses are
    /// detached. Returns `None` (and records nothing) when the batch carries
    /// no labelled target.
    pub fn step(&mut self, batch: &BatchTensors, stage: Stage) -> anyhow::Result<Option<Tensor>> {
        if batch.num_labelled == 0 {
            tracing::debug!(%stage, graphs = batch.num_graphs, "skipping batch without labels");
            return Ok(None);
        }
        let train = stage.is_train();
        let mut pred = self.forward(batch, train)?;
        if !train {
            pred = pred.detach();
        }
        let pred = masked_select(&pred, &batch.mask)?;
        let target = masked_select(&batch.label, &batch.mask)?;
        let loss = l1_loss(&pred, &target)?;
        self.losses.record(stage, loss.to_scalar::<f32>()?);
        Ok(Some(loss))
    }

    /// Warmup, backward, optional clipping, AdamW.
    pub fn optimizer_step(&mut self, loss: &Tensor) -> anyhow::Result<StepMetrics> {
        if let Some(lr) = self.warmup.lr_at(self.global_step) {
            self.optimizer.set_learning_rate(lr);
        }

        let mut grads = loss.backward()?;
        let grad_norm = if self.config.grad_clip_max_norm > 0.0 {
            Some(clip_grad_norm(
                &mut grads,
                &self.vars,
                self.config.grad_clip_max_norm,
            )?)
        } else {
            None
        };
        self.optimizer.step(&grads)?;

        let step = self.global_step;
        self.global_step += 1;
        Ok(StepMetrics {
            step,
            loss: loss.to_scalar::<f32>()?,
            lr: self.optimizer.learning_rate(),
            grad_norm,
        })
    }

    pub fn lr(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    /// Log epoch means, step the plateau scheduler on `val_loss` and reset
    /// the loss book. While sanity checking only the reset happens.
    pub fn on_validation_epoch_end(&mut self) -> anyhow::Result<Option<EpochMetrics>> {
        if self.sanity_checking {
            self.losses.reset();
            return Ok(None);
        }

        let lr = self.optimizer.learning_rate();
        let metrics = EpochMetrics {
            epoch: self.current_epoch,
            lr,
            train_loss: self.losses.mean(Stage::Train),
            val_loss: self.losses.mean(Stage::Val),
            test_loss: self.losses.mean(Stage::Test),
        };
        match self.metrics_logger.as_mut() {
            Some(logger) => logger.log_epoch(&metrics)?,
            None => tracing::info!(
                epoch = metrics.epoch,
                lr,
                train_loss = ?metrics.train_loss,
                val_loss = ?metrics.val_loss,
                test_loss = ?metrics.test_loss,
                "epoch"
            ),
        }

        match metrics.val_loss {
            Some(val_loss) => {
                let new_lr = self.plateau.step(val_loss, lr);
                if new_lr < lr {
                    tracing::info!(epoch = self.current_epoch, from = lr, to = new_lr, "reducing learning rate");
                    self.optimizer.set_learning_rate(new_lr);
                }
            }
            None => tracing::warn!(epoch = self.current_epoch, "no val_loss; plateau scheduler not stepped"),
        }

        self.losses.reset();
        Ok(Some(metrics))
    }

    pub fn on_test_epoch_end(&mut self) -> TestMetrics {
        let metrics = TestMetrics {
            test_loss: self.losses.mean(Stage::Test),
        };
        match self.metrics_logger.as_mut() {
            Some(logger) => logger.log_test(&metrics),
            None => tracing::info!(test_loss = ?metrics.test_loss, "test"),
        }
        self.losses.reset();
        metrics
    }

    pub fn losses(&self) -> &LossBook {
        &self.losses
    }

    pub fn set_metrics_logger(&mut self, logger: MetricsLogger) {
        self.metrics_logger = Some(logger);
    }

    pub fn model_config(&self) -> &ModelConfig {
        &self.model_config
    }

    // ── Persistence ─────────────────────────────────────────────────────────

    /// Write `hparams.json` (model + trainer config) to the output dir.
    pub fn save_hyperparameters(&self) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(&self.config.output_dir)?;
        let path = self.config.output_dir.join("hparams.json");
        let hparams = Hyperparameters {
            model: &self.model_config,
            trainer: &self.config,
        };
        std::fs::write(&path, serde_json::to_string_pretty(&hparams)?)
            .with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }

    /// Save `<name>.safetensors` plus `config.json`.
    pub fn save_checkpoint(&self, name: &str) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(&self.config.output_dir)?;
        let path = self.config.output_dir.join(format!("{name}.safetensors"));
        self.varmap.save(&path)?;
        self.model_config
            .save(&self.config.output_dir.join("config.json"))?;
        Ok(path)
    }

    /// Save final model.
    pub fn save_final(&self) -> anyhow::Result<PathBuf> {
        self.save_checkpoint("model")
    }

    /// Overwrite all weights (and batch-norm statistics) from safetensors.
    pub fn load_weights(&mut self, path: &Path) -> anyhow::Result<()> {
        self.varmap
            .load(path)
            .with_context(|| format!("load weights from {}", path.display()))?;
        tracing::info!(path = %path.display(), "loaded weights");
        Ok(())
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

// ── Gradient utilities ──────────────────────────────────────────────────────

/// Every variable except batch-norm running statistics, in name order.
fn trainable_vars(varmap: &VarMap) -> anyhow::Result<Vec<Var>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| anyhow::anyhow!("variable map lock poisoned"))?;
    let mut named: Vec<(&String, &Var)> = data
        .iter()
        .filter(|(name, _)| !name.contains("running_"))
        .collect();
    named.sort_by(|a, b| a.0.cmp(b.0));
    Ok(named.into_iter().map(|(_, var)| var.clone()).collect())
}

/// Total L2 norm of gradients.
fn grad_norm(grads: &GradStore, vars: &[Var]) -> anyhow::Result<f64> {
    let mut total = 0.0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            total += g.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
    }
    Ok(total.sqrt())
}

/// Clip gradients so their global L2 norm ≤ `max_norm`. Returns the norm
/// before clipping.
fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> anyhow::Result<f64> {
    let norm = grad_norm(grads, vars)?;
    if norm <= max_norm {
        return Ok(norm);
    }
    let scale = max_norm / (norm + 1e-6);
    for var in vars {
        if let Some(g) = grads.remove(var.as_tensor()) {
            let clipped = g.affine(scale, 0.0)?;
            grads.insert(var.as_tensor(), clipped);
        }
    }
    Ok(norm)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use molview_common::{GraphBatch, GraphSample};

    fn model_config() -> ModelConfig {
        ModelConfig {
            embed_dim: 8,
            num_layers: 2,
            num_tasks: 1,
            atom_feature_dims: vec![4, 2],
            bond_feature_dims: vec![3],
            dropout: 0.0,
            ..Default::default()
        }
    }

    fn trainer_config(dir: &Path) -> TrainerConfig {
        TrainerConfig {
            lr: 1e-2,
            output_dir: dir.to_path_buf(),
            progress_bar: false,
            ..Default::default()
        }
    }

    fn chain(len: usize, label: Option<f32>) -> GraphSample {
        let atom_features = (0..len).map(|i| vec![(i % 4) as u32, (i % 2) as u32]).collect();
        let mut edge_index = Vec::new();
        let mut edge_features = Vec::new();
        for i in 1..len as u32 {
            edge_index.push([i - 1, i]);
            edge_index.push([i, i - 1]);
            edge_features.push(vec![i % 3]);
            edge_features.push(vec![i % 3]);
        }
        GraphSample {
            atom_features,
            edge_index,
            edge_features,
            labels: vec![label],
        }
    }

    fn batch(samples: &[GraphSample]) -> BatchTensors {
        let refs: Vec<&GraphSample> = samples.iter().collect();
        GraphBatch::collate(&refs)
            .unwrap()
            .to_tensors(&Device::Cpu)
            .unwrap()
    }

    fn labelled_batch() -> BatchTensors {
        batch(&[
            chain(2, Some(3.0)),
            chain(3, Some(4.5)),
            chain(4, Some(6.0)),
            chain(5, None),
        ])
    }

    #[test]
    fn optimizer_excludes_running_stats() {
        let dir = tempfile::tempdir().unwrap();
        let t = Trainer::new(model_config(), trainer_config(dir.path()), Device::Cpu).unwrap();
        let trainable: usize = t.vars.iter().map(|v| v.elem_count()).sum();
        assert_eq!(trainable, model_stats(&model_config()).total_params);
    }

    #[test]
    fn step_records_per_stage() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = Trainer::new(model_config(), trainer_config(dir.path()), Device::Cpu).unwrap();
        let b = labelled_batch();

        let loss = t.training_step(&b).unwrap().unwrap();
        assert!(loss.to_scalar::<f32>().unwrap() > 0.0);
        t.validation_step(&b).unwrap();
        t.validation_step(&b).unwrap();
        t.test_step(&b).unwrap();
        assert_eq!(t.losses().len(Stage::Train), 1);
        assert_eq!(t.losses().len(Stage::Val), 2);
        assert_eq!(t.losses().len(Stage::Test), 1);

        // Eval losses are deterministic.
        let val = t.losses().losses(Stage::Val);
        assert!((val[0] - val[1]).abs() < 1e-6);
    }

    #[test]
    fn unlabelled_batch_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = Trainer::new(model_config(), trainer_config(dir.path()), Device::Cpu).unwrap();
        let b = batch(&[chain(3, None), chain(2, None)]);
        assert!(t.training_step(&b).unwrap().is_none());
        assert_eq!(t.losses().len(Stage::Train), 0);
    }

    #[test]
    fn warmup_scales_learning_rate() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = TrainerConfig {
            lr_warmup_steps: 4,
            ..trainer_config(dir.path())
        };
        let mut t = Trainer::new(model_config(), cfg, Device::Cpu).unwrap();
        let b = labelled_batch();
        let expected = [0.25e-2, 0.5e-2, 0.75e-2, 1e-2, 1e-2];
        for (i, want) in expected.iter().enumerate() {
            let loss = t.training_step(&b).unwrap().unwrap();
            let m = t.optimizer_step(&loss).unwrap();
            assert_eq!(m.step, i);
            assert!((m.lr - want).abs() < 1e-12, "step {i}: {} != {want}", m.lr);
        }
        assert_eq!(t.global_step, 5);
    }

    #[test]
    fn training_reduces_loss() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = TrainerConfig {
            lr: 3e-2,
            ..trainer_config(dir.path())
        };
        let mut t = Trainer::new(model_config(), cfg, Device::Cpu).unwrap();
        let b = labelled_batch();
        let mut first = None;
        let mut last = 0.0;
        for _ in 0..100 {
            let loss = t.training_step(&b).unwrap().unwrap();
            let m = t.optimizer_step(&loss).unwrap();
            first.get_or_insert(m.loss);
            last = m.loss;
        }
        let first = first.unwrap();
        assert!(last < 0.5 * first, "loss {first} → {last}");
    }

    #[test]
    fn gradient_clipping_reports_norm() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = TrainerConfig {
            grad_clip_max_norm: 1e-3,
            ..trainer_config(dir.path())
        };
        let mut t = Trainer::new(model_config(), cfg, Device::Cpu).unwrap();
        let loss = t.training_step(&labelled_batch()).unwrap().unwrap();
        let m = t.optimizer_step(&loss).unwrap();
        assert!(m.grad_norm.unwrap() > 1e-3);
    }

    #[test]
    fn clip_bounds_global_norm() {
        let dev = Device::Cpu;
        let a = Var::new(&[1f32, 2.], &dev).unwrap();
        let b = Var::new(&[3f32], &dev).unwrap();
        let loss = ((a.as_tensor().sqr().unwrap().sum_all().unwrap() * 0.5).unwrap()
            + (b.as_tensor() * 2.0).unwrap().sum_all().unwrap())
        .unwrap();
        let vars = vec![a, b];
        let mut grads = loss.backward().unwrap();
        // grads: a → [1, 2], b → [2]; norm 3.
        let before = clip_grad_norm(&mut grads, &vars, 1.0).unwrap();
        assert!((before - 3.0).abs() < 1e-6);
        let after = grad_norm(&grads, &vars).unwrap();
        assert!((after - 1.0).abs() < 1e-4);
    }

    #[test]
    fn epoch_end_logs_steps_plateau_and_resets() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = TrainerConfig {
            lr_factor: 0.5,
            lr_patience: 0,
            ..trainer_config(dir.path())
        };
        let mut t = Trainer::new(model_config(), cfg, Device::Cpu).unwrap();

        // Sanity check: nothing logged, losses dropped.
        t.sanity_checking = true;
        t.losses.record(Stage::Val, 9.0);
        assert!(t.on_validation_epoch_end().unwrap().is_none());
        assert_eq!(t.losses().len(Stage::Val), 0);
        t.sanity_checking = false;

        t.losses.record(Stage::Train, 2.0);
        t.losses.record(Stage::Val, 1.0);
        t.losses.record(Stage::Val, 3.0);
        let m = t.on_validation_epoch_end().unwrap().unwrap();
        assert_eq!(m.train_loss, Some(2.0));
        assert_eq!(m.val_loss, Some(2.0));
        assert_eq!(m.test_loss, None);
        assert_eq!(m.lr, 1e-2);
        assert_eq!(t.losses().len(Stage::Train), 0);

        // No improvement with patience 0: lr halves after logging.
        t.current_epoch = 1;
        t.losses.record(Stage::Val, 2.0);
        t.losses.record(Stage::Test, 0.5);
        let m = t.on_validation_epoch_end().unwrap().unwrap();
        assert_eq!(m.epoch, 1);
        assert_eq!(m.lr, 1e-2);
        assert_eq!(m.test_loss, Some(0.5));
        assert!((t.lr() - 5e-3).abs() < 1e-12);
    }

    #[test]
    fn test_epoch_end_resets() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = Trainer::new(model_config(), trainer_config(dir.path()), Device::Cpu).unwrap();
        assert_eq!(t.on_test_epoch_end().test_loss, None);
        t.losses.record(Stage::Test, 1.0);
        t.losses.record(Stage::Test, 2.0);
        assert_eq!(t.on_test_epoch_end().test_loss, Some(1.5));
        assert_eq!(t.losses().len(Stage::Test), 0);
    }

    #[test]
    fn checkpoint_roundtrip_and_hparams() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = Trainer::new(model_config(), trainer_config(dir.path()), Device::Cpu).unwrap();
        let b = labelled_batch();
        for _ in 0..3 {
            let loss = a.training_step(&b).unwrap().unwrap();
            a.optimizer_step(&loss).unwrap();
        }
        let path = a.save_checkpoint("best").unwrap();
        assert!(dir.path().join("config.json").exists());

        let hparams = a.save_hyperparameters().unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(hparams).unwrap()).unwrap();
        assert_eq!(json["model"]["embed_dim"], 8);
        assert_eq!(json["trainer"]["lr"], 1e-2);

        let mut restored =
            Trainer::new(model_config(), trainer_config(dir.path()), Device::Cpu).unwrap();
        restored.load_weights(&path).unwrap();
        let pa: Vec<Vec<f32>> = a.forward(&b, false).unwrap().to_vec2().unwrap();
        let pb: Vec<Vec<f32>> = restored.forward(&b, false).unwrap().to_vec2().unwrap();
        for (x, y) in pa.iter().flatten().zip(pb.iter().flatten()) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn config_defaults_from_empty_json() {
        let cfg: TrainerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, TrainerConfig::default());
        assert_eq!(cfg.num_sanity_val_steps, 2);
    }
}
