//! Learning rate schedules: linear warmup and reduce-on-plateau.
//!
//! Warmup is driven by the optimiser step counter; the plateau schedule is
//! driven once per epoch by the monitored validation loss. Both write into
//! the same optimiser learning rate, warmup taking precedence while active.

use serde::{Deserialize, Serialize};

// ── Warmup ──────────────────────────────────────────────────────────────────

/// Linear ramp from `base_lr / warmup_steps` to `base_lr`.
#[derive(Debug, Clone, Copy)]
pub struct LinearWarmup {
    base_lr: f64,
    warmup_steps: usize,
}

impl LinearWarmup {
    pub fn new(base_lr: f64, warmup_steps: usize) -> Self {
        Self {
            base_lr,
            warmup_steps,
        }
    }

    /// Learning rate to apply before optimiser step `step`, or `None` once
    /// warmup is over (or disabled with `warmup_steps == 0`).
    pub fn lr_at(&self, step: usize) -> Option<f64> {
        if step >= self.warmup_steps {
            return None;
        }
        let scale = ((step as f64 + 1.0) / self.warmup_steps as f64).min(1.0);
        Some(scale * self.base_lr)
    }
}

// ── Reduce on plateau ───────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlateauMode {
    /// Lower metric is better.
    #[default]
    Min,
    Max,
}

/// How `threshold` defines a significant improvement.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdMode {
    /// Relative to the best value: `best · (1 ∓ threshold)`.
    #[default]
    Rel,
    /// Absolute offset: `best ∓ threshold`.
    Abs,
}

/// Multiply the learning rate by `factor` once the metric has not improved
/// for more than `patience` epochs.
#[derive(Debug, Clone)]
pub struct ReduceLrOnPlateau {
    mode: PlateauMode,
    factor: f64,
    patience: usize,
    threshold: f64,
    threshold_mode: ThresholdMode,
    cooldown: usize,
    min_lr: f64,
    eps: f64,
    best: f64,
    num_bad_epochs: usize,
    cooldown_counter: usize,
}

impl ReduceLrOnPlateau {
    /// Defaults: `threshold = 1e-4` (relative), `cooldown = 0`, `eps = 1e-8`.
    pub fn new(
        mode: PlateauMode,
        factor: f64,
        patience: usize,
        min_lr: f64,
    ) -> anyhow::Result<Self> {
        if !(factor < 1.0) {
            anyhow::bail!("plateau factor should be < 1.0, got {factor}");
        }
        let best = match mode {
            PlateauMode::Min => f64::INFINITY,
            PlateauMode::Max => f64::NEG_INFINITY,
        };
        Ok(Self {
            mode,
            factor,
            patience,
            threshold: 1e-4,
            threshold_mode: ThresholdMode::Rel,
            cooldown: 0,
            min_lr,
            eps: 1e-8,
            best,
            num_bad_epochs: 0,
            cooldown_counter: 0,
        })
    }

    pub fn with_threshold(mut self, threshold: f64, threshold_mode: ThresholdMode) -> Self {
        self.threshold = threshold;
        self.threshold_mode = threshold_mode;
        self
    }

    pub fn with_cooldown(mut self, cooldown: usize) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }

    /// Feed one epoch's metric; returns the learning rate to use next.
    ///
    /// A NaN metric never counts as an improvement.
    pub fn step(&mut self, metric: f64, current_lr: f64) -> f64 {
        if self.is_better(metric) {
            self.best = metric;
            self.num_bad_epochs = 0;
        } else {
            self.num_bad_epochs += 1;
        }

        if self.cooldown_counter > 0 {
            self.cooldown_counter -= 1;
            self.num_bad_epochs = 0;
        }

        if self.num_bad_epochs > self.patience {
            self.cooldown_counter = self.cooldown;
            self.num_bad_epochs = 0;
            let new_lr = (current_lr * self.factor).max(self.min_lr);
            if current_lr - new_lr > self.eps {
                return new_lr;
            }
        }
        current_lr
    }

    fn is_better(&self, metric: f64) -> bool {
        match (self.mode, self.threshold_mode) {
            (PlateauMode::Min, ThresholdMode::Rel) => metric < self.best * (1.0 - self.threshold),
            (PlateauMode::Min, ThresholdMode::Abs) => metric < self.best - self.threshold,
            (PlateauMode::Max, ThresholdMode::Rel) => metric > self.best * (1.0 + self.threshold),
            (PlateauMode::Max, ThresholdMode::Abs) => metric > self.best + self.threshold,
        }
    }

    pub fn best(&self) -> f64 {
        self.best
    }

    pub fn num_bad_epochs(&self) -> usize {
        self.num_bad_epochs
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
