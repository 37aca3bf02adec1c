//! # molview-train: The Training Harness
//!
//! Optimisation and bookkeeping around the multi-view model:
//!
//! * **[`Trainer`]**: owns model + AdamW + schedules. Exposes the step hooks
//!   (`training_step`, `optimizer_step`, `on_validation_epoch_end`, ...).
//! * **[`fit()`]**: the epoch loop (sanity check, train, validate, periodic
//!   test, checkpoints, early stopping).
//! * **[`LinearWarmup`]** / **[`ReduceLrOnPlateau`]**: learning-rate
//!   schedules.
//! * **[`LossBook`]**: per-stage loss lists, reset every epoch.
//! * **[`MetricsLogger`]**: `metrics.csv` plus `tracing` output.

pub mod fit;
pub mod losses;
pub mod metrics;
pub mod scheduler;
pub mod trainer;

pub use fit::{evaluate, fit, test, FitSummary};
pub use losses::{l1_loss, masked_select, LossBook, Stage};
pub use metrics::{EpochMetrics, MetricsLogger, TestMetrics};
pub use scheduler::{LinearWarmup, PlateauMode, ReduceLrOnPlateau, ThresholdMode};
pub use trainer::{StepMetrics, Trainer, TrainerConfig};
