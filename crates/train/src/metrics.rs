//! Epoch metrics and the `metrics.csv` writer.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Serialize;

/// What the trainer logs at the end of every validation epoch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    /// Learning rate in effect during the epoch (before the plateau step).
    pub lr: f64,
    pub train_loss: Option<f64>,
    pub val_loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_loss: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestMetrics {
    pub test_loss: Option<f64>,
}

pub const CSV_HEADER: &str = "epoch,lr,train_loss,val_loss,test_loss";

/// Appends one CSV row per epoch and mirrors it to `tracing`.
pub struct MetricsLogger {
    path: PathBuf,
    out: BufWriter<File>,
}

impl MetricsLogger {
    /// Create (truncating) the CSV file and write its header.
    pub fn create(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
        let mut out = BufWriter::new(file);
        writeln!(out, "{CSV_HEADER}")?;
        out.flush()?;
        Ok(Self {
            path: path.to_path_buf(),
            out,
        })
    }

    pub fn log_epoch(&mut self, m: &EpochMetrics) -> anyhow::Result<()> {
        tracing::info!(
            epoch = m.epoch,
            lr = m.lr,
            train_loss = ?m.train_loss,
            val_loss = ?m.val_loss,
            test_loss = ?m.test_loss,
            "epoch"
        );
        writeln!(
            self.out,
            "{},{},{},{},{}",
            m.epoch,
            m.lr,
            cell(m.train_loss),
            cell(m.val_loss),
            cell(m.test_loss)
        )?;
        self.out.flush()?;
        Ok(())
    }

    pub fn log_test(&mut self, m: &TestMetrics) {
        tracing::info!(test_loss = ?m.test_loss, "test");
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn cell(v: Option<f64>) -> String {
    v.map(|x| x.to_string()).unwrap_or_default()
}
