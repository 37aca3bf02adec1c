//! Multi-layer perceptron with batch norm, GELU and dropout.
//!
//! Layer layout for `channels = [c0, c1, ..., ck]`:
//!
//! ```text
//! hidden i: Linear(c_i, c_i+1) → BatchNorm → GELU → Dropout
//! last:     Linear(c_k-1, c_k)
//! ```
//!
//! The last layer is "plain" (no norm, activation or dropout) so the MLP can
//! end a network or feed a residual.

use candle_core::{Result, Tensor};
use candle_nn::{batch_norm, linear, BatchNorm, BatchNormConfig, Dropout, Linear, Module, ModuleT, VarBuilder};

pub struct Mlp {
    lins: Vec<Linear>,
    norms: Vec<BatchNorm>,
    dropout: Dropout,
}

impl Mlp {
    /// Build from a channel list with at least two entries.
    pub fn new(channels: &[usize], dropout: f64, norm_eps: f64, vb: VarBuilder) -> Result<Self> {
        if channels.len() < 2 {
            candle_core::bail!("MLP needs at least two channels, got {channels:?}");
        }
        let num_lins = channels.len() - 1;
        let mut lins = Vec::with_capacity(num_lins);
        let mut norms = Vec::with_capacity(num_lins - 1);
        for (i, pair) in channels.windows(2).enumerate() {
            lins.push(linear(pair[0], pair[1], vb.pp(format!("lins.{i}")))?);
            if i + 1 < num_lins {
                let cfg = BatchNormConfig {
                    eps: norm_eps,
                    ..Default::default()
                };
                norms.push(batch_norm(pair[1], cfg, vb.pp(format!("norms.{i}")))?);
            }
        }
        Ok(Self {
            lins,
            norms,
            dropout: Dropout::new(dropout as f32),
        })
    }

    pub fn in_channels(&self) -> Result<usize> {
        self.lins[0].weight().dim(1)
    }

    pub fn out_channels(&self) -> Result<usize> {
        self.lins[self.lins.len() - 1].weight().dim(0)
    }
}

impl ModuleT for Mlp {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        // Batch statistics of a single row are undefined; such batches fall
        // back to the running statistics.
        let batch_stats = train && xs.dim(0)? > 1;
        let mut x = xs.clone();
        for (lin, norm) in self.lins.iter().zip(&self.norms) {
            x = lin.forward(&x)?;
            x = norm.forward_t(&x, batch_stats)?;
            x = x.gelu_erf()?;
            x = self.dropout.forward_t(&x, train)?;
        }
        self.lins[self.lins.len() - 1].forward(&x)
    }
}
