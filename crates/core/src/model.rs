//! Multi-view graph representation model.
//!
//! Two views of each molecule are computed from shared atom embeddings `h0`:
//!
//! * **graph view**: a residual stack of [`GineConv`] layers, pooled per graph;
//! * **composition view**: `h0` pooled per graph (a bag of atoms), refined
//!   by an MLP.
//!
//! The views are concatenated and a prediction head maps them to one value
//! per task.

use candle_core::{Result, Tensor};
use candle_nn::{Dropout, Module, ModuleT, VarBuilder, VarMap};

use molview_common::{BatchTensors, BondEncoding, ModelConfig, Pooling};

use crate::encoder::CategoricalEncoder;
use crate::gnn::GineConv;
use crate::mlp::Mlp;
use crate::pool::{global_add_pool, global_mean_pool};

pub struct MultiViewRepresentation {
    atom_encoder: CategoricalEncoder,
    convs: Vec<GineConv>,
    composition: Mlp,
    head: Mlp,
    dropout: Dropout,
    config: ModelConfig,
}

impl MultiViewRepresentation {
    pub fn new(vb: VarBuilder, config: &ModelConfig) -> Result<Self> {
        let d = config.embed_dim;
        let atom_encoder =
            CategoricalEncoder::new(&config.atom_feature_dims, d, vb.pp("atom_encoder"))?;

        let mut convs = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            convs.push(GineConv::new(config, d, d, vb.pp(format!("convs.{i}")))?);
        }

        let composition = Mlp::new(
            &[d, d, d],
            config.dropout,
            config.batch_norm_eps,
            vb.pp("composition"),
        )?;
        let head = Mlp::new(
            &[config.head_input_dim(), d, config.num_tasks],
            config.dropout,
            config.batch_norm_eps,
            vb.pp("head"),
        )?;

        Ok(Self {
            atom_encoder,
            convs,
            composition,
            head,
            dropout: Dropout::new(config.dropout as f32),
            config: config.clone(),
        })
    }

    /// Inference forward pass: `(G, num_tasks)` predictions.
    pub fn forward(&self, batch: &BatchTensors) -> Result<Tensor> {
        self.forward_t(batch, false)
    }

    /// Forward pass; `train` enables dropout and batch statistics.
    pub fn forward_t(&self, batch: &BatchTensors, train: bool) -> Result<Tensor> {
        let h0 = self.atom_encoder.forward(&batch.atom_features)?;

        // Graph view
        let mut h = h0.clone();
        let last = self.convs.len().saturating_sub(1);
        for (i, conv) in self.convs.iter().enumerate() {
            let mut out = conv.forward(&h, &batch.edge_index, Some(&batch.edge_features), train)?;
            if i < last {
                out = out.gelu_erf()?;
                out = self.dropout.forward_t(&out, train)?;
            }
            h = (h + out)?;
        }
        let graph_view = self.pool(&h, batch)?;

        // Composition view
        let composition_view = self
            .composition
            .forward_t(&self.pool(&h0, batch)?, train)?;

        let fused = Tensor::cat(&[&graph_view, &composition_view], 1)?;
        self.head.forward_t(&fused, train)
    }

    fn pool(&self, x: &Tensor, batch: &BatchTensors) -> Result<Tensor> {
        match self.config.pooling {
            Pooling::Mean => global_mean_pool(x, &batch.batch, batch.num_graphs),
            Pooling::Sum => global_add_pool(x, &batch.batch, batch.num_graphs),
        }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn num_layers(&self) -> usize {
        self.convs.len()
    }
}

// ── Model Stats ─────────────────────────────────────────────────────────────

/// Trainable parameter counts, split by component.
///
/// Computed from config alone (no model instance needed). Batch-norm running
/// statistics are buffers and are not counted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelStats {
    pub total_params: usize,
    pub encoder_params: usize,
    pub conv_params: usize,
    pub readout_params: usize,
}

/// Compute parameter counts from config.
pub fn model_stats(config: &ModelConfig) -> ModelStats {
    let d = config.embed_dim;

    let encoder = config.atom_feature_dims.iter().sum::<usize>() * d;

    let bond_encoder = match config.bond_encoding {
        BondEncoding::Categorical => config.bond_feature_dims.iter().sum::<usize>() * d,
        BondEncoding::Raw => 0,
    };
    let edge_proj = config.bond_embed_dim() * d + d;
    let eps = usize::from(config.train_eps);
    let per_conv = mlp_params(&[d, d, d]) + bond_encoder + edge_proj + eps;
    let conv = config.num_layers * per_conv;

    let readout =
        mlp_params(&[d, d, d]) + mlp_params(&[config.head_input_dim(), d, config.num_tasks]);

    ModelStats {
        total_params: encoder + conv + readout,
        encoder_params: encoder,
        conv_params: conv,
        readout_params: readout,
    }
}

/// Trainable elements held by `varmap`; batch-norm running statistics are
/// skipped.
pub fn num_parameters(varmap: &VarMap) -> Result<usize> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| candle_core::Error::Msg("variable map lock poisoned".into()))?;
    Ok(data
        .iter()
        .filter(|(name, _)| !name.contains("running_"))
        .map(|(_, var)| var.elem_count())
        .sum())
}

/// Linear weights + biases, plus batch-norm scale and shift on hidden layers.
fn mlp_params(channels: &[usize]) -> usize {
    let num_lins = channels.len() - 1;
    channels
        .windows(2)
        .enumerate()
        .map(|(i, pair)| {
            let lin = pair[0] * pair[1] + pair[1];
            let norm = if i + 1 < num_lins { 2 * pair[1] } else { 0 };
            lin + norm
        })
        .sum()
}
