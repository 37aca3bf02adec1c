//! GINE: graph isomorphism convolution with edge features.
//!
//! For every target node `i` with incoming edges `j → i`:
//!
//! ```text
//! e_ji   = Linear( BondEncoder(edge_attr_ji) )
//! m_ji   = x_j + e_ji                      (x_j when there are no edge features)
//! agg_i  = Σ_j m_ji
//! out_i  = MLP( agg_i + (1 + ε) · x_i )
//! ```
//!
//! Messages are not passed through a ReLU; the sum goes straight into the
//! aggregation. `edge_index` is `u32 (2, E)` with sources in row 0 and targets
//! in row 1.

use candle_core::{IndexOp, Result, Tensor};
use candle_nn::{linear, Init, Linear, Module, ModuleT, VarBuilder};

use molview_common::ModelConfig;

use crate::encoder::BondEncoder;
use crate::mlp::Mlp;

/// The `ε` weighting of the root node.
pub enum Eps {
    Fixed(f64),
    /// Learnable `(1,)` parameter.
    Learned(Tensor),
}

pub struct GineConv {
    bond_encoder: BondEncoder,
    edge_proj: Linear,
    nn: Mlp,
    eps: Eps,
}

impl GineConv {
    pub fn new(
        config: &ModelConfig,
        in_channels: usize,
        out_channels: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let nn = Mlp::new(
            &[in_channels, out_channels, out_channels],
            config.dropout,
            config.batch_norm_eps,
            vb.pp("nn"),
        )?;
        let bond_encoder = BondEncoder::new(config, vb.pp("bond_encoder.0"))?;
        let edge_proj = linear(config.bond_embed_dim(), in_channels, vb.pp("bond_encoder.1"))?;
        let eps = if config.train_eps {
            Eps::Learned(vb.get_with_hints(1, "eps", Init::Const(config.eps))?)
        } else {
            Eps::Fixed(config.eps)
        };
        Ok(Self {
            bond_encoder,
            edge_proj,
            nn,
            eps,
        })
    }

    /// Homogeneous graph: sources and targets share `x`.
    pub fn forward(
        &self,
        x: &Tensor,
        edge_index: &Tensor,
        edge_attr: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        self.forward_pair(x, Some(x), edge_index, edge_attr, None, train)
    }

    /// Bipartite graph: messages flow from `x_src` rows to `x_dst` rows.
    ///
    /// The number of output rows is `size.1` when given, else the number of
    /// `x_dst` rows, else the number of `x_src` rows. Without `x_dst` no
    /// root term is added.
    pub fn forward_pair(
        &self,
        x_src: &Tensor,
        x_dst: Option<&Tensor>,
        edge_index: &Tensor,
        edge_attr: Option<&Tensor>,
        size: Option<(usize, usize)>,
        train: bool,
    ) -> Result<Tensor> {
        let num_edges = edge_index.dim(1)?;
        if let Some(e) = edge_attr {
            if e.dim(0)? != num_edges {
                candle_core::bail!("{num_edges} edges but {} edge attribute rows", e.dim(0)?);
            }
        }
        let edge_attr = match edge_attr {
            Some(e) if num_edges > 0 => Some(self.encode_edges(e)?),
            _ => None,
        };
        let num_targets = match (size, x_dst) {
            (Some((_, n)), _) => n,
            (None, Some(x_r)) => x_r.dim(0)?,
            (None, None) => x_src.dim(0)?,
        };

        let mut out = propagate(x_src, edge_index, edge_attr.as_ref(), num_targets)?;
        if let Some(x_r) = x_dst {
            out = (out + self.scale_root(x_r)?)?;
        }
        self.nn.forward_t(&out, train)
    }

    fn encode_edges(&self, edge_attr: &Tensor) -> Result<Tensor> {
        let encoded = self.bond_encoder.forward(edge_attr)?;
        self.edge_proj.forward(&encoded)
    }

    /// `(1 + ε) · x_r`
    fn scale_root(&self, x_r: &Tensor) -> Result<Tensor> {
        match &self.eps {
            Eps::Fixed(eps) => x_r.affine(1.0 + eps, 0.0),
            Eps::Learned(eps) => x_r.broadcast_mul(&eps.affine(1.0, 1.0)?),
        }
    }

    /// Current value of `ε`.
    pub fn eps(&self) -> Result<f64> {
        match &self.eps {
            Eps::Fixed(eps) => Ok(*eps),
            Eps::Learned(eps) => Ok(eps.to_vec1::<f32>()?[0] as f64),
        }
    }
}

// ── Message passing ─────────────────────────────────────────────────────────

/// Gather source rows along the edges, build messages and sum them per target.
pub fn propagate(
    x_src: &Tensor,
    edge_index: &Tensor,
    edge_attr: Option<&Tensor>,
    num_targets: usize,
) -> Result<Tensor> {
    let (rows, num_edges) = edge_index.dims2()?;
    if rows != 2 {
        candle_core::bail!("edge_index must have shape (2, E), got {:?}", edge_index.dims());
    }
    if let Some(e) = edge_attr {
        if e.dim(0)? != num_edges {
            candle_core::bail!(
                "{num_edges} edges but {} edge attribute rows",
                e.dim(0)?
            );
        }
    }
    if num_edges == 0 {
        let d = x_src.dim(1)?;
        return Tensor::zeros((num_targets, d), x_src.dtype(), x_src.device());
    }

    let src = edge_index.i(0)?.contiguous()?;
    let dst = edge_index.i(1)?.contiguous()?;
    let x_j = x_src.index_select(&src, 0)?;
    let messages = message(&x_j, edge_attr)?;
    aggregate(&messages, &dst, num_targets)
}

/// `x_j + e_ji`, or `x_j` alone without edge attributes.
pub fn message(x_j: &Tensor, edge_attr: Option<&Tensor>) -> Result<Tensor> {
    match edge_attr {
        Some(e) => x_j + e,
        None => Ok(x_j.clone()),
    }
}

/// Sum messages into `num_targets` rows by target index.
pub fn aggregate(messages: &Tensor, index: &Tensor, num_targets: usize) -> Result<Tensor> {
    let (_, d) = messages.dims2()?;
    let out = Tensor::zeros((num_targets, d), messages.dtype(), messages.device())?;
    if messages.dim(0)? == 0 {
        return Ok(out);
    }
    out.index_add(index, messages, 0)
}
