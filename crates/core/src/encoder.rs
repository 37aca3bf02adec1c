//! Categorical feature encoders for atoms and bonds.
//!
//! Molecular graphs carry small integer features per atom/bond (element,
//! charge, bond type, ...). Each column gets its own embedding table and the
//! column embeddings are summed, as in the OGB `AtomEncoder`/`BondEncoder`.

use candle_core::{DType, IndexOp, Result, Tensor};
use candle_nn::{embedding, Embedding, Module, VarBuilder};

use molview_common::{BondEncoding, ModelConfig};

/// Sum of per-column embeddings: `u32 (M, F)` → `(M, out_dim)`.
pub struct CategoricalEncoder {
    tables: Vec<Embedding>,
    out_dim: usize,
}

impl CategoricalEncoder {
    /// One table per entry of `feature_dims`, stored under `vb.pp(i)`.
    pub fn new(feature_dims: &[usize], out_dim: usize, vb: VarBuilder) -> Result<Self> {
        let tables = feature_dims
            .iter()
            .enumerate()
            .map(|(i, &dim)| embedding(dim, out_dim, vb.pp(i.to_string())))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { tables, out_dim })
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }
}

impl Module for CategoricalEncoder {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (rows, cols) = xs.dims2()?;
        if cols != self.tables.len() {
            candle_core::bail!(
                "encoder expects {} feature columns, got {cols}",
                self.tables.len()
            );
        }
        let mut out = Tensor::zeros((rows, self.out_dim), DType::F32, xs.device())?;
        for (i, table) in self.tables.iter().enumerate() {
            let column = xs.i((.., i))?.contiguous()?;
            out = (out + table.forward(&column)?)?;
        }
        Ok(out)
    }
}

/// Bond feature encoder: the first stage of each convolution's edge path.
pub enum BondEncoder {
    Categorical(CategoricalEncoder),
    /// Identity over the features cast to `f32`.
    Raw,
}

impl BondEncoder {
    /// Construct from config. `vb` should be scoped to the encoder prefix.
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        match config.bond_encoding {
            BondEncoding::Categorical => Ok(Self::Categorical(CategoricalEncoder::new(
                &config.bond_feature_dims,
                config.embed_dim,
                vb,
            )?)),
            BondEncoding::Raw => Ok(Self::Raw),
        }
    }
}

impl Module for BondEncoder {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Self::Categorical(enc) => enc.forward(xs),
            Self::Raw => xs.to_dtype(DType::F32),
        }
    }
}
