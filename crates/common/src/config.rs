//! Model configuration for the multi-view graph model.
//!
//! Serialised as JSON next to the weights. Every field has a default so a
//! minimal `{}` JSON produces a working model over OGB-style molecular
//! features.

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// OGB atom feature vocabulary (atomic number, chirality, degree, charge,
/// num Hs, radical electrons, hybridisation, aromatic, in ring).
pub const OGB_ATOM_FEATURE_DIMS: [usize; 9] = [119, 5, 12, 12, 10, 6, 6, 2, 2];
/// OGB bond feature vocabulary (bond type, stereo, conjugated).
pub const OGB_BOND_FEATURE_DIMS: [usize; 3] = [5, 6, 2];

/// Configuration for the multi-view representation model.
///
/// Stored alongside weights for reproducible import. Backwards-compatible: missing fields fall back to their `#[serde(default)]`
/// values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    // ── Dimensions ──────────────────────────────────────────────────────────
    /// Node embedding width shared by every view.
    #[serde(default = "default_embed_dim")]
    pub embed_dim: usize,
    /// Number of GINE message-passing layers in the graph view.
    #[serde(default = "default_num_layers")]
    pub num_layers: usize,
    /// Number of regression targets per graph.
    #[serde(default = "default_num_tasks")]
    pub num_tasks: usize,

    // ── Featurisation ───────────────────────────────────────────────────────
    /// Vocabulary size of each categorical atom feature column.
    #[serde(default = "default_atom_feature_dims")]
    pub atom_feature_dims: Vec<usize>,
    /// Vocabulary size of each categorical bond feature column.
    #[serde(default = "default_bond_feature_dims")]
    pub bond_feature_dims: Vec<usize>,
    /// How bond features are embedded before the per-layer projection.
    #[serde(default)]
    pub bond_encoding: BondEncoding,

    // ── Convolution ─────────────────────────────────────────────────────────
    /// Dropout inside every MLP.
    #[serde(default = "default_dropout")]
    pub dropout: f64,
    /// Learn the GIN `eps` instead of keeping it fixed.
    #[serde(default)]
    pub train_eps: bool,
    /// Initial (or fixed) GIN `eps`.
    #[serde(default)]
    pub eps: f64,
    #[serde(default = "default_batch_norm_eps")]
    pub batch_norm_eps: f64,

    // ── Readout ─────────────────────────────────────────────────────────────
    #[serde(default)]
    pub pooling: Pooling,
}

/// Bond feature encoder choice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BondEncoding {
    /// Sum of one embedding table per bond feature column.
    #[default]
    Categorical,
    /// Raw feature values cast to `f32`, projected directly by each layer.
    Raw,
}

/// Node → graph readout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pooling {
    #[default]
    Mean,
    Sum,
}

// ── Default value functions ─────────────────────────────────────────────────

fn default_embed_dim() -> usize {
    288
}
fn default_num_layers() -> usize {
    4
}
fn default_num_tasks() -> usize {
    1
}
fn default_atom_feature_dims() -> Vec<usize> {
    OGB_ATOM_FEATURE_DIMS.to_vec()
}
fn default_bond_feature_dims() -> Vec<usize> {
    OGB_BOND_FEATURE_DIMS.to_vec()
}
fn default_dropout() -> f64 {
    0.1
}
fn default_batch_norm_eps() -> f64 {
    1e-5
}

// ── Impl ────────────────────────────────────────────────────────────────────

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            embed_dim: default_embed_dim(),
            num_layers: default_num_layers(),
            num_tasks: default_num_tasks(),
            atom_feature_dims: default_atom_feature_dims(),
            bond_feature_dims: default_bond_feature_dims(),
            bond_encoding: BondEncoding::Categorical,
            dropout: default_dropout(),
            train_eps: false,
            eps: 0.0,
            batch_norm_eps: default_batch_norm_eps(),
            pooling: Pooling::Mean,
        }
    }
}

impl ModelConfig {
    /// Width of the fused representation fed to the prediction head.
    pub fn head_input_dim(&self) -> usize {
        2 * self.embed_dim
    }

    /// Output width of the bond encoder, i.e. the input of the per-layer
    /// edge projection.
    pub fn bond_embed_dim(&self) -> usize {
        match self.bond_encoding {
            BondEncoding::Categorical => self.embed_dim,
            BondEncoding::Raw => self.bond_feature_dims.len(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.embed_dim == 0 {
            anyhow::bail!("embed_dim must be positive");
        }
        if self.num_layers == 0 {
            anyhow::bail!("num_layers must be positive");
        }
        if self.num_tasks == 0 {
            anyhow::bail!("num_tasks must be positive");
        }
        if !(0.0..1.0).contains(&self.dropout) {
            anyhow::bail!("dropout must be in [0, 1), got {}", self.dropout);
        }
        if self.atom_feature_dims.is_empty() || self.atom_feature_dims.contains(&0) {
            anyhow::bail!("atom_feature_dims must be non-empty with positive entries");
        }
        if self.bond_feature_dims.is_empty() || self.bond_feature_dims.contains(&0) {
            anyhow::bail!("bond_feature_dims must be non-empty with positive entries");
        }
        Ok(())
    }

    /// Save config to a JSON file.
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let json =
            std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let config: Self = serde_json::from_str(&json)
            .with_context(|| format!("parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_json_round_trip() {
        let config = ModelConfig {
            num_tasks: 3,
            pooling: Pooling::Sum,
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let loaded: ModelConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, loaded);
        assert!(json.contains("\"pooling\":\"sum\""));
    }

    #[test]
    fn empty_json_uses_defaults() {
        let loaded: ModelConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(loaded.embed_dim, 288);
        assert_eq!(loaded.atom_feature_dims, OGB_ATOM_FEATURE_DIMS.to_vec());
        assert_eq!(loaded.bond_feature_dims, OGB_BOND_FEATURE_DIMS.to_vec());
        assert_eq!(loaded.bond_encoding, BondEncoding::Categorical);
        assert_eq!(loaded.dropout, 0.1);
        assert!(!loaded.train_eps);
        assert!(loaded.validate().is_ok());
    }

    #[test]
    fn bond_embed_dim_follows_encoding() {
        let mut c = ModelConfig {
            embed_dim: 16,
            ..Default::default()
        };
        assert_eq!(c.bond_embed_dim(), 16);
        c.bond_encoding = BondEncoding::Raw;
        assert_eq!(c.bond_embed_dim(), 3);
        assert_eq!(c.head_input_dim(), 32);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let bad = [
            ModelConfig {
                num_layers: 0,
                ..Default::default()
            },
            ModelConfig {
                dropout: 1.0,
                ..Default::default()
            },
            ModelConfig {
                bond_feature_dims: vec![],
                ..Default::default()
            },
            ModelConfig {
                atom_feature_dims: vec![3, 0],
                ..Default::default()
            },
        ];
        for c in bad {
            assert!(c.validate().is_err(), "{c:?}");
        }
    }

    #[test]
    fn save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = ModelConfig {
            embed_dim: 32,
            train_eps: true,
            ..Default::default()
        };
        config.save(&path).unwrap();
        assert_eq!(ModelConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn load_error_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let err = ModelConfig::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("missing.json"), "{err:#}");

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{ not json").unwrap();
        let err = ModelConfig::load(&bad).unwrap_err();
        assert!(format!("{err:#}").contains("bad.json"), "{err:#}");
    }
}
