//! # molview-core: The Graph Model
//!
//! Every learnable building block of the multi-view molecular model:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`encoder`] | `CategoricalEncoder` (atom/bond embeddings), `BondEncoder` |
//! | [`mlp`] | `Mlp` (Linear → BatchNorm → GELU → Dropout, plain last layer) |
//! | [`gnn`] | `GineConv`, edge-aware GIN message passing |
//! | [`pool`] | `global_add_pool`, `global_mean_pool` |
//! | [`model`] | `MultiViewRepresentation`, `ModelStats`, `num_parameters` |
//!
//! Everything goes through `candle-core`/`candle-nn`; message passing is
//! `index_select` (gather) followed by `index_add` (scatter-sum), both of
//! which are differentiable.

pub mod encoder;
pub mod gnn;
pub mod mlp;
pub mod model;
pub mod pool;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use encoder::{BondEncoder, CategoricalEncoder};
pub use gnn::{aggregate, message, propagate, Eps, GineConv};
pub use mlp::Mlp;
pub use model::{model_stats, num_parameters, ModelStats, MultiViewRepresentation};
pub use pool::{global_add_pool, global_mean_pool};
