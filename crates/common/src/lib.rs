//! # molview-common: Shared Primitives
//!
//! Types and utilities shared across every crate in the workspace:
//!
//! * **[`ModelConfig`]**: model hyper-parameters (serialised as JSON).
//! * **[`GraphDataset`]** / **[`GraphBatch`]**: featurised graph loading & collation.
//! * **[`BatchTensors`]**: a collated batch as Candle tensors.

pub mod config;
pub mod data;

pub use config::{BondEncoding, ModelConfig, Pooling};
pub use data::{BatchDataset, BatchTensors, GraphBatch, GraphDataset, GraphSample};
