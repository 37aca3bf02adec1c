//! Data pipeline: featurised graph loading, splitting, batching.
//!
//! Graphs arrive already featurised as JSONL, one [`GraphSample`] per line:
//!
//! ```text
//! {"atom_features": [[5,0,2,5,1,0,2,0,0], ...],
//!  "edge_index": [[0,1],[1,0]],
//!  "edge_features": [[0,0,0],[0,0,0]],
//!  "labels": [0.42, null]}
//! ```
//!
//! Edges are directed `(src, dst)` pairs, so an undirected bond appears twice.
//! A `null` label marks a missing target; it is masked out of the loss.
//!
//! * **[`GraphDataset`]**: in-memory samples from a file or directory.
//! * **[`GraphBatch`]**: several graphs collated into one disjoint graph.
//! * **[`BatchTensors`]**: a batch moved onto a Candle device.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result as AnyhowResult};
use candle_core::{Device, Result, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::config::ModelConfig;

// ── GraphSample ─────────────────────────────────────────────────────────────

/// One featurised graph with its (possibly partial) regression targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSample {
    /// `N × F_atom` categorical atom features.
    pub atom_features: Vec<Vec<u32>>,
    /// Directed `(src, dst)` node pairs.
    #[serde(default)]
    pub edge_index: Vec<[u32; 2]>,
    /// `E × F_bond` categorical bond features, aligned with `edge_index`.
    #[serde(default)]
    pub edge_features: Vec<Vec<u32>>,
    /// One entry per task; `None` is unlabelled.
    pub labels: Vec<Option<f32>>,
}

impl GraphSample {
    pub fn num_nodes(&self) -> usize {
        self.atom_features.len()
    }

    pub fn num_edges(&self) -> usize {
        self.edge_index.len()
    }

    /// Check shapes and category ranges against a model config.
    pub fn validate(&self, config: &ModelConfig) -> AnyhowResult<()> {
        let n = self.num_nodes();
        if n == 0 {
            anyhow::bail!("graph has no atoms");
        }
        for (i, row) in self.atom_features.iter().enumerate() {
            check_categories(row, &config.atom_feature_dims)
                .with_context(|| format!("atom {i}"))?;
        }
        if self.edge_features.len() != self.num_edges() {
            anyhow::bail!(
                "{} edges but {} edge feature rows",
                self.num_edges(),
                self.edge_features.len()
            );
        }
        for (i, [src, dst]) in self.edge_index.iter().enumerate() {
            if *src as usize >= n || *dst as usize >= n {
                anyhow::bail!("edge {i} ({src}, {dst}) out of range for {n} atoms");
            }
        }
        for (i, row) in self.edge_features.iter().enumerate() {
            check_categories(row, &config.bond_feature_dims)
                .with_context(|| format!("edge {i}"))?;
        }
        if self.labels.len() != config.num_tasks {
            anyhow::bail!(
                "{} labels but the model predicts {} tasks",
                self.labels.len(),
                config.num_tasks
            );
        }
        Ok(())
    }
}

fn check_categories(row: &[u32], dims: &[usize]) -> AnyhowResult<()> {
    if row.len() != dims.len() {
        anyhow::bail!("expected {} features, got {}", dims.len(), row.len());
    }
    for (col, (&v, &dim)) in row.iter().zip(dims).enumerate() {
        if v as usize >= dim {
            anyhow::bail!("feature {col} value {v} outside vocabulary of size {dim}");
        }
    }
    Ok(())
}

// ── GraphDataset ────────────────────────────────────────────────────────────

/// In-memory collection of graphs.
#[derive(Debug, Clone, Default)]
pub struct GraphDataset {
    samples: Vec<GraphSample>,
}

impl GraphDataset {
    pub fn new(samples: Vec<GraphSample>) -> Self {
        Self { samples }
    }

    /// Load every sample from a JSONL file, or from all `.jsonl`/`.json`
    /// files of a directory in sorted order.
    pub fn load(path: &Path) -> AnyhowResult<Self> {
        let mut dataset = Self::default();
        for file in collect_files(path)? {
            dataset.load_file(&file)?;
        }
        tracing::debug!(path = %path.display(), graphs = dataset.len(), "Loaded graphs");
        Ok(dataset)
    }

    fn load_file(&mut self, path: &Path) -> AnyhowResult<()> {
        let reader = BufReader::new(
            File::open(path).with_context(|| format!("open {}", path.display()))?,
        );
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let sample: GraphSample = serde_json::from_str(line)
                .with_context(|| format!("parse {}:{}", path.display(), lineno + 1))?;
            self.samples.push(sample);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Validate every sample, reporting the index of the first bad one.
    pub fn validate(&self, config: &ModelConfig) -> AnyhowResult<()> {
        for (i, sample) in self.samples.iter().enumerate() {
            sample
                .validate(config)
                .with_context(|| format!("graph {i}"))?;
        }
        Ok(())
    }

    /// Seeded random split into `(train, val, test)`.
    pub fn split(
        self,
        val_fraction: f64,
        test_fraction: f64,
        seed: u64,
    ) -> AnyhowResult<(Self, Self, Self)> {
        if val_fraction < 0.0 || test_fraction < 0.0 || val_fraction + test_fraction >= 1.0 {
            anyhow::bail!(
                "invalid split fractions: val={val_fraction}, test={test_fraction}"
            );
        }
        let n = self.samples.len();
        let n_val = (n as f64 * val_fraction).round() as usize;
        let n_test = (n as f64 * test_fraction).round() as usize;
        if n_val + n_test >= n {
            anyhow::bail!("{n} graphs are too few for a {n_val}/{n_test} val/test split");
        }

        let mut order: Vec<usize> = (0..n).collect();
        order.shuffle(&mut StdRng::seed_from_u64(seed));
        let mut slots: Vec<Option<GraphSample>> = self.samples.into_iter().map(Some).collect();
        let mut take = |idx: &[usize]| -> Vec<GraphSample> {
            idx.iter().filter_map(|&i| slots[i].take()).collect()
        };
        let val = take(&order[..n_val]);
        let test = take(&order[n_val..n_val + n_test]);
        let train = take(&order[n_val + n_test..]);
        Ok((Self::new(train), Self::new(val), Self::new(test)))
    }
}

impl From<Vec<GraphSample>> for GraphDataset {
    fn from(samples: Vec<GraphSample>) -> Self {
        Self::new(samples)
    }
}

// ── BatchDataset trait ──────────────────────────────────────────────────────

/// Common interface for anything that can be cut into [`GraphBatch`]es.
pub trait BatchDataset {
    fn samples(&self) -> &[GraphSample];

    fn num_graphs(&self) -> usize {
        self.samples().len()
    }

    /// Batches in storage order. The last batch may be smaller.
    fn batches(&self, batch_size: usize) -> Box<dyn Iterator<Item = AnyhowResult<GraphBatch>> + '_> {
        let samples = self.samples();
        Box::new(samples.chunks(batch_size.max(1)).map(|chunk| {
            let refs: Vec<&GraphSample> = chunk.iter().collect();
            GraphBatch::collate(&refs)
        }))
    }

    /// Batches over a random permutation of the samples.
    fn shuffled_batches(
        &self,
        batch_size: usize,
        rng: &mut StdRng,
    ) -> Box<dyn Iterator<Item = AnyhowResult<GraphBatch>> + '_> {
        let samples = self.samples();
        let mut order: Vec<usize> = (0..samples.len()).collect();
        order.shuffle(rng);
        let batch_size = batch_size.max(1);
        let mut start = 0usize;
        Box::new(std::iter::from_fn(move || {
            if start >= order.len() {
                return None;
            }
            let end = (start + batch_size).min(order.len());
            let refs: Vec<&GraphSample> = order[start..end].iter().map(|&i| &samples[i]).collect();
            start = end;
            Some(GraphBatch::collate(&refs))
        }))
    }
}

impl BatchDataset for GraphDataset {
    fn samples(&self) -> &[GraphSample] {
        &self.samples
    }
}

impl BatchDataset for Vec<GraphSample> {
    fn samples(&self) -> &[GraphSample] {
        self
    }
}

// ── GraphBatch ──────────────────────────────────────────────────────────────

/// Several graphs collated into a single disjoint graph (host side).
#[derive(Debug, Clone, PartialEq)]
pub struct GraphBatch {
    pub num_graphs: usize,
    pub num_tasks: usize,
    pub atom_feature_count: usize,
    pub bond_feature_count: usize,
    /// Row-major `N × atom_feature_count`.
    pub atom_features: Vec<u32>,
    pub edge_src: Vec<u32>,
    pub edge_dst: Vec<u32>,
    /// Row-major `E × bond_feature_count`.
    pub edge_features: Vec<u32>,
    /// Graph index of every node.
    pub batch: Vec<u32>,
    /// Row-major `G × T`; missing labels are stored as `0.0`.
    pub labels: Vec<f32>,
    /// Row-major `G × T`; `1` where the label is present.
    pub mask: Vec<u8>,
}

impl GraphBatch {
    /// Concatenate graphs, offsetting edge endpoints by the running node count.
    pub fn collate(samples: &[&GraphSample]) -> AnyhowResult<Self> {
        if samples.is_empty() {
            anyhow::bail!("cannot collate an empty batch");
        }
        let num_tasks = samples[0].labels.len();
        let atom_feature_count = samples
            .iter()
            .find_map(|s| s.atom_features.first())
            .map_or(0, Vec::len);
        let bond_feature_count = samples
            .iter()
            .find_map(|s| s.edge_features.first())
            .map_or(0, Vec::len);

        let num_nodes: usize = samples.iter().map(|s| s.num_nodes()).sum();
        let num_edges: usize = samples.iter().map(|s| s.num_edges()).sum();
        let mut out = Self {
            num_graphs: samples.len(),
            num_tasks,
            atom_feature_count,
            bond_feature_count,
            atom_features: Vec::with_capacity(num_nodes * atom_feature_count),
            edge_src: Vec::with_capacity(num_edges),
            edge_dst: Vec::with_capacity(num_edges),
            edge_features: Vec::with_capacity(num_edges * bond_feature_count),
            batch: Vec::with_capacity(num_nodes),
            labels: Vec::with_capacity(samples.len() * num_tasks),
            mask: Vec::with_capacity(samples.len() * num_tasks),
        };

        let mut offset = 0u32;
        for (g, sample) in samples.iter().enumerate() {
            if sample.labels.len() != num_tasks {
                anyhow::bail!(
                    "graph {g} has {} labels, expected {num_tasks}",
                    sample.labels.len()
                );
            }
            if sample.edge_features.len() != sample.num_edges() {
                anyhow::bail!("graph {g} has mismatched edge features");
            }
            for row in &sample.atom_features {
                if row.len() != atom_feature_count {
                    anyhow::bail!("graph {g} has inconsistent atom feature width");
                }
                out.atom_features.extend_from_slice(row);
                out.batch.push(g as u32);
            }
            for [src, dst] in &sample.edge_index {
                out.edge_src.push(src + offset);
                out.edge_dst.push(dst + offset);
            }
            for row in &sample.edge_features {
                if row.len() != bond_feature_count {
                    anyhow::bail!("graph {g} has inconsistent bond feature width");
                }
                out.edge_features.extend_from_slice(row);
            }
            for label in &sample.labels {
                out.labels.push(label.unwrap_or(0.0));
                out.mask.push(u8::from(label.is_some()));
            }
            offset += sample.num_nodes() as u32;
        }
        Ok(out)
    }

    pub fn num_nodes(&self) -> usize {
        self.batch.len()
    }

    pub fn num_edges(&self) -> usize {
        self.edge_src.len()
    }

    /// Number of labelled `(graph, task)` targets.
    pub fn num_labelled(&self) -> usize {
        self.mask.iter().filter(|&&m| m != 0).count()
    }

    /// Move the batch onto `device`.
    pub fn to_tensors(&self, device: &Device) -> Result<BatchTensors> {
        let n = self.num_nodes();
        let e = self.num_edges();
        let shape_gt = (self.num_graphs, self.num_tasks);

        let atom_features =
            Tensor::from_vec(self.atom_features.clone(), (n, self.atom_feature_count), device)?;
        let mut endpoints = Vec::with_capacity(2 * e);
        endpoints.extend_from_slice(&self.edge_src);
        endpoints.extend_from_slice(&self.edge_dst);
        let edge_index = Tensor::from_vec(endpoints, (2, e), device)?;
        let edge_features =
            Tensor::from_vec(self.edge_features.clone(), (e, self.bond_feature_count), device)?;
        let batch = Tensor::from_vec(self.batch.clone(), n, device)?;
        let label = Tensor::from_vec(self.labels.clone(), shape_gt, device)?;
        let mask = Tensor::from_vec(self.mask.clone(), shape_gt, device)?;

        Ok(BatchTensors {
            atom_features,
            edge_index,
            edge_features,
            batch,
            label,
            mask,
            num_graphs: self.num_graphs,
            num_labelled: self.num_labelled(),
        })
    }
}

/// A [`GraphBatch`] as Candle tensors.
#[derive(Debug, Clone)]
pub struct BatchTensors {
    /// `u32 (N, F_atom)`
    pub atom_features: Tensor,
    /// `u32 (2, E)`: row 0 sources, row 1 targets.
    pub edge_index: Tensor,
    /// `u32 (E, F_bond)`
    pub edge_features: Tensor,
    /// `u32 (N,)`
    pub batch: Tensor,
    /// `f32 (G, T)`
    pub label: Tensor,
    /// `u8 (G, T)`
    pub mask: Tensor,
    pub num_graphs: usize,
    pub num_labelled: usize,
}

// ── Helpers ─────────────────────────────────────────────────────────────────

/// Collect JSONL files from a path (file or directory), sorted.
fn collect_files(path: &Path) -> AnyhowResult<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    if !path.is_dir() {
        anyhow::bail!("path is neither file nor directory: {}", path.display());
    }
    let mut entries: Vec<_> = std::fs::read_dir(path)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.extension()
                    .map(|e| e == "jsonl" || e == "json")
                    .unwrap_or(false)
        })
        .collect();
    entries.sort();
    Ok(entries)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn config() -> ModelConfig {
        ModelConfig {
            atom_feature_dims: vec![4, 2],
            bond_feature_dims: vec![3],
            num_tasks: 2,
            ..Default::default()
        }
    }

    fn triangle(label: Option<f32>) -> GraphSample {
        GraphSample {
            atom_features: vec![vec![0, 1], vec![1, 0], vec![3, 1]],
            edge_index: vec![[0, 1], [1, 0], [1, 2], [2, 1]],
            edge_features: vec![vec![0], vec![0], vec![2], vec![2]],
            labels: vec![Some(1.5), label],
        }
    }

    fn single_atom() -> GraphSample {
        GraphSample {
            atom_features: vec![vec![2, 0]],
            edge_index: vec![],
            edge_features: vec![],
            labels: vec![None, Some(-0.5)],
        }
    }

    #[test]
    fn sample_json_with_null_label() {
        let line = r#"{"atom_features": [[2, 0]], "labels": [null, -0.5]}"#;
        let sample: GraphSample = serde_json::from_str(line).unwrap();
        assert_eq!(sample, single_atom());
        assert!(sample.validate(&config()).is_ok());
    }

    #[test]
    fn validate_catches_bad_graphs() {
        let c = config();
        let mut s = triangle(None);
        s.edge_index[0] = [0, 7];
        assert!(s.validate(&c).is_err());

        let mut s = triangle(None);
        s.atom_features[2] = vec![4, 1];
        assert!(s.validate(&c).is_err());

        let mut s = triangle(None);
        s.edge_features.pop();
        assert!(s.validate(&c).is_err());

        let mut s = triangle(None);
        s.labels.push(None);
        assert!(s.validate(&c).is_err());
    }

    #[test]
    fn collate_offsets_edges_and_builds_mask() {
        let a = triangle(None);
        let b = single_atom();
        let c = triangle(Some(2.0));
        let batch = GraphBatch::collate(&[&a, &b, &c]).unwrap();

        assert_eq!(batch.num_graphs, 3);
        assert_eq!(batch.num_nodes(), 7);
        assert_eq!(batch.num_edges(), 8);
        assert_eq!(batch.batch, vec![0, 0, 0, 1, 2, 2, 2]);
        // Third graph starts at node 4.
        assert_eq!(&batch.edge_src[4..], &[4, 5, 5, 6]);
        assert_eq!(&batch.edge_dst[4..], &[5, 4, 6, 5]);
        assert_eq!(batch.labels, vec![1.5, 0.0, 0.0, -0.5, 1.5, 2.0]);
        assert_eq!(batch.mask, vec![1, 0, 0, 1, 1, 1]);
        assert_eq!(batch.num_labelled(), 4);
    }

    #[test]
    fn collate_rejects_mixed_task_counts() {
        let a = triangle(None);
        let mut b = single_atom();
        b.labels = vec![Some(1.0)];
        assert!(GraphBatch::collate(&[&a, &b]).is_err());
        assert!(GraphBatch::collate(&[]).is_err());
    }

    #[test]
    fn to_tensors_shapes() {
        let a = triangle(Some(0.0));
        let b = single_atom();
        let t = GraphBatch::collate(&[&a, &b])
            .unwrap()
            .to_tensors(&Device::Cpu)
            .unwrap();
        assert_eq!(t.atom_features.dims(), &[4, 2]);
        assert_eq!(t.edge_index.dims(), &[2, 4]);
        assert_eq!(t.edge_features.dims(), &[4, 1]);
        assert_eq!(t.batch.to_vec1::<u32>().unwrap(), vec![0, 0, 0, 1]);
        assert_eq!(t.label.dims(), &[2, 2]);
        assert_eq!(
            t.mask.to_vec2::<u8>().unwrap(),
            vec![vec![1, 1], vec![0, 1]]
        );
        assert_eq!(t.num_labelled, 3);
    }

    #[test]
    fn edgeless_batch_has_empty_edge_tensors() {
        let b = single_atom();
        let t = GraphBatch::collate(&[&b, &b])
            .unwrap()
            .to_tensors(&Device::Cpu)
            .unwrap();
        assert_eq!(t.edge_index.dims(), &[2, 0]);
        assert_eq!(t.edge_features.dims(), &[0, 0]);
    }

    #[test]
    fn batches_keep_partial_tail() {
        let ds: Vec<GraphSample> = (0..5).map(|_| triangle(None)).collect();
        let sizes: Vec<usize> = ds
            .batches(2)
            .map(|b| b.unwrap().num_graphs)
            .collect();
        assert_eq!(sizes, vec![2, 2, 1]);

        let mut rng = StdRng::seed_from_u64(7);
        let total: usize = ds
            .shuffled_batches(2, &mut rng)
            .map(|b| b.unwrap().num_graphs)
            .sum();
        assert_eq!(total, 5);
    }

    #[test]
    fn split_is_seeded_and_disjoint() {
        let samples: Vec<GraphSample> = (0..20)
            .map(|i| GraphSample {
                labels: vec![Some(i as f32), None],
                ..single_atom()
            })
            .collect();
        let (train, val, test) = GraphDataset::new(samples.clone())
            .split(0.2, 0.1, 3)
            .unwrap();
        assert_eq!((train.len(), val.len(), test.len()), (14, 4, 2));

        let mut seen: Vec<f32> = [&train, &val, &test]
            .iter()
            .flat_map(|d| d.samples().iter().map(|s| s.labels[0].unwrap()))
            .collect();
        seen.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(seen, (0..20).map(|i| i as f32).collect::<Vec<_>>());

        let (_, val2, _) = GraphDataset::new(samples).split(0.2, 0.1, 3).unwrap();
        assert_eq!(val.samples(), val2.samples());
    }

    #[test]
    fn split_rejects_bad_fractions() {
        let ds = GraphDataset::new(vec![single_atom(); 4]);
        assert!(ds.clone().split(0.6, 0.5, 0).is_err());
        assert!(ds.split(0.5, 0.5, 0).is_err());
    }

    #[test]
    fn load_directory_of_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = File::create(dir.path().join("b.jsonl")).unwrap();
        writeln!(f, "{}", serde_json::to_string(&triangle(None)).unwrap()).unwrap();
        writeln!(f).unwrap();
        let mut f = File::create(dir.path().join("a.jsonl")).unwrap();
        writeln!(f, "{}", serde_json::to_string(&single_atom()).unwrap()).unwrap();
        File::create(dir.path().join("notes.txt")).unwrap();

        let ds = GraphDataset::load(dir.path()).unwrap();
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.samples()[0], single_atom());
        assert!(ds.validate(&config()).is_ok());
    }

    #[test]
    fn load_reports_bad_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.jsonl");
        std::fs::write(&path, "{\"atom_features\": 3}\n").unwrap();
        let err = GraphDataset::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("bad.jsonl:1"));
    }
}
