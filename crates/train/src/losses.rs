//! Per-stage loss bookkeeping and the masked L1 objective.

use std::fmt;

use candle_core::{DType, Result, Tensor};

/// Phase of a training run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    Train,
    Val,
    Test,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Val => "val",
            Self::Test => "test",
        }
    }

    pub fn is_train(&self) -> bool {
        *self == Self::Train
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detached per-batch losses collected since the last epoch boundary.
#[derive(Debug, Clone, Default)]
pub struct LossBook {
    train: Vec<f32>,
    val: Vec<f32>,
    test: Vec<f32>,
}

impl LossBook {
    fn stage(&self, stage: Stage) -> &Vec<f32> {
        match stage {
            Stage::Train => &self.train,
            Stage::Val => &self.val,
            Stage::Test => &self.test,
        }
    }

    pub fn record(&mut self, stage: Stage, loss: f32) {
        match stage {
            Stage::Train => self.train.push(loss),
            Stage::Val => self.val.push(loss),
            Stage::Test => self.test.push(loss),
        }
    }

    pub fn losses(&self, stage: Stage) -> &[f32] {
        self.stage(stage)
    }

    pub fn len(&self, stage: Stage) -> usize {
        self.stage(stage).len()
    }

    /// Unweighted mean over recorded batches; `None` if nothing was recorded.
    pub fn mean(&self, stage: Stage) -> Option<f64> {
        let losses = self.stage(stage);
        if losses.is_empty() {
            return None;
        }
        Some(losses.iter().map(|&l| l as f64).sum::<f64>() / losses.len() as f64)
    }

    pub fn reset(&mut self) {
        self.train.clear();
        self.val.clear();
        self.test.clear();
    }
}

/// Mean absolute error.
pub fn l1_loss(pred: &Tensor, target: &Tensor) -> Result<Tensor> {
    (pred - target)?.abs()?.mean_all()
}

/// Flatten `t` and keep the entries where `mask` is non-zero (row-major).
pub fn masked_select(t: &Tensor, mask: &Tensor) -> Result<Tensor> {
    if t.elem_count() != mask.elem_count() {
        candle_core::bail!(
            "mask shape {:?} does not match tensor shape {:?}",
            mask.dims(),
            t.dims()
        );
    }
    let flags = mask.flatten_all()?.to_dtype(DType::U8)?.to_vec1::<u8>()?;
    let index: Vec<u32> = flags
        .iter()
        .enumerate()
        .filter(|(_, &m)| m != 0)
        .map(|(i, _)| i as u32)
        .collect();
    let n = index.len();
    let index = Tensor::from_vec(index, n, t.device())?;
    t.flatten_all()?.index_select(&index, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn book_mean_and_reset() {
        let mut book = LossBook::default();
        assert_eq!(book.mean(Stage::Train), None);
        book.record(Stage::Train, 1.0);
        book.record(Stage::Train, 2.0);
        book.record(Stage::Test, 4.0);
        assert_eq!(book.len(Stage::Train), 2);
        assert_eq!(book.mean(Stage::Train), Some(1.5));
        assert_eq!(book.mean(Stage::Val), None);
        assert_eq!(book.losses(Stage::Test), &[4.0]);
        book.reset();
        for stage in [Stage::Train, Stage::Val, Stage::Test] {
            assert_eq!(book.len(stage), 0);
        }
    }

    #[test]
    fn stage_names() {
        assert_eq!(Stage::Train.to_string(), "train");
        assert_eq!(Stage::Val.to_string(), "val");
        assert_eq!(Stage::Test.as_str(), "test");
        assert!(Stage::Train.is_train());
        assert!(!Stage::Val.is_train());
    }

    #[test]
    fn masked_l1() {
        let dev = Device::Cpu;
        let pred = Tensor::new(&[[1f32, 100.], [3., 5.]], &dev).unwrap();
        let label = Tensor::new(&[[2f32, 0.], [0., 5.]], &dev).unwrap();
        let mask = Tensor::new(&[[1u8, 0], [1, 1]], &dev).unwrap();

        let p = masked_select(&pred, &mask).unwrap();
        assert_eq!(p.to_vec1::<f32>().unwrap(), vec![1., 3., 5.]);
        let y = masked_select(&label, &mask).unwrap();
        let loss: f32 = l1_loss(&p, &y).unwrap().to_scalar().unwrap();
        // |1-2| + |3-0| + |5-5| over 3 entries
        assert!((loss - 4.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn masked_select_shape_mismatch() {
        let dev = Device::Cpu;
        let t = Tensor::zeros((2, 2), DType::F32, &dev).unwrap();
        let mask = Tensor::ones(3, DType::U8, &dev).unwrap();
        assert!(masked_select(&t, &mask).is_err());
    }
}
