//! Node → graph readout over a collated batch.

use candle_core::{Result, Tensor};

/// Sum node rows per graph. `batch` is the `u32 (N,)` node → graph index.
pub fn global_add_pool(x: &Tensor, batch: &Tensor, num_graphs: usize) -> Result<Tensor> {
    let (n, d) = x.dims2()?;
    let out = Tensor::zeros((num_graphs, d), x.dtype(), x.device())?;
    if n == 0 {
        return Ok(out);
    }
    out.index_add(batch, x, 0)
}

/// Average node rows per graph. Graphs without nodes pool to zeros.
pub fn global_mean_pool(x: &Tensor, batch: &Tensor, num_graphs: usize) -> Result<Tensor> {
    let sum = global_add_pool(x, batch, num_graphs)?;
    let ones = Tensor::ones((x.dim(0)?, 1), x.dtype(), x.device())?;
    let counts = global_add_pool(&ones, batch, num_graphs)?.maximum(1.0)?;
    sum.broadcast_div(&counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn add_and_mean_pool() {
        let dev = Device::Cpu;
        let x = Tensor::new(&[[1f32, 2.], [3., 4.], [10., 20.]], &dev).unwrap();
        let batch = Tensor::new(&[0u32, 0, 2], &dev).unwrap();

        let sum: Vec<Vec<f32>> = global_add_pool(&x, &batch, 3).unwrap().to_vec2().unwrap();
        assert_eq!(sum, vec![vec![4., 6.], vec![0., 0.], vec![10., 20.]]);

        let mean: Vec<Vec<f32>> = global_mean_pool(&x, &batch, 3).unwrap().to_vec2().unwrap();
        assert_eq!(mean, vec![vec![2., 3.], vec![0., 0.], vec![10., 20.]]);
    }
}
