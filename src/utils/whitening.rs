/// Feature whitening (decorrelation) through the inverse Cholesky factor
use candle_core::{DType, Device, Result, Tensor};

use super::misc::eye;

/// Whitening transform for `[batch, num_features]` embeddings
///
/// In training mode the batch statistics are used and, when tracked, folded
/// into running estimates; in eval mode the running estimates are used.
pub struct Whitening2d {
    num_features: usize,
    momentum: f64,
    track_running_stats: bool,
    eps: f64,
    running_mean: Tensor,
    running_variance: Tensor,
}

impl Whitening2d {
    /// # Arguments
    /// * `num_features` - Embedding dimension
    /// * `momentum` - Weight of the batch statistics in the running estimates
    /// * `track_running_stats` - Keep running mean/covariance for eval mode
    /// * `eps` - Shrinkage of the covariance towards the identity
    pub fn new(
        num_features: usize,
        momentum: f64,
        track_running_stats: bool,
        eps: f64,
        device: &Device,
    ) -> Result<Self> {
        Ok(Self {
            num_features,
            momentum,
            track_running_stats,
            eps,
            running_mean: Tensor::zeros((1, num_features), DType::F32, device)?,
            running_variance: eye(num_features, DType::F32, device)?,
        })
    }

    pub fn with_defaults(num_features: usize, device: &Device) -> Result<Self> {
        Self::new(num_features, 0.01, true, 0.0, device)
    }

    pub fn running_mean(&self) -> &Tensor {
        &self.running_mean
    }

    pub fn running_variance(&self) -> &Tensor {
        &self.running_variance
    }

    /// Whiten `x`
    ///
    /// In training mode the whitening matrix is built from the batch
    /// covariance with tensor ops, so gradients flow through it as well as
    /// through the centering.
    pub fn forward(&mut self, x: &Tensor, train: bool) -> Result<Tensor> {
        let (n, d) = x.dims2()?;
        if d != self.num_features {
            candle_core::bail!("expected {} features, got {}", self.num_features, d);
        }
        let use_batch_stats = train || !self.track_running_stats;
        if use_batch_stats && n < 2 {
            candle_core::bail!("whitening needs at least 2 samples in training mode, got {n}");
        }

        let dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;

        let mean = if use_batch_stats {
            x.mean_keepdim(0)?
        } else {
            self.running_mean.clone()
        };
        let xn = x.broadcast_sub(&mean)?;

        let f_cov = if use_batch_stats {
            (xn.t()?.matmul(&xn)? / (n - 1) as f64)?
        } else {
            self.running_variance.clone()
        };

        let identity = eye(d, DType::F32, x.device())?;
        let shrunk = ((&f_cov * (1.0 - self.eps))? + (identity * self.eps)?)?;
        let inv_sqrt = inverse_cholesky(&shrunk)?;

        let decorrelated = xn.matmul(&inv_sqrt.t()?)?;

        if train && self.track_running_stats {
            self.running_mean = ((&self.running_mean * (1.0 - self.momentum))?
                + (mean.detach() * self.momentum)?)?;
            self.running_variance = ((f_cov.detach() * self.momentum)?
                + (&self.running_variance * (1.0 - self.momentum))?)?;
        }

        decorrelated.to_dtype(dtype)
    }

    /// Replace the running estimates, e.g. when restoring a checkpoint
    pub fn set_running_stats(&mut self, mean: &Tensor, variance: &Tensor) -> Result<()> {
        let d = self.num_features;
        if mean.dims() != [1, d] || variance.dims() != [d, d] {
            candle_core::bail!(
                "running stats of shape {:?}/{:?} do not match {d} features",
                mean.dims(),
                variance.dims()
            );
        }
        let device = self.running_mean.device().clone();
        self.running_mean = mean.to_dtype(DType::F32)?.to_device(&device)?;
        self.running_variance = variance.to_dtype(DType::F32)?.to_device(&device)?;
        Ok(())
    }
}

/// Inverse of the lower Cholesky factor of a symmetric positive-definite matrix
pub fn inverse_cholesky(cov: &Tensor) -> Result<Tensor> {
    invert_lower_triangular(&cholesky(cov)?)
}

/// Lower Cholesky factor, assembled column by column
pub fn cholesky(a: &Tensor) -> Result<Tensor> {
    let (n, m) = a.dims2()?;
    if n != m {
        candle_core::bail!("covariance must be square, got {n}x{m}");
    }
    let a = a.to_dtype(DType::F32)?;

    let mut columns: Vec<Tensor> = Vec::with_capacity(n);
    for j in 0..n {
        // v = A[:, j] - L[:, :j] L[j, :j]^T
        let mut v = a.narrow(1, j, 1)?;
        if j > 0 {
            let l = Tensor::cat(&columns, 1)?;
            let row = l.narrow(0, j, 1)?;
            v = (v - l.matmul(&row.t()?)?)?;
        }

        let pivot = v.narrow(0, j, 1)?;
        let value = pivot.reshape(())?.to_scalar::<f32>()?;
        if value <= 0.0 || !value.is_finite() {
            candle_core::bail!("covariance is not positive definite (pivot {j} = {value})");
        }

        let below = v.narrow(0, j, n - j)?.broadcast_div(&pivot.sqrt()?)?;
        let column = if j == 0 {
            below
        } else {
            Tensor::cat(&[Tensor::zeros((j, 1), DType::F32, a.device())?, below], 0)?
        };
        columns.push(column);
    }

    Tensor::cat(&columns, 1)
}

fn invert_lower_triangular(l: &Tensor) -> Result<Tensor> {
    let n = l.dim(0)?;
    let identity = eye(n, DType::F32, l.device())?;

    // forward substitution, one row of the inverse at a time
    let mut rows: Vec<Tensor> = Vec::with_capacity(n);
    for i in 0..n {
        let l_row = l.narrow(0, i, 1)?;
        let mut r = identity.narrow(0, i, 1)?;
        if i > 0 {
            let solved = Tensor::cat(&rows, 0)?;
            r = (r - l_row.narrow(1, 0, i)?.matmul(&solved)?)?;
        }
        rows.push(r.broadcast_div(&l_row.narrow(1, i, 1)?)?);
    }

    Tensor::cat(&rows, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn covariance(x: &Tensor) -> Result<Vec<Vec<f32>>> {
        let n = x.dim(0)?;
        let xc = x.broadcast_sub(&x.mean_keepdim(0)?)?;
        (xc.t()?.matmul(&xc)? / (n - 1) as f64)?.to_vec2::<f32>()
    }

    #[test]
    fn test_whitened_covariance_is_identity() -> Result<()> {
        let device = Device::Cpu;
        // correlated features
        let base = Tensor::randn(0f32, 1.0, (256, 4), &device)?;
        let mix = Tensor::new(
            &[
                [1.0f32, 0.5, 0.0, 0.0],
                [0.0, 1.0, 0.3, 0.0],
                [0.0, 0.0, 2.0, 0.1],
                [0.0, 0.0, 0.0, 0.5],
            ],
            &device,
        )?;
        let x = base.matmul(&mix)?;

        let mut whitening = Whitening2d::with_defaults(4, &device)?;
        let out = whitening.forward(&x, true)?;

        let cov = covariance(&out)?;
        for (i, row) in cov.iter().enumerate() {
            for (j, v) in row.iter().enumerate() {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((v - expected).abs() < 1e-3, "cov[{i}][{j}] = {v}");
            }
        }

        Ok(())
    }

    #[test]
    fn test_running_stats_update() -> Result<()> {
        let device = Device::Cpu;
        let x = (Tensor::randn(0f32, 1.0, (64, 3), &device)? + 5.0)?;

        let mut whitening = Whitening2d::new(3, 0.5, true, 0.0, &device)?;
        whitening.forward(&x, true)?;

        // half-way from 0 towards the batch mean of ~5
        let running = whitening.running_mean().mean_all()?.to_scalar::<f32>()?;
        assert!((running - 2.5).abs() < 0.5, "running mean {running}");

        // eval mode uses the running estimates and does not touch them
        whitening.forward(&x, false)?;
        let after = whitening.running_mean().mean_all()?.to_scalar::<f32>()?;
        assert!((after - running).abs() < 1e-6);

        Ok(())
    }

    #[test]
    fn test_singular_covariance_fails() -> Result<()> {
        let device = Device::Cpu;
        // identical samples have zero covariance
        let x = Tensor::ones((3, 8), DType::F32, &device)?;
        let mut whitening = Whitening2d::with_defaults(8, &device)?;

        assert!(whitening.forward(&x, true).is_err());

        Ok(())
    }

    #[test]
    fn test_shrinkage_regularizes() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (3, 8), &device)?;
        let mut whitening = Whitening2d::new(8, 0.01, true, 0.5, &device)?;

        let out = whitening.forward(&x, true)?;
        assert_eq!(out.dims(), &[3, 8]);

        Ok(())
    }

    #[test]
    fn test_inverse_cholesky_diagonal() -> Result<()> {
        let device = Device::Cpu;
        let cov = Tensor::new(&[[4.0f32, 0.0], [0.0, 9.0]], &device)?;
        let w = inverse_cholesky(&cov)?.to_vec2::<f32>()?;

        assert!((w[0][0] - 0.5).abs() < 1e-6);
        assert!((w[1][1] - 1.0 / 3.0).abs() < 1e-6);
        assert!(w[0][1].abs() < 1e-6 && w[1][0].abs() < 1e-6);

        Ok(())
    }

    #[test]
    fn test_inverse_cholesky_whitens_dense_matrix() -> Result<()> {
        let device = Device::Cpu;
        let a = Tensor::new(&[[4.0f32, 2.0, 0.4], [2.0, 3.0, 0.5], [0.4, 0.5, 1.0]], &device)?;

        let l = cholesky(&a)?;
        let rebuilt = l.matmul(&l.t()?)?.to_vec2::<f32>()?;
        let w = inverse_cholesky(&a)?;
        let whitened = w.matmul(&a)?.matmul(&w.t()?)?.to_vec2::<f32>()?;
        let expected = a.to_vec2::<f32>()?;

        for i in 0..3 {
            for j in 0..3 {
                assert!((rebuilt[i][j] - expected[i][j]).abs() < 1e-5);
                let identity = if i == j { 1.0 } else { 0.0 };
                assert!((whitened[i][j] - identity).abs() < 1e-5, "W A W^T[{i}][{j}] = {}", whitened[i][j]);
            }
        }

        Ok(())
    }

    #[test]
    fn test_gradient_flows_through_whitening_matrix() -> Result<()> {
        let device = Device::Cpu;
        let x = candle_core::Var::randn(0f32, 1.0, (16, 3), &device)?;
        let mut whitening = Whitening2d::with_defaults(3, &device)?;

        // whitened batches have a fixed total energy of (n - 1) * d, so the
        // gradient vanishes once it is taken through the whitening matrix
        let loss = whitening.forward(x.as_tensor(), true)?.sqr()?.sum_all()?;
        let value = loss.to_scalar::<f32>()?;
        assert!((value - 45.0).abs() < 1e-2, "loss {value}");

        let grads = loss.backward()?;
        let grad = grads.get(x.as_tensor()).expect("gradient for the input");
        let total = grad.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert!(total < 1e-2, "gradient mass {total}");

        Ok(())
    }
}
