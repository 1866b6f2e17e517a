/// VICReg variance-invariance-covariance loss
use candle_core::{Result, Tensor};

use crate::utils::gather::{gather, ProcessGroup};
use crate::utils::misc::off_diagonal_mask;

const VAR_EPS: f64 = 1e-4;

/// Mean squared distance between the two views
pub fn invariance_loss(z1: &Tensor, z2: &Tensor) -> Result<Tensor> {
    (z1 - z2)?.sqr()?.mean_all()
}

fn centered(z: &Tensor) -> Result<Tensor> {
    z.broadcast_sub(&z.mean_keepdim(0)?)
}

/// Hinge keeping the per-feature standard deviation above 1
pub fn variance_loss(z1: &Tensor, z2: &Tensor) -> Result<Tensor> {
    let hinge = |z: &Tensor| -> Result<Tensor> {
        let n = z.dim(0)?;
        let var = (centered(z)?.sqr()?.sum(0)? / (n - 1) as f64)?;
        let std = (var + VAR_EPS)?.sqrt()?;
        std.affine(-1.0, 1.0)?.relu()?.mean_all()
    };
    hinge(z1)? + hinge(z2)?
}

/// Sum of squared off-diagonal covariances, divided by the dimension
pub fn covariance_loss(z1: &Tensor, z2: &Tensor) -> Result<Tensor> {
    let off_diag = |z: &Tensor| -> Result<Tensor> {
        let (n, d) = z.dims2()?;
        let zc = centered(z)?;
        let cov = (zc.t()?.matmul(&zc)? / (n - 1) as f64)?;
        let mask = off_diagonal_mask(d, cov.dtype(), cov.device())?;
        (cov.sqr()? * mask)?.sum_all()? / d as f64
    };
    off_diag(z1)? + off_diag(z2)?
}

/// VICReg loss
///
/// The invariance term uses the local batch; variance and covariance terms
/// use the batches of every replica.
pub fn vicreg_loss_func(
    z1: &Tensor,
    z2: &Tensor,
    sim_loss_weight: f64,
    var_loss_weight: f64,
    cov_loss_weight: f64,
    group: &dyn ProcessGroup,
) -> Result<Tensor> {
    let sim_loss = invariance_loss(z1, z2)?;

    let z1 = gather(z1, group)?;
    let z2 = gather(z2, group)?;

    let var_loss = variance_loss(&z1, &z2)?;
    let cov_loss = covariance_loss(&z1, &z2)?;

    ((sim_loss * sim_loss_weight)? + (var_loss * var_loss_weight)?)? + (cov_loss * cov_loss_weight)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::gather::SingleProcess;
    use candle_core::Device;

    #[test]
    fn test_variance_hinge() -> Result<()> {
        let device = Device::Cpu;
        // constant features collapse: std ~ sqrt(1e-4) = 0.01
        let collapsed = Tensor::ones((16, 4), candle_core::DType::F32, &device)?;
        let v = variance_loss(&collapsed, &collapsed)?.to_scalar::<f32>()?;
        assert!((v - 1.98).abs() < 1e-3, "variance loss {v}");

        // wide features are not penalized
        let wide = (Tensor::randn(0f32, 1.0, (512, 4), &device)? * 10.0)?;
        let v = variance_loss(&wide, &wide)?.to_scalar::<f32>()?;
        assert!(v < 1e-3);

        Ok(())
    }

    #[test]
    fn test_covariance_penalizes_correlation() -> Result<()> {
        let device = Device::Cpu;
        let a = Tensor::randn(0f32, 1.0, (256, 1), &device)?;
        let correlated = Tensor::cat(&[&a, &a], 1)?;
        let independent = Tensor::randn(0f32, 1.0, (256, 2), &device)?;

        let c = covariance_loss(&correlated, &correlated)?.to_scalar::<f32>()?;
        let i = covariance_loss(&independent, &independent)?.to_scalar::<f32>()?;
        assert!(c > i, "correlated {c} independent {i}");

        Ok(())
    }

    #[test]
    fn test_vicreg_total() -> Result<()> {
        let device = Device::Cpu;
        let z1 = Tensor::randn(0f32, 1.0, (32, 8), &device)?;
        let z2 = Tensor::randn(0f32, 1.0, (32, 8), &device)?;

        let total = vicreg_loss_func(&z1, &z2, 25.0, 25.0, 1.0, &SingleProcess)?.to_scalar::<f32>()?;
        let expected = 25.0 * invariance_loss(&z1, &z2)?.to_scalar::<f32>()?
            + 25.0 * variance_loss(&z1, &z2)?.to_scalar::<f32>()?
            + covariance_loss(&z1, &z2)?.to_scalar::<f32>()?;
        assert!((total - expected).abs() < 1e-3);

        Ok(())
    }
}
