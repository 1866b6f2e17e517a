/// Barlow Twins redundancy-reduction loss
use candle_core::{Result, Tensor};

use crate::utils::gather::{all_reduce_sum, ProcessGroup};
use crate::utils::misc::eye;

const BN_EPS: f64 = 1e-5;

/// Per-feature standardization over the batch (batch norm without affine)
fn standardize(z: &Tensor) -> Result<Tensor> {
    let mean = z.mean_keepdim(0)?;
    let centered = z.broadcast_sub(&mean)?;
    let var = centered.sqr()?.mean_keepdim(0)?;
    centered.broadcast_div(&(var + BN_EPS)?.sqrt()?)
}

/// Barlow Twins loss
///
/// Pushes the cross-correlation matrix of the standardized embeddings towards
/// the identity: on-diagonal terms to 1 (invariance), off-diagonal terms
/// (weighted by `lamb`) to 0 (redundancy reduction).
///
/// # Arguments
/// * `z1`, `z2` - Projections of two views, `[batch, dim]`
/// * `lamb` - Off-diagonal weight
/// * `scale_loss` - Final scale of the loss
pub fn barlow_loss_func(
    z1: &Tensor,
    z2: &Tensor,
    lamb: f64,
    scale_loss: f64,
    group: &dyn ProcessGroup,
) -> Result<Tensor> {
    let (n, d) = z1.dims2()?;

    let z1 = standardize(z1)?;
    let z2 = standardize(z2)?;

    let corr = (z1.t()?.matmul(&z2)? / n as f64)?;
    let corr = (all_reduce_sum(&corr, group)? / group.world_size() as f64)?;

    let identity = eye(d, corr.dtype(), corr.device())?;
    let c_diff = (corr - &identity)?.sqr()?;
    // 1 on the diagonal, lamb elsewhere
    let weights = identity.affine(1.0 - lamb, lamb)?;

    (c_diff * weights)?.sum_all()? * scale_loss
}
