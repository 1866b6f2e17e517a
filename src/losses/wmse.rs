/// W-MSE loss on whitened embeddings
use candle_core::{Result, Tensor};

use crate::utils::misc::cosine_similarity;

/// MSE between normalized whitened embeddings, `2 - 2 * cos(z1, z2)`
///
/// Unlike BYOL both sides receive gradients.
pub fn wmse_loss_func(z1: &Tensor, z2: &Tensor) -> Result<Tensor> {
    cosine_similarity(z1, z2)?.mean_all()?.affine(-2.0, 2.0)
}
