/// BYOL prediction loss
use candle_core::{Result, Tensor};

use crate::utils::misc::cosine_similarity;

/// Negative cosine similarity between online predictions and momentum targets
///
/// `2 - 2 * cos(p, z)` averaged over the batch. `z` is treated as a constant.
pub fn byol_loss_func(p: &Tensor, z: &Tensor) -> Result<Tensor> {
    let cos = cosine_similarity(p, &z.detach())?.mean_all()?;
    cos.affine(-2.0, 2.0)
}
