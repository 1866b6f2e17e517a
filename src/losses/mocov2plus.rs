/// MoCo V2+ InfoNCE loss against a queue of negatives
use candle_core::{DType, Result, Tensor};
use candle_nn::loss::cross_entropy;

/// InfoNCE with the key as the only positive
///
/// # Arguments
/// * `query` - Normalized online projections, `[batch, dim]`
/// * `key` - Normalized momentum projections of the other view, `[batch, dim]`
/// * `queue` - Normalized negatives, `[queue_size, dim]`
/// * `temperature` - Softmax temperature
pub fn mocov2plus_loss_func(
    query: &Tensor,
    key: &Tensor,
    queue: &Tensor,
    temperature: f64,
) -> Result<Tensor> {
    let batch = query.dim(0)?;
    let pos = (query * key.detach())?.sum_keepdim(1)?;
    let neg = query.matmul(&queue.detach().t()?)?;

    let logits = (Tensor::cat(&[&pos, &neg], 1)? / temperature)?;
    // the positive is column 0
    let targets = Tensor::zeros(batch, DType::U32, query.device())?;

    cross_entropy(&logits, &targets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::misc::l2_normalize;
    use candle_core::Device;

    #[test]
    fn test_matching_key_lowers_loss() -> Result<()> {
        let device = Device::Cpu;
        let query = l2_normalize(&Tensor::randn(0f32, 1.0, (8, 16), &device)?)?;
        let queue = l2_normalize(&Tensor::randn(0f32, 1.0, (32, 16), &device)?)?;
        let random_key = l2_normalize(&Tensor::randn(0f32, 1.0, (8, 16), &device)?)?;

        let matched = mocov2plus_loss_func(&query, &query, &queue, 0.2)?.to_scalar::<f32>()?;
        let random = mocov2plus_loss_func(&query, &random_key, &queue, 0.2)?.to_scalar::<f32>()?;

        assert!(matched < random, "matched {matched} random {random}");

        Ok(())
    }
}
