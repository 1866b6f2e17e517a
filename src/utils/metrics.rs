/// Classification metrics
use candle_core::{DType, Result, Tensor};
use std::collections::HashMap;

/// Top-k accuracy in percent for each `k` in `top_k`
///
/// # Arguments
/// * `outputs` - Scores of shape `[batch, num_classes]`
/// * `targets` - Class indices of shape `[batch]`
pub fn accuracy_at_k(outputs: &Tensor, targets: &Tensor, top_k: &[usize]) -> Result<Vec<f64>> {
    let scores = outputs.detach().to_dtype(DType::F32)?.to_vec2::<f32>()?;
    let targets = targets.to_dtype(DType::U32)?.to_vec1::<u32>()?;
    if scores.len() != targets.len() {
        candle_core::bail!(
            "accuracy_at_k: {} outputs but {} targets",
            scores.len(),
            targets.len()
        );
    }
    if scores.is_empty() {
        return Ok(vec![0.0; top_k.len()]);
    }

    // rank of the target = number of classes scored strictly higher
    let mut ranks = Vec::with_capacity(scores.len());
    for (row, &target) in scores.iter().zip(targets.iter()) {
        let Some(&target_score) = row.get(target as usize) else {
            candle_core::bail!("accuracy_at_k: target {} out of range for {} classes", target, row.len());
        };
        ranks.push(row.iter().filter(|&&s| s > target_score).count());
    }

    let batch_size = ranks.len() as f64;
    Ok(top_k
        .iter()
        .map(|&k| {
            let correct = ranks.iter().filter(|&&rank| rank < k).count() as f64;
            correct * 100.0 / batch_size
        })
        .collect())
}

/// Mean of `key` over step outputs, weighted by `batch_size_key`
pub fn weighted_mean(outputs: &[HashMap<String, f64>], key: &str, batch_size_key: &str) -> f64 {
    let mut value = 0.0;
    let mut n = 0.0;
    for out in outputs {
        let (Some(v), Some(bs)) = (out.get(key), out.get(batch_size_key)) else {
            continue;
        };
        value += v * bs;
        n += bs;
    }
    if n == 0.0 {
        0.0
    } else {
        value / n
    }
}
