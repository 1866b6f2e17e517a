/// SwAV swapped-prediction loss
use candle_core::{Result, Tensor, D};
use candle_nn::ops::log_softmax;

/// Predict the cluster assignment of one view from the prototype scores of another
///
/// Averages `-mean(sum(q_v1 * log_softmax(p_v2 / T)))` over every view `v1`
/// with an assignment and every other view `v2`.
///
/// # Arguments
/// * `preds` - Prototype scores of every view
/// * `assignments` - Sinkhorn-Knopp assignments of the large views
/// * `temperature` - Softmax temperature
pub fn swav_loss_func(preds: &[Tensor], assignments: &[Tensor], temperature: f64) -> Result<Tensor> {
    let mut losses = Vec::new();

    for (v1, a) in assignments.iter().enumerate() {
        for (v2, p) in preds.iter().enumerate() {
            if v1 == v2 {
                continue;
            }
            let log_p = log_softmax(&(p / temperature)?, D::Minus1)?;
            let loss = (a.detach() * log_p)?.sum(1)?.mean_all()?.neg()?;
            losses.push(loss);
        }
    }

    if losses.is_empty() {
        candle_core::bail!("swav loss needs at least two views");
    }
    let n = losses.len() as f64;
    Tensor::stack(&losses, 0)?.sum_all()? / n
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::ops::softmax;

    #[test]
    fn test_consistent_predictions_score_lower() -> Result<()> {
        let device = Device::Cpu;
        let p1 = (Tensor::randn(0f32, 1.0, (8, 10), &device)? * 5.0)?;
        let p2 = (Tensor::randn(0f32, 1.0, (8, 10), &device)? * 5.0)?;
        let q1 = softmax(&p1, D::Minus1)?;
        let q2 = softmax(&p2, D::Minus1)?;

        // the swapped prediction of each view matches the other view's assignment
        let consistent = swav_loss_func(&[p1.clone(), p2.clone()], &[q2.clone(), q1.clone()], 1.0)?
            .to_scalar::<f32>()?;
        let mismatched = swav_loss_func(&[p1, p2], &[q1, q2], 1.0)?.to_scalar::<f32>()?;

        assert!(consistent < mismatched, "consistent {consistent} mismatched {mismatched}");

        Ok(())
    }

    #[test]
    fn test_single_view_fails() -> Result<()> {
        let device = Device::Cpu;
        let p = Tensor::randn(0f32, 1.0, (4, 3), &device)?;
        assert!(swav_loss_func(&[p.clone()], &[p], 0.1).is_err());
        Ok(())
    }
}
