/// SimCLR NT-Xent contrastive loss
use candle_core::{DType, Result, Tensor};

use crate::utils::gather::{gather, ProcessGroup};
use crate::utils::misc::l2_normalize;

/// NT-Xent loss over the batches of every replica
///
/// Samples sharing a dataset index (different views of the same image) are
/// positives, every other sample is a negative.
///
/// # Arguments
/// * `z` - Projections of every local view, `[n_views * batch, dim]`
/// * `indexes` - Dataset index of each row of `z`
/// * `temperature` - Softmax temperature
pub fn simclr_loss_func(
    z: &Tensor,
    indexes: &Tensor,
    temperature: f64,
    group: &dyn ProcessGroup,
) -> Result<Tensor> {
    let z = l2_normalize(z)?;
    let gathered_z = gather(&z, group)?;

    let sim = (z.matmul(&gathered_z.t()?)? / temperature)?.exp()?;

    let indexes = indexes.to_dtype(DType::U32)?;
    let local = indexes.to_vec1::<u32>()?;
    let gathered = gather(&indexes, group)?.to_vec1::<u32>()?;

    let n = local.len();
    let total = gathered.len();
    let offset = n * group.rank();

    let mut pos = vec![0f32; n * total];
    let mut neg = vec![0f32; n * total];
    for (i, a) in local.iter().enumerate() {
        for (j, b) in gathered.iter().enumerate() {
            if a == b {
                // a sample is not its own positive
                if j != offset + i {
                    pos[i * total + j] = 1.0;
                }
            } else {
                neg[i * total + j] = 1.0;
            }
        }
    }

    let pos_mask = Tensor::from_vec(pos, (n, total), z.device())?.to_dtype(sim.dtype())?;
    let neg_mask = Tensor::from_vec(neg, (n, total), z.device())?.to_dtype(sim.dtype())?;

    let pos = (&sim * pos_mask)?.sum(1)?;
    let neg = (&sim * neg_mask)?.sum(1)?;

    (&pos / (&pos + neg)?)?.log()?.mean_all()?.neg()
}
