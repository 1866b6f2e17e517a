/// Sinkhorn-Knopp soft cluster assignment
///
/// Turns prototype scores into a (near) doubly-stochastic assignment matrix
/// so that every prototype is selected equally often across the batch.
use candle_core::{Result, Tensor};
use std::sync::Arc;

use super::gather::{ProcessGroup, SingleProcess};

pub struct SinkhornKnopp {
    num_iters: usize,
    epsilon: f64,
    group: Arc<dyn ProcessGroup>,
}

impl Default for SinkhornKnopp {
    fn default() -> Self {
        Self::new(3, 0.05)
    }
}

impl SinkhornKnopp {
    /// # Arguments
    /// * `num_iters` - Number of row/column normalization rounds
    /// * `epsilon` - Entropic regularization; smaller values give sharper assignments
    pub fn new(num_iters: usize, epsilon: f64) -> Self {
        Self {
            num_iters,
            epsilon,
            group: Arc::new(SingleProcess),
        }
    }

    /// Normalize over the batches of every replica in `group`
    pub fn with_group(mut self, group: Arc<dyn ProcessGroup>) -> Self {
        self.group = group;
        self
    }

    pub fn num_iters(&self) -> usize {
        self.num_iters
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    /// Compute assignments for scores `q` of shape `[batch, num_prototypes]`
    ///
    /// Returns a `[batch, num_prototypes]` matrix whose rows sum to 1. The
    /// computation runs on detached scores in f32.
    pub fn forward(&self, q: &Tensor) -> Result<Tensor> {
        let dtype = q.dtype();
        let q = q.detach().to_dtype(candle_core::DType::F32)?;

        // [K, B]
        let mut q = (q / self.epsilon)?.exp()?.t()?.contiguous()?;
        let (k, b) = q.dims2()?;
        let b_total = (b * self.group.world_size()) as f64;

        let sum_q = self.group.all_reduce_sum(&q.sum_all()?)?;
        q = q.broadcast_div(&sum_q)?;

        for _ in 0..self.num_iters {
            // each prototype gets total weight 1/K
            let sum_of_rows = self.group.all_reduce_sum(&q.sum_keepdim(1)?)?;
            q = (q.broadcast_div(&sum_of_rows)? / k as f64)?;

            // each sample gets total weight 1/B
            let sum_of_cols = q.sum_keepdim(0)?;
            q = (q.broadcast_div(&sum_of_cols)? / b_total)?;
        }

        // columns sum to 1 so each sample's assignment is a distribution
        (q * b_total)?.t()?.contiguous()?.to_dtype(dtype)
    }
}
