/// Cross-replica gathering for contrastive losses
///
/// Data-parallel replicas each compute features for their shard of the
/// batch. Contrastive objectives need negatives from every replica, so the
/// feature batches are gathered before the loss.
use candle_core::{Result, Tensor};
use std::sync::{Arc, Barrier, Mutex};

/// Collective communication between data-parallel replicas
///
/// Every replica must issue the same sequence of collectives.
pub trait ProcessGroup: Send + Sync {
    /// Index of this replica
    fn rank(&self) -> usize;

    /// Number of replicas
    fn world_size(&self) -> usize;

    /// Collect `tensor` from every replica, ordered by rank
    fn all_gather(&self, tensor: &Tensor) -> Result<Vec<Tensor>>;

    /// Element-wise sum of `tensor` over every replica
    fn all_reduce_sum(&self, tensor: &Tensor) -> Result<Tensor> {
        let parts = self.all_gather(tensor)?;
        let mut acc = parts[0].clone();
        for part in &parts[1..] {
            acc = (acc + part)?;
        }
        Ok(acc)
    }

    fn is_global_zero(&self) -> bool {
        self.rank() == 0
    }
}

/// Group with a single replica; every collective is the identity
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl ProcessGroup for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_gather(&self, tensor: &Tensor) -> Result<Vec<Tensor>> {
        Ok(vec![tensor.clone()])
    }

    fn all_reduce_sum(&self, tensor: &Tensor) -> Result<Tensor> {
        Ok(tensor.clone())
    }
}

struct Rendezvous {
    slots: Mutex<Vec<Option<Tensor>>>,
    barrier: Barrier,
}

/// In-process replicas, one per thread, sharing a rendezvous point
///
/// Create the whole group with [`LocalProcessGroup::new_group`] and move one
/// handle into each worker thread.
#[derive(Clone)]
pub struct LocalProcessGroup {
    rank: usize,
    world_size: usize,
    shared: Arc<Rendezvous>,
}

impl LocalProcessGroup {
    /// Create handles for `world_size` replicas
    pub fn new_group(world_size: usize) -> Vec<Self> {
        assert!(world_size > 0, "world_size must be > 0");
        let shared = Arc::new(Rendezvous {
            slots: Mutex::new(vec![None; world_size]),
            barrier: Barrier::new(world_size),
        });

        (0..world_size)
            .map(|rank| Self {
                rank,
                world_size,
                shared: shared.clone(),
            })
            .collect()
    }
}

impl ProcessGroup for LocalProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_gather(&self, tensor: &Tensor) -> Result<Vec<Tensor>> {
        {
            let mut slots = self
                .shared
                .slots
                .lock()
                .map_err(|_| candle_core::Error::Msg("process group poisoned".to_string()))?;
            slots[self.rank] = Some(tensor.detach());
        }

        // every replica has published
        self.shared.barrier.wait();

        let gathered = {
            let slots = self
                .shared
                .slots
                .lock()
                .map_err(|_| candle_core::Error::Msg("process group poisoned".to_string()))?;
            slots
                .iter()
                .enumerate()
                .map(|(rank, slot)| {
                    slot.clone().ok_or_else(|| {
                        candle_core::Error::Msg(format!("rank {rank} did not publish"))
                    })
                })
                .collect::<Result<Vec<_>>>()
        };

        // every replica has read before the next collective overwrites slots
        self.shared.barrier.wait();

        gathered
    }
}

/// Rank of this replica, 0 outside of distributed training
pub fn get_rank(group: &dyn ProcessGroup) -> usize {
    group.rank()
}

/// Gather `x` from every replica and concatenate along dim 0
///
/// The local slot keeps the autograd graph of `x`; slots from other replicas
/// are constants.
pub fn gather(x: &Tensor, group: &dyn ProcessGroup) -> Result<Tensor> {
    GatherLayer::new(group).forward(x)
}

/// Sum `x` over every replica, keeping the autograd graph of the local term
///
/// Gradients flow to the local `x` as if the reduction were the identity,
/// the contributions of other replicas are constants.
pub fn all_reduce_sum(x: &Tensor, group: &dyn ProcessGroup) -> Result<Tensor> {
    if group.world_size() == 1 {
        return Ok(x.clone());
    }
    let reduced = group.all_reduce_sum(x)?;
    x + (reduced - x.detach())?
}

/// Gather with an explicit backward pass
pub struct GatherLayer<'a> {
    group: &'a dyn ProcessGroup,
}

impl<'a> GatherLayer<'a> {
    pub fn new(group: &'a dyn ProcessGroup) -> Self {
        Self { group }
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        if self.group.world_size() == 1 {
            return Ok(x.clone());
        }

        let mut parts = self.group.all_gather(x)?;
        parts[self.group.rank()] = x.clone();
        Tensor::cat(&parts, 0)
    }

    /// Gradient of the local input given the gradient of the gathered output
    ///
    /// Sums `grad_output` over every replica and returns the rows belonging to
    /// this rank. `grad_output` must have `world_size * local_batch` rows.
    pub fn backward(&self, grad_output: &Tensor) -> Result<Tensor> {
        let world_size = self.group.world_size();
        let rows = grad_output.dim(0)?;
        if rows % world_size != 0 {
            candle_core::bail!(
                "gathered gradient has {} rows, not divisible by world size {}",
                rows,
                world_size
            );
        }

        let reduced = self.group.all_reduce_sum(grad_output)?;
        let local = rows / world_size;
        reduced.narrow(0, self.group.rank() * local, local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Var};
    use std::thread;

    #[test]
    fn test_single_process_gather_is_identity() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (4, 3), &device)?;
        let gathered = gather(&x, &SingleProcess)?;

        assert_eq!(gathered.dims(), &[4, 3]);
        let diff = (gathered - &x)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-6);

        Ok(())
    }

    #[test]
    fn test_local_group_gather_rank_order() {
        let groups = LocalProcessGroup::new_group(3);

        let handles: Vec<_> = groups
            .into_iter()
            .map(|group| {
                thread::spawn(move || -> Result<Vec<f32>> {
                    let x = Tensor::full(group.rank() as f32, (2, 1), &Device::Cpu)?;
                    gather(&x, &group)?.flatten_all()?.to_vec1::<f32>()
                })
            })
            .collect();

        for handle in handles {
            let values = handle.join().expect("worker panicked").expect("gather failed");
            assert_eq!(values, vec![0.0, 0.0, 1.0, 1.0, 2.0, 2.0]);
        }
    }

    #[test]
    fn test_local_group_all_reduce() {
        let groups = LocalProcessGroup::new_group(4);

        let handles: Vec<_> = groups
            .into_iter()
            .map(|group| {
                thread::spawn(move || -> Result<f32> {
                    let x = Tensor::full(1f32 + group.rank() as f32, 3, &Device::Cpu)?;
                    // two collectives in a row reuse the same slots
                    let _ = group.all_reduce_sum(&x)?;
                    group.all_reduce_sum(&x)?.sum_all()?.to_scalar::<f32>()
                })
            })
            .collect();

        for handle in handles {
            let total = handle.join().expect("worker panicked").expect("reduce failed");
            assert!((total - 30.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_gather_backward_returns_rank_slice() {
        let groups = LocalProcessGroup::new_group(2);

        let handles: Vec<_> = groups
            .into_iter()
            .map(|group| {
                thread::spawn(move || -> Result<(usize, Vec<f32>)> {
                    let layer = GatherLayer::new(&group);
                    // gradient of the gathered [4, 1] output on this replica
                    let grad = Tensor::new(&[[1f32], [2.0], [3.0], [4.0]], &Device::Cpu)?;
                    let local = layer.backward(&grad)?;
                    Ok((group.rank(), local.flatten_all()?.to_vec1::<f32>()?))
                })
            })
            .collect();

        for handle in handles {
            let (rank, grad) = handle.join().expect("worker panicked").expect("backward failed");
            if rank == 0 {
                assert_eq!(grad, vec![2.0, 4.0]);
            } else {
                assert_eq!(grad, vec![6.0, 8.0]);
            }
        }
    }

    #[test]
    fn test_gather_keeps_local_gradient() {
        let groups = LocalProcessGroup::new_group(2);

        let handles: Vec<_> = groups
            .into_iter()
            .map(|group| {
                thread::spawn(move || -> Result<f32> {
                    let x = Var::ones((2, 2), DType::F32, &Device::Cpu)?;
                    let gathered = gather(x.as_tensor(), &group)?;
                    let grads = gathered.sum_all()?.backward()?;
                    let grad = grads.get(&x).expect("local slot has gradient");
                    grad.sum_all()?.to_scalar::<f32>()
                })
            })
            .collect();

        for handle in handles {
            let grad_sum = handle.join().expect("worker panicked").expect("gather failed");
            assert!((grad_sum - 4.0).abs() < 1e-6);
        }
    }
}
