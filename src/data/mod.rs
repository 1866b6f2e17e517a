/// Data loading for self-supervised pretraining
pub mod augment;
pub mod numpy_dataset;

pub use augment::{AugmentationConfig, FullTransformPipeline, NCropAugmentation, NoiseAugmentation};
pub use numpy_dataset::{DatasetMetadata, FeatureDataset, FeatureLoader};

use candle_core::{Device, Result, Tensor};

/// A batch of augmented views of the same samples
#[derive(Debug, Clone)]
pub struct Batch {
    /// Dataset index of every sample, u32 `[batch]`
    pub indexes: Tensor,
    /// One `[batch, dim]` tensor per view, large crops first
    pub views: Vec<Tensor>,
    /// Class labels, u32 `[batch]`
    pub targets: Option<Tensor>,
}

impl Batch {
    pub fn batch_size(&self) -> Result<usize> {
        self.indexes.dim(0)
    }
}

/// Source of view batches
pub trait ViewLoader {
    /// Get the next batch, `None` at the end of the epoch
    fn next_batch(&mut self, device: &Device) -> Result<Option<Batch>>;

    /// Reset loader for new epoch
    fn reset(&mut self);

    fn num_batches(&self) -> usize;
}
