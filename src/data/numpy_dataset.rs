/// Feature datasets stored as NumPy .npy files
///
/// A dataset directory holds `inputs.npy` (f32, `[N, D]`), `labels.npy`
/// (i64, `[N]`) and an optional `dataset.json` with metadata.
use candle_core::{DType, Device, Result, Tensor};
use ndarray::{Array1, Array2, Axis};
use ndarray_npy::{ReadNpyExt, WriteNpyExt};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use super::augment::FullTransformPipeline;
use super::{Batch, ViewLoader};

/// Metadata from dataset.json
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct DatasetMetadata {
    pub num_classes: usize,
    pub feature_dim: usize,
    #[serde(default)]
    pub num_examples: usize,
    #[serde(default)]
    pub description: String,
}

/// Labelled feature vectors
#[derive(Clone)]
pub struct FeatureDataset {
    inputs: Array2<f32>,
    labels: Array1<i64>,
    metadata: DatasetMetadata,
}

impl FeatureDataset {
    pub fn from_arrays(inputs: Array2<f32>, labels: Array1<i64>) -> crate::Result<Self> {
        if inputs.nrows() != labels.len() {
            return Err(crate::SoloError::Config(format!(
                "Shape mismatch: {} inputs != {} labels",
                inputs.nrows(),
                labels.len()
            )));
        }
        if labels.iter().any(|&l| l < 0) {
            return Err(crate::SoloError::Config("labels must be non-negative".to_string()));
        }

        let num_classes = labels.iter().max().map(|&m| m as usize + 1).unwrap_or(0);
        let metadata = DatasetMetadata {
            num_classes,
            feature_dim: inputs.ncols(),
            num_examples: inputs.nrows(),
            description: String::new(),
        };

        Ok(Self {
            inputs,
            labels,
            metadata,
        })
    }

    /// Load from a directory containing .npy files and dataset.json
    pub fn from_directory<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let dir = path.as_ref();

        log::info!("Loading feature dataset from: {:?}", dir);

        let inputs = Array2::<f32>::read_npy(File::open(dir.join("inputs.npy"))?)?;
        let labels = Array1::<i64>::read_npy(File::open(dir.join("labels.npy"))?)?;
        let mut dataset = Self::from_arrays(inputs, labels)?;

        let metadata_path = dir.join("dataset.json");
        if metadata_path.exists() {
            let reader = BufReader::new(File::open(&metadata_path)?);
            let metadata: DatasetMetadata = serde_json::from_reader(reader)?;
            if metadata.feature_dim != dataset.feature_dim() {
                return Err(crate::SoloError::Config(format!(
                    "dataset.json declares feature_dim {} but inputs have {}",
                    metadata.feature_dim,
                    dataset.feature_dim()
                )));
            }
            // declared classes may exceed the labels present in a split
            dataset.metadata.num_classes = metadata.num_classes.max(dataset.metadata.num_classes);
            dataset.metadata.description = metadata.description;
        } else {
            log::warn!("dataset.json not found, inferring metadata from labels");
        }

        log::info!(
            "Dataset loaded: {} examples, feature_dim={}, num_classes={}",
            dataset.len(),
            dataset.feature_dim(),
            dataset.num_classes()
        );

        Ok(dataset)
    }

    /// Write the dataset in the layout read by `from_directory`
    pub fn save_to_directory<P: AsRef<Path>>(&self, path: P) -> crate::Result<()> {
        let dir = path.as_ref();
        std::fs::create_dir_all(dir)?;

        self.inputs
            .write_npy(BufWriter::new(File::create(dir.join("inputs.npy"))?))
            .map_err(|e| crate::SoloError::Config(format!("Failed to write inputs.npy: {e}")))?;
        self.labels
            .write_npy(BufWriter::new(File::create(dir.join("labels.npy"))?))
            .map_err(|e| crate::SoloError::Config(format!("Failed to write labels.npy: {e}")))?;
        std::fs::write(
            dir.join("dataset.json"),
            serde_json::to_string_pretty(&self.metadata)?,
        )?;

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inputs.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.nrows() == 0
    }

    pub fn feature_dim(&self) -> usize {
        self.inputs.ncols()
    }

    pub fn num_classes(&self) -> usize {
        self.metadata.num_classes
    }

    pub fn metadata(&self) -> &DatasetMetadata {
        &self.metadata
    }

    /// Rows `indices` as an `[n, D]` tensor and their labels as u32
    pub fn gather(&self, indices: &[usize], device: &Device) -> Result<(Tensor, Tensor)> {
        let inputs = self.inputs.select(Axis(0), indices);
        let (rows, cols) = inputs.dim();
        let inputs = Tensor::from_iter(inputs.iter().copied(), device)?.reshape((rows, cols))?;

        let labels: Vec<u32> = indices.iter().map(|&i| self.labels[i] as u32).collect();
        let labels = Tensor::from_vec(labels, rows, device)?;

        Ok((inputs, labels))
    }
}

/// Batches a `FeatureDataset`, optionally producing augmented views
pub struct FeatureLoader {
    dataset: FeatureDataset,
    batch_size: usize,
    shuffle: bool,
    drop_last: bool,
    transform: Option<FullTransformPipeline>,
    current_idx: usize,
    indices: Vec<usize>,
}

impl FeatureLoader {
    pub fn new(dataset: FeatureDataset, batch_size: usize, shuffle: bool, drop_last: bool) -> Self {
        let mut indices: Vec<usize> = (0..dataset.len()).collect();
        if shuffle {
            indices.shuffle(&mut rand::thread_rng());
        }

        Self {
            dataset,
            batch_size: batch_size.max(1),
            shuffle,
            drop_last,
            transform: None,
            current_idx: 0,
            indices,
        }
    }

    /// Produce augmented views instead of the raw batch
    pub fn with_transform(mut self, transform: FullTransformPipeline) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn dataset(&self) -> &FeatureDataset {
        &self.dataset
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

impl ViewLoader for FeatureLoader {
    fn next_batch(&mut self, device: &Device) -> Result<Option<Batch>> {
        let remaining = self.indices.len().saturating_sub(self.current_idx);
        if remaining == 0 || (self.drop_last && remaining < self.batch_size) {
            return Ok(None);
        }

        let end_idx = (self.current_idx + self.batch_size).min(self.indices.len());
        let batch_indices = &self.indices[self.current_idx..end_idx];
        let (inputs, targets) = self.dataset.gather(batch_indices, device)?;
        let indexes: Vec<u32> = batch_indices.iter().map(|&i| i as u32).collect();
        let indexes = Tensor::from_vec(indexes, batch_indices.len(), device)?;
        self.current_idx = end_idx;

        let views = match &self.transform {
            Some(transform) => transform.apply(&inputs)?,
            None => vec![inputs.to_dtype(DType::F32)?],
        };

        Ok(Some(Batch {
            indexes,
            views,
            targets: Some(targets),
        }))
    }

    fn reset(&mut self) {
        self.current_idx = 0;
        if self.shuffle {
            self.indices.shuffle(&mut rand::thread_rng());
        }
    }

    fn num_batches(&self) -> usize {
        if self.drop_last {
            self.dataset.len() / self.batch_size
        } else {
            self.dataset.len().div_ceil(self.batch_size)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::augment::AugmentationConfig;

    fn toy_dataset(n: usize, d: usize) -> FeatureDataset {
        let inputs = Array2::from_shape_fn((n, d), |(i, j)| (i * d + j) as f32);
        let labels = Array1::from_shape_fn(n, |i| (i % 3) as i64);
        FeatureDataset::from_arrays(inputs, labels).unwrap()
    }

    #[test]
    fn test_metadata_deserialization() {
        let json = r#"{
            "num_classes": 10,
            "feature_dim": 128,
            "num_examples": 50000,
            "description": "cifar10 features"
        }"#;

        let metadata: DatasetMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(metadata.num_classes, 10);
        assert_eq!(metadata.feature_dim, 128);
        assert_eq!(metadata.num_examples, 50000);
    }

    #[test]
    fn test_inferred_metadata() {
        let dataset = toy_dataset(7, 4);
        assert_eq!(dataset.len(), 7);
        assert_eq!(dataset.feature_dim(), 4);
        assert_eq!(dataset.num_classes(), 3);
    }

    #[test]
    fn test_mismatched_arrays() {
        let inputs = Array2::<f32>::zeros((4, 2));
        let labels = Array1::<i64>::zeros(3);
        assert!(FeatureDataset::from_arrays(inputs, labels).is_err());
    }

    #[test]
    fn test_directory_roundtrip() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        toy_dataset(5, 3).save_to_directory(dir.path())?;

        let loaded = FeatureDataset::from_directory(dir.path())?;
        assert_eq!(loaded.len(), 5);
        assert_eq!(loaded.feature_dim(), 3);
        assert_eq!(loaded.num_classes(), 3);

        Ok(())
    }

    #[test]
    fn test_loader_drop_last() -> Result<()> {
        let device = Device::Cpu;
        let mut loader = FeatureLoader::new(toy_dataset(10, 4), 4, false, true);
        assert_eq!(loader.num_batches(), 2);

        let mut seen = 0;
        while let Some(batch) = loader.next_batch(&device)? {
            assert_eq!(batch.views.len(), 1);
            assert_eq!(batch.views[0].dims(), &[4, 4]);
            seen += 1;
        }
        assert_eq!(seen, 2);

        loader.reset();
        assert!(loader.next_batch(&device)?.is_some());

        Ok(())
    }

    #[test]
    fn test_loader_keeps_partial_batch() -> Result<()> {
        let device = Device::Cpu;
        let mut loader = FeatureLoader::new(toy_dataset(10, 4), 4, false, false);
        assert_eq!(loader.num_batches(), 3);

        let mut sizes = Vec::new();
        while let Some(batch) = loader.next_batch(&device)? {
            sizes.push(batch.batch_size()?);
        }
        assert_eq!(sizes, vec![4, 4, 2]);

        Ok(())
    }

    #[test]
    fn test_loader_views_and_targets() -> Result<()> {
        let device = Device::Cpu;
        let transform = FullTransformPipeline::from_configs(&[AugmentationConfig::default()])?;
        let mut loader = FeatureLoader::new(toy_dataset(6, 4), 3, true, true).with_transform(transform);

        let batch = loader.next_batch(&device)?.unwrap();
        assert_eq!(batch.views.len(), 2);

        let indexes = batch.indexes.to_vec1::<u32>()?;
        let targets = batch.targets.unwrap().to_vec1::<u32>()?;
        for (i, t) in indexes.iter().zip(targets.iter()) {
            assert_eq!(*t, i % 3);
        }

        Ok(())
    }
}
