/// Weighted k-NN evaluation of frozen features
use candle_core::{DType, Result, Tensor};

use super::misc::l2_normalize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Distance {
    Cosine,
    Euclidean,
}

/// k-NN classifier that votes with similarity-weighted neighbours
///
/// Features are accumulated with [`update`](Self::update) and evaluated in
/// chunks so the test x train distance matrix stays bounded.
pub struct WeightedKnnClassifier {
    k: usize,
    temperature: f64,
    max_distance_matrix_size: usize,
    distance: Distance,
    epsilon: f64,
    train_features: Vec<Tensor>,
    train_targets: Vec<Tensor>,
    test_features: Vec<Tensor>,
    test_targets: Vec<Tensor>,
}

impl Default for WeightedKnnClassifier {
    fn default() -> Self {
        Self::new(20, 0.07, Distance::Cosine)
    }
}

impl WeightedKnnClassifier {
    pub fn new(k: usize, temperature: f64, distance: Distance) -> Self {
        Self {
            k,
            temperature,
            max_distance_matrix_size: 5_000_000,
            distance,
            epsilon: 1e-5,
            train_features: Vec::new(),
            train_targets: Vec::new(),
            test_features: Vec::new(),
            test_targets: Vec::new(),
        }
    }

    pub fn with_max_distance_matrix_size(mut self, size: usize) -> Self {
        self.max_distance_matrix_size = size;
        self
    }

    /// Accumulate train and/or test features with their targets
    pub fn update(
        &mut self,
        train: Option<(&Tensor, &Tensor)>,
        test: Option<(&Tensor, &Tensor)>,
    ) -> Result<()> {
        if let Some((features, targets)) = train {
            if features.dim(0)? != targets.dim(0)? {
                candle_core::bail!("train features and targets differ in length");
            }
            self.train_features.push(features.detach());
            self.train_targets.push(targets.to_dtype(DType::U32)?);
        }
        if let Some((features, targets)) = test {
            if features.dim(0)? != targets.dim(0)? {
                candle_core::bail!("test features and targets differ in length");
            }
            self.test_features.push(features.detach());
            self.test_targets.push(targets.to_dtype(DType::U32)?);
        }
        Ok(())
    }

    pub fn reset(&mut self) {
        self.train_features.clear();
        self.train_targets.clear();
        self.test_features.clear();
        self.test_targets.clear();
    }

    /// Returns `(acc@1, acc@5)` in percent
    pub fn compute(&self) -> Result<(f64, f64)> {
        if self.train_features.is_empty() || self.test_features.is_empty() {
            candle_core::bail!("k-NN needs both train and test features");
        }

        let mut train_features = Tensor::cat(&self.train_features, 0)?.to_dtype(DType::F32)?;
        let train_targets = Tensor::cat(&self.train_targets, 0)?.to_vec1::<u32>()?;
        let mut test_features = Tensor::cat(&self.test_features, 0)?.to_dtype(DType::F32)?;
        let test_targets = Tensor::cat(&self.test_targets, 0)?.to_vec1::<u32>()?;

        if self.distance == Distance::Cosine {
            train_features = l2_normalize(&train_features)?;
            test_features = l2_normalize(&test_features)?;
        }

        let num_classes = train_targets
            .iter()
            .chain(test_targets.iter())
            .max()
            .map_or(0, |m| *m as usize + 1);
        let num_train = train_targets.len();
        let num_test = test_targets.len();
        let k = self.k.min(num_train);
        let top5 = 5.min(k).min(num_classes);
        let chunk_size = (self.max_distance_matrix_size / num_train).max(1).min(num_test);

        let train_t = train_features.t()?.contiguous()?;
        let train_sq = train_features.sqr()?.sum_keepdim(1)?.t()?;

        let mut top1_correct = 0usize;
        let mut top5_correct = 0usize;

        let mut start = 0;
        while start < num_test {
            let len = chunk_size.min(num_test - start);
            let features = test_features.narrow(0, start, len)?;

            let similarities = match self.distance {
                Distance::Cosine => features.matmul(&train_t)?,
                Distance::Euclidean => {
                    let test_sq = features.sqr()?.sum_keepdim(1)?;
                    let dist = (test_sq.broadcast_add(&train_sq)? - (features.matmul(&train_t)? * 2.0)?)?
                        .relu()?
                        .sqrt()?;
                    (dist + self.epsilon)?.recip()?
                }
            };

            for (row, &target) in similarities
                .to_vec2::<f32>()?
                .iter()
                .zip(&test_targets[start..start + len])
            {
                let mut neighbours: Vec<usize> = (0..num_train).collect();
                neighbours.sort_by(|&a, &b| row[b].total_cmp(&row[a]));

                let mut votes = vec![0f64; num_classes];
                for &idx in &neighbours[..k] {
                    let sim = row[idx] as f64;
                    let weight = match self.distance {
                        Distance::Cosine => (sim / self.temperature).exp(),
                        Distance::Euclidean => sim,
                    };
                    votes[train_targets[idx] as usize] += weight;
                }

                let mut predictions: Vec<usize> = (0..num_classes).collect();
                predictions.sort_by(|&a, &b| votes[b].total_cmp(&votes[a]));

                if predictions[0] == target as usize {
                    top1_correct += 1;
                }
                if predictions[..top5].contains(&(target as usize)) {
                    top5_correct += 1;
                }
            }

            start += len;
        }

        Ok((
            top1_correct as f64 * 100.0 / num_test as f64,
            top5_correct as f64 * 100.0 / num_test as f64,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn clusters() -> Result<(Tensor, Tensor)> {
        let device = Device::Cpu;
        let features = Tensor::new(
            &[
                [1.0f32, 0.0],
                [0.9, 0.1],
                [0.95, -0.05],
                [0.0, 1.0],
                [0.1, 0.9],
                [-0.05, 0.95],
            ],
            &device,
        )?;
        let targets = Tensor::new(&[0u32, 0, 0, 1, 1, 1], &device)?;
        Ok((features, targets))
    }

    #[test]
    fn test_knn_separable_clusters() -> Result<()> {
        let (train, train_targets) = clusters()?;
        let test = Tensor::new(&[[0.8f32, 0.2], [0.2, 0.8]], &Device::Cpu)?;
        let test_targets = Tensor::new(&[0u32, 1], &Device::Cpu)?;

        for distance in [Distance::Cosine, Distance::Euclidean] {
            let mut knn = WeightedKnnClassifier::new(3, 0.07, distance);
            knn.update(Some((&train, &train_targets)), Some((&test, &test_targets)))?;
            let (top1, top5) = knn.compute()?;

            assert!((top1 - 100.0).abs() < 1e-9, "{distance:?} top1 {top1}");
            assert!((top5 - 100.0).abs() < 1e-9);
        }

        Ok(())
    }

    #[test]
    fn test_knn_chunking_matches() -> Result<()> {
        let (train, train_targets) = clusters()?;

        let mut full = WeightedKnnClassifier::new(2, 0.1, Distance::Cosine);
        full.update(Some((&train, &train_targets)), Some((&train, &train_targets)))?;
        // 6 train samples, chunks of a single test sample
        let mut chunked = WeightedKnnClassifier::new(2, 0.1, Distance::Cosine)
            .with_max_distance_matrix_size(6);
        chunked.update(Some((&train, &train_targets)), Some((&train, &train_targets)))?;

        assert_eq!(full.compute()?, chunked.compute()?);

        Ok(())
    }

    #[test]
    fn test_knn_requires_data() {
        let knn = WeightedKnnClassifier::default();
        assert!(knn.compute().is_err());
    }
}
