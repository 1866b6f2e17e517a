/// Multi-view augmentation of feature vectors
///
/// A view is produced by random per-sample scaling, additive gaussian noise
/// and random feature masking. `NCropAugmentation` applies a pipeline several
/// times; `FullTransformPipeline` chains several of those (e.g. large crops
/// followed by small crops).
use candle_core::{DType, Result, Tensor};
use serde::{Deserialize, Serialize};

/// Settings for one kind of view
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AugmentationConfig {
    /// Standard deviation of the additive noise
    pub noise_std: f64,
    /// Probability of zeroing each feature
    pub mask_prob: f64,
    pub min_scale: f64,
    pub max_scale: f64,
    /// Number of views produced with these settings
    pub num_crops: usize,
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            noise_std: 0.1,
            mask_prob: 0.1,
            min_scale: 0.8,
            max_scale: 1.2,
            num_crops: 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NoiseAugmentation {
    noise_std: f64,
    mask_prob: f64,
    min_scale: f64,
    max_scale: f64,
}

impl NoiseAugmentation {
    pub fn new(noise_std: f64, mask_prob: f64, min_scale: f64, max_scale: f64) -> Result<Self> {
        if noise_std < 0.0 {
            candle_core::bail!("noise_std must be non-negative, got {noise_std}");
        }
        if !(0.0..1.0).contains(&mask_prob) {
            candle_core::bail!("mask_prob must be in [0, 1), got {mask_prob}");
        }
        if min_scale > max_scale {
            candle_core::bail!("min_scale {min_scale} exceeds max_scale {max_scale}");
        }
        Ok(Self {
            noise_std,
            mask_prob,
            min_scale,
            max_scale,
        })
    }

    pub fn from_config(config: &AugmentationConfig) -> Result<Self> {
        Self::new(config.noise_std, config.mask_prob, config.min_scale, config.max_scale)
    }

    /// Augment a batch `[batch, dim]`
    pub fn apply(&self, x: &Tensor) -> Result<Tensor> {
        let (n, d) = x.dims2()?;
        let device = x.device();
        let x = x.to_dtype(DType::F32)?;

        let mut out = if self.max_scale > self.min_scale {
            let scale = Tensor::rand(self.min_scale as f32, self.max_scale as f32, (n, 1), device)?;
            x.broadcast_mul(&scale)?
        } else {
            (x * self.min_scale)?
        };

        if self.noise_std > 0.0 {
            out = (out + Tensor::randn(0f32, self.noise_std as f32, (n, d), device)?)?;
        }

        if self.mask_prob > 0.0 {
            let keep = Tensor::rand(0f32, 1f32, (n, d), device)?
                .ge(self.mask_prob as f32)?
                .to_dtype(DType::F32)?;
            out = (out * keep)?;
        }

        Ok(out)
    }
}

/// Applies one pipeline per crop, or the same pipeline `n` times
#[derive(Debug, Clone)]
pub struct NCropAugmentation {
    transforms: Vec<NoiseAugmentation>,
}

impl NCropAugmentation {
    pub fn new(transform: NoiseAugmentation, num_crops: usize) -> Self {
        Self {
            transforms: vec![transform; num_crops],
        }
    }

    pub fn per_crop(transforms: Vec<NoiseAugmentation>) -> Self {
        Self { transforms }
    }

    pub fn num_crops(&self) -> usize {
        self.transforms.len()
    }

    pub fn apply(&self, x: &Tensor) -> Result<Vec<Tensor>> {
        self.transforms.iter().map(|t| t.apply(x)).collect()
    }
}

/// Concatenates the views of several n-crop pipelines
#[derive(Debug, Clone)]
pub struct FullTransformPipeline {
    pipelines: Vec<NCropAugmentation>,
}

impl FullTransformPipeline {
    pub fn new(pipelines: Vec<NCropAugmentation>) -> Self {
        Self { pipelines }
    }

    pub fn from_configs(configs: &[AugmentationConfig]) -> Result<Self> {
        let pipelines = configs
            .iter()
            .map(|c| Ok(NCropAugmentation::new(NoiseAugmentation::from_config(c)?, c.num_crops)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(pipelines))
    }

    pub fn num_crops(&self) -> usize {
        self.pipelines.iter().map(|p| p.num_crops()).sum()
    }

    pub fn apply(&self, x: &Tensor) -> Result<Vec<Tensor>> {
        let mut views = Vec::with_capacity(self.num_crops());
        for pipeline in &self.pipelines {
            views.extend(pipeline.apply(x)?);
        }
        Ok(views)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_identity_settings() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (4, 6), &device)?;
        let aug = NoiseAugmentation::new(0.0, 0.0, 1.0, 1.0)?;

        let out = aug.apply(&x)?;
        let diff = (out - &x)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-6);

        Ok(())
    }

    #[test]
    fn test_masking_zeroes_features() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::ones((64, 64), DType::F32, &device)?;
        let aug = NoiseAugmentation::new(0.0, 0.5, 1.0, 1.0)?;

        let kept = aug.apply(&x)?.mean_all()?.to_scalar::<f32>()?;
        assert!(kept > 0.35 && kept < 0.65, "kept fraction {kept}");

        Ok(())
    }

    #[test]
    fn test_invalid_settings() {
        assert!(NoiseAugmentation::new(-1.0, 0.0, 1.0, 1.0).is_err());
        assert!(NoiseAugmentation::new(0.1, 1.0, 1.0, 1.0).is_err());
        assert!(NoiseAugmentation::new(0.1, 0.0, 2.0, 1.0).is_err());
    }

    #[test]
    fn test_multicrop_pipeline() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (3, 5), &device)?;
        let large = AugmentationConfig::default();
        let small = AugmentationConfig {
            noise_std: 0.3,
            num_crops: 4,
            ..Default::default()
        };

        let pipeline = FullTransformPipeline::from_configs(&[large, small])?;
        assert_eq!(pipeline.num_crops(), 6);

        let views = pipeline.apply(&x)?;
        assert_eq!(views.len(), 6);
        for v in &views {
            assert_eq!(v.dims(), &[3, 5]);
        }

        Ok(())
    }

    #[test]
    fn test_one_transform_per_crop() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::ones((2, 2), DType::F32, &device)?;
        let crops = NCropAugmentation::per_crop(vec![
            NoiseAugmentation::new(0.0, 0.0, 1.0, 1.0)?,
            NoiseAugmentation::new(0.0, 0.0, 2.0, 2.0)?,
        ]);

        let views = crops.apply(&x)?;
        assert_eq!(views.len(), 2);
        let second = views[1].mean_all()?.to_scalar::<f32>()?;
        assert!((second - 2.0).abs() < 1e-6);

        Ok(())
    }
}
