/// Pretraining run configuration
///
/// Serialized verbatim as `args.json` in the run directory.
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub use crate::data::AugmentationConfig;
pub use crate::layers::MlpConfig;
pub use crate::methods::MethodParams;
pub use crate::training::scheduler::{SchedulerConfig, SchedulerKind};
pub use crate::utils::checkpointer::CheckpointConfig;

use crate::methods::{MethodConfig, MethodKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Sgd,
    Adamw,
}

/// Optimizer settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OptimizerConfig {
    pub kind: OptimizerKind,
    /// Base learning rate
    pub lr: f64,
    pub weight_decay: f64,
    /// SGD momentum
    pub momentum: f64,
    pub nesterov: bool,
    /// AdamW betas
    pub betas: (f64, f64),
    /// Wrap the optimizer with LARS
    pub lars: bool,
    pub eta_lars: f64,
    pub grad_clip_lars: bool,
    pub exclude_bias_n_norm: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            kind: OptimizerKind::Sgd,
            lr: 0.3,
            weight_decay: 1e-4,
            momentum: 0.9,
            nesterov: false,
            betas: (0.9, 0.999),
            lars: true,
            eta_lars: 0.02,
            grad_clip_lars: false,
            exclude_bias_n_norm: true,
        }
    }
}

/// Configuration of a pretraining run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PretrainConfig {
    /// Run name, used in checkpoint file names
    pub name: String,
    pub project: String,
    /// Directory of the feature dataset
    pub dataset_dir: PathBuf,
    /// Encoder architecture; only `mlp` is built in
    pub encoder_name: String,
    pub encoder: MlpConfig,
    pub max_epochs: usize,
    /// Per-replica batch size
    pub batch_size: usize,
    pub num_large_crops: usize,
    pub num_small_crops: usize,
    /// View pipelines, large crops first
    pub augmentations: Vec<AugmentationConfig>,
    pub optimizer: OptimizerConfig,
    pub scheduler: SchedulerConfig,
    pub method: MethodParams,
    pub checkpoint: CheckpointConfig,
    /// Resume from this checkpoint
    pub resume_from_checkpoint: Option<PathBuf>,
    /// Log every N optimizer steps
    pub log_every_n_steps: usize,
}

impl Default for PretrainConfig {
    fn default() -> Self {
        Self {
            name: "barlow_twins".to_string(),
            project: "solo".to_string(),
            dataset_dir: PathBuf::from("datasets/train"),
            encoder_name: "mlp".to_string(),
            encoder: MlpConfig::default(),
            max_epochs: 100,
            batch_size: 256,
            num_large_crops: 2,
            num_small_crops: 0,
            augmentations: vec![AugmentationConfig::default()],
            optimizer: OptimizerConfig::default(),
            scheduler: SchedulerConfig::default(),
            method: MethodParams::default(),
            checkpoint: CheckpointConfig::default(),
            resume_from_checkpoint: None,
            log_every_n_steps: 50,
        }
    }
}

impl PretrainConfig {
    pub fn from_json_file<P: AsRef<std::path::Path>>(path: P) -> crate::Result<Self> {
        let file = std::fs::File::open(path)?;
        let config: Self = serde_json::from_reader(std::io::BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    pub fn method_kind(&self) -> MethodKind {
        self.method.kind()
    }

    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        let err = |msg: String| Err(crate::SoloError::Config(msg));

        if self.encoder_name != "mlp" {
            return err(format!(
                "Invalid encoder: {}. Only 'mlp' is supported",
                self.encoder_name
            ));
        }
        if self.encoder.hidden_dims.is_empty() || self.encoder.hidden_dims.contains(&0) {
            return err("encoder hidden_dims must be non-empty and > 0".to_string());
        }
        if self.batch_size == 0 || self.max_epochs == 0 {
            return err("batch_size and max_epochs must be > 0".to_string());
        }
        if self.num_large_crops < 2 {
            return err("num_large_crops must be >= 2".to_string());
        }

        let crops: usize = self.augmentations.iter().map(|a| a.num_crops).sum();
        if crops != self.num_large_crops + self.num_small_crops {
            return err(format!(
                "augmentations produce {} crops but {} large + {} small are configured",
                crops, self.num_large_crops, self.num_small_crops
            ));
        }

        if self.optimizer.lr <= 0.0 {
            return err("lr must be > 0".to_string());
        }
        if self.optimizer.weight_decay < 0.0 {
            return err("weight_decay must be >= 0".to_string());
        }
        if self.checkpoint.frequency == 0 {
            return err("checkpoint frequency must be > 0".to_string());
        }

        if let Some((base, last)) = self.method.momentum_taus() {
            if !(0.0..=1.0).contains(&base) || !(0.0..=1.0).contains(&last) {
                return err(format!("momentum taus must be in [0, 1], got {base} and {last}"));
            }
        }

        match &self.method {
            MethodParams::Mocov2plus(p) if p.queue_size % self.batch_size != 0 => {
                return err(format!(
                    "queue_size {} must be divisible by batch_size {}",
                    p.queue_size, self.batch_size
                ));
            }
            MethodParams::Swav(p) if p.num_prototypes == 0 => {
                return err("num_prototypes must be > 0".to_string());
            }
            MethodParams::Dino(p) if p.num_prototypes == 0 => {
                return err("num_prototypes must be > 0".to_string());
            }
            MethodParams::Wmse(p) if p.whitening_size == 0 || self.batch_size % p.whitening_size != 0 => {
                return err(format!(
                    "whitening_size {} must divide batch_size {}",
                    p.whitening_size, self.batch_size
                ));
            }
            _ => {}
        }

        Ok(())
    }

    /// Method construction settings for a dataset
    pub fn method_config(&self, input_dim: usize, num_classes: usize) -> MethodConfig {
        MethodConfig {
            input_dim,
            encoder: self.encoder.clone(),
            num_classes,
            num_large_crops: self.num_large_crops,
            num_small_crops: self.num_small_crops,
            batch_size: self.batch_size,
            max_epochs: self.max_epochs,
            params: self.method.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::methods::MocoV2PlusParams;

    #[test]
    fn test_default_is_valid() {
        PretrainConfig::default().validate().unwrap();
    }

    #[test]
    fn test_crop_count_mismatch() {
        let config = PretrainConfig {
            num_small_crops: 2,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_encoder() {
        let config = PretrainConfig {
            encoder_name: "resnet18".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_queue_size_divisibility() {
        let mut config = PretrainConfig {
            batch_size: 24,
            method: MethodParams::Mocov2plus(MocoV2PlusParams {
                queue_size: 100,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.method = MethodParams::Mocov2plus(MocoV2PlusParams {
            queue_size: 96,
            ..Default::default()
        });
        config.validate().unwrap();
    }

    #[test]
    fn test_invalid_taus() {
        let config = PretrainConfig {
            method: MethodParams::Byol(crate::methods::ByolParams {
                base_tau_momentum: 1.5,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_roundtrip_with_partial_fields() {
        let json = r#"{
            "name": "swav-run",
            "batch_size": 64,
            "method": { "name": "swav", "num_prototypes": 100 }
        }"#;

        let config: PretrainConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.batch_size, 64);
        assert_eq!(config.method_kind(), MethodKind::Swav);
        match &config.method {
            MethodParams::Swav(p) => {
                assert_eq!(p.num_prototypes, 100);
                assert_eq!(p.sk_iters, 3);
            }
            other => panic!("unexpected method {other:?}"),
        }
        assert_eq!(config.optimizer, OptimizerConfig::default());
    }
}
