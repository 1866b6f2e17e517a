//! solo - self-supervised representation learning on candle
//!
//! Trains encoders without labels using contrastive and non-contrastive
//! objectives and measures representation quality with linear probing and
//! k-NN evaluation.
//!
//! # Layout
//!
//! - **utils**: checkpointer, momentum updater, distributed gather,
//!   Sinkhorn-Knopp, whitening, truncated-normal init, metrics, k-NN
//! - **losses**: Barlow Twins, BYOL, SimCLR, SwAV, VICReg, W-MSE, MoCo V2+, DINO
//! - **methods**: the methods above wired to an MLP encoder and heads
//! - **training**: momentum SGD, LARS, LR schedules, pretraining loop, linear probe
//! - **data**: `.npy` feature datasets and multi-crop noise augmentation
//!
//! # Example
//!
//! ```ignore
//! use solo::{PretrainConfig, training::Trainer};
//!
//! let config = PretrainConfig::default();
//! let mut trainer = Trainer::new(config, input_dim, num_classes, loader.num_batches(), candle_core::Device::Cpu)?;
//! trainer.fit(&mut loader)?;
//! ```

pub mod cli;
pub mod config;
pub mod data;
pub mod layers;
pub mod losses;
pub mod methods;
pub mod training;
pub mod utils;

pub use config::PretrainConfig;
pub use methods::{Method, MethodKind};

/// Library error types
#[derive(Debug, thiserror::Error)]
pub enum SoloError {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Training error: {0}")]
    Training(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("NumPy error: {0}")]
    Npy(#[from] ndarray_npy::ReadNpyError),
}

pub type Result<T> = std::result::Result<T, SoloError>;
