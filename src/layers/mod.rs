/// Network building blocks
///
/// - MLP encoder over flat feature vectors
/// - Projection / prediction heads
/// - Truncated-normal and weight-normalized linear layers

pub mod linear;
pub mod mlp;

pub use linear::{trunc_normal_linear, WeightNormLinear};
pub use mlp::{Activation, HeadConfig, Mlp, MlpConfig, MlpHead};
