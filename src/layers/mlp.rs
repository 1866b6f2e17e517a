/// MLP encoder and projection heads
use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::{batch_norm, linear, BatchNorm, BatchNormConfig, Linear, VarBuilder};
use serde::{Deserialize, Serialize};

use super::linear::trunc_normal_linear;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Relu,
    Gelu,
}

impl Activation {
    fn apply(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Activation::Relu => x.relu(),
            Activation::Gelu => x.gelu_erf(),
        }
    }
}

/// Linear, optional batch norm, optional activation
struct Block {
    linear: Linear,
    bn: Option<BatchNorm>,
    activation: Option<Activation>,
}

impl Block {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let mut x = self.linear.forward(x)?;
        if let Some(bn) = &self.bn {
            x = bn.forward_t(&x, train)?;
        }
        match self.activation {
            Some(act) => act.apply(&x),
            None => Ok(x),
        }
    }
}

/// Encoder settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MlpConfig {
    /// Width of every hidden layer; the last one is the feature dimension
    pub hidden_dims: Vec<usize>,
    pub batch_norm: bool,
}

impl Default for MlpConfig {
    fn default() -> Self {
        Self {
            hidden_dims: vec![512, 512],
            batch_norm: true,
        }
    }
}

/// Fully connected encoder over flat feature vectors
pub struct Mlp {
    blocks: Vec<Block>,
    output_dim: usize,
}

impl Mlp {
    pub fn new(input_dim: usize, config: &MlpConfig, vb: VarBuilder) -> Result<Self> {
        if config.hidden_dims.is_empty() {
            candle_core::bail!("MLP encoder needs at least one hidden layer");
        }

        let mut blocks = Vec::with_capacity(config.hidden_dims.len());
        let mut in_dim = input_dim;
        for (i, &dim) in config.hidden_dims.iter().enumerate() {
            let bn = if config.batch_norm {
                Some(batch_norm(dim, BatchNormConfig::default(), vb.pp(format!("bn{i}")))?)
            } else {
                None
            };
            blocks.push(Block {
                linear: linear(in_dim, dim, vb.pp(format!("fc{i}")))?,
                bn,
                activation: Some(Activation::Relu),
            });
            in_dim = dim;
        }

        Ok(Self {
            blocks,
            output_dim: in_dim,
        })
    }

    /// Feature dimension
    pub fn output_dim(&self) -> usize {
        self.output_dim
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let mut x = x.clone();
        for block in &self.blocks {
            x = block.forward_t(&x, train)?;
        }
        Ok(x)
    }
}

/// Projection or prediction head settings
#[derive(Debug, Clone)]
pub struct HeadConfig {
    pub hidden_dim: usize,
    pub output_dim: usize,
    pub num_hidden_layers: usize,
    /// Batch norm after every hidden linear layer
    pub batch_norm: bool,
    pub activation: Activation,
    /// Truncated-normal (std 0.02) initialization of the linear layers
    pub trunc_normal_init: bool,
}

impl HeadConfig {
    /// `hidden_layers` x (Linear, BN, ReLU) then Linear
    pub fn bn_relu(hidden_dim: usize, output_dim: usize, hidden_layers: usize) -> Self {
        Self {
            hidden_dim,
            output_dim,
            num_hidden_layers: hidden_layers,
            batch_norm: true,
            activation: Activation::Relu,
            trunc_normal_init: false,
        }
    }

    /// Linear, ReLU, Linear
    pub fn relu(hidden_dim: usize, output_dim: usize) -> Self {
        Self {
            batch_norm: false,
            ..Self::bn_relu(hidden_dim, output_dim, 1)
        }
    }
}

/// MLP head on top of the encoder features
pub struct MlpHead {
    blocks: Vec<Block>,
}

impl MlpHead {
    pub fn new(input_dim: usize, config: &HeadConfig, vb: VarBuilder) -> Result<Self> {
        let make_linear = |in_dim: usize, out_dim: usize, vb: VarBuilder| {
            if config.trunc_normal_init {
                trunc_normal_linear(in_dim, out_dim, true, vb)
            } else {
                linear(in_dim, out_dim, vb)
            }
        };

        let mut blocks = Vec::with_capacity(config.num_hidden_layers + 1);
        let mut in_dim = input_dim;
        for i in 0..config.num_hidden_layers {
            let bn = if config.batch_norm {
                Some(batch_norm(
                    config.hidden_dim,
                    BatchNormConfig::default(),
                    vb.pp(format!("bn{i}")),
                )?)
            } else {
                None
            };
            blocks.push(Block {
                linear: make_linear(in_dim, config.hidden_dim, vb.pp(format!("fc{i}")))?,
                bn,
                activation: Some(config.activation),
            });
            in_dim = config.hidden_dim;
        }

        let last = config.num_hidden_layers;
        blocks.push(Block {
            linear: make_linear(in_dim, config.output_dim, vb.pp(format!("fc{last}")))?,
            bn: None,
            activation: None,
        });

        Ok(Self { blocks })
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let mut x = x.clone();
        for block in &self.blocks {
            x = block.forward_t(&x, train)?;
        }
        Ok(x)
    }
}
