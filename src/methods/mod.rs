/// Self-supervised methods
///
/// Every method owns an MLP encoder, an online linear classifier and its
/// method-specific heads. Methods with a momentum (target) network expose it
/// through [`Method::momentum_varmap`] so the trainer can update it after each
/// optimizer step.
use candle_core::{Device, Result, Tensor};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::data::Batch;
use crate::layers::MlpConfig;
use crate::utils::gather::ProcessGroup;

pub mod barlow_twins;
pub mod base;
pub mod byol;
pub mod dino;
pub mod mocov2plus;
pub mod simclr;
pub mod swav;
pub mod vicreg;
pub mod wmse;

pub use barlow_twins::{BarlowTwins, BarlowTwinsParams};
pub use base::BaseMethod;
pub use byol::{Byol, ByolParams};
pub use dino::{Dino, DinoParams};
pub use mocov2plus::{MocoV2Plus, MocoV2PlusParams};
pub use simclr::{SimClr, SimClrParams};
pub use swav::{SwAV, SwAVParams};
pub use vicreg::{VicReg, VicRegParams};
pub use wmse::{WMse, WMseParams};

/// Prefix of momentum parameters in exported tensors
pub const MOMENTUM_PREFIX: &str = "momentum.";

/// Progress of the training run, passed to every step
#[derive(Debug, Clone, Copy, Default)]
pub struct StepContext {
    pub epoch: usize,
    pub global_step: usize,
    pub max_steps: usize,
}

pub struct StepOutput {
    /// Method loss plus the online classifier loss
    pub loss: Tensor,
    pub metrics: HashMap<String, f64>,
}

/// Outputs of a forward pass in evaluation mode
pub struct MethodOutput {
    pub feats: Tensor,
    pub logits: Option<Tensor>,
    /// Projection
    pub z: Option<Tensor>,
    /// Prediction or prototype scores
    pub p: Option<Tensor>,
}

pub trait Method {
    fn name(&self) -> &'static str;

    /// Parameters trained by the optimizer
    fn varmap(&self) -> &VarMap;

    /// Parameters following the online network by exponential moving average
    fn momentum_varmap(&self) -> Option<&VarMap> {
        None
    }

    fn on_train_epoch_start(&mut self, _epoch: usize) -> Result<()> {
        Ok(())
    }

    fn training_step(&mut self, batch: &Batch, ctx: &StepContext) -> Result<StepOutput>;

    fn forward(&self, x: &Tensor) -> Result<MethodOutput>;

    /// Encoder features in evaluation mode
    fn features(&self, x: &Tensor) -> Result<Tensor> {
        Ok(self.forward(x)?.feats)
    }

    /// State outside the varmaps that a resumed run needs (loss centres,
    /// running statistics, queues)
    fn buffers(&self) -> Result<HashMap<String, Tensor>> {
        Ok(HashMap::new())
    }

    /// Restore state exported by [`Method::buffers`], returning how many tensors were used
    fn load_buffers(&mut self, _buffers: &HashMap<String, Tensor>) -> Result<usize> {
        Ok(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum MethodKind {
    Simclr,
    BarlowTwins,
    Byol,
    Swav,
    Vicreg,
    Wmse,
    Mocov2plus,
    Dino,
}

impl MethodKind {
    pub fn default_params(&self) -> MethodParams {
        match self {
            MethodKind::Simclr => MethodParams::Simclr(SimClrParams::default()),
            MethodKind::BarlowTwins => MethodParams::BarlowTwins(BarlowTwinsParams::default()),
            MethodKind::Byol => MethodParams::Byol(ByolParams::default()),
            MethodKind::Swav => MethodParams::Swav(SwAVParams::default()),
            MethodKind::Vicreg => MethodParams::Vicreg(VicRegParams::default()),
            MethodKind::Wmse => MethodParams::Wmse(WMseParams::default()),
            MethodKind::Mocov2plus => MethodParams::Mocov2plus(MocoV2PlusParams::default()),
            MethodKind::Dino => MethodParams::Dino(DinoParams::default()),
        }
    }
}

impl std::fmt::Display for MethodKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MethodKind::Simclr => "simclr",
            MethodKind::BarlowTwins => "barlow_twins",
            MethodKind::Byol => "byol",
            MethodKind::Swav => "swav",
            MethodKind::Vicreg => "vicreg",
            MethodKind::Wmse => "wmse",
            MethodKind::Mocov2plus => "mocov2plus",
            MethodKind::Dino => "dino",
        };
        f.write_str(name)
    }
}

/// Method hyperparameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum MethodParams {
    Simclr(SimClrParams),
    BarlowTwins(BarlowTwinsParams),
    Byol(ByolParams),
    Swav(SwAVParams),
    Vicreg(VicRegParams),
    Wmse(WMseParams),
    Mocov2plus(MocoV2PlusParams),
    Dino(DinoParams),
}

impl Default for MethodParams {
    fn default() -> Self {
        MethodParams::BarlowTwins(BarlowTwinsParams::default())
    }
}

impl MethodParams {
    pub fn kind(&self) -> MethodKind {
        match self {
            MethodParams::Simclr(_) => MethodKind::Simclr,
            MethodParams::BarlowTwins(_) => MethodKind::BarlowTwins,
            MethodParams::Byol(_) => MethodKind::Byol,
            MethodParams::Swav(_) => MethodKind::Swav,
            MethodParams::Vicreg(_) => MethodKind::Vicreg,
            MethodParams::Wmse(_) => MethodKind::Wmse,
            MethodParams::Mocov2plus(_) => MethodKind::Mocov2plus,
            MethodParams::Dino(_) => MethodKind::Dino,
        }
    }

    /// Base and final tau of the momentum network, if the method has one
    pub fn momentum_taus(&self) -> Option<(f64, f64)> {
        match self {
            MethodParams::Byol(p) => Some((p.base_tau_momentum, p.final_tau_momentum)),
            MethodParams::Mocov2plus(p) => Some((p.base_tau_momentum, p.final_tau_momentum)),
            MethodParams::Dino(p) => Some((p.base_tau_momentum, p.final_tau_momentum)),
            _ => None,
        }
    }
}

/// Everything needed to build a method
#[derive(Debug, Clone)]
pub struct MethodConfig {
    /// Dimension of the input feature vectors
    pub input_dim: usize,
    pub encoder: MlpConfig,
    /// Classes of the online classifier, 0 disables it
    pub num_classes: usize,
    pub num_large_crops: usize,
    pub num_small_crops: usize,
    /// Per-replica batch size
    pub batch_size: usize,
    pub max_epochs: usize,
    pub params: MethodParams,
}

/// Build the method described by `config.params`
pub fn build(
    config: &MethodConfig,
    group: Arc<dyn ProcessGroup>,
    device: &Device,
) -> Result<Box<dyn Method>> {
    let method: Box<dyn Method> = match &config.params {
        MethodParams::Simclr(p) => Box::new(SimClr::new(config, p.clone(), group, device)?),
        MethodParams::BarlowTwins(p) => Box::new(BarlowTwins::new(config, p.clone(), group, device)?),
        MethodParams::Byol(p) => Box::new(Byol::new(config, p.clone(), group, device)?),
        MethodParams::Swav(p) => Box::new(SwAV::new(config, p.clone(), group, device)?),
        MethodParams::Vicreg(p) => Box::new(VicReg::new(config, p.clone(), group, device)?),
        MethodParams::Wmse(p) => Box::new(WMse::new(config, p.clone(), group, device)?),
        MethodParams::Mocov2plus(p) => Box::new(MocoV2Plus::new(config, p.clone(), group, device)?),
        MethodParams::Dino(p) => Box::new(Dino::new(config, p.clone(), group, device)?),
    };
    Ok(method)
}

fn varmap_tensors(varmap: &VarMap, prefix: &str, out: &mut HashMap<String, Tensor>) -> Result<()> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| candle_core::Error::Msg("varmap lock poisoned".to_string()))?;
    for (name, var) in data.iter() {
        out.insert(format!("{prefix}{name}"), var.as_tensor().detach());
    }
    Ok(())
}

/// Online parameters by name, momentum parameters under [`MOMENTUM_PREFIX`]
/// and the method's buffers under their own names
pub fn named_tensors(method: &dyn Method) -> Result<HashMap<String, Tensor>> {
    let mut tensors = HashMap::new();
    varmap_tensors(method.varmap(), "", &mut tensors)?;
    if let Some(momentum) = method.momentum_varmap() {
        varmap_tensors(momentum, MOMENTUM_PREFIX, &mut tensors)?;
    }
    for (name, buffer) in method.buffers()? {
        tensors.insert(name, buffer.detach());
    }
    Ok(tensors)
}

fn load_varmap(varmap: &VarMap, prefix: &str, tensors: &HashMap<String, Tensor>) -> Result<usize> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| candle_core::Error::Msg("varmap lock poisoned".to_string()))?;
    let mut loaded = 0;
    for (name, var) in data.iter() {
        match tensors.get(&format!("{prefix}{name}")) {
            Some(t) => {
                var.set(&t.to_dtype(var.dtype())?.to_device(var.device())?)?;
                loaded += 1;
            }
            None => log::warn!("no saved value for parameter {prefix}{name}"),
        }
    }
    Ok(loaded)
}

/// Restore tensors exported by [`named_tensors`], returning how many were set
pub fn load_tensors(method: &mut dyn Method, tensors: &HashMap<String, Tensor>) -> Result<usize> {
    let mut loaded = load_varmap(method.varmap(), "", tensors)?;
    if let Some(momentum) = method.momentum_varmap() {
        loaded += load_varmap(momentum, MOMENTUM_PREFIX, tensors)?;
    }
    loaded += method.load_buffers(tensors)?;
    Ok(loaded)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::gather::SingleProcess;

    #[test]
    fn test_params_tagged_serialization() {
        let params = MethodKind::Byol.default_params();
        let json = serde_json::to_string(&params).unwrap();
        assert!(json.contains("\"name\":\"byol\""));

        let back: MethodParams = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind(), MethodKind::Byol);
        assert_eq!(back.momentum_taus(), Some((0.99, 1.0)));
        assert_eq!(MethodKind::Simclr.default_params().momentum_taus(), None);
    }

    #[test]
    fn test_tensor_export_and_restore() -> Result<()> {
        let device = Device::Cpu;
        let config = test_utils::config(MethodKind::Byol.default_params(), 0);
        let method = build(&config, Arc::new(SingleProcess), &device)?;

        let tensors = named_tensors(method.as_ref())?;
        assert!(tensors.contains_key("backbone.fc0.weight"));
        assert!(tensors.contains_key("momentum.backbone.fc0.weight"));

        let mut other = build(&config, Arc::new(SingleProcess), &device)?;
        let loaded = load_tensors(other.as_mut(), &tensors)?;
        assert_eq!(loaded, tensors.len());

        let a = named_tensors(other.as_ref())?;
        let diff = (&a["backbone.fc0.weight"] - &tensors["backbone.fc0.weight"])?
            .abs()?
            .sum_all()?
            .to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);

        Ok(())
    }

    #[test]
    fn test_buffers_survive_export() -> Result<()> {
        let device = Device::Cpu;
        let config = test_utils::config(
            MethodParams::Dino(DinoParams {
                proj_hidden_dim: 32,
                proj_output_dim: 8,
                num_prototypes: 16,
                ..Default::default()
            }),
            0,
        );
        let mut method = build(&config, Arc::new(SingleProcess), &device)?;
        let batch = test_utils::batch(&config, &device)?;
        method.training_step(&batch, &StepContext::default())?;

        let tensors = named_tensors(method.as_ref())?;
        let center = tensors.get("dino.center").expect("exported centre");
        assert!(center.abs()?.sum_all()?.to_scalar::<f32>()? > 0.0);

        let mut other = build(&config, Arc::new(SingleProcess), &device)?;
        load_tensors(other.as_mut(), &tensors)?;
        let restored = other.buffers()?;
        let diff = (&restored["dino.center"] - center)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);

        Ok(())
    }
}
