/// DINO: self-distillation with a momentum teacher
use candle_core::{Device, Result, Tensor};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use super::base::{record_loss, BaseMethod, MomentumBackbone};
use super::{Method, MethodConfig, MethodOutput, StepContext, StepOutput};
use crate::data::Batch;
use crate::layers::{Activation, HeadConfig, MlpHead, WeightNormLinear};
use crate::losses::{DinoLoss, DinoLossConfig};
use crate::utils::gather::ProcessGroup;
use crate::utils::misc::l2_normalize;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DinoParams {
    pub proj_hidden_dim: usize,
    /// Bottleneck dimension before the prototype layer
    pub proj_output_dim: usize,
    pub num_prototypes: usize,
    /// Keep the norm of the prototype layer fixed at 1
    pub norm_last_layer: bool,
    pub student_temperature: f64,
    pub teacher_temperature: f64,
    pub warmup_teacher_temperature: f64,
    pub warmup_teacher_temperature_epochs: usize,
    /// The prototype layer is frozen for this many epochs
    pub freeze_last_layer: usize,
    pub base_tau_momentum: f64,
    pub final_tau_momentum: f64,
}

impl Default for DinoParams {
    fn default() -> Self {
        Self {
            proj_hidden_dim: 2048,
            proj_output_dim: 256,
            num_prototypes: 4096,
            norm_last_layer: true,
            student_temperature: 0.1,
            teacher_temperature: 0.07,
            warmup_teacher_temperature: 0.04,
            warmup_teacher_temperature_epochs: 50,
            freeze_last_layer: 1,
            base_tau_momentum: 0.9995,
            final_tau_momentum: 1.0,
        }
    }
}

/// MLP, l2 normalization, weight-normalized prototype layer
pub struct DinoHead {
    mlp: MlpHead,
    last_layer: WeightNormLinear,
}

impl DinoHead {
    pub fn new(input_dim: usize, params: &DinoParams, vb: candle_nn::VarBuilder) -> Result<Self> {
        let config = HeadConfig {
            hidden_dim: params.proj_hidden_dim,
            output_dim: params.proj_output_dim,
            num_hidden_layers: 2,
            batch_norm: false,
            activation: Activation::Gelu,
            trunc_normal_init: true,
        };
        let mlp = MlpHead::new(input_dim, &config, vb.pp("mlp"))?;
        let last_layer = WeightNormLinear::new(
            params.proj_output_dim,
            params.num_prototypes,
            params.norm_last_layer,
            vb.pp("last_layer"),
        )?;
        Ok(Self { mlp, last_layer })
    }

    pub fn forward(&self, x: &Tensor, freeze_last_layer: bool) -> Result<Tensor> {
        let x = l2_normalize(&self.mlp.forward_t(x, true)?)?;
        self.last_layer.forward(&x, freeze_last_layer)
    }
}

pub struct Dino {
    base: BaseMethod,
    head: DinoHead,
    momentum: MomentumBackbone,
    momentum_head: DinoHead,
    loss: DinoLoss,
    params: DinoParams,
    epoch: usize,
}

impl Dino {
    pub fn new(
        config: &MethodConfig,
        params: DinoParams,
        group: Arc<dyn ProcessGroup>,
        device: &Device,
    ) -> Result<Self> {
        let base = BaseMethod::new(config, group.clone(), device)?;
        let head = DinoHead::new(base.features_dim(), &params, base.vb().pp("head"))?;

        let momentum = MomentumBackbone::new(config, device)?;
        let momentum_head = DinoHead::new(base.features_dim(), &params, momentum.vb(device).pp("head"))?;
        momentum.initialize_from(&base.varmap)?;

        let loss_config = DinoLossConfig {
            num_prototypes: params.num_prototypes,
            warmup_teacher_temp: params.warmup_teacher_temperature,
            teacher_temp: params.teacher_temperature,
            warmup_teacher_temp_epochs: params.warmup_teacher_temperature_epochs,
            num_epochs: config.max_epochs,
            student_temp: params.student_temperature,
            num_large_crops: config.num_large_crops,
            center_momentum: 0.9,
        };
        let loss = DinoLoss::new(loss_config, group, device)?;

        Ok(Self {
            base,
            head,
            momentum,
            momentum_head,
            loss,
            params,
            epoch: 0,
        })
    }

    pub fn teacher_temperature(&self) -> f64 {
        self.loss.teacher_temp()
    }

    fn last_layer_frozen(&self) -> bool {
        self.epoch < self.params.freeze_last_layer
    }
}

impl Method for Dino {
    fn name(&self) -> &'static str {
        "dino"
    }

    fn varmap(&self) -> &VarMap {
        &self.base.varmap
    }

    fn momentum_varmap(&self) -> Option<&VarMap> {
        Some(&self.momentum.varmap)
    }

    fn on_train_epoch_start(&mut self, epoch: usize) -> Result<()> {
        self.epoch = epoch;
        self.loss.set_epoch(epoch);
        Ok(())
    }

    fn training_step(&mut self, batch: &Batch, _ctx: &StepContext) -> Result<StepOutput> {
        self.base.check_views(batch)?;
        let frozen = self.last_layer_frozen();

        let feats = self.base.backbone_views(&batch.views)?;
        let student = feats
            .iter()
            .map(|f| self.head.forward(f, frozen))
            .collect::<Result<Vec<_>>>()?;

        let teacher = batch.views[..self.base.num_large_crops]
            .iter()
            .map(|x| {
                let f = self.momentum.forward(x)?;
                Ok(self.momentum_head.forward(&f, true)?.detach())
            })
            .collect::<Result<Vec<_>>>()?;

        let dino_loss = self
            .loss
            .forward(&Tensor::cat(&student, 0)?, &Tensor::cat(&teacher, 0)?)?;

        let mut metrics = HashMap::new();
        record_loss(&mut metrics, "dino", &dino_loss)?;
        let loss = self.base.total_loss(dino_loss, &feats, batch.targets.as_ref(), &mut metrics)?;

        Ok(StepOutput { loss, metrics })
    }

    fn buffers(&self) -> Result<HashMap<String, Tensor>> {
        Ok(HashMap::from([("dino.center".to_string(), self.loss.center().clone())]))
    }

    fn load_buffers(&mut self, buffers: &HashMap<String, Tensor>) -> Result<usize> {
        match buffers.get("dino.center") {
            Some(center) => {
                self.loss.set_center(center)?;
                Ok(1)
            }
            None => {
                log::warn!("no saved value for buffer dino.center");
                Ok(0)
            }
        }
    }

    fn forward(&self, x: &Tensor) -> Result<MethodOutput> {
        let feats = self.base.backbone.forward_t(x, false)?;
        let p = self.head.forward(&feats, true)?;
        Ok(MethodOutput {
            logits: self.base.logits(&feats)?,
            feats,
            z: None,
            p: Some(p),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::methods::test_utils::{batch, check_training_step, config};
    use crate::methods::MethodParams;
    use crate::utils::gather::SingleProcess;

    fn params() -> DinoParams {
        DinoParams {
            proj_hidden_dim: 32,
            proj_output_dim: 8,
            num_prototypes: 20,
            warmup_teacher_temperature_epochs: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_dino_step() -> Result<()> {
        check_training_step(MethodParams::Dino(params()), 0)?;
        check_training_step(MethodParams::Dino(params()), 2)
    }

    #[test]
    fn test_last_layer_frozen_first_epoch() -> Result<()> {
        let device = Device::Cpu;
        let config = config(MethodParams::Dino(params()), 0);
        let mut dino = Dino::new(&config, params(), Arc::new(SingleProcess), &device)?;
        let batch = batch(&config, &device)?;
        let weight_v = dino.base.varmap.data().lock().unwrap()["head.last_layer.weight_v"].clone();

        dino.on_train_epoch_start(0)?;
        let out = dino.training_step(&batch, &StepContext::default())?;
        assert!(out.loss.backward()?.get(&weight_v).is_none());

        dino.on_train_epoch_start(1)?;
        let out = dino.training_step(&batch, &StepContext::default())?;
        assert!(out.loss.backward()?.get(&weight_v).is_some());

        Ok(())
    }

    #[test]
    fn test_teacher_temperature_warmup() -> Result<()> {
        let device = Device::Cpu;
        let config = config(MethodParams::Dino(params()), 0);
        let mut dino = Dino::new(&config, params(), Arc::new(SingleProcess), &device)?;

        dino.on_train_epoch_start(0)?;
        assert!((dino.teacher_temperature() - 0.04).abs() < 1e-12);
        dino.on_train_epoch_start(3)?;
        assert!((dino.teacher_temperature() - 0.07).abs() < 1e-12);

        Ok(())
    }
}
