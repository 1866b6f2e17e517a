/// VICReg: variance-invariance-covariance regularization
use candle_core::{Device, Result, Tensor};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use super::base::{record_loss, BaseMethod};
use super::{Method, MethodConfig, MethodOutput, StepContext, StepOutput};
use crate::data::Batch;
use crate::layers::{HeadConfig, MlpHead};
use crate::losses::vicreg_loss_func;
use crate::utils::gather::ProcessGroup;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VicRegParams {
    pub proj_hidden_dim: usize,
    pub proj_output_dim: usize,
    pub sim_loss_weight: f64,
    pub var_loss_weight: f64,
    pub cov_loss_weight: f64,
}

impl Default for VicRegParams {
    fn default() -> Self {
        Self {
            proj_hidden_dim: 2048,
            proj_output_dim: 2048,
            sim_loss_weight: 25.0,
            var_loss_weight: 25.0,
            cov_loss_weight: 1.0,
        }
    }
}

pub struct VicReg {
    base: BaseMethod,
    projector: MlpHead,
    params: VicRegParams,
}

impl VicReg {
    pub fn new(
        config: &MethodConfig,
        params: VicRegParams,
        group: Arc<dyn ProcessGroup>,
        device: &Device,
    ) -> Result<Self> {
        let base = BaseMethod::new(config, group, device)?;
        let projector = MlpHead::new(
            base.features_dim(),
            &HeadConfig::bn_relu(params.proj_hidden_dim, params.proj_output_dim, 2),
            base.vb().pp("projector"),
        )?;
        Ok(Self {
            base,
            projector,
            params,
        })
    }
}

impl Method for VicReg {
    fn name(&self) -> &'static str {
        "vicreg"
    }

    fn varmap(&self) -> &VarMap {
        &self.base.varmap
    }

    fn training_step(&mut self, batch: &Batch, _ctx: &StepContext) -> Result<StepOutput> {
        self.base.check_views(batch)?;
        let feats = self.base.backbone_views(&batch.views)?;
        let z1 = self.projector.forward_t(&feats[0], true)?;
        let z2 = self.projector.forward_t(&feats[1], true)?;

        let p = &self.params;
        let vicreg_loss = vicreg_loss_func(
            &z1,
            &z2,
            p.sim_loss_weight,
            p.var_loss_weight,
            p.cov_loss_weight,
            self.base.group.as_ref(),
        )?;

        let mut metrics = HashMap::new();
        record_loss(&mut metrics, "vicreg", &vicreg_loss)?;
        let loss = self.base.total_loss(vicreg_loss, &feats, batch.targets.as_ref(), &mut metrics)?;

        Ok(StepOutput { loss, metrics })
    }

    fn forward(&self, x: &Tensor) -> Result<MethodOutput> {
        let feats = self.base.backbone.forward_t(x, false)?;
        let z = self.projector.forward_t(&feats, false)?;
        Ok(MethodOutput {
            logits: self.base.logits(&feats)?,
            feats,
            z: Some(z),
            p: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::methods::test_utils::check_training_step;
    use crate::methods::MethodParams;

    #[test]
    fn test_vicreg_step() -> Result<()> {
        let params = VicRegParams {
            proj_hidden_dim: 32,
            proj_output_dim: 16,
            ..Default::default()
        };
        check_training_step(MethodParams::Vicreg(params), 0)
    }
}
