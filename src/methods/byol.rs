/// BYOL: predict the momentum network's projection of the other view
use candle_core::{Device, Result, Tensor};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use super::base::{record_loss, BaseMethod, MomentumBackbone};
use super::{Method, MethodConfig, MethodOutput, StepContext, StepOutput};
use crate::data::Batch;
use crate::layers::{HeadConfig, MlpHead};
use crate::losses::byol_loss_func;
use crate::utils::gather::ProcessGroup;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ByolParams {
    pub proj_hidden_dim: usize,
    pub proj_output_dim: usize,
    pub pred_hidden_dim: usize,
    pub base_tau_momentum: f64,
    pub final_tau_momentum: f64,
}

impl Default for ByolParams {
    fn default() -> Self {
        Self {
            proj_hidden_dim: 4096,
            proj_output_dim: 256,
            pred_hidden_dim: 4096,
            base_tau_momentum: 0.99,
            final_tau_momentum: 1.0,
        }
    }
}

pub struct Byol {
    base: BaseMethod,
    projector: MlpHead,
    predictor: MlpHead,
    momentum: MomentumBackbone,
    momentum_projector: MlpHead,
}

impl Byol {
    pub fn new(
        config: &MethodConfig,
        params: ByolParams,
        group: Arc<dyn ProcessGroup>,
        device: &Device,
    ) -> Result<Self> {
        let base = BaseMethod::new(config, group, device)?;
        let proj_config = HeadConfig::bn_relu(params.proj_hidden_dim, params.proj_output_dim, 1);
        let projector = MlpHead::new(base.features_dim(), &proj_config, base.vb().pp("projector"))?;
        let predictor = MlpHead::new(
            params.proj_output_dim,
            &HeadConfig::bn_relu(params.pred_hidden_dim, params.proj_output_dim, 1),
            base.vb().pp("predictor"),
        )?;

        let momentum = MomentumBackbone::new(config, device)?;
        let momentum_projector = MlpHead::new(
            base.features_dim(),
            &proj_config,
            momentum.vb(device).pp("projector"),
        )?;
        momentum.initialize_from(&base.varmap)?;

        Ok(Self {
            base,
            projector,
            predictor,
            momentum,
            momentum_projector,
        })
    }
}

impl Method for Byol {
    fn name(&self) -> &'static str {
        "byol"
    }

    fn varmap(&self) -> &VarMap {
        &self.base.varmap
    }

    fn momentum_varmap(&self) -> Option<&VarMap> {
        Some(&self.momentum.varmap)
    }

    fn training_step(&mut self, batch: &Batch, _ctx: &StepContext) -> Result<StepOutput> {
        self.base.check_views(batch)?;
        let num_large = self.base.num_large_crops;

        let feats = self.base.backbone_views(&batch.views)?;
        let p = feats
            .iter()
            .map(|f| {
                let z = self.projector.forward_t(f, true)?;
                self.predictor.forward_t(&z, true)
            })
            .collect::<Result<Vec<_>>>()?;

        let z_momentum = batch.views[..num_large]
            .iter()
            .map(|x| {
                let f = self.momentum.forward(x)?;
                Ok(self.momentum_projector.forward_t(&f, true)?.detach())
            })
            .collect::<Result<Vec<_>>>()?;

        let mut terms = Vec::new();
        for (v1, z) in z_momentum.iter().enumerate() {
            for (v2, p) in p.iter().enumerate() {
                if v1 != v2 {
                    terms.push(byol_loss_func(p, z)?);
                }
            }
        }
        let neg_cos_sim = Tensor::stack(&terms, 0)?.sum_all()?;

        let mut metrics = HashMap::new();
        record_loss(&mut metrics, "neg_cos_sim", &neg_cos_sim)?;
        let loss = self.base.total_loss(neg_cos_sim, &feats, batch.targets.as_ref(), &mut metrics)?;

        Ok(StepOutput { loss, metrics })
    }

    fn forward(&self, x: &Tensor) -> Result<MethodOutput> {
        let feats = self.base.backbone.forward_t(x, false)?;
        let z = self.projector.forward_t(&feats, false)?;
        let p = self.predictor.forward_t(&z, false)?;
        Ok(MethodOutput {
            logits: self.base.logits(&feats)?,
            feats,
            z: Some(z),
            p: Some(p),
        })
    }
}
