/// Barlow Twins: redundancy reduction between two views
use candle_core::{Device, Result, Tensor};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use super::base::{record_loss, BaseMethod};
use super::{Method, MethodConfig, MethodOutput, StepContext, StepOutput};
use crate::data::Batch;
use crate::layers::{HeadConfig, MlpHead};
use crate::losses::barlow_loss_func;
use crate::utils::gather::ProcessGroup;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BarlowTwinsParams {
    pub proj_hidden_dim: usize,
    pub proj_output_dim: usize,
    /// Weight of the off-diagonal terms
    pub lamb: f64,
    pub scale_loss: f64,
}

impl Default for BarlowTwinsParams {
    fn default() -> Self {
        Self {
            proj_hidden_dim: 2048,
            proj_output_dim: 2048,
            lamb: 0.0051,
            scale_loss: 0.1,
        }
    }
}

pub struct BarlowTwins {
    base: BaseMethod,
    projector: MlpHead,
    params: BarlowTwinsParams,
}

impl BarlowTwins {
    pub fn new(
        config: &MethodConfig,
        params: BarlowTwinsParams,
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

impl Method for BarlowTwins {
    fn name(&self) -> &'static str {
        "barlow_twins"
    }

    fn varmap(&self) -> &VarMap {
        &self.base.varmap
    }

    fn training_step(&mut self, batch: &Batch, _ctx: &StepContext) -> Result<StepOutput> {
        self.base.check_views(batch)?;
        let feats = self.base.backbone_views(&batch.views)?;
        let z1 = self.projector.forward_t(&feats[0], true)?;
        let z2 = self.projector.forward_t(&feats[1], true)?;

        let barlow_loss = barlow_loss_func(
            &z1,
            &z2,
            self.params.lamb,
            self.params.scale_loss,
            self.base.group.as_ref(),
        )?;

        let mut metrics = HashMap::new();
        record_loss(&mut metrics, "barlow", &barlow_loss)?;
        let loss = self.base.total_loss(barlow_loss, &feats, batch.targets.as_ref(), &mut metrics)?;

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
