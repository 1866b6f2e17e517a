/// SimCLR: contrastive learning with in-batch negatives
use candle_core::{Device, Result, Tensor};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use super::base::{record_loss, BaseMethod};
use super::{Method, MethodConfig, MethodOutput, StepContext, StepOutput};
use crate::data::Batch;
use crate::layers::{HeadConfig, MlpHead};
use crate::losses::simclr_loss_func;
use crate::utils::gather::ProcessGroup;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SimClrParams {
    pub proj_hidden_dim: usize,
    pub proj_output_dim: usize,
    pub temperature: f64,
}

impl Default for SimClrParams {
    fn default() -> Self {
        Self {
            proj_hidden_dim: 2048,
            proj_output_dim: 256,
            temperature: 0.1,
        }
    }
}

pub struct SimClr {
    base: BaseMethod,
    projector: MlpHead,
    params: SimClrParams,
}

impl SimClr {
    pub fn new(
        config: &MethodConfig,
        params: SimClrParams,
        group: Arc<dyn ProcessGroup>,
        device: &Device,
    ) -> Result<Self> {
        let base = BaseMethod::new(config, group, device)?;
        let projector = MlpHead::new(
            base.features_dim(),
            &HeadConfig::relu(params.proj_hidden_dim, params.proj_output_dim),
            base.vb().pp("projector"),
        )?;
        Ok(Self {
            base,
            projector,
            params,
        })
    }
}

impl Method for SimClr {
    fn name(&self) -> &'static str {
        "simclr"
    }

    fn varmap(&self) -> &VarMap {
        &self.base.varmap
    }

    fn training_step(&mut self, batch: &Batch, _ctx: &StepContext) -> Result<StepOutput> {
        self.base.check_views(batch)?;
        let feats = self.base.backbone_views(&batch.views)?;
        let z = feats
            .iter()
            .map(|f| self.projector.forward_t(f, true))
            .collect::<Result<Vec<_>>>()?;

        // every view of a sample shares its dataset index
        let z = Tensor::cat(&z, 0)?;
        let indexes = batch.indexes.repeat(self.base.num_crops())?;
        let nce_loss = simclr_loss_func(&z, &indexes, self.params.temperature, self.base.group.as_ref())?;

        let mut metrics = HashMap::new();
        record_loss(&mut metrics, "nce", &nce_loss)?;
        let loss = self.base.total_loss(nce_loss, &feats, batch.targets.as_ref(), &mut metrics)?;

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
