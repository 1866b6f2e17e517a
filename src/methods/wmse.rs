/// W-MSE: MSE between whitened projections of the views
use candle_core::{Device, Result, Tensor};
use candle_nn::VarMap;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use super::base::{record_loss, BaseMethod};
use super::{Method, MethodConfig, MethodOutput, StepContext, StepOutput};
use crate::data::Batch;
use crate::layers::{HeadConfig, MlpHead};
use crate::losses::wmse_loss_func;
use crate::utils::gather::ProcessGroup;
use crate::utils::whitening::Whitening2d;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WMseParams {
    pub proj_hidden_dim: usize,
    pub proj_output_dim: usize,
    /// Random sub-batch partitions per step
    pub whitening_iters: usize,
    /// Rows whitened together; must divide the batch size
    pub whitening_size: usize,
    pub whitening_eps: f64,
}

impl Default for WMseParams {
    fn default() -> Self {
        Self {
            proj_hidden_dim: 1024,
            proj_output_dim: 64,
            whitening_iters: 1,
            whitening_size: 256,
            whitening_eps: 0.0,
        }
    }
}

pub struct WMse {
    base: BaseMethod,
    projector: MlpHead,
    whitening: Whitening2d,
    params: WMseParams,
}

impl WMse {
    pub fn new(
        config: &MethodConfig,
        params: WMseParams,
        group: Arc<dyn ProcessGroup>,
        device: &Device,
    ) -> Result<Self> {
        if params.whitening_size == 0 || config.batch_size % params.whitening_size != 0 {
            candle_core::bail!(
                "whitening size {} must divide the batch size {}",
                params.whitening_size,
                config.batch_size
            );
        }
        if params.whitening_size <= params.proj_output_dim {
            candle_core::bail!(
                "whitening size {} must exceed the projection dim {}",
                params.whitening_size,
                params.proj_output_dim
            );
        }

        let base = BaseMethod::new(config, group, device)?;
        let projector = MlpHead::new(
            base.features_dim(),
            &HeadConfig::bn_relu(params.proj_hidden_dim, params.proj_output_dim, 1),
            base.vb().pp("projector"),
        )?;
        let whitening = Whitening2d::new(params.proj_output_dim, 0.01, true, params.whitening_eps, device)?;

        Ok(Self {
            base,
            projector,
            whitening,
            params,
        })
    }
}

impl Method for WMse {
    fn name(&self) -> &'static str {
        "wmse"
    }

    fn varmap(&self) -> &VarMap {
        &self.base.varmap
    }

    fn training_step(&mut self, batch: &Batch, _ctx: &StepContext) -> Result<StepOutput> {
        self.base.check_views(batch)?;
        let batch_size = batch.batch_size()?;
        let w_size = self.params.whitening_size;
        if batch_size % w_size != 0 {
            candle_core::bail!("batch of {batch_size} cannot be split into whitening groups of {w_size}");
        }

        let num_large = self.base.num_large_crops;
        let feats = self.base.backbone_views(&batch.views)?;
        let v = feats[..num_large]
            .iter()
            .map(|f| self.projector.forward_t(f, true))
            .collect::<Result<Vec<_>>>()?;

        let mut terms = Vec::new();
        for _ in 0..self.params.whitening_iters {
            let mut perm: Vec<u32> = (0..batch_size as u32).collect();
            perm.shuffle(&mut rand::thread_rng());

            // rows of every view are permuted alike, so pairs stay aligned
            let mut z = vec![Vec::new(); num_large];
            for chunk in perm.chunks(w_size) {
                let idx = Tensor::new(chunk, &self.base.device)?;
                for (i, vi) in v.iter().enumerate() {
                    z[i].push(self.whitening.forward(&vi.index_select(&idx, 0)?, true)?);
                }
            }
            let z = z
                .iter()
                .map(|parts| Tensor::cat(parts, 0))
                .collect::<Result<Vec<_>>>()?;

            for i in 0..num_large {
                for j in i + 1..num_large {
                    terms.push(wmse_loss_func(&z[i], &z[j])?);
                }
            }
        }

        let n = terms.len() as f64;
        let wmse_loss = (Tensor::stack(&terms, 0)?.sum_all()? / n)?;

        let mut metrics = HashMap::new();
        record_loss(&mut metrics, "wmse", &wmse_loss)?;
        let loss = self.base.total_loss(wmse_loss, &feats, batch.targets.as_ref(), &mut metrics)?;

        Ok(StepOutput { loss, metrics })
    }

    fn buffers(&self) -> Result<HashMap<String, Tensor>> {
        Ok(HashMap::from([
            ("whitening.running_mean".to_string(), self.whitening.running_mean().clone()),
            ("whitening.running_variance".to_string(), self.whitening.running_variance().clone()),
        ]))
    }

    fn load_buffers(&mut self, buffers: &HashMap<String, Tensor>) -> Result<usize> {
        match (buffers.get("whitening.running_mean"), buffers.get("whitening.running_variance")) {
            (Some(mean), Some(variance)) => {
                self.whitening.set_running_stats(mean, variance)?;
                Ok(2)
            }
            _ => {
                log::warn!("no saved whitening statistics");
                Ok(0)
            }
        }
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
