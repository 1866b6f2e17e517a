/// MoCo V2+: InfoNCE against a queue of momentum keys
use candle_core::{DType, Device, Result, Tensor};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use super::base::{record_loss, BaseMethod, MomentumBackbone};
use super::{Method, MethodConfig, MethodOutput, StepContext, StepOutput};
use crate::data::Batch;
use crate::layers::{HeadConfig, MlpHead};
use crate::losses::mocov2plus_loss_func;
use crate::utils::gather::{gather, ProcessGroup};
use crate::utils::misc::l2_normalize;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MocoV2PlusParams {
    pub proj_hidden_dim: usize,
    pub proj_output_dim: usize,
    pub temperature: f64,
    /// Number of negatives kept per view
    pub queue_size: usize,
    pub base_tau_momentum: f64,
    pub final_tau_momentum: f64,
}

impl Default for MocoV2PlusParams {
    fn default() -> Self {
        Self {
            proj_hidden_dim: 2048,
            proj_output_dim: 256,
            temperature: 0.2,
            queue_size: 65536,
            base_tau_momentum: 0.99,
            final_tau_momentum: 1.0,
        }
    }
}

/// Ring buffer of normalized keys, one `[queue_size, dim]` tensor per view
struct KeyQueue {
    queues: [Tensor; 2],
    ptr: usize,
}

impl KeyQueue {
    fn new(queue_size: usize, dim: usize, device: &Device) -> Result<Self> {
        let make = || l2_normalize(&Tensor::randn(0f32, 1.0, (queue_size, dim), device)?);
        Ok(Self {
            queues: [make()?, make()?],
            ptr: 0,
        })
    }

    fn size(&self) -> Result<usize> {
        self.queues[0].dim(0)
    }

    /// Overwrite the oldest keys with `keys` (one tensor per view)
    fn dequeue_and_enqueue(&mut self, keys: [&Tensor; 2]) -> Result<()> {
        let batch = keys[0].dim(0)?;
        let size = self.size()?;
        if size % batch != 0 {
            candle_core::bail!("queue size {size} is not a multiple of the gathered batch {batch}");
        }

        let dim = keys[0].dim(1)?;
        for (queue, k) in self.queues.iter_mut().zip(keys) {
            *queue = queue.slice_assign(&[self.ptr..self.ptr + batch, 0..dim], &k.detach())?;
        }
        self.ptr = (self.ptr + batch) % size;
        Ok(())
    }
    fn restore(&mut self, queues: &Tensor, ptr: usize) -> Result<()> {
        let expected = [2, self.size()?, self.queues[0].dim(1)?];
        if queues.dims() != expected || ptr >= expected[1] {
            candle_core::bail!("saved queue {:?} at {ptr} does not fit {:?}", queues.dims(), expected);
        }
        let device = self.queues[0].device().clone();
        let queues = queues.to_dtype(DType::F32)?.to_device(&device)?;
        self.queues = [queues.get(0)?, queues.get(1)?];
        self.ptr = ptr;
        Ok(())
    }
}

pub struct MocoV2Plus {
    base: BaseMethod,
    projector: MlpHead,
    momentum: MomentumBackbone,
    momentum_projector: MlpHead,
    queue: KeyQueue,
    params: MocoV2PlusParams,
}

impl MocoV2Plus {
    pub fn new(
        config: &MethodConfig,
        params: MocoV2PlusParams,
        group: Arc<dyn ProcessGroup>,
        device: &Device,
    ) -> Result<Self> {
        let base = BaseMethod::new(config, group, device)?;
        let proj_config = HeadConfig::relu(params.proj_hidden_dim, params.proj_output_dim);
        let projector = MlpHead::new(base.features_dim(), &proj_config, base.vb().pp("projector"))?;

        let momentum = MomentumBackbone::new(config, device)?;
        let momentum_projector = MlpHead::new(
            base.features_dim(),
            &proj_config,
            momentum.vb(device).pp("projector"),
        )?;
        momentum.initialize_from(&base.varmap)?;

        let queue = KeyQueue::new(params.queue_size, params.proj_output_dim, device)?;

        Ok(Self {
            base,
            projector,
            momentum,
            momentum_projector,
            queue,
            params,
        })
    }

    /// Snapshot of the negatives of both views
    pub fn queue(&self) -> [&Tensor; 2] {
        [&self.queue.queues[0], &self.queue.queues[1]]
    }

    fn query(&self, feats: &Tensor) -> Result<Tensor> {
        l2_normalize(&self.projector.forward_t(feats, true)?)
    }

    fn key(&self, x: &Tensor) -> Result<Tensor> {
        let f = self.momentum.forward(x)?;
        l2_normalize(&self.momentum_projector.forward_t(&f, true)?.detach())
    }
}

impl Method for MocoV2Plus {
    fn name(&self) -> &'static str {
        "mocov2plus"
    }

    fn varmap(&self) -> &VarMap {
        &self.base.varmap
    }

    fn momentum_varmap(&self) -> Option<&VarMap> {
        Some(&self.momentum.varmap)
    }

    fn training_step(&mut self, batch: &Batch, _ctx: &StepContext) -> Result<StepOutput> {
        self.base.check_views(batch)?;
        let feats = self.base.backbone_views(&batch.views)?;

        let q1 = self.query(&feats[0])?;
        let q2 = self.query(&feats[1])?;
        let k1 = self.key(&batch.views[0])?;
        let k2 = self.key(&batch.views[1])?;

        let t = self.params.temperature;
        let [queue1, queue2] = self.queue();
        // each query is contrasted with the negatives of the other view
        let nce_loss = ((mocov2plus_loss_func(&q1, &k2, queue2, t)?
            + mocov2plus_loss_func(&q2, &k1, queue1, t)?)?
            / 2.0)?;

        let group = self.base.group.as_ref();
        let k1 = gather(&k1, group)?.to_dtype(DType::F32)?;
        let k2 = gather(&k2, group)?.to_dtype(DType::F32)?;
        self.queue.dequeue_and_enqueue([&k1, &k2])?;

        let mut metrics = HashMap::new();
        record_loss(&mut metrics, "nce", &nce_loss)?;
        let loss = self.base.total_loss(nce_loss, &feats, batch.targets.as_ref(), &mut metrics)?;

        Ok(StepOutput { loss, metrics })
    }

    fn buffers(&self) -> Result<HashMap<String, Tensor>> {
        let device = self.queue.queues[0].device();
        Ok(HashMap::from([
            ("queue".to_string(), Tensor::stack(&self.queue.queues, 0)?),
            ("queue_ptr".to_string(), Tensor::new(&[self.queue.ptr as u32], device)?),
        ]))
    }

    fn load_buffers(&mut self, buffers: &HashMap<String, Tensor>) -> Result<usize> {
        match (buffers.get("queue"), buffers.get("queue_ptr")) {
            (Some(queues), Some(ptr)) => {
                let ptr = ptr.to_dtype(DType::U32)?.to_vec1::<u32>()?;
                let Some(&ptr) = ptr.first() else {
                    candle_core::bail!("empty queue pointer");
                };
                self.queue.restore(queues, ptr as usize)?;
                Ok(2)
            }
            _ => {
                log::warn!("no saved key queue");
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
