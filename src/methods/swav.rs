/// SwAV: swapped prediction of Sinkhorn-Knopp cluster assignments
use candle_core::{DType, Device, Result, Tensor};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use super::base::{record_loss, BaseMethod};
use super::{Method, MethodConfig, MethodOutput, StepContext, StepOutput};
use crate::data::Batch;
use crate::layers::{HeadConfig, MlpHead};
use crate::losses::swav_loss_func;
use crate::utils::gather::ProcessGroup;
use crate::utils::misc::{l2_normalize, register_var, trunc_normal, TruncNormal};
use crate::utils::sinkhorn_knopp::SinkhornKnopp;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SwAVParams {
    pub proj_hidden_dim: usize,
    pub proj_output_dim: usize,
    pub num_prototypes: usize,
    pub sk_iters: usize,
    pub sk_epsilon: f64,
    pub temperature: f64,
    /// Past projections kept per large crop, 0 disables the queue
    pub queue_size: usize,
    pub epoch_queue_starts: usize,
    /// Prototypes receive no updates before this epoch
    pub freeze_prototypes_epochs: usize,
}

impl Default for SwAVParams {
    fn default() -> Self {
        Self {
            proj_hidden_dim: 2048,
            proj_output_dim: 128,
            num_prototypes: 3000,
            sk_iters: 3,
            sk_epsilon: 0.05,
            temperature: 0.1,
            queue_size: 3840,
            epoch_queue_starts: 50,
            freeze_prototypes_epochs: 2,
        }
    }
}

/// Projections of past batches, newest first
struct ProjectionQueue {
    queues: Vec<Tensor>,
    filled: usize,
}

impl ProjectionQueue {
    fn new(num_crops: usize, size: usize, dim: usize, device: &Device) -> Result<Self> {
        let queues = (0..num_crops)
            .map(|_| Tensor::zeros((size, dim), DType::F32, device))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { queues, filled: 0 })
    }

    fn is_full(&self) -> Result<bool> {
        Ok(self.filled >= self.queues[0].dim(0)?)
    }

    fn push(&mut self, z: &[Tensor]) -> Result<()> {
        let size = self.queues[0].dim(0)?;
        for (queue, z) in self.queues.iter_mut().zip(z) {
            let z = z.detach().to_dtype(DType::F32)?;
            let batch = z.dim(0)?;
            *queue = if batch >= size {
                z.narrow(0, 0, size)?
            } else {
                Tensor::cat(&[&z, &queue.narrow(0, 0, size - batch)?], 0)?
            };
        }
        self.filled = (self.filled + z[0].dim(0)?).min(size);
        Ok(())
    }
}

pub struct SwAV {
    base: BaseMethod,
    projector: MlpHead,
    /// `[num_prototypes, proj_output_dim]`, kept row-normalized
    prototypes: candle_core::Var,
    sk: SinkhornKnopp,
    queue: Option<ProjectionQueue>,
    params: SwAVParams,
    epoch: usize,
}

impl SwAV {
    pub fn new(
        config: &MethodConfig,
        params: SwAVParams,
        group: Arc<dyn ProcessGroup>,
        device: &Device,
    ) -> Result<Self> {
        let base = BaseMethod::new(config, group.clone(), device)?;
        let projector = MlpHead::new(
            base.features_dim(),
            &HeadConfig::bn_relu(params.proj_hidden_dim, params.proj_output_dim, 1),
            base.vb().pp("projector"),
        )?;

        let init = trunc_normal(
            (params.num_prototypes, params.proj_output_dim),
            &TruncNormal::default(),
            device,
        )?;
        let prototypes = register_var(&base.varmap, "prototypes.weight", &l2_normalize(&init)?)?;

        let sk = SinkhornKnopp::new(params.sk_iters, params.sk_epsilon).with_group(group);

        Ok(Self {
            base,
            projector,
            prototypes,
            sk,
            queue: None,
            params,
            epoch: 0,
        })
    }

    fn normalize_prototypes(&self) -> Result<()> {
        let normalized = l2_normalize(&self.prototypes.as_tensor().detach())?;
        self.prototypes.set(&normalized)
    }

    /// Normalized projection and prototype scores
    fn project(&self, feats: &Tensor, train: bool) -> Result<(Tensor, Tensor)> {
        let z = l2_normalize(&self.projector.forward_t(feats, train)?)?;
        let prototypes = if self.epoch < self.params.freeze_prototypes_epochs {
            self.prototypes.as_tensor().detach()
        } else {
            self.prototypes.as_tensor().clone()
        };
        let p = z.matmul(&prototypes.t()?)?;
        Ok((z, p))
    }

    /// Soft cluster assignments of the large crops
    fn get_assignments(&self, preds: &[Tensor]) -> Result<Vec<Tensor>> {
        let batch = preds[0].dim(0)?;
        let use_queue = match &self.queue {
            Some(queue) => queue.is_full()?,
            None => false,
        };

        let prototypes = self.prototypes.as_tensor().detach();
        let mut assignments = Vec::with_capacity(preds.len());
        for (i, p) in preds.iter().enumerate() {
            let p = p.detach();
            let scores = match (&self.queue, use_queue) {
                (Some(queue), true) => {
                    let queued = queue.queues[i].matmul(&prototypes.t()?)?;
                    Tensor::cat(&[&p, &queued], 0)?
                }
                _ => p,
            };
            assignments.push(self.sk.forward(&scores)?.narrow(0, 0, batch)?);
        }
        Ok(assignments)
    }
}

impl Method for SwAV {
    fn name(&self) -> &'static str {
        "swav"
    }

    fn varmap(&self) -> &VarMap {
        &self.base.varmap
    }

    fn on_train_epoch_start(&mut self, epoch: usize) -> Result<()> {
        self.epoch = epoch;
        if self.params.queue_size > 0 && epoch >= self.params.epoch_queue_starts && self.queue.is_none() {
            log::info!("SwAV queue of {} projections enabled", self.params.queue_size);
            self.queue = Some(ProjectionQueue::new(
                self.base.num_large_crops,
                self.params.queue_size,
                self.params.proj_output_dim,
                &self.base.device,
            )?);
        }
        Ok(())
    }

    fn training_step(&mut self, batch: &Batch, _ctx: &StepContext) -> Result<StepOutput> {
        self.base.check_views(batch)?;
        self.normalize_prototypes()?;

        let feats = self.base.backbone_views(&batch.views)?;
        let mut z = Vec::with_capacity(feats.len());
        let mut preds = Vec::with_capacity(feats.len());
        for f in &feats {
            let (zi, pi) = self.project(f, true)?;
            z.push(zi);
            preds.push(pi);
        }

        let num_large = self.base.num_large_crops;
        let assignments = self.get_assignments(&preds[..num_large])?;
        let swav_loss = swav_loss_func(&preds, &assignments, self.params.temperature)?;

        if let Some(queue) = self.queue.as_mut() {
            queue.push(&z[..num_large])?;
        }

        let mut metrics = HashMap::new();
        record_loss(&mut metrics, "swav", &swav_loss)?;
        let loss = self.base.total_loss(swav_loss, &feats, batch.targets.as_ref(), &mut metrics)?;

        Ok(StepOutput { loss, metrics })
    }

    fn forward(&self, x: &Tensor) -> Result<MethodOutput> {
        let feats = self.base.backbone.forward_t(x, false)?;
        let (z, p) = self.project(&feats, false)?;
        Ok(MethodOutput {
            logits: self.base.logits(&feats)?,
            feats,
            z: Some(z),
            p: Some(p),
        })
    }
}
