/// Pieces shared by every method: encoder, online classifier, momentum copy
use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::loss::cross_entropy;
use candle_nn::{linear, Linear, VarBuilder, VarMap};
use std::collections::HashMap;
use std::sync::Arc;

use super::MethodConfig;
use crate::data::Batch;
use crate::layers::Mlp;
use crate::utils::gather::ProcessGroup;
use crate::utils::metrics::accuracy_at_k;
use crate::utils::momentum::initialize_momentum_params;

/// Encoder plus an online linear classifier trained on detached features
///
/// The classifier measures representation quality during pretraining; its
/// gradients never reach the encoder.
pub struct BaseMethod {
    pub varmap: VarMap,
    pub backbone: Mlp,
    classifier: Option<Linear>,
    pub num_large_crops: usize,
    pub num_small_crops: usize,
    pub group: Arc<dyn ProcessGroup>,
    pub device: Device,
}

impl BaseMethod {
    pub fn new(config: &MethodConfig, group: Arc<dyn ProcessGroup>, device: &Device) -> Result<Self> {
        if config.num_large_crops < 2 {
            candle_core::bail!("at least two large crops are required, got {}", config.num_large_crops);
        }

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let backbone = Mlp::new(config.input_dim, &config.encoder, vb.pp("backbone"))?;
        let classifier = if config.num_classes > 0 {
            Some(linear(backbone.output_dim(), config.num_classes, vb.pp("classifier"))?)
        } else {
            None
        };

        Ok(Self {
            varmap,
            backbone,
            classifier,
            num_large_crops: config.num_large_crops,
            num_small_crops: config.num_small_crops,
            group,
            device: device.clone(),
        })
    }

    /// Builder for method-specific online parameters
    pub fn vb(&self) -> VarBuilder<'_> {
        VarBuilder::from_varmap(&self.varmap, DType::F32, &self.device)
    }

    pub fn features_dim(&self) -> usize {
        self.backbone.output_dim()
    }

    pub fn num_crops(&self) -> usize {
        self.num_large_crops + self.num_small_crops
    }

    /// Ensure the batch carries one view per crop
    pub fn check_views(&self, batch: &Batch) -> Result<()> {
        if batch.views.len() != self.num_crops() {
            candle_core::bail!(
                "expected {} views ({} large + {} small), got {}",
                self.num_crops(),
                self.num_large_crops,
                self.num_small_crops,
                batch.views.len()
            );
        }
        Ok(())
    }

    /// Encoder features of every view, in training mode
    pub fn backbone_views(&self, views: &[Tensor]) -> Result<Vec<Tensor>> {
        views.iter().map(|x| self.backbone.forward_t(x, true)).collect()
    }

    pub fn logits(&self, feats: &Tensor) -> Result<Option<Tensor>> {
        match &self.classifier {
            Some(classifier) => Ok(Some(classifier.forward(&feats.detach())?)),
            None => Ok(None),
        }
    }

    /// Classification loss and accuracy averaged over the large crops
    ///
    /// Returns `None` when there are no targets or no classifier.
    pub fn class_step(
        &self,
        feats: &[Tensor],
        targets: Option<&Tensor>,
        metrics: &mut HashMap<String, f64>,
    ) -> Result<Option<Tensor>> {
        let (Some(classifier), Some(targets)) = (&self.classifier, targets) else {
            return Ok(None);
        };
        let num_classes = classifier.weight().dim(0)?;
        let top_k = [1, 5.min(num_classes)];

        let mut losses = Vec::with_capacity(self.num_large_crops);
        let (mut acc1, mut acc5) = (0.0, 0.0);
        for f in feats.iter().take(self.num_large_crops) {
            let logits = classifier.forward(&f.detach())?;
            losses.push(cross_entropy(&logits, targets)?);
            let acc = accuracy_at_k(&logits, targets, &top_k)?;
            acc1 += acc[0];
            acc5 += acc[1];
        }

        let n = losses.len() as f64;
        let loss = (Tensor::stack(&losses, 0)?.sum_all()? / n)?;
        metrics.insert("train_class_loss".to_string(), loss.to_scalar::<f32>()? as f64);
        metrics.insert("train_acc1".to_string(), acc1 / n);
        metrics.insert("train_acc5".to_string(), acc5 / n);

        Ok(Some(loss))
    }

    /// Add the classification loss, when there is one, to the method loss
    pub fn total_loss(
        &self,
        method_loss: Tensor,
        feats: &[Tensor],
        targets: Option<&Tensor>,
        metrics: &mut HashMap<String, f64>,
    ) -> Result<Tensor> {
        match self.class_step(feats, targets, metrics)? {
            Some(class_loss) => method_loss + class_loss,
            None => Ok(method_loss),
        }
    }
}

/// Momentum copy of the encoder and of a method head
pub struct MomentumBackbone {
    pub varmap: VarMap,
    pub backbone: Mlp,
}

impl MomentumBackbone {
    pub fn new(config: &MethodConfig, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let backbone = Mlp::new(config.input_dim, &config.encoder, vb.pp("backbone"))?;
        Ok(Self { varmap, backbone })
    }

    pub fn vb<'a>(&'a self, device: &'a Device) -> VarBuilder<'a> {
        VarBuilder::from_varmap(&self.varmap, DType::F32, device)
    }

    /// Copy the online weights once every momentum parameter is created
    pub fn initialize_from(&self, online: &VarMap) -> Result<()> {
        initialize_momentum_params(online, &self.varmap)
    }

    /// Detached momentum features
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        Ok(self.backbone.forward_t(x, true)?.detach())
    }
}

/// Insert the loss value under `train_{name}_loss`
pub fn record_loss(metrics: &mut HashMap<String, f64>, name: &str, loss: &Tensor) -> Result<()> {
    metrics.insert(format!("train_{name}_loss"), loss.to_scalar::<f32>()? as f64);
    Ok(())
}
