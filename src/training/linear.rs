/// Linear and k-NN evaluation of frozen features
use candle_core::{DType, Device, Tensor};
use candle_nn::{linear, loss, Linear, Module, Optimizer, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::optimizer::{MomentumSgd, ParamsSgd};
use super::scheduler::{LrScheduler, SchedulerConfig, SchedulerKind};
use crate::data::ViewLoader;
use crate::utils::knn::{Distance, WeightedKnnClassifier};
use crate::utils::metrics::{accuracy_at_k, weighted_mean};

/// Linear probe settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LinearConfig {
    pub max_epochs: usize,
    pub batch_size: usize,
    pub lr: f64,
    pub weight_decay: f64,
    pub momentum: f64,
    pub scheduler: SchedulerConfig,
}

impl Default for LinearConfig {
    fn default() -> Self {
        Self {
            max_epochs: 100,
            batch_size: 256,
            lr: 0.1,
            weight_decay: 0.0,
            momentum: 0.9,
            scheduler: SchedulerConfig {
                kind: SchedulerKind::Step,
                lr_decay_steps: vec![60, 80],
                gamma: 0.1,
                ..Default::default()
            },
        }
    }
}

/// Validation metrics, averaged over samples
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LinearEvalReport {
    pub loss: f64,
    pub acc1: f64,
    pub acc5: f64,
}

/// Linear classifier trained on frozen features
pub struct LinearProbe {
    varmap: VarMap,
    classifier: Linear,
    optimizer: MomentumSgd,
    scheduler: LrScheduler,
    config: LinearConfig,
}

impl LinearProbe {
    pub fn new(
        features_dim: usize,
        num_classes: usize,
        config: LinearConfig,
        steps_per_epoch: usize,
        device: &Device,
    ) -> candle_core::Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let classifier = linear(features_dim, num_classes, vb.pp("classifier"))?;

        let params = ParamsSgd {
            lr: config.lr,
            momentum: config.momentum,
            weight_decay: config.weight_decay,
            nesterov: false,
        };
        let optimizer = MomentumSgd::new(varmap.all_vars(), params)?;
        let scheduler = LrScheduler::new(config.scheduler.clone(), config.lr, steps_per_epoch, config.max_epochs);

        Ok(Self {
            varmap,
            classifier,
            optimizer,
            scheduler,
            config,
        })
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn forward(&self, feats: &Tensor) -> candle_core::Result<Tensor> {
        self.classifier.forward(&feats.detach())
    }

    fn shared_step(&self, feats: &Tensor, targets: &Tensor) -> candle_core::Result<(Tensor, HashMap<String, f64>)> {
        let logits = self.forward(feats)?;
        let loss = loss::cross_entropy(&logits, &targets.to_dtype(DType::U32)?)?;

        let top_k = [1, 5.min(logits.dim(1)?)];
        let acc = accuracy_at_k(&logits, targets, &top_k)?;

        let mut metrics = HashMap::new();
        metrics.insert("batch_size".to_string(), feats.dim(0)? as f64);
        metrics.insert("loss".to_string(), loss.to_scalar::<f32>()? as f64);
        metrics.insert("acc1".to_string(), acc[0]);
        metrics.insert("acc5".to_string(), acc[1]);
        Ok((loss, metrics))
    }

    /// One SGD step on a batch of features
    pub fn train_step(&mut self, feats: &Tensor, targets: &Tensor) -> candle_core::Result<HashMap<String, f64>> {
        self.optimizer.set_learning_rate(self.scheduler.get_lr());
        let (loss, metrics) = self.shared_step(feats, targets)?;
        self.optimizer.backward_step(&loss)?;
        self.scheduler.step();
        Ok(metrics)
    }

    /// Train on features produced by `encode`
    pub fn fit<F>(&mut self, encode: F, loader: &mut impl ViewLoader, device: &Device) -> crate::Result<()>
    where
        F: Fn(&Tensor) -> candle_core::Result<Tensor>,
    {
        for epoch in 0..self.config.max_epochs {
            loader.reset();
            let mut outputs = Vec::new();
            while let Some(batch) = loader.next_batch(device)? {
                let Some(targets) = batch.targets.as_ref() else {
                    return Err(crate::SoloError::Training("linear probe needs labelled batches".to_string()));
                };
                let feats = encode(&batch.views[0])?;
                outputs.push(self.train_step(&feats, targets)?);
            }
            log::info!(
                "Linear epoch {}/{}: loss={:.4}, acc1={:.2}",
                epoch + 1,
                self.config.max_epochs,
                weighted_mean(&outputs, "loss", "batch_size"),
                weighted_mean(&outputs, "acc1", "batch_size")
            );
        }
        Ok(())
    }

    /// Sample-weighted validation loss and accuracies
    pub fn evaluate<F>(&self, encode: F, loader: &mut impl ViewLoader, device: &Device) -> crate::Result<LinearEvalReport>
    where
        F: Fn(&Tensor) -> candle_core::Result<Tensor>,
    {
        loader.reset();
        let mut outputs = Vec::new();
        while let Some(batch) = loader.next_batch(device)? {
            let Some(targets) = batch.targets.as_ref() else {
                return Err(crate::SoloError::Training("evaluation needs labelled batches".to_string()));
            };
            let feats = encode(&batch.views[0])?;
            outputs.push(self.shared_step(&feats, targets)?.1);
        }

        Ok(LinearEvalReport {
            loss: weighted_mean(&outputs, "loss", "batch_size"),
            acc1: weighted_mean(&outputs, "acc1", "batch_size"),
            acc5: weighted_mean(&outputs, "acc5", "batch_size"),
        })
    }
}

/// k-NN evaluation settings
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KnnConfig {
    pub k: usize,
    pub temperature: f64,
    pub distance: Distance,
}

impl Default for KnnConfig {
    fn default() -> Self {
        Self {
            k: 20,
            temperature: 0.07,
            distance: Distance::Cosine,
        }
    }
}

/// Weighted k-NN accuracy `(acc@1, acc@5)` of encoded features
pub fn knn_evaluate<F>(
    encode: F,
    train_loader: &mut impl ViewLoader,
    test_loader: &mut impl ViewLoader,
    config: &KnnConfig,
    device: &Device,
) -> crate::Result<(f64, f64)>
where
    F: Fn(&Tensor) -> candle_core::Result<Tensor>,
{
    let mut knn = WeightedKnnClassifier::new(config.k, config.temperature, config.distance);
    for (feats, targets) in encode_all(&encode, train_loader, device)? {
        knn.update(Some((&feats, &targets)), None)?;
    }
    for (feats, targets) in encode_all(&encode, test_loader, device)? {
        knn.update(None, Some((&feats, &targets)))?;
    }

    Ok(knn.compute()?)
}

fn encode_all<F>(encode: &F, loader: &mut impl ViewLoader, device: &Device) -> crate::Result<Vec<(Tensor, Tensor)>>
where
    F: Fn(&Tensor) -> candle_core::Result<Tensor>,
{
    loader.reset();
    let mut out = Vec::with_capacity(loader.num_batches());
    while let Some(batch) = loader.next_batch(device)? {
        let Some(targets) = batch.targets else {
            return Err(crate::SoloError::Training("k-NN needs labelled batches".to_string()));
        };
        out.push((encode(&batch.views[0])?, targets));
    }
    Ok(out)
}
