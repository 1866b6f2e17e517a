/// Pretraining loop
use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use super::lars::{Lars, LarsConfig};
use super::optimizer::{MomentumSgd, ParamsSgd};
use super::scheduler::LrScheduler;
use crate::config::{OptimizerConfig, OptimizerKind, PretrainConfig};
use crate::data::{Batch, ViewLoader};
use crate::methods::{self, Method, StepContext};
use crate::utils::checkpointer::{Checkpoint, Checkpointer, TrainingState};
use crate::utils::gather::{ProcessGroup, SingleProcess};
use crate::utils::momentum::MomentumUpdater;

/// Prefix of optimizer state in exported tensors
pub const OPTIMIZER_PREFIX: &str = "optimizer.";

/// Optimizer of a pretraining run, optionally wrapped with LARS
pub enum PretrainOptimizer {
    Sgd(MomentumSgd),
    AdamW(AdamW),
    LarsSgd(Lars<MomentumSgd>),
    LarsAdamW(Lars<AdamW>),
}

impl PretrainOptimizer {
    pub fn new(vars: Vec<Var>, config: &OptimizerConfig) -> candle_core::Result<Self> {
        let lars_config = LarsConfig {
            eta: config.eta_lars,
            clip: config.grad_clip_lars,
            exclude_bias_n_norm: config.exclude_bias_n_norm,
            ..Default::default()
        };

        let optimizer = match config.kind {
            OptimizerKind::Sgd => {
                let params = ParamsSgd {
                    lr: config.lr,
                    momentum: config.momentum,
                    weight_decay: config.weight_decay,
                    nesterov: config.nesterov,
                };
                let sgd = MomentumSgd::new(vars.clone(), params)?;
                if config.lars {
                    PretrainOptimizer::LarsSgd(Lars::new(sgd, vars, lars_config))
                } else {
                    PretrainOptimizer::Sgd(sgd)
                }
            }
            OptimizerKind::Adamw => {
                let params = ParamsAdamW {
                    lr: config.lr,
                    beta1: config.betas.0,
                    beta2: config.betas.1,
                    eps: 1e-8,
                    weight_decay: config.weight_decay,
                };
                let adamw = AdamW::new(vars.clone(), params)?;
                if config.lars {
                    PretrainOptimizer::LarsAdamW(Lars::new(adamw, vars, lars_config))
                } else {
                    PretrainOptimizer::AdamW(adamw)
                }
            }
        };
        Ok(optimizer)
    }

    pub fn learning_rate(&self) -> f64 {
        match self {
            PretrainOptimizer::Sgd(o) => o.learning_rate(),
            PretrainOptimizer::AdamW(o) => o.learning_rate(),
            PretrainOptimizer::LarsSgd(o) => o.learning_rate(),
            PretrainOptimizer::LarsAdamW(o) => o.learning_rate(),
        }
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        match self {
            PretrainOptimizer::Sgd(o) => o.set_learning_rate(lr),
            PretrainOptimizer::AdamW(o) => o.set_learning_rate(lr),
            PretrainOptimizer::LarsSgd(o) => o.set_learning_rate(lr),
            PretrainOptimizer::LarsAdamW(o) => o.set_learning_rate(lr),
        }
    }

    /// Parameter update from precomputed gradients (LARS rescales them in place)
    pub fn step(&mut self, grads: &mut GradStore) -> candle_core::Result<()> {
        match self {
            PretrainOptimizer::Sgd(o) => o.step(grads),
            PretrainOptimizer::AdamW(o) => o.step(grads),
            PretrainOptimizer::LarsSgd(o) => o.step(grads),
            PretrainOptimizer::LarsAdamW(o) => o.step(grads),
        }
    }

    /// Backward pass and parameter update
    pub fn backward_step(&mut self, loss: &Tensor) -> candle_core::Result<()> {
        let mut grads = loss.backward()?;
        self.step(&mut grads)
    }

    fn momentum_sgd(&self) -> Option<&MomentumSgd> {
        match self {
            PretrainOptimizer::Sgd(o) => Some(o),
            PretrainOptimizer::LarsSgd(o) => Some(o.inner()),
            _ => None,
        }
    }

    fn momentum_sgd_mut(&mut self) -> Option<&mut MomentumSgd> {
        match self {
            PretrainOptimizer::Sgd(o) => Some(o),
            PretrainOptimizer::LarsSgd(o) => Some(o.inner_mut()),
            _ => None,
        }
    }

    /// Velocity buffers under [`OPTIMIZER_PREFIX`] and the parameter name
    ///
    /// AdamW moments stay inside candle-nn and are not exported.
    pub fn state(&self, params: &[(String, Var)]) -> HashMap<String, Tensor> {
        let Some(sgd) = self.momentum_sgd() else {
            return HashMap::new();
        };
        params
            .iter()
            .filter_map(|(name, var)| {
                sgd.velocity(var)
                    .map(|v| (format!("{OPTIMIZER_PREFIX}{name}"), v.detach()))
            })
            .collect()
    }

    /// Restore buffers exported by [`PretrainOptimizer::state`], returning how many were set
    pub fn load_state(
        &mut self,
        params: &[(String, Var)],
        tensors: &HashMap<String, Tensor>,
    ) -> candle_core::Result<usize> {
        let Some(sgd) = self.momentum_sgd_mut() else {
            return Ok(0);
        };
        let mut loaded = 0;
        for (name, var) in params {
            if let Some(velocity) = tensors.get(&format!("{OPTIMIZER_PREFIX}{name}")) {
                if sgd.set_velocity(var, velocity)? {
                    loaded += 1;
                }
            }
        }
        Ok(loaded)
    }
}

/// Variables of `varmap` sorted by name, so every replica walks them in the same order
fn sorted_vars(varmap: &VarMap) -> candle_core::Result<Vec<(String, Var)>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| candle_core::Error::Msg("varmap lock poisoned".to_string()))?;
    let mut vars: Vec<_> = data.iter().map(|(name, var)| (name.clone(), var.clone())).collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(vars)
}

/// Overwrite every replica's copy of `vars` with rank 0's values
fn broadcast_vars(vars: &[(String, Var)], group: &dyn ProcessGroup) -> candle_core::Result<()> {
    for (name, var) in vars {
        let parts = group.all_gather(&var.as_tensor().copy()?)?;
        let Some(source) = parts.first() else {
            candle_core::bail!("no value of {name} from rank 0");
        };
        if group.rank() != 0 {
            var.set(source)?;
        }
    }
    Ok(())
}

/// Overwrite every replica's method buffers with rank 0's values
fn broadcast_buffers(method: &mut dyn Method, group: &dyn ProcessGroup) -> candle_core::Result<()> {
    let mut buffers: Vec<_> = method.buffers()?.into_iter().collect();
    buffers.sort_by(|a, b| a.0.cmp(&b.0));

    let mut synced = HashMap::new();
    for (name, buffer) in buffers {
        let parts = group.all_gather(&buffer)?;
        let Some(source) = parts.into_iter().next() else {
            candle_core::bail!("no value of {name} from rank 0");
        };
        synced.insert(name, source);
    }
    if group.rank() != 0 {
        method.load_buffers(&synced)?;
    }
    Ok(())
}

/// Replace each gradient by its mean over the replicas
fn average_gradients(
    grads: &mut GradStore,
    params: &[(String, Var)],
    group: &dyn ProcessGroup,
) -> candle_core::Result<()> {
    let world_size = group.world_size() as f64;
    for (_, var) in params {
        let Some(grad) = grads.get(var) else {
            continue;
        };
        let mean = (group.all_reduce_sum(grad)? / world_size)?;
        grads.insert(var, mean);
    }
    Ok(())
}

/// Loss and metrics of one optimizer step
#[derive(Debug, Clone)]
pub struct StepMetrics {
    pub loss: f64,
    pub lr: f64,
    pub metrics: HashMap<String, f64>,
}

/// Self-supervised pretraining of a [`Method`]
pub struct Trainer {
    config: PretrainConfig,
    method: Box<dyn Method>,
    optimizer: PretrainOptimizer,
    scheduler: LrScheduler,
    momentum_updater: Option<MomentumUpdater>,
    checkpointer: Checkpointer,
    group: Arc<dyn ProcessGroup>,
    /// Online parameters in name order
    params: Vec<(String, Var)>,
    step: usize,
    start_epoch: usize,
}

impl Trainer {
    /// # Arguments
    /// * `input_dim` - Dimension of the dataset feature vectors
    /// * `num_classes` - Classes of the online classifier (0 disables it)
    /// * `steps_per_epoch` - Batches per epoch, for the schedules
    pub fn new(
        config: PretrainConfig,
        input_dim: usize,
        num_classes: usize,
        steps_per_epoch: usize,
        device: Device,
    ) -> crate::Result<Self> {
        Self::with_group(config, input_dim, num_classes, steps_per_epoch, Arc::new(SingleProcess), device)
    }

    /// Trainer for one replica of `group`
    ///
    /// Replicas start from rank 0's parameters and average their gradients
    /// before every optimizer step, so they stay identical while each
    /// trains on its own shard of the data.
    pub fn with_group(
        config: PretrainConfig,
        input_dim: usize,
        num_classes: usize,
        steps_per_epoch: usize,
        group: Arc<dyn ProcessGroup>,
        device: Device,
    ) -> crate::Result<Self> {
        config.validate()?;

        let is_global_zero = group.is_global_zero();
        let method_config = config.method_config(input_dim, num_classes);
        let mut method = methods::build(&method_config, group.clone(), &device)?;

        let params = sorted_vars(method.varmap())?;
        if group.world_size() > 1 {
            broadcast_vars(&params, group.as_ref())?;
            if let Some(momentum) = method.momentum_varmap() {
                broadcast_vars(&sorted_vars(momentum)?, group.as_ref())?;
            }
            broadcast_buffers(method.as_mut(), group.as_ref())?;
            log::info!("Replica {} of {} synced from rank 0", group.rank(), group.world_size());
        }

        let optimizer = PretrainOptimizer::new(method.varmap().all_vars(), &config.optimizer)?;
        let scheduler = LrScheduler::new(
            config.scheduler.clone(),
            config.optimizer.lr,
            steps_per_epoch,
            config.max_epochs,
        );

        let momentum_updater = match (config.method.momentum_taus(), method.momentum_varmap()) {
            (Some((base, last)), Some(_)) => Some(MomentumUpdater::new(base, last)?),
            _ => None,
        };

        let mut checkpointer = Checkpointer::new(config.checkpoint.clone(), config.name.clone());
        checkpointer.set_global_zero(is_global_zero);

        log::info!(
            "{} with {} parameters, {} steps per epoch",
            method.name(),
            count_parameters(method.as_ref()),
            steps_per_epoch
        );

        let mut trainer = Self {
            config,
            method,
            optimizer,
            scheduler,
            momentum_updater,
            checkpointer,
            group,
            params,
            step: 0,
            start_epoch: 0,
        };

        if let Some(path) = trainer.config.resume_from_checkpoint.clone() {
            trainer.resume(&path, &device)?;
        }

        Ok(trainer)
    }

    fn resume(&mut self, path: &std::path::Path, device: &Device) -> crate::Result<()> {
        let checkpoint = Checkpoint::load(path, device)?;
        let loaded = methods::load_tensors(self.method.as_mut(), &checkpoint.tensors)?;
        let buffers = self.optimizer.load_state(&self.params, &checkpoint.tensors)?;

        self.step = checkpoint.metadata.step;
        self.start_epoch = checkpoint.metadata.epoch + 1;
        self.scheduler.set_step(self.step);
        if let Some(updater) = self.momentum_updater.as_mut() {
            updater.update_tau(self.step, self.scheduler.total_steps());
        }

        log::info!(
            "Resumed {} tensors and {} optimizer buffers from {:?} at epoch {}, step {}",
            loaded,
            buffers,
            path,
            self.start_epoch,
            self.step
        );
        Ok(())
    }

    pub fn method(&self) -> &dyn Method {
        self.method.as_ref()
    }

    pub fn checkpointer(&self) -> &Checkpointer {
        &self.checkpointer
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    /// Momentum of the target network, if the method has one
    pub fn cur_tau(&self) -> Option<f64> {
        self.momentum_updater.as_ref().map(|u| u.cur_tau())
    }

    /// One optimizer step on `batch`
    pub fn train_step(&mut self, batch: &Batch, epoch: usize) -> crate::Result<StepMetrics> {
        let lr = self.scheduler.get_lr();
        self.optimizer.set_learning_rate(lr);

        let ctx = StepContext {
            epoch,
            global_step: self.step,
            max_steps: self.scheduler.total_steps(),
        };
        let out = self.method.training_step(batch, &ctx)?;
        let loss = out.loss.to_scalar::<f32>()? as f64;
        if !loss.is_finite() {
            return Err(crate::SoloError::Training(format!(
                "non-finite loss {loss} at step {}",
                self.step
            )));
        }

        let mut grads = out.loss.backward()?;
        if self.group.world_size() > 1 {
            average_gradients(&mut grads, &self.params, self.group.as_ref())?;
        }
        self.optimizer.step(&mut grads)?;
        self.scheduler.step();
        self.step += 1;

        if let (Some(updater), Some(momentum)) = (self.momentum_updater.as_mut(), self.method.momentum_varmap()) {
            updater.update(self.method.varmap(), momentum)?;
            updater.update_tau(self.step, self.scheduler.total_steps());
        }

        Ok(StepMetrics {
            loss,
            lr,
            metrics: out.metrics,
        })
    }

    /// Train for one epoch, returning the mean loss
    pub fn train_epoch(&mut self, loader: &mut impl ViewLoader, epoch: usize) -> crate::Result<f64> {
        let device = self.device()?;
        self.method.on_train_epoch_start(epoch)?;
        loader.reset();

        let mut total_loss = 0.0;
        let mut num_batches = 0;
        while let Some(batch) = loader.next_batch(&device)? {
            let out = self.train_step(&batch, epoch)?;
            total_loss += out.loss;
            num_batches += 1;

            log::debug!("step {} loss {:.4} lr {:.6}", self.step, out.loss, out.lr);
            let every = self.config.log_every_n_steps;
            if every > 0 && self.step % every == 0 {
                let mut metrics: Vec<_> = out.metrics.iter().collect();
                metrics.sort_by(|a, b| a.0.cmp(b.0));
                log::info!(
                    "Step {}: loss={:.4}, lr={:.6}, {:?}",
                    self.step,
                    out.loss,
                    out.lr,
                    metrics
                );
            }
        }

        if num_batches == 0 {
            return Err(crate::SoloError::Training("loader produced no batches".to_string()));
        }
        Ok(total_loss / num_batches as f64)
    }

    fn training_state(&self) -> crate::Result<TrainingState> {
        let mut tensors = methods::named_tensors(self.method.as_ref())?;
        tensors.extend(self.optimizer.state(&self.params));
        Ok(TrainingState {
            tensors,
            step: self.step,
            lr: self.optimizer.learning_rate(),
            method: self.method.name().to_string(),
        })
    }

    fn device(&self) -> crate::Result<Device> {
        let vars = self.method.varmap().all_vars();
        let var = vars
            .first()
            .ok_or_else(|| crate::SoloError::Training("method has no parameters".to_string()))?;
        Ok(var.device().clone())
    }

    /// Full training loop, returning the last checkpoint written
    pub fn fit(&mut self, loader: &mut impl ViewLoader) -> crate::Result<Option<PathBuf>> {
        let max_epochs = self.config.max_epochs;
        log::info!("Starting training for {} epochs", max_epochs);
        log::info!("Total batches per epoch: {}", loader.num_batches());

        self.checkpointer.on_train_start(&self.config)?;

        let mut last_epoch = self.start_epoch.saturating_sub(1);
        for epoch in self.start_epoch..max_epochs {
            log::info!("=== Epoch {}/{} ===", epoch + 1, max_epochs);
            let avg_loss = self.train_epoch(loader, epoch)?;
            log::info!(
                "Epoch {} complete: avg_loss={:.4}, step={}",
                epoch + 1,
                avg_loss,
                self.step
            );

            let state = self.training_state()?;
            self.checkpointer.on_train_epoch_end(epoch, &state)?;
            last_epoch = epoch;
        }

        log::info!("Training complete!");
        let state = self.training_state()?;
        self.checkpointer.on_train_end(last_epoch, &state)?;

        Ok(self.checkpointer.last_checkpoint().map(|p| p.to_path_buf()))
    }
}

fn count_parameters(method: &dyn Method) -> usize {
    method
        .varmap()
        .all_vars()
        .iter()
        .map(|v| crate::utils::misc::count_parameters(v.as_tensor()))
        .sum()
}
