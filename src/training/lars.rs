/// Layer-wise adaptive rate scaling (LARS)
///
/// Wraps a base optimizer and rescales every gradient by a per-parameter
/// trust ratio `eta * ||p|| / (||g|| + wd * ||p|| + eps)` before delegating
/// the update. Weight decay is folded into the rescaled gradient, so the base
/// optimizer's own decay is disabled during its step.
use candle_core::backprop::GradStore;
use candle_core::{Result, Tensor, Var};
use candle_nn::Optimizer;

use super::optimizer::WeightDecay;
use crate::utils::misc::l2_norm;

#[derive(Debug, Clone)]
pub struct LarsConfig {
    /// Trust coefficient
    pub eta: f64,
    /// Clip the adaptive rate so it never exceeds the base learning rate
    pub clip: bool,
    pub eps: f64,
    /// Skip adaptation (and weight decay) for 1-D parameters: biases and norms
    pub exclude_bias_n_norm: bool,
}

impl Default for LarsConfig {
    fn default() -> Self {
        Self {
            eta: 1e-3,
            clip: false,
            eps: 1e-8,
            exclude_bias_n_norm: false,
        }
    }
}

pub struct Lars<O> {
    optim: O,
    vars: Vec<Var>,
    config: LarsConfig,
}

impl<O: Optimizer + WeightDecay> Lars<O> {
    /// # Arguments
    /// * `optim` - Base optimizer, built over the same `vars`
    /// * `vars` - Parameters the base optimizer updates
    pub fn new(optim: O, vars: Vec<Var>, config: LarsConfig) -> Self {
        Self {
            optim,
            vars,
            config,
        }
    }

    pub fn config(&self) -> &LarsConfig {
        &self.config
    }

    pub fn inner(&self) -> &O {
        &self.optim
    }

    pub fn inner_mut(&mut self) -> &mut O {
        &mut self.optim
    }

    pub fn learning_rate(&self) -> f64 {
        self.optim.learning_rate()
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.optim.set_learning_rate(lr)
    }

    /// Rescale `grads` in place and step the base optimizer
    pub fn step(&mut self, grads: &mut GradStore) -> Result<()> {
        let weight_decay = self.optim.weight_decay();
        let lr = self.optim.learning_rate();

        for var in self.vars.iter() {
            let Some(grad) = grads.get(var) else {
                continue;
            };
            if self.config.exclude_bias_n_norm && var.rank() <= 1 {
                continue;
            }

            let p_norm = l2_norm(var.as_tensor())?;
            let g_norm = l2_norm(grad)?;
            if p_norm == 0.0 || g_norm == 0.0 {
                continue;
            }

            let mut new_lr = self.config.eta * p_norm / (g_norm + p_norm * weight_decay + self.config.eps);
            if self.config.clip {
                new_lr = (new_lr / lr).min(1.0);
            }

            let scaled = ((grad + (var.as_tensor() * weight_decay)?)? * new_lr)?;
            grads.insert(var, scaled);
        }

        self.optim.set_weight_decay(0.0);
        let result = self.optim.step(grads);
        self.optim.set_weight_decay(weight_decay);
        result
    }

    pub fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        let mut grads = loss.backward()?;
        self.step(&mut grads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::optimizer::{MomentumSgd, ParamsSgd};
    use candle_core::{DType, Device};

    fn plain_sgd(vars: Vec<Var>, lr: f64, weight_decay: f64) -> Result<MomentumSgd> {
        MomentumSgd::new(
            vars,
            ParamsSgd {
                lr,
                momentum: 0.0,
                weight_decay,
                nesterov: false,
            },
        )
    }

    #[test]
    fn test_trust_ratio_scaling() -> Result<()> {
        let device = Device::Cpu;
        // ||p|| = 2
        let param = Var::ones((2, 2), DType::F32, &device)?;
        let sgd = plain_sgd(vec![param.clone()], 1.0, 0.0)?;
        let mut lars = Lars::new(sgd, vec![param.clone()], LarsConfig::default());

        // grad of 3 * sum(p) is 3 everywhere, ||g|| = 6
        let loss = (param.as_tensor().sum_all()? * 3.0)?;
        lars.backward_step(&loss)?;

        // new_lr = 1e-3 * 2 / 6, step = 3 * new_lr = 1e-3
        let value = param.as_tensor().mean_all()?.to_scalar::<f32>()?;
        assert!((value - (1.0 - 1e-3)).abs() < 1e-6, "value {value}");

        Ok(())
    }

    #[test]
    fn test_clip_caps_rate() -> Result<()> {
        let device = Device::Cpu;
        let param = Var::ones((2, 2), DType::F32, &device)?;
        let sgd = plain_sgd(vec![param.clone()], 1e-4, 0.0)?;
        let config = LarsConfig {
            eta: 1.0,
            clip: true,
            ..Default::default()
        };
        let mut lars = Lars::new(sgd, vec![param.clone()], config);

        // new_lr = 2 / 6 = 1/3, clipped to min(1/3 / 1e-4, 1) = 1
        let loss = (param.as_tensor().sum_all()? * 3.0)?;
        lars.backward_step(&loss)?;

        // p = 1 - lr * 3
        let value = param.as_tensor().mean_all()?.to_scalar::<f32>()?;
        assert!((value - (1.0 - 3e-4)).abs() < 1e-6, "value {value}");

        Ok(())
    }

    #[test]
    fn test_excluded_bias_skips_adaptation_and_decay() -> Result<()> {
        let device = Device::Cpu;
        let bias = Var::ones(4, DType::F32, &device)?;
        let sgd = plain_sgd(vec![bias.clone()], 0.1, 0.5)?;
        let config = LarsConfig {
            exclude_bias_n_norm: true,
            ..Default::default()
        };
        let mut lars = Lars::new(sgd, vec![bias.clone()], config);

        let loss = bias.as_tensor().sum_all()?;
        lars.backward_step(&loss)?;

        // raw gradient, no decay: 1 - 0.1 * 1
        let value = bias.as_tensor().mean_all()?.to_scalar::<f32>()?;
        assert!((value - 0.9).abs() < 1e-6, "value {value}");

        // weight decay is restored after the step
        assert_eq!(lars.inner().weight_decay(), 0.5);

        Ok(())
    }

    #[test]
    fn test_zero_gradient_untouched() -> Result<()> {
        let device = Device::Cpu;
        let param = Var::ones((2, 2), DType::F32, &device)?;
        let sgd = plain_sgd(vec![param.clone()], 1.0, 0.0)?;
        let mut lars = Lars::new(sgd, vec![param.clone()], LarsConfig::default());

        let loss = (param.as_tensor() * 0.0)?.sum_all()?;
        lars.backward_step(&loss)?;

        let value = param.as_tensor().mean_all()?.to_scalar::<f32>()?;
        assert!((value - 1.0).abs() < 1e-6);

        Ok(())
    }

    #[test]
    fn test_learning_rate_delegates() -> Result<()> {
        let sgd = plain_sgd(vec![], 0.3, 0.0)?;
        let mut lars = Lars::new(sgd, vec![], LarsConfig::default());
        assert_eq!(lars.learning_rate(), 0.3);

        lars.set_learning_rate(0.05);
        assert_eq!(lars.inner().learning_rate(), 0.05);

        Ok(())
    }
}
