/// SGD with momentum and weight decay
///
/// candle-nn only ships a plain SGD; self-supervised recipes train with
/// momentum SGD (usually wrapped in LARS), so it is implemented here.
use candle_core::backprop::GradStore;
use candle_core::{Result, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};

/// Optimizers whose weight decay can be read and overridden
///
/// LARS folds weight decay into the rescaled gradient and disables the base
/// optimizer's own decay for the duration of its step.
pub trait WeightDecay {
    fn weight_decay(&self) -> f64;
    fn set_weight_decay(&mut self, weight_decay: f64);
}

/// Momentum SGD configuration
#[derive(Debug, Clone)]
pub struct ParamsSgd {
    /// Learning rate
    pub lr: f64,
    /// Momentum factor (0 disables the velocity buffer)
    pub momentum: f64,
    /// L2 penalty added to the gradient
    pub weight_decay: f64,
    pub nesterov: bool,
}

impl Default for ParamsSgd {
    fn default() -> Self {
        Self {
            lr: 0.1,
            momentum: 0.9,
            weight_decay: 1e-5,
            nesterov: false,
        }
    }
}

struct VarState {
    var: Var,
    /// Velocity buffer, created on the first step
    velocity: Option<Tensor>,
}

/// SGD with momentum
pub struct MomentumSgd {
    vars: Vec<VarState>,
    params: ParamsSgd,
}

impl Optimizer for MomentumSgd {
    type Config = ParamsSgd;

    fn new(vars: Vec<Var>, params: ParamsSgd) -> Result<Self> {
        let vars = vars
            .into_iter()
            .filter(|var| var.dtype().is_float())
            .map(|var| VarState {
                var,
                velocity: None,
            })
            .collect();
        Ok(Self { vars, params })
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        let p = &self.params;
        for state in self.vars.iter_mut() {
            let Some(grad) = grads.get(&state.var) else {
                continue;
            };

            let mut d_p = if p.weight_decay != 0.0 {
                (grad + (state.var.as_tensor() * p.weight_decay)?)?
            } else {
                grad.clone()
            };

            if p.momentum != 0.0 {
                // buf = momentum * buf + d_p, initialized to d_p
                let buf = match state.velocity.take() {
                    Some(buf) => ((buf * p.momentum)? + &d_p)?,
                    None => d_p.clone(),
                };
                d_p = if p.nesterov {
                    (d_p + (&buf * p.momentum)?)?
                } else {
                    buf.clone()
                };
                state.velocity = Some(buf);
            }

            let updated = (state.var.as_tensor() - (d_p * p.lr)?)?;
            state.var.set(&updated)?;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }
}

impl MomentumSgd {
    pub fn params(&self) -> &ParamsSgd {
        &self.params
    }

    fn state(&self, var: &Var) -> Option<&VarState> {
        let id = var.as_tensor().id();
        self.vars.iter().find(|s| s.var.as_tensor().id() == id)
    }

    /// Velocity buffer of `var`, once it has taken a step
    pub fn velocity(&self, var: &Var) -> Option<&Tensor> {
        self.state(var).and_then(|s| s.velocity.as_ref())
    }

    /// Restore the velocity buffer of `var`, returning false if `var` is not optimized here
    pub fn set_velocity(&mut self, var: &Var, velocity: &Tensor) -> Result<bool> {
        let id = var.as_tensor().id();
        let Some(state) = self.vars.iter_mut().find(|s| s.var.as_tensor().id() == id) else {
            return Ok(false);
        };
        if velocity.dims() != state.var.dims() {
            candle_core::bail!(
                "velocity of shape {:?} for a parameter of shape {:?}",
                velocity.dims(),
                state.var.dims()
            );
        }
        state.velocity = Some(velocity.to_dtype(state.var.dtype())?.to_device(state.var.device())?);
        Ok(true)
    }
}

impl WeightDecay for MomentumSgd {
    fn weight_decay(&self) -> f64 {
        self.params.weight_decay
    }

    fn set_weight_decay(&mut self, weight_decay: f64) {
        self.params.weight_decay = weight_decay;
    }
}

impl WeightDecay for AdamW {
    fn weight_decay(&self) -> f64 {
        self.params().weight_decay
    }

    fn set_weight_decay(&mut self, weight_decay: f64) {
        let params = ParamsAdamW {
            weight_decay,
            ..self.params().clone()
        };
        self.set_params(params);
    }
}
