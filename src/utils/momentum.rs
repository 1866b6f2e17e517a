/// Momentum (EMA) networks
///
/// Several methods keep a slowly-moving copy of the online network as a
/// target. The momentum parameters follow
/// `p_m = tau * p_m + (1 - tau) * p_o` and never receive gradients.
use candle_core::{Result, Var};
use candle_nn::VarMap;
use std::collections::HashMap;
use std::f64::consts::PI;

fn snapshot(varmap: &VarMap) -> Result<HashMap<String, Var>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| candle_core::Error::Msg("varmap lock poisoned".to_string()))?;
    Ok(data.clone())
}

/// Copy online parameters into the momentum network
///
/// Every parameter of `momentum` must have a same-named parameter in
/// `online`; online-only parameters (predictors, classifiers) are ignored.
pub fn initialize_momentum_params(online: &VarMap, momentum: &VarMap) -> Result<()> {
    let online = snapshot(online)?;
    for (name, momentum_var) in snapshot(momentum)? {
        let online_var = online.get(&name).ok_or_else(|| {
            candle_core::Error::Msg(format!("momentum parameter {name} has no online counterpart"))
        })?;
        momentum_var.set(&online_var.as_tensor().detach())?;
    }
    Ok(())
}

/// Updater for momentum networks with a cosine tau schedule
#[derive(Debug, Clone)]
pub struct MomentumUpdater {
    base_tau: f64,
    final_tau: f64,
    cur_tau: f64,
}

impl Default for MomentumUpdater {
    fn default() -> Self {
        Self {
            base_tau: 0.996,
            final_tau: 1.0,
            cur_tau: 0.996,
        }
    }
}

impl MomentumUpdater {
    /// # Arguments
    /// * `base_tau` - Momentum at the start of training
    /// * `final_tau` - Momentum at the end of training
    pub fn new(base_tau: f64, final_tau: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&base_tau) {
            candle_core::bail!("base_tau must be in [0, 1], got {base_tau}");
        }
        if !(0.0..=1.0).contains(&final_tau) {
            candle_core::bail!("final_tau must be in [0, 1], got {final_tau}");
        }

        Ok(Self {
            base_tau,
            final_tau,
            cur_tau: base_tau,
        })
    }

    pub fn cur_tau(&self) -> f64 {
        self.cur_tau
    }

    pub fn base_tau(&self) -> f64 {
        self.base_tau
    }

    pub fn final_tau(&self) -> f64 {
        self.final_tau
    }

    /// Move the momentum network towards the online network
    ///
    /// Batch-norm running statistics are left alone: the momentum network
    /// tracks its own in its forward passes.
    pub fn update(&self, online: &VarMap, momentum: &VarMap) -> Result<()> {
        let online = snapshot(online)?;
        let tau = self.cur_tau;

        for (name, momentum_var) in snapshot(momentum)? {
            if is_running_stat(&name) {
                continue;
            }
            let Some(online_var) = online.get(&name) else {
                candle_core::bail!("momentum parameter {name} has no online counterpart");
            };
            let updated = ((momentum_var.as_tensor() * tau)?
                + (online_var.as_tensor().detach() * (1.0 - tau))?)?;
            momentum_var.set(&updated)?;
        }

        Ok(())
    }

    /// Recompute tau for the current step
    ///
    /// Increases from `base_tau` to `final_tau` along a cosine.
    pub fn update_tau(&mut self, cur_step: usize, max_steps: usize) {
        let progress = if max_steps == 0 {
            1.0
        } else {
            (cur_step as f64 / max_steps as f64).min(1.0)
        };
        self.cur_tau =
            self.final_tau - (self.final_tau - self.base_tau) * ((PI * progress).cos() + 1.0) / 2.0;
    }
}

fn is_running_stat(name: &str) -> bool {
    name.ends_with("running_mean") || name.ends_with("running_var")
}
