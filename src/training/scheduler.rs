/// Learning rate schedules
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    /// Linear warmup followed by cosine annealing
    WarmupCosine,
    /// Multiply by `gamma` at each listed epoch
    Step,
    Constant,
}

/// Learning rate schedule configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    pub kind: SchedulerKind,
    /// Warmup length in epochs
    pub warmup_epochs: usize,
    /// Learning rate at the first warmup step
    pub warmup_start_lr: f64,
    /// Learning rate at the end of cosine annealing
    pub min_lr: f64,
    /// Epochs at which the step schedule decays
    pub lr_decay_steps: Vec<usize>,
    pub gamma: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            kind: SchedulerKind::WarmupCosine,
            warmup_epochs: 10,
            warmup_start_lr: 3e-5,
            min_lr: 0.0,
            lr_decay_steps: vec![60, 80],
            gamma: 0.1,
        }
    }
}

/// Per-step learning rate scheduler
///
/// The schedule is evaluated per optimizer step; epoch-based settings are
/// converted with `steps_per_epoch`.
pub struct LrScheduler {
    config: SchedulerConfig,
    base_lr: f64,
    steps_per_epoch: usize,
    total_steps: usize,
    current_step: usize,
}

impl LrScheduler {
    pub fn new(config: SchedulerConfig, base_lr: f64, steps_per_epoch: usize, max_epochs: usize) -> Self {
        let steps_per_epoch = steps_per_epoch.max(1);
        Self {
            config,
            base_lr,
            steps_per_epoch,
            total_steps: steps_per_epoch * max_epochs,
            current_step: 0,
        }
    }

    pub fn base_lr(&self) -> f64 {
        self.base_lr
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    /// Get learning rate for current step
    pub fn get_lr(&self) -> f64 {
        self.get_lr_at_step(self.current_step)
    }

    /// Get learning rate for a specific step
    pub fn get_lr_at_step(&self, step: usize) -> f64 {
        match self.config.kind {
            SchedulerKind::Constant => self.base_lr,
            SchedulerKind::Step => {
                let epoch = step / self.steps_per_epoch;
                let decays = self
                    .config
                    .lr_decay_steps
                    .iter()
                    .filter(|&&milestone| epoch >= milestone)
                    .count();
                self.base_lr * self.config.gamma.powi(decays as i32)
            }
            SchedulerKind::WarmupCosine => {
                let warmup_steps = self.config.warmup_epochs * self.steps_per_epoch;
                let start = self.config.warmup_start_lr;
                if step < warmup_steps {
                    return start + (self.base_lr - start) * step as f64 / warmup_steps as f64;
                }

                let progress = if self.total_steps > warmup_steps {
                    (step - warmup_steps) as f64 / (self.total_steps - warmup_steps) as f64
                } else {
                    1.0
                };
                let progress = progress.clamp(0.0, 1.0);

                let min_lr = self.config.min_lr;
                min_lr + (self.base_lr - min_lr) * 0.5 * (1.0 + (PI * progress).cos())
            }
        }
    }

    /// Step the scheduler (increment step counter)
    pub fn step(&mut self) {
        self.current_step += 1;
    }

    pub fn get_step(&self) -> usize {
        self.current_step
    }

    /// Jump to a step, e.g. when resuming from a checkpoint
    pub fn set_step(&mut self, step: usize) {
        self.current_step = step;
    }

    pub fn reset(&mut self) {
        self.current_step = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(warmup_epochs: usize, warmup_start_lr: f64) -> SchedulerConfig {
        SchedulerConfig {
            kind: SchedulerKind::WarmupCosine,
            warmup_epochs,
            warmup_start_lr,
            min_lr: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_warmup_phase() {
        // 10 steps per epoch, 10 warmup epochs
        let scheduler = LrScheduler::new(cosine(10, 0.0), 1.0, 10, 100);

        assert!((scheduler.get_lr_at_step(0) - 0.0).abs() < 1e-6);
        assert!((scheduler.get_lr_at_step(50) - 0.5).abs() < 1e-6);
        assert!((scheduler.get_lr_at_step(100) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_warmup_start_lr() {
        let scheduler = LrScheduler::new(cosine(1, 0.1), 1.0, 10, 10);

        assert!((scheduler.get_lr_at_step(0) - 0.1).abs() < 1e-9);
        assert!((scheduler.get_lr_at_step(5) - 0.55).abs() < 1e-9);
    }

    #[test]
    fn test_cosine_annealing() {
        let scheduler = LrScheduler::new(cosine(0, 0.0), 1.0, 10, 100);

        assert!((scheduler.get_lr_at_step(0) - 1.0).abs() < 1e-6);
        assert!((scheduler.get_lr_at_step(500) - 0.5).abs() < 1e-6);
        assert!((scheduler.get_lr_at_step(1000) - 0.0).abs() < 1e-6);
        // past the end stays at min_lr
        assert!((scheduler.get_lr_at_step(5000) - 0.0).abs() < 1e-6);
    }

    #[test]
    fn test_step_schedule() {
        let config = SchedulerConfig {
            kind: SchedulerKind::Step,
            lr_decay_steps: vec![2, 4],
            gamma: 0.1,
            ..Default::default()
        };
        let scheduler = LrScheduler::new(config, 1.0, 5, 6);

        assert!((scheduler.get_lr_at_step(9) - 1.0).abs() < 1e-12);
        assert!((scheduler.get_lr_at_step(10) - 0.1).abs() < 1e-12);
        assert!((scheduler.get_lr_at_step(20) - 0.01).abs() < 1e-12);
    }

    #[test]
    fn test_constant_and_stepping() {
        let config = SchedulerConfig {
            kind: SchedulerKind::Constant,
            ..Default::default()
        };
        let mut scheduler = LrScheduler::new(config, 0.3, 4, 2);

        scheduler.step();
        scheduler.step();
        assert_eq!(scheduler.get_step(), 2);
        assert_eq!(scheduler.get_lr(), 0.3);

        scheduler.reset();
        assert_eq!(scheduler.get_step(), 0);
    }

    #[test]
    fn test_lr_never_exceeds_base() {
        let scheduler = LrScheduler::new(cosine(2, 1e-4), 1.0, 7, 20);

        for step in 0..=scheduler.total_steps() {
            let lr = scheduler.get_lr_at_step(step);
            assert!(lr <= 1.0 + 1e-9, "LR {} exceeds base at step {}", lr, step);
            assert!(lr >= 0.0);
        }
    }
}
