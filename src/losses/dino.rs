/// DINO self-distillation loss
use candle_core::{DType, Device, Result, Tensor, D};
use candle_nn::ops::{log_softmax, softmax};
use std::sync::Arc;

use crate::utils::gather::ProcessGroup;

/// DINO loss configuration
#[derive(Debug, Clone)]
pub struct DinoLossConfig {
    pub num_prototypes: usize,
    /// Teacher temperature at the start of the warm-up
    pub warmup_teacher_temp: f64,
    /// Teacher temperature after the warm-up
    pub teacher_temp: f64,
    pub warmup_teacher_temp_epochs: usize,
    pub num_epochs: usize,
    pub student_temp: f64,
    /// Number of large crops (seen by the teacher)
    pub num_large_crops: usize,
    pub center_momentum: f64,
}

impl Default for DinoLossConfig {
    fn default() -> Self {
        Self {
            num_prototypes: 4096,
            warmup_teacher_temp: 0.04,
            teacher_temp: 0.07,
            warmup_teacher_temp_epochs: 30,
            num_epochs: 100,
            student_temp: 0.1,
            num_large_crops: 2,
            center_momentum: 0.9,
        }
    }
}

/// Cross entropy between sharpened, centred teacher outputs and student outputs
pub struct DinoLoss {
    config: DinoLossConfig,
    teacher_temp_schedule: Vec<f64>,
    center: Tensor,
    epoch: usize,
    group: Arc<dyn ProcessGroup>,
}

impl DinoLoss {
    pub fn new(config: DinoLossConfig, group: Arc<dyn ProcessGroup>, device: &Device) -> Result<Self> {
        if config.num_large_crops == 0 {
            candle_core::bail!("DINO needs at least one large crop");
        }

        let warmup = config.warmup_teacher_temp_epochs.min(config.num_epochs);
        let mut schedule = Vec::with_capacity(config.num_epochs.max(1));
        for i in 0..warmup {
            let t = if warmup == 1 {
                config.warmup_teacher_temp
            } else {
                config.warmup_teacher_temp
                    + (config.teacher_temp - config.warmup_teacher_temp) * i as f64
                        / (warmup - 1) as f64
            };
            schedule.push(t);
        }
        while schedule.len() < config.num_epochs.max(1) {
            schedule.push(config.teacher_temp);
        }

        let center = Tensor::zeros((1, config.num_prototypes), DType::F32, device)?;

        Ok(Self {
            config,
            teacher_temp_schedule: schedule,
            center,
            epoch: 0,
            group,
        })
    }

    pub fn set_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
    }

    /// Teacher temperature for the current epoch
    pub fn teacher_temp(&self) -> f64 {
        let last = self.teacher_temp_schedule.len() - 1;
        self.teacher_temp_schedule[self.epoch.min(last)]
    }

    pub fn center(&self) -> &Tensor {
        &self.center
    }

    pub fn set_center(&mut self, center: &Tensor) -> Result<()> {
        if center.dims() != self.center.dims() {
            candle_core::bail!("center of shape {:?}, expected {:?}", center.dims(), self.center.dims());
        }
        self.center = center.to_dtype(DType::F32)?.to_device(self.center.device())?;
        Ok(())
    }

    /// # Arguments
    /// * `student_output` - Prototype scores of every crop, stacked crop by crop
    /// * `teacher_output` - Prototype scores of the large crops, stacked crop by crop
    pub fn forward(&mut self, student_output: &Tensor, teacher_output: &Tensor) -> Result<Tensor> {
        let num_large = self.config.num_large_crops;
        let teacher_rows = teacher_output.dim(0)?;
        if teacher_rows % num_large != 0 {
            candle_core::bail!("{teacher_rows} teacher rows for {num_large} large crops");
        }
        let batch = teacher_rows / num_large;
        let student_rows = student_output.dim(0)?;
        if batch == 0 || student_rows % batch != 0 {
            candle_core::bail!("{student_rows} student rows for a batch of {batch}");
        }
        let num_crops = student_rows / batch;

        let student_out = (student_output / self.config.student_temp)?;
        let teacher = teacher_output.detach().to_dtype(DType::F32)?;
        let teacher_out = softmax(
            &(teacher.broadcast_sub(&self.center)? / self.teacher_temp())?,
            D::Minus1,
        )?
        .to_dtype(student_output.dtype())?;

        let mut terms = Vec::new();
        for iq in 0..num_large {
            let q = teacher_out.narrow(0, iq * batch, batch)?;
            for v in 0..num_crops {
                if v == iq {
                    continue;
                }
                let s = log_softmax(&student_out.narrow(0, v * batch, batch)?, D::Minus1)?;
                terms.push((q.neg()? * s)?.sum(D::Minus1)?.mean_all()?);
            }
        }
        if terms.is_empty() {
            candle_core::bail!("DINO loss needs at least two crops");
        }
        let n = terms.len() as f64;
        let loss = (Tensor::stack(&terms, 0)?.sum_all()? / n)?;

        self.update_center(&teacher)?;

        Ok(loss)
    }

    fn update_center(&mut self, teacher_output: &Tensor) -> Result<()> {
        let rows = teacher_output.dim(0)? * self.group.world_size();
        let batch_center = self.group.all_reduce_sum(&teacher_output.sum_keepdim(0)?)?;
        let batch_center = (batch_center / rows as f64)?;

        let m = self.config.center_momentum;
        self.center = ((&self.center * m)? + (batch_center * (1.0 - m))?)?;
        Ok(())
    }
}
