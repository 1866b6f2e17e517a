/// Command-line interface of the `solo` binary
pub mod commands;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{AugmentationConfig, OptimizerKind, PretrainConfig, SchedulerKind};
use crate::methods::{MethodKind, MethodParams};

#[derive(Parser, Debug)]
#[command(name = "solo")]
#[command(about = "Self-supervised pretraining and evaluation of feature encoders", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Pretrain an encoder with a self-supervised method
    Pretrain(PretrainArgs),
    /// Linear probe and k-NN evaluation of frozen features
    Linear(LinearArgs),
}

/// Flags override the JSON config, which overrides the defaults
#[derive(Args, Debug, Default)]
pub struct PretrainArgs {
    /// JSON run configuration
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Directory with inputs.npy and labels.npy
    #[arg(long)]
    pub dataset_dir: Option<PathBuf>,
    #[arg(long)]
    pub name: Option<String>,
    #[arg(long)]
    pub project: Option<String>,

    /// Encoder architecture
    #[arg(long)]
    pub encoder: Option<String>,
    /// Encoder hidden widths, comma separated
    #[arg(long, value_delimiter = ',')]
    pub hidden_dims: Option<Vec<usize>>,
    #[arg(long)]
    pub no_encoder_bn: bool,

    #[arg(long)]
    pub max_epochs: Option<usize>,
    #[arg(long)]
    pub batch_size: Option<usize>,

    #[arg(long, value_enum)]
    pub optimizer: Option<OptimizerKind>,
    #[arg(long)]
    pub lr: Option<f64>,
    #[arg(long)]
    pub weight_decay: Option<f64>,
    #[arg(long)]
    pub momentum: Option<f64>,
    #[arg(long)]
    pub nesterov: bool,
    /// Wrap the optimizer with LARS
    #[arg(long)]
    pub lars: Option<bool>,
    #[arg(long)]
    pub eta_lars: Option<f64>,
    #[arg(long)]
    pub grad_clip_lars: bool,
    #[arg(long)]
    pub exclude_bias_n_norm: Option<bool>,

    #[arg(long, value_enum)]
    pub scheduler: Option<SchedulerKind>,
    #[arg(long)]
    pub warmup_epochs: Option<usize>,
    #[arg(long)]
    pub warmup_start_lr: Option<f64>,
    #[arg(long)]
    pub min_lr: Option<f64>,
    #[arg(long, value_delimiter = ',')]
    pub lr_decay_steps: Option<Vec<usize>>,

    #[arg(long)]
    pub noise_std: Option<f64>,
    #[arg(long)]
    pub mask_prob: Option<f64>,
    #[arg(long)]
    pub min_scale: Option<f64>,
    #[arg(long)]
    pub max_scale: Option<f64>,
    #[arg(long)]
    pub num_large_crops: Option<usize>,
    #[arg(long)]
    pub num_small_crops: Option<usize>,

    #[arg(long, value_enum)]
    pub method: Option<MethodKind>,
    #[command(flatten)]
    pub method_args: MethodArgs,

    #[arg(long)]
    pub checkpoint_dir: Option<PathBuf>,
    #[arg(long)]
    pub checkpoint_frequency: Option<usize>,
    #[arg(long)]
    pub keep_previous_checkpoints: bool,
    /// Resume from a checkpoint file
    #[arg(long)]
    pub resume_from_checkpoint: Option<PathBuf>,
    /// Resume from the newest checkpoint of this run name
    #[arg(long)]
    pub auto_resume: bool,
    #[arg(long)]
    pub log_every_n_steps: Option<usize>,
}

/// Method hyperparameters; each applies to the methods that have it
#[derive(Args, Debug, Default)]
pub struct MethodArgs {
    #[arg(long)]
    pub proj_hidden_dim: Option<usize>,
    #[arg(long)]
    pub proj_output_dim: Option<usize>,
    #[arg(long)]
    pub pred_hidden_dim: Option<usize>,
    #[arg(long)]
    pub temperature: Option<f64>,
    #[arg(long)]
    pub lamb: Option<f64>,
    #[arg(long)]
    pub scale_loss: Option<f64>,
    #[arg(long)]
    pub num_prototypes: Option<usize>,
    #[arg(long)]
    pub sk_iters: Option<usize>,
    #[arg(long)]
    pub sk_epsilon: Option<f64>,
    #[arg(long)]
    pub queue_size: Option<usize>,
    #[arg(long)]
    pub epoch_queue_starts: Option<usize>,
    #[arg(long)]
    pub freeze_prototypes_epochs: Option<usize>,
    #[arg(long)]
    pub base_tau_momentum: Option<f64>,
    #[arg(long)]
    pub final_tau_momentum: Option<f64>,
    #[arg(long)]
    pub sim_loss_weight: Option<f64>,
    #[arg(long)]
    pub var_loss_weight: Option<f64>,
    #[arg(long)]
    pub cov_loss_weight: Option<f64>,
    #[arg(long)]
    pub whitening_iters: Option<usize>,
    #[arg(long)]
    pub whitening_size: Option<usize>,
    #[arg(long)]
    pub warmup_teacher_temperature_epochs: Option<usize>,
    #[arg(long)]
    pub freeze_last_layer: Option<usize>,
}

fn set<T>(field: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *field = value;
    }
}

impl MethodArgs {
    pub fn apply(&self, params: &mut MethodParams) {
        match params {
            MethodParams::Simclr(p) => {
                set(&mut p.proj_hidden_dim, self.proj_hidden_dim);
                set(&mut p.proj_output_dim, self.proj_output_dim);
                set(&mut p.temperature, self.temperature);
            }
            MethodParams::BarlowTwins(p) => {
                set(&mut p.proj_hidden_dim, self.proj_hidden_dim);
                set(&mut p.proj_output_dim, self.proj_output_dim);
                set(&mut p.lamb, self.lamb);
                set(&mut p.scale_loss, self.scale_loss);
            }
            MethodParams::Byol(p) => {
                set(&mut p.proj_hidden_dim, self.proj_hidden_dim);
                set(&mut p.proj_output_dim, self.proj_output_dim);
                set(&mut p.pred_hidden_dim, self.pred_hidden_dim);
                set(&mut p.base_tau_momentum, self.base_tau_momentum);
                set(&mut p.final_tau_momentum, self.final_tau_momentum);
            }
            MethodParams::Swav(p) => {
                set(&mut p.proj_hidden_dim, self.proj_hidden_dim);
                set(&mut p.proj_output_dim, self.proj_output_dim);
                set(&mut p.num_prototypes, self.num_prototypes);
                set(&mut p.sk_iters, self.sk_iters);
                set(&mut p.sk_epsilon, self.sk_epsilon);
                set(&mut p.temperature, self.temperature);
                set(&mut p.queue_size, self.queue_size);
                set(&mut p.epoch_queue_starts, self.epoch_queue_starts);
                set(&mut p.freeze_prototypes_epochs, self.freeze_prototypes_epochs);
            }
            MethodParams::Vicreg(p) => {
                set(&mut p.proj_hidden_dim, self.proj_hidden_dim);
                set(&mut p.proj_output_dim, self.proj_output_dim);
                set(&mut p.sim_loss_weight, self.sim_loss_weight);
                set(&mut p.var_loss_weight, self.var_loss_weight);
                set(&mut p.cov_loss_weight, self.cov_loss_weight);
            }
            MethodParams::Wmse(p) => {
                set(&mut p.proj_hidden_dim, self.proj_hidden_dim);
                set(&mut p.proj_output_dim, self.proj_output_dim);
                set(&mut p.whitening_iters, self.whitening_iters);
                set(&mut p.whitening_size, self.whitening_size);
            }
            MethodParams::Mocov2plus(p) => {
                set(&mut p.proj_hidden_dim, self.proj_hidden_dim);
                set(&mut p.proj_output_dim, self.proj_output_dim);
                set(&mut p.temperature, self.temperature);
                set(&mut p.queue_size, self.queue_size);
                set(&mut p.base_tau_momentum, self.base_tau_momentum);
                set(&mut p.final_tau_momentum, self.final_tau_momentum);
            }
            MethodParams::Dino(p) => {
                set(&mut p.proj_hidden_dim, self.proj_hidden_dim);
                set(&mut p.proj_output_dim, self.proj_output_dim);
                set(&mut p.num_prototypes, self.num_prototypes);
                set(&mut p.student_temperature, self.temperature);
                set(&mut p.warmup_teacher_temperature_epochs, self.warmup_teacher_temperature_epochs);
                set(&mut p.freeze_last_layer, self.freeze_last_layer);
                set(&mut p.base_tau_momentum, self.base_tau_momentum);
                set(&mut p.final_tau_momentum, self.final_tau_momentum);
            }
        }
    }
}

impl PretrainArgs {
    /// Resolve the run configuration and validate it
    pub fn to_config(&self) -> crate::Result<PretrainConfig> {
        let mut config = match &self.config {
            Some(path) => serde_json::from_reader(std::io::BufReader::new(std::fs::File::open(path)?))?,
            None => PretrainConfig::default(),
        };

        set(&mut config.dataset_dir, self.dataset_dir.clone());
        set(&mut config.project, self.project.clone());
        set(&mut config.encoder_name, self.encoder.clone());
        set(&mut config.encoder.hidden_dims, self.hidden_dims.clone());
        if self.no_encoder_bn {
            config.encoder.batch_norm = false;
        }
        set(&mut config.max_epochs, self.max_epochs);
        set(&mut config.batch_size, self.batch_size);

        let optimizer = &mut config.optimizer;
        set(&mut optimizer.kind, self.optimizer);
        set(&mut optimizer.lr, self.lr);
        set(&mut optimizer.weight_decay, self.weight_decay);
        set(&mut optimizer.momentum, self.momentum);
        optimizer.nesterov |= self.nesterov;
        set(&mut optimizer.lars, self.lars);
        set(&mut optimizer.eta_lars, self.eta_lars);
        optimizer.grad_clip_lars |= self.grad_clip_lars;
        set(&mut optimizer.exclude_bias_n_norm, self.exclude_bias_n_norm);

        let scheduler = &mut config.scheduler;
        set(&mut scheduler.kind, self.scheduler);
        set(&mut scheduler.warmup_epochs, self.warmup_epochs);
        set(&mut scheduler.warmup_start_lr, self.warmup_start_lr);
        set(&mut scheduler.min_lr, self.min_lr);
        set(&mut scheduler.lr_decay_steps, self.lr_decay_steps.clone());

        if self.num_large_crops.is_some() || self.num_small_crops.is_some() {
            set(&mut config.num_large_crops, self.num_large_crops);
            set(&mut config.num_small_crops, self.num_small_crops);
            config.augmentations = crop_pipelines(
                &config.augmentations,
                config.num_large_crops,
                config.num_small_crops,
            );
        }
        for aug in config.augmentations.iter_mut() {
            set(&mut aug.noise_std, self.noise_std);
            set(&mut aug.mask_prob, self.mask_prob);
            set(&mut aug.min_scale, self.min_scale);
            set(&mut aug.max_scale, self.max_scale);
        }

        if let Some(kind) = self.method {
            if kind != config.method.kind() {
                config.method = kind.default_params();
                if self.name.is_none() {
                    config.name = kind.to_string();
                }
            }
        }
        self.method_args.apply(&mut config.method);
        set(&mut config.name, self.name.clone());

        let checkpoint = &mut config.checkpoint;
        set(&mut checkpoint.dir, self.checkpoint_dir.clone());
        set(&mut checkpoint.frequency, self.checkpoint_frequency);
        checkpoint.keep_previous_checkpoints |= self.keep_previous_checkpoints;
        set(&mut config.resume_from_checkpoint, self.resume_from_checkpoint.clone().map(Some));
        set(&mut config.log_every_n_steps, self.log_every_n_steps);

        config.validate()?;
        Ok(config)
    }
}

/// One pipeline for the large crops and, if any, one for the small crops
fn crop_pipelines(current: &[AugmentationConfig], large: usize, small: usize) -> Vec<AugmentationConfig> {
    let large_aug = current.first().cloned().unwrap_or_default();
    let small_aug = current.get(1).cloned().unwrap_or_else(|| large_aug.clone());

    let mut pipelines = vec![AugmentationConfig {
        num_crops: large,
        ..large_aug
    }];
    if small > 0 {
        pipelines.push(AugmentationConfig {
            num_crops: small,
            ..small_aug
        });
    }
    pipelines
}

#[derive(Args, Debug)]
pub struct LinearArgs {
    /// Training split for the probe
    #[arg(long)]
    pub train_dir: PathBuf,
    /// Validation split, defaults to the training split
    #[arg(long)]
    pub val_dir: Option<PathBuf>,
    /// Pretrained checkpoint; raw features are probed without one
    #[arg(long)]
    pub checkpoint: Option<PathBuf>,
    /// Run configuration, defaults to args.json next to the checkpoint
    #[arg(long)]
    pub pretrain_args: Option<PathBuf>,
    #[arg(long, default_value = "100")]
    pub max_epochs: usize,
    #[arg(long, default_value = "256")]
    pub batch_size: usize,
    #[arg(long, default_value = "0.1")]
    pub lr: f64,
    #[arg(long, default_value = "0.0")]
    pub weight_decay: f64,
    /// Also run weighted k-NN
    #[arg(long)]
    pub knn: bool,
    #[arg(long, default_value = "20")]
    pub knn_k: usize,
    #[arg(long, default_value = "0.07")]
    pub knn_temperature: f64,
    /// Write the evaluation report as JSON
    #[arg(long)]
    pub output: Option<PathBuf>,
}

pub fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Pretrain(args) => commands::pretrain(&args),
        Commands::Linear(args) => commands::linear(&args),
    }
}
