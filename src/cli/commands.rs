use anyhow::{bail, Context, Result};
use candle_core::{Device, Tensor};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

use super::{LinearArgs, PretrainArgs};
use crate::config::PretrainConfig;
use crate::data::{FeatureDataset, FeatureLoader, FullTransformPipeline, ViewLoader};
use crate::methods::{self, Method};
use crate::training::{knn_evaluate, KnnConfig, LinearConfig, LinearEvalReport, LinearProbe, Trainer};
use crate::utils::checkpointer::{find_last_checkpoint, Checkpoint};
use crate::utils::gather::SingleProcess;

fn select_device() -> Result<Device> {
    let device = if candle_core::utils::cuda_is_available() {
        Device::new_cuda(0)?
    } else {
        Device::Cpu
    };
    log::info!("Using device: {:?}", device);
    Ok(device)
}

fn load_dataset(path: &std::path::Path) -> Result<FeatureDataset> {
    log::info!("Loading dataset from: {:?}", path);
    let dataset = FeatureDataset::from_directory(path)
        .with_context(|| format!("failed to load dataset from {}", path.display()))?;
    log::info!(
        "Dataset loaded: {} examples, {} features, {} classes",
        dataset.len(),
        dataset.feature_dim(),
        dataset.num_classes()
    );
    Ok(dataset)
}

pub fn pretrain(args: &PretrainArgs) -> Result<()> {
    let mut config = args.to_config()?;
    let device = select_device()?;

    if args.auto_resume && config.resume_from_checkpoint.is_none() && config.checkpoint.dir.exists() {
        match find_last_checkpoint(&config.checkpoint.dir, &config.name)? {
            Some(path) => {
                log::info!("Auto-resuming from {:?}", path);
                config.resume_from_checkpoint = Some(path);
            }
            None => log::warn!("No checkpoint of {} to resume from", config.name),
        }
    }

    let dataset = load_dataset(&config.dataset_dir)?;
    let (input_dim, num_classes) = (dataset.feature_dim(), dataset.num_classes());
    let transform = FullTransformPipeline::from_configs(&config.augmentations)?;
    let mut loader = FeatureLoader::new(dataset, config.batch_size, true, true).with_transform(transform);
    let steps_per_epoch = loader.num_batches();
    if steps_per_epoch == 0 {
        bail!("dataset is smaller than one batch of {}", config.batch_size);
    }

    log::info!("Method: {}, {} epochs, batch size {}", config.method_kind(), config.max_epochs, config.batch_size);
    let mut trainer = Trainer::new(config, input_dim, num_classes, steps_per_epoch, device)?;
    let last = trainer.fit(&mut loader)?;

    log::info!("Run directory: {:?}", trainer.checkpointer().path());
    if let Some(path) = last {
        log::info!("Final checkpoint: {:?}", path);
    }
    Ok(())
}

/// Pretrained method restored from a checkpoint
fn load_method(args: &LinearArgs, checkpoint_path: &PathBuf, input_dim: usize, device: &Device) -> Result<Box<dyn Method>> {
    let args_path = match &args.pretrain_args {
        Some(path) => path.clone(),
        None => checkpoint_path
            .parent()
            .map(|dir| dir.join("args.json"))
            .context("checkpoint has no parent directory")?,
    };
    let config = PretrainConfig::from_json_file(&args_path)
        .with_context(|| format!("failed to read run configuration {}", args_path.display()))?;

    let checkpoint = Checkpoint::load(checkpoint_path, device)?;
    let num_classes = match checkpoint.tensors.get("classifier.weight") {
        Some(weight) => weight.dim(0)?,
        None => 0,
    };

    let mut method = methods::build(&config.method_config(input_dim, num_classes), Arc::new(SingleProcess), device)?;
    let loaded = methods::load_tensors(method.as_mut(), &checkpoint.tensors)?;
    log::info!(
        "Loaded {} tensors of {} from epoch {}",
        loaded,
        checkpoint.metadata.method,
        checkpoint.metadata.epoch
    );
    Ok(method)
}

#[derive(Debug, Serialize)]
struct EvaluationReport {
    linear: LinearEvalReport,
    knn_acc1: Option<f64>,
    knn_acc5: Option<f64>,
}

pub fn linear(args: &LinearArgs) -> Result<()> {
    let device = select_device()?;

    let train = load_dataset(&args.train_dir)?;
    let val = match &args.val_dir {
        Some(dir) => load_dataset(dir)?,
        None => train.clone(),
    };
    if train.feature_dim() != val.feature_dim() {
        bail!(
            "train and validation features differ: {} vs {}",
            train.feature_dim(),
            val.feature_dim()
        );
    }

    let input_dim = train.feature_dim();
    let num_classes = train.num_classes().max(val.num_classes());
    let method = match &args.checkpoint {
        Some(path) => Some(load_method(args, path, input_dim, &device)?),
        None => None,
    };
    let encode = |x: &Tensor| match &method {
        Some(method) => method.features(x),
        None => Ok(x.clone()),
    };
    let features_dim = encode(&Tensor::zeros((1, input_dim), candle_core::DType::F32, &device)?)?.dim(1)?;

    let mut train_loader = FeatureLoader::new(train, args.batch_size, true, false);
    let mut val_loader = FeatureLoader::new(val, args.batch_size, false, false);

    let config = LinearConfig {
        max_epochs: args.max_epochs,
        batch_size: args.batch_size,
        lr: args.lr,
        weight_decay: args.weight_decay,
        ..Default::default()
    };
    let mut probe = LinearProbe::new(features_dim, num_classes, config, train_loader.num_batches(), &device)?;
    probe.fit(encode, &mut train_loader, &device)?;
    let report = probe.evaluate(encode, &mut val_loader, &device)?;
    log::info!(
        "Linear: val_loss={:.4}, val_acc1={:.2}, val_acc5={:.2}",
        report.loss,
        report.acc1,
        report.acc5
    );

    let (knn_acc1, knn_acc5) = if args.knn {
        let knn_config = KnnConfig {
            k: args.knn_k,
            temperature: args.knn_temperature,
            ..Default::default()
        };
        let (acc1, acc5) = knn_evaluate(encode, &mut train_loader, &mut val_loader, &knn_config, &device)?;
        log::info!("k-NN: acc1={:.2}, acc5={:.2}", acc1, acc5);
        (Some(acc1), Some(acc5))
    } else {
        (None, None)
    };

    if let Some(output) = &args.output {
        let summary = EvaluationReport {
            linear: report,
            knn_acc1,
            knn_acc5,
        };
        std::fs::write(output, serde_json::to_string_pretty(&summary)?)?;
        log::info!("Report written to {:?}", output);
    }

    Ok(())
}
