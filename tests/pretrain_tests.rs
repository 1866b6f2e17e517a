/// Short end-to-end pretraining runs on a synthetic feature dataset
use candle_core::Device;
use ndarray::{Array1, Array2};
use solo::config::{AugmentationConfig, CheckpointConfig, MlpConfig, OptimizerConfig, PretrainConfig};
use solo::data::{FeatureDataset, FeatureLoader, FullTransformPipeline, ViewLoader};
use solo::methods::{BarlowTwinsParams, ByolParams, MethodParams, MocoV2PlusParams, SimClrParams, SwAVParams};
use solo::training::{LinearConfig, LinearProbe, Trainer};
use solo::utils::checkpointer::{find_last_checkpoint, Checkpoint};
use solo::Method;

const INPUT_DIM: usize = 10;
const BATCH_SIZE: usize = 8;

fn dataset() -> FeatureDataset {
    let n = 32;
    let inputs = Array2::from_shape_fn((n, INPUT_DIM), |(i, j)| {
        let class = (i % 4) as f32;
        class * 0.5 + ((i * 13 + j * 7) % 17) as f32 / 17.0
    });
    let labels = Array1::from_shape_fn(n, |i| (i % 4) as i64);
    FeatureDataset::from_arrays(inputs, labels).unwrap()
}

fn config(name: &str, method: MethodParams, dir: &std::path::Path) -> PretrainConfig {
    PretrainConfig {
        name: name.to_string(),
        encoder: MlpConfig {
            hidden_dims: vec![32, 16],
            batch_norm: true,
        },
        max_epochs: 2,
        batch_size: BATCH_SIZE,
        augmentations: vec![AugmentationConfig::default()],
        optimizer: OptimizerConfig {
            lr: 0.05,
            ..Default::default()
        },
        method,
        checkpoint: CheckpointConfig {
            dir: dir.to_path_buf(),
            frequency: 1,
            keep_previous_checkpoints: true,
        },
        log_every_n_steps: 1,
        ..Default::default()
    }
}

fn loader(config: &PretrainConfig) -> FeatureLoader {
    let transform = FullTransformPipeline::from_configs(&config.augmentations).unwrap();
    FeatureLoader::new(dataset(), config.batch_size, true, true).with_transform(transform)
}

fn run(name: &str, method: MethodParams) -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = config(name, method, dir.path());
    let mut loader = loader(&config);

    let mut trainer = Trainer::new(config.clone(), INPUT_DIM, 4, loader.num_batches(), Device::Cpu)?;
    let last = trainer.fit(&mut loader)?.expect("final checkpoint");
    assert_eq!(trainer.step(), 2 * loader.num_batches());

    let run_dir = trainer.checkpointer().path();
    let args: PretrainConfig = serde_json::from_str(&std::fs::read_to_string(run_dir.join("args.json"))?)?;
    assert_eq!(args.name, config.name);
    assert_eq!(args.batch_size, config.batch_size);
    assert_eq!(args.method_kind(), config.method_kind());

    // one checkpoint per epoch is kept
    for epoch in 0..2 {
        assert!(trainer.checkpointer().checkpoint_path(epoch).exists());
    }
    assert_eq!(find_last_checkpoint(dir.path(), name)?, Some(last.clone()));

    let checkpoint = Checkpoint::load(&last, &Device::Cpu)?;
    assert_eq!(checkpoint.metadata.epoch, 1);
    assert_eq!(checkpoint.metadata.method, trainer.method().name());
    assert!(checkpoint.tensors.contains_key("backbone.fc0.weight"));
    assert!(checkpoint.tensors.contains_key("classifier.weight"));

    Ok(())
}

#[test]
fn test_barlow_twins_pretraining() -> anyhow::Result<()> {
    run(
        "barlow",
        MethodParams::BarlowTwins(BarlowTwinsParams {
            proj_hidden_dim: 32,
            proj_output_dim: 32,
            ..Default::default()
        }),
    )
}

#[test]
fn test_simclr_pretraining() -> anyhow::Result<()> {
    run(
        "simclr",
        MethodParams::Simclr(SimClrParams {
            proj_hidden_dim: 32,
            proj_output_dim: 8,
            ..Default::default()
        }),
    )
}

#[test]
fn test_byol_pretraining() -> anyhow::Result<()> {
    run(
        "byol",
        MethodParams::Byol(ByolParams {
            proj_hidden_dim: 32,
            proj_output_dim: 8,
            pred_hidden_dim: 32,
            ..Default::default()
        }),
    )
}

#[test]
fn test_mocov2plus_pretraining() -> anyhow::Result<()> {
    run(
        "moco",
        MethodParams::Mocov2plus(MocoV2PlusParams {
            proj_hidden_dim: 32,
            proj_output_dim: 8,
            queue_size: 16,
            ..Default::default()
        }),
    )
}

#[test]
fn test_swav_pretraining() -> anyhow::Result<()> {
    run(
        "swav",
        MethodParams::Swav(SwAVParams {
            proj_hidden_dim: 32,
            proj_output_dim: 8,
            num_prototypes: 10,
            queue_size: 16,
            epoch_queue_starts: 1,
            freeze_prototypes_epochs: 1,
            ..Default::default()
        }),
    )
}

#[test]
fn test_linear_probe_on_pretrained_features() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = config(
        "probe",
        MethodParams::BarlowTwins(BarlowTwinsParams {
            proj_hidden_dim: 32,
            proj_output_dim: 32,
            ..Default::default()
        }),
        dir.path(),
    );
    let mut loader = loader(&config);
    let mut trainer = Trainer::new(config, INPUT_DIM, 4, loader.num_batches(), Device::Cpu)?;
    trainer.fit(&mut loader)?;

    let mut train = FeatureLoader::new(dataset(), BATCH_SIZE, true, false);
    let mut val = FeatureLoader::new(dataset(), BATCH_SIZE, false, false);
    let probe_config = LinearConfig {
        max_epochs: 3,
        ..Default::default()
    };
    let mut probe = LinearProbe::new(16, 4, probe_config, train.num_batches(), &Device::Cpu)?;

    let method = trainer.method();
    probe.fit(|x| method.features(x), &mut train, &Device::Cpu)?;
    let report = probe.evaluate(|x| method.features(x), &mut val, &Device::Cpu)?;

    assert!(report.loss.is_finite());
    assert!((0.0..=100.0).contains(&report.acc1));
    assert!(report.acc5 >= report.acc1);

    Ok(())
}
