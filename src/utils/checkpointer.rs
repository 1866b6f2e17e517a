/// Run-scoped checkpointing with safetensors
///
/// Each run gets its own directory `dir/version`, where `version` is a random
/// id. The run configuration is written once as `args.json`; checkpoints are
/// `{name}-{version}-ep={epoch}.safetensors` with the training metadata stored
/// in the safetensors header.
use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;
use rand::Rng;
use safetensors::tensor::SafeTensors;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::SoloError;

/// Header key holding the serialized [`CheckpointMetadata`]
const METADATA_KEY: &str = "solo";

/// Checkpointer configuration
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Base directory for runs
    pub dir: PathBuf,
    /// Save every N epochs
    pub frequency: usize,
    /// Keep every checkpoint instead of only the latest
    pub keep_previous_checkpoints: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("trained_models"),
            frequency: 1,
            keep_previous_checkpoints: false,
        }
    }
}

/// Checkpoint metadata
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CheckpointMetadata {
    pub epoch: usize,
    /// Optimizer steps taken
    pub step: usize,
    /// Learning rate at checkpoint
    pub lr: f64,
    pub name: String,
    pub version: String,
    pub method: String,
}

/// Model checkpoint
pub struct Checkpoint {
    /// Model parameters
    pub tensors: HashMap<String, Tensor>,
    pub metadata: CheckpointMetadata,
}

impl Checkpoint {
    pub fn new(tensors: HashMap<String, Tensor>, metadata: CheckpointMetadata) -> Self {
        Self { tensors, metadata }
    }

    /// Save checkpoint to a safetensors file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> crate::Result<()> {
        let mut header = HashMap::new();
        header.insert(METADATA_KEY.to_string(), serde_json::to_string(&self.metadata)?);

        safetensors::serialize_to_file(
            self.tensors.iter().map(|(name, tensor)| (name.as_str(), tensor)),
            &Some(header),
            path.as_ref(),
        )
        .map_err(|e| SoloError::Checkpoint(format!("{}: {e}", path.as_ref().display())))
    }

    /// Load checkpoint tensors onto `device` together with its metadata
    pub fn load<P: AsRef<Path>>(path: P, device: &Device) -> crate::Result<Self> {
        let data = std::fs::read(path.as_ref())?;

        let (_, header) = SafeTensors::read_metadata(&data)
            .map_err(|e| SoloError::Checkpoint(format!("{}: {e}", path.as_ref().display())))?;
        let metadata = match header.metadata().as_ref().and_then(|m| m.get(METADATA_KEY)) {
            Some(json) => serde_json::from_str(json)?,
            None => {
                log::warn!("{} has no run metadata", path.as_ref().display());
                CheckpointMetadata::default()
            }
        };

        let tensors = candle_core::safetensors::load_buffer(&data, device)?;

        Ok(Self { tensors, metadata })
    }
}

/// Parameters and counters to persist at the end of an epoch
pub struct TrainingState {
    pub tensors: HashMap<String, Tensor>,
    pub step: usize,
    pub lr: f64,
    pub method: String,
}

/// Saves checkpoints of a training run
pub struct Checkpointer {
    config: CheckpointConfig,
    name: String,
    version: String,
    path: PathBuf,
    last_ckpt: Option<PathBuf>,
    is_global_zero: bool,
}

impl Checkpointer {
    /// Create a checkpointer with a fresh random run version
    pub fn new(config: CheckpointConfig, name: impl Into<String>) -> Self {
        let mut version = random_string(4, 4);
        while config.dir.join(&version).exists() {
            version = random_string(4, 4);
        }
        Self::with_version(config, name, version)
    }

    /// Create a checkpointer for an explicit run version (e.g. when resuming)
    pub fn with_version(
        config: CheckpointConfig,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        let version = version.into();
        let path = config.dir.join(&version);
        Self {
            config,
            name: name.into(),
            version,
            path,
            last_ckpt: None,
            is_global_zero: true,
        }
    }

    /// Only the global-zero replica writes to disk
    pub fn set_global_zero(&mut self, is_global_zero: bool) {
        self.is_global_zero = is_global_zero;
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Run directory
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn last_checkpoint(&self) -> Option<&Path> {
        self.last_ckpt.as_deref()
    }

    pub fn checkpoint_path(&self, epoch: usize) -> PathBuf {
        self.path
            .join(format!("{}-{}-ep={}.safetensors", self.name, self.version, epoch))
    }

    /// Create the run directory and snapshot the run arguments
    pub fn initial_setup<A: Serialize>(&self, args: &A) -> crate::Result<()> {
        if !self.is_global_zero {
            return Ok(());
        }

        std::fs::create_dir_all(&self.path)?;
        let json_path = self.path.join("args.json");
        std::fs::write(&json_path, serde_json::to_string_pretty(args)?)?;
        log::info!("Run {} writing checkpoints to {:?}", self.version, self.path);

        Ok(())
    }

    pub fn on_train_start<A: Serialize>(&self, args: &A) -> crate::Result<()> {
        self.initial_setup(args)
    }

    pub fn on_train_epoch_end(
        &mut self,
        epoch: usize,
        state: &TrainingState,
    ) -> crate::Result<Option<PathBuf>> {
        if self.config.frequency > 0 && epoch % self.config.frequency == 0 {
            self.save(epoch, state)
        } else {
            Ok(None)
        }
    }

    pub fn on_train_end(
        &mut self,
        epoch: usize,
        state: &TrainingState,
    ) -> crate::Result<Option<PathBuf>> {
        self.save(epoch, state)
    }

    /// Write a checkpoint for `epoch`, replacing the previous one unless
    /// previous checkpoints are kept
    pub fn save(&mut self, epoch: usize, state: &TrainingState) -> crate::Result<Option<PathBuf>> {
        if !self.is_global_zero {
            return Ok(None);
        }

        std::fs::create_dir_all(&self.path)?;
        let ckpt = self.checkpoint_path(epoch);
        let metadata = CheckpointMetadata {
            epoch,
            step: state.step,
            lr: state.lr,
            name: self.name.clone(),
            version: self.version.clone(),
            method: state.method.clone(),
        };

        log::info!("Saving checkpoint to {:?}", ckpt);
        Checkpoint::new(state.tensors.clone(), metadata).save(&ckpt)?;

        if let Some(last) = self.last_ckpt.take() {
            if last != ckpt && !self.config.keep_previous_checkpoints {
                log::debug!("Removing previous checkpoint {:?}", last);
                std::fs::remove_file(&last)?;
            }
        }
        self.last_ckpt = Some(ckpt.clone());

        Ok(Some(ckpt))
    }
}

/// Random id of lowercase letters and digits in shuffled order
pub fn random_string(letter_count: usize, digit_count: usize) -> String {
    let mut rng = rand::thread_rng();
    let mut chars = Vec::with_capacity(letter_count + digit_count);
    for _ in 0..letter_count {
        chars.push(rng.gen_range(b'a'..=b'z') as char);
    }
    for _ in 0..digit_count {
        chars.push(rng.gen_range(b'0'..=b'9') as char);
    }
    chars.shuffle(&mut rng);
    chars.into_iter().collect()
}

/// Parse the epoch out of a `{name}-{version}-ep={epoch}.safetensors` file name
fn checkpoint_epoch(file_name: &str, name: &str) -> Option<usize> {
    let rest = file_name.strip_prefix(name)?.strip_prefix('-')?;
    let stem = rest.strip_suffix(".safetensors")?;
    let (_, epoch) = stem.rsplit_once("-ep=")?;
    epoch.parse().ok()
}

/// Newest checkpoint (highest epoch) of run `name` under `dir`
///
/// Looks in `dir` and in its run sub-directories.
pub fn find_last_checkpoint<P: AsRef<Path>>(dir: P, name: &str) -> crate::Result<Option<PathBuf>> {
    let mut candidates = Vec::new();
    let mut dirs = vec![dir.as_ref().to_path_buf()];
    for entry in std::fs::read_dir(dir.as_ref())? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }

    for d in dirs {
        for entry in std::fs::read_dir(&d)? {
            let path = entry?.path();
            let Some(file_name) = path.file_name().and_then(|f| f.to_str()) else {
                continue;
            };
            if let Some(epoch) = checkpoint_epoch(file_name, name) {
                candidates.push((epoch, path.clone()));
            }
        }
    }

    Ok(candidates
        .into_iter()
        .max_by_key(|(epoch, _)| *epoch)
        .map(|(_, path)| path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn state(value: f32) -> candle_core::Result<TrainingState> {
        let mut tensors = HashMap::new();
        tensors.insert(
            "backbone.weight".to_string(),
            Tensor::full(value, (3, 2), &Device::Cpu)?,
        );
        Ok(TrainingState {
            tensors,
            step: 10,
            lr: 0.3,
            method: "byol".to_string(),
        })
    }

    #[test]
    fn test_random_string() {
        let s = random_string(4, 4);
        assert_eq!(s.len(), 8);
        assert_eq!(s.chars().filter(|c| c.is_ascii_lowercase()).count(), 4);
        assert_eq!(s.chars().filter(|c| c.is_ascii_digit()).count(), 4);
    }

    #[test]
    fn test_checkpoint_epoch_parsing() {
        assert_eq!(checkpoint_epoch("byol-ab12cd34-ep=7.safetensors", "byol"), Some(7));
        assert_eq!(checkpoint_epoch("byol-ab12cd34-ep=7.safetensors", "simclr"), None);
        assert_eq!(checkpoint_epoch("args.json", "byol"), None);
    }

    #[test]
    fn test_save_load_roundtrip() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("ckpt.safetensors");

        let metadata = CheckpointMetadata {
            epoch: 3,
            step: 300,
            lr: 0.05,
            name: "run".to_string(),
            version: "abcd1234".to_string(),
            method: "simclr".to_string(),
        };
        let mut tensors = HashMap::new();
        tensors.insert("w".to_string(), Tensor::ones((5, 5), DType::F32, &Device::Cpu)?);
        Checkpoint::new(tensors, metadata.clone()).save(&path)?;

        let loaded = Checkpoint::load(&path, &Device::Cpu)?;
        assert_eq!(loaded.metadata, metadata);
        let sum = loaded.tensors["w"].sum_all()?.to_scalar::<f32>()?;
        assert!((sum - 25.0).abs() < 1e-6);

        Ok(())
    }

    #[test]
    fn test_initial_setup_writes_args() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = CheckpointConfig {
            dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let checkpointer = Checkpointer::new(config, "run");
        checkpointer.initial_setup(&serde_json::json!({ "lr": 0.1 }))?;

        let args: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(checkpointer.path().join("args.json"))?)?;
        assert_eq!(args["lr"], 0.1);

        Ok(())
    }

    #[test]
    fn test_previous_checkpoint_removed() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = CheckpointConfig {
            dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let mut checkpointer = Checkpointer::new(config, "run");

        let first = checkpointer.save(0, &state(1.0)?)?.expect("saved");
        let second = checkpointer.save(1, &state(2.0)?)?.expect("saved");

        assert!(!first.exists());
        assert!(second.exists());
        assert_eq!(checkpointer.last_checkpoint(), Some(second.as_path()));

        Ok(())
    }

    #[test]
    fn test_keep_previous_checkpoints() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = CheckpointConfig {
            dir: dir.path().to_path_buf(),
            frequency: 2,
            keep_previous_checkpoints: true,
        };
        let mut checkpointer = Checkpointer::new(config, "run");

        // frequency 2 skips odd epochs
        assert!(checkpointer.on_train_epoch_end(1, &state(1.0)?)?.is_none());
        let first = checkpointer.on_train_epoch_end(2, &state(1.0)?)?.expect("saved");
        let second = checkpointer.on_train_end(3, &state(2.0)?)?.expect("saved");

        assert!(first.exists() && second.exists());

        let last = find_last_checkpoint(dir.path(), "run")?.expect("found");
        assert_eq!(last, second);

        let loaded = Checkpoint::load(&last, &Device::Cpu)?;
        assert_eq!(loaded.metadata.epoch, 3);
        assert_eq!(loaded.metadata.method, "byol");

        Ok(())
    }

    #[test]
    fn test_non_zero_rank_does_not_write() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = CheckpointConfig {
            dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let mut checkpointer = Checkpointer::new(config, "run");
        checkpointer.set_global_zero(false);

        assert!(checkpointer.save(0, &state(1.0)?)?.is_none());
        assert!(!checkpointer.path().exists());

        Ok(())
    }
}
