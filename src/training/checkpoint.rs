/// Model checkpointing with safetensors
///
/// A checkpoint is a single safetensors file holding every tensor of the
/// training state (model parameters under the `model.` prefix, optimizer
/// slots under their own prefix). Metadata is stored as JSON in the
/// safetensors header.
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use safetensors::SafeTensors;

use crate::{NmtError, Result};

/// Header key holding the JSON encoded metadata
const METADATA_KEY: &str = "checkpoint";

/// Checkpoint file name prefix: `ckpt-<step>.safetensors`
const CHECKPOINT_PREFIX: &str = "ckpt-";
const CHECKPOINT_EXTENSION: &str = "safetensors";

/// Checkpoint metadata
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CheckpointMetadata {
    /// Training step
    pub step: usize,
    /// Learning rate at checkpoint
    #[serde(default)]
    pub lr: f64,
    /// Loss at checkpoint
    #[serde(default)]
    pub loss: Option<f64>,
    /// Model configuration (as JSON string)
    #[serde(default)]
    pub config: Option<String>,
    /// Steps of the checkpoints this one was averaged from
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub averaged_steps: Vec<usize>,
}

/// Model checkpoint
pub struct Checkpoint {
    /// Named tensors
    pub tensors: HashMap<String, Tensor>,
    /// Metadata
    pub metadata: CheckpointMetadata,
}

impl Checkpoint {
    /// Create new checkpoint
    pub fn new(tensors: HashMap<String, Tensor>, metadata: CheckpointMetadata) -> Self {
        Self { tensors, metadata }
    }

    /// Snapshot every variable of `varmap`
    pub fn from_varmap(varmap: &VarMap, metadata: CheckpointMetadata) -> Result<Self> {
        let data = varmap
            .data()
            .lock()
            .map_err(|_| NmtError::Checkpoint("variable map lock poisoned".to_string()))?;

        let tensors = data
            .iter()
            .map(|(name, var)| Ok((name.clone(), var.as_tensor().copy()?)))
            .collect::<candle_core::Result<HashMap<_, _>>>()?;

        Ok(Self::new(tensors, metadata))
    }

    /// Sorted tensor names
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tensors.keys().cloned().collect();
        names.sort();
        names
    }

    /// Save checkpoint to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        let mut header = HashMap::new();
        header.insert(
            METADATA_KEY.to_string(),
            serde_json::to_string(&self.metadata)?,
        );

        // safetensors needs contiguous row-major buffers
        let tensors = self
            .tensors
            .iter()
            .map(|(name, tensor)| Ok((name.clone(), tensor.contiguous()?)))
            .collect::<candle_core::Result<Vec<_>>>()?;

        safetensors::serialize_to_file(tensors, &Some(header), path)?;
        log::debug!("Saved {} tensors to {}", self.tensors.len(), path.display());

        Ok(())
    }

    /// Load checkpoint from file
    pub fn load<P: AsRef<Path>>(path: P, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;

        let (_, header) = SafeTensors::read_metadata(&data)?;
        let metadata = match header.metadata().as_ref().and_then(|m| m.get(METADATA_KEY)) {
            Some(json) => serde_json::from_str(json)?,
            None => {
                log::warn!("{} has no checkpoint metadata", path.display());
                CheckpointMetadata::default()
            }
        };

        let tensors = candle_core::safetensors::load_buffer(&data, device)?;

        Ok(Self { tensors, metadata })
    }

    /// Assign every variable of `varmap` from this checkpoint
    ///
    /// Each variable must have a tensor of the same shape in the checkpoint.
    /// Tensors without a matching variable are ignored.
    pub fn restore(&self, varmap: &VarMap) -> Result<()> {
        let data = varmap
            .data()
            .lock()
            .map_err(|_| NmtError::Checkpoint("variable map lock poisoned".to_string()))?;

        for (name, var) in data.iter() {
            let value = self.tensors.get(name).ok_or_else(|| {
                NmtError::Checkpoint(format!("variable {:?} not found in checkpoint", name))
            })?;
            if value.dims() != var.dims() {
                return Err(NmtError::Checkpoint(format!(
                    "variable {:?} has shape {:?} but checkpoint holds {:?}",
                    name,
                    var.dims(),
                    value.dims()
                )));
            }
            var.set(&value.to_dtype(var.dtype())?.to_device(var.device())?)?;
        }

        Ok(())
    }
}

/// Step encoded in a checkpoint file name
pub fn checkpoint_step<P: AsRef<Path>>(path: P) -> Option<usize> {
    let path = path.as_ref();
    if path.extension()? != CHECKPOINT_EXTENSION {
        return None;
    }
    path.file_stem()?
        .to_str()?
        .strip_prefix(CHECKPOINT_PREFIX)?
        .parse()
        .ok()
}

/// Numbered checkpoints of a directory
///
/// Checkpoints are stored as `ckpt-<step>.safetensors`. When `max_to_keep` is
/// set, saving a checkpoint deletes the oldest ones beyond that count.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    directory: PathBuf,
    max_to_keep: Option<usize>,
}

impl CheckpointManager {
    pub fn new<P: Into<PathBuf>>(directory: P, max_to_keep: Option<usize>) -> Self {
        Self {
            directory: directory.into(),
            max_to_keep,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Path of the checkpoint for `step`
    pub fn checkpoint_path(&self, step: usize) -> PathBuf {
        self.directory
            .join(format!("{}{}.{}", CHECKPOINT_PREFIX, step, CHECKPOINT_EXTENSION))
    }

    /// Existing checkpoints as (step, path), oldest first
    pub fn checkpoints(&self) -> Result<Vec<(usize, PathBuf)>> {
        if !self.directory.is_dir() {
            return Ok(Vec::new());
        }

        let mut checkpoints = Vec::new();
        for entry in std::fs::read_dir(&self.directory)? {
            let path = entry?.path();
            if let Some(step) = checkpoint_step(&path) {
                checkpoints.push((step, path));
            }
        }
        checkpoints.sort_by_key(|(step, _)| *step);

        Ok(checkpoints)
    }

    /// Most recent checkpoint, if any
    pub fn latest_checkpoint(&self) -> Result<Option<PathBuf>> {
        Ok(self.checkpoints()?.pop().map(|(_, path)| path))
    }

    /// Write `checkpoint` for `step` and prune old checkpoints
    pub fn save(&self, checkpoint: &Checkpoint, step: usize) -> Result<PathBuf> {
        if self.max_to_keep == Some(0) {
            return Err(NmtError::Config(
                "max_to_keep must be > 0 when set".to_string(),
            ));
        }
        std::fs::create_dir_all(&self.directory)?;

        let path = self.checkpoint_path(step);
        checkpoint.save(&path)?;
        log::info!("Saved checkpoint {}", path.display());

        if let Some(max_to_keep) = self.max_to_keep {
            let checkpoints = self.checkpoints()?;
            let excess = checkpoints.len().saturating_sub(max_to_keep);
            for (_, old) in checkpoints.into_iter().take(excess) {
                log::debug!("Removing old checkpoint {}", old.display());
                std::fs::remove_file(&old)?;
            }
        }

        Ok(path)
    }
}
