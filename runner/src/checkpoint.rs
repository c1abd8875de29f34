use std::{
    collections::BTreeMap,
    fs,
    num::NonZeroUsize,
    path::{Path, PathBuf},
};

use engine::Tensor;
use log::warn;
use safetensors::{SafeTensors, tensor::Dtype, tensor::TensorView};

use crate::error::{Result, RunnerErr};

/// Tensor snapshot file inside a checkpoint directory.
pub const TENSORS_FILE: &str = "model.safetensors";
/// Property map file inside a checkpoint directory.
pub const PROPERTIES_FILE: &str = "properties.json";

const CHECKPOINT_PREFIX: &str = "checkpoint_";

/// Bounded set of on-disk training snapshots, keyed by weight-update step.
///
/// Construction scans the checkpoint directory, so a restarted run picks
/// up snapshots written by its predecessor.
#[derive(Debug)]
pub struct CheckpointRegistry {
    dir: PathBuf,
    max_checkpoints: usize,
    checkpoints: BTreeMap<usize, PathBuf>,
}

impl CheckpointRegistry {
    /// Opens a registry over `dir`, indexing existing `checkpoint_<step>`
    /// subdirectories.
    ///
    /// # Errors
    /// Propagates directory-scan I/O failures.
    pub fn new(dir: PathBuf, max_checkpoints: NonZeroUsize) -> Result<Self> {
        let mut checkpoints = BTreeMap::new();
        if dir.is_dir() {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                let name = entry.file_name();
                let Some(step) = name
                    .to_str()
                    .and_then(|n| n.strip_prefix(CHECKPOINT_PREFIX))
                    .and_then(|n| n.parse::<usize>().ok())
                else {
                    continue;
                };
                checkpoints.insert(step, entry.path());
            }
        }
        Ok(Self {
            dir,
            max_checkpoints: max_checkpoints.get(),
            checkpoints,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }

    /// Path of the newest known snapshot, if any.
    pub fn try_get_latest(&self) -> Option<&Path> {
        self.checkpoints
            .last_key_value()
            .map(|(_, path)| path.as_path())
    }

    /// Registers a snapshot for `weight_update_step`.
    ///
    /// # Returns
    /// The directory to write the snapshot into, and — when the bound is
    /// now exceeded — the oldest snapshot's path. The caller deletes the
    /// old snapshot only after the new one is durably written.
    pub fn add_checkpoint(&mut self, weight_update_step: usize) -> (PathBuf, Option<PathBuf>) {
        let path = self
            .dir
            .join(format!("{CHECKPOINT_PREFIX}{weight_update_step}"));
        self.checkpoints.insert(weight_update_step, path.clone());

        let evict = if self.checkpoints.len() > self.max_checkpoints {
            self.checkpoints.pop_first().map(|(_, old)| old)
        } else {
            None
        };
        (path, evict)
    }
}

/// Writes one snapshot: tensor state plus the property map.
///
/// # Errors
/// Any write failure here is fatal to the run.
pub fn save_snapshot(
    path: &Path,
    tensors: &[(String, Tensor)],
    properties: &BTreeMap<String, String>,
) -> Result<()> {
    fs::create_dir_all(path)?;

    let views = tensors
        .iter()
        .map(|(name, tensor)| {
            TensorView::new(
                Dtype::F32,
                tensor.shape().to_vec(),
                bytemuck::cast_slice(tensor.data()),
            )
            .map(|view| (name.as_str(), view))
        })
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| RunnerErr::Checkpoint(e.to_string()))?;
    let bytes =
        safetensors::serialize(views, &None).map_err(|e| RunnerErr::Checkpoint(e.to_string()))?;
    fs::write(path.join(TENSORS_FILE), bytes)?;

    let json = serde_json::to_string_pretty(properties)?;
    fs::write(path.join(PROPERTIES_FILE), json)?;
    Ok(())
}

/// Reads one snapshot back.
///
/// # Errors
/// Missing files, malformed payloads and non-f32 tensors are all hard
/// restore failures.
pub fn load_snapshot(path: &Path) -> Result<(Vec<(String, Tensor)>, BTreeMap<String, String>)> {
    let bytes = fs::read(path.join(TENSORS_FILE))?;
    let parsed =
        SafeTensors::deserialize(&bytes).map_err(|e| RunnerErr::Checkpoint(e.to_string()))?;

    let mut tensors = Vec::with_capacity(parsed.len());
    for (name, view) in parsed.tensors() {
        if view.dtype() != Dtype::F32 {
            return Err(RunnerErr::Checkpoint(format!(
                "tensor `{name}` has dtype {:?}, expected F32",
                view.dtype()
            )));
        }
        let data: Vec<f32> = bytemuck::pod_collect_to_vec(view.data());
        tensors.push((name, Tensor::new(view.shape().to_vec(), data)));
    }

    let json = fs::read_to_string(path.join(PROPERTIES_FILE))?;
    let properties: BTreeMap<String, String> = serde_json::from_str(&json)?;
    Ok((tensors, properties))
}

/// Deletes an evicted snapshot. Deletion failure is downgraded to a
/// warning; a stale directory must not abort training.
pub fn remove_snapshot(path: &Path) {
    if let Err(e) = fs::remove_dir_all(path) {
        warn!("failed to delete old checkpoint {}: {e}", path.display());
    }
}
