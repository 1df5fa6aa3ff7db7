use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::model::Model;

/// Bumped whenever the checkpoint layout changes.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Checkpoint metadata: which epoch the snapshot came from, how it scored,
/// and where the weights live (relative to the checkpoint directory).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointData {
    pub version: u32,
    pub epoch: usize,
    pub val_loss: f32,
    pub val_accuracy: f32,
    pub model_file: String,
}

/// A checkpoint found on disk.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub path: PathBuf,
    pub data: CheckpointData,
}

/// Snapshot the model into `checkpoint_dir`, tagged with the epoch and its
/// validation metrics. Weights and metadata are staged under temporary names
/// and renamed into place, so a crash never leaves a half-written checkpoint.
pub fn save_checkpoint(
    model: &dyn Model,
    epoch: usize,
    val_loss: f32,
    val_accuracy: f32,
    checkpoint_dir: &Path,
) -> Result<PathBuf> {
    fs::create_dir_all(checkpoint_dir)
        .with_context(|| format!("Failed to create checkpoint directory: {:?}", checkpoint_dir))?;

    let stem = format!("checkpoint_epoch_{epoch:05}");
    let model_file = format!("{stem}_model.mpk");

    let staged_weights = checkpoint_dir.join(format!(".tmp_{model_file}"));
    model.save_weights(&staged_weights)?;
    let weights_path = checkpoint_dir.join(&model_file);
    fs::rename(&staged_weights, &weights_path)
        .with_context(|| format!("Failed to move weights into place: {:?}", weights_path))?;

    let data = CheckpointData {
        version: CHECKPOINT_VERSION,
        epoch,
        val_loss,
        val_accuracy,
        model_file,
    };
    let json = serde_json::to_string_pretty(&data)
        .with_context(|| "Failed to serialize checkpoint metadata")?;

    let staged_metadata = checkpoint_dir.join(format!(".tmp_{stem}.json"));
    fs::write(&staged_metadata, json)
        .with_context(|| format!("Failed to write checkpoint metadata: {:?}", staged_metadata))?;
    let metadata_path = checkpoint_dir.join(format!("{stem}.json"));
    fs::rename(&staged_metadata, &metadata_path)
        .with_context(|| format!("Failed to move metadata into place: {:?}", metadata_path))?;

    info!(
        "Checkpoint saved at epoch {} (val_loss={:.6}): {:?}",
        epoch, val_loss, metadata_path
    );
    Ok(metadata_path)
}

/// Restore weights from a checkpoint metadata file into an existing model.
pub fn load_checkpoint(metadata_path: &Path, model: &mut dyn Model) -> Result<CheckpointData> {
    let json = fs::read_to_string(metadata_path)
        .with_context(|| format!("Failed to read checkpoint file: {:?}", metadata_path))?;
    let data: CheckpointData = serde_json::from_str(&json)
        .with_context(|| "Failed to parse checkpoint metadata")?;

    if data.version != CHECKPOINT_VERSION {
        bail!(
            "unsupported checkpoint version {} (expected {})",
            data.version,
            CHECKPOINT_VERSION
        );
    }

    let checkpoint_dir = metadata_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("Invalid checkpoint path"))?;
    model.load_weights(&checkpoint_dir.join(&data.model_file))?;

    info!("Restored checkpoint from epoch {}", data.epoch);
    Ok(data)
}

/// All checkpoints in a directory, sorted by epoch.
pub fn list_checkpoints(checkpoint_dir: &Path) -> Result<Vec<Checkpoint>> {
    if !checkpoint_dir.exists() {
        warn!("Checkpoint directory does not exist: {:?}", checkpoint_dir);
        return Ok(Vec::new());
    }

    let mut checkpoints = Vec::new();
    for entry in WalkDir::new(checkpoint_dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        let is_metadata = path.extension().and_then(|s| s.to_str()) == Some("json")
            && path
                .file_name()
                .and_then(|s| s.to_str())
                .map(|name| name.starts_with("checkpoint_"))
                .unwrap_or(false);
        if !is_metadata {
            continue;
        }
        if let Ok(json) = fs::read_to_string(path) {
            if let Ok(data) = serde_json::from_str::<CheckpointData>(&json) {
                checkpoints.push(Checkpoint {
                    path: path.to_path_buf(),
                    data,
                });
            }
        }
    }

    checkpoints.sort_by_key(|c| c.data.epoch);
    Ok(checkpoints)
}

/// The snapshot with the lowest validation loss, if any exist.
pub fn best_checkpoint(checkpoint_dir: &Path) -> Result<Option<Checkpoint>> {
    let checkpoints = list_checkpoints(checkpoint_dir)?;
    Ok(checkpoints
        .into_iter()
        .min_by(|a, b| a.data.val_loss.total_cmp(&b.data.val_loss)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::testing::FakeModel;
    use tempfile::TempDir;

    #[test]
    fn list_empty_checkpoints() {
        let temp_dir = TempDir::new().unwrap();
        let checkpoints = list_checkpoints(temp_dir.path()).unwrap();
        assert_eq!(checkpoints.len(), 0);
    }

    #[test]
    fn save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let model = FakeModel::constant(0.5, 0.9);

        let path = save_checkpoint(&model, 3, 0.25, 0.9, dir.path()).unwrap();
        let mut restored = FakeModel::constant(0.5, 0.9);
        let data = load_checkpoint(&path, &mut restored).unwrap();
        assert_eq!(data.epoch, 3);
        assert_eq!(data.model_file, "checkpoint_epoch_00003_model.mpk");
        assert_eq!(restored.loads(), 1);
    }

    #[test]
    fn best_is_minimum_validation_loss() {
        let dir = TempDir::new().unwrap();
        let model = FakeModel::constant(0.5, 0.9);

        save_checkpoint(&model, 1, 0.9, 0.5, dir.path()).unwrap();
        save_checkpoint(&model, 2, 0.2, 0.8, dir.path()).unwrap();
        save_checkpoint(&model, 3, 0.4, 0.7, dir.path()).unwrap();

        let best = best_checkpoint(dir.path()).unwrap().unwrap();
        assert_eq!(best.data.epoch, 2);

        let all = list_checkpoints(dir.path()).unwrap();
        let epochs: Vec<usize> = all.iter().map(|c| c.data.epoch).collect();
        assert_eq!(epochs, vec![1, 2, 3]);
    }

    #[test]
    fn no_staging_files_left_behind() {
        let dir = TempDir::new().unwrap();
        let model = FakeModel::constant(0.5, 0.9);
        save_checkpoint(&model, 1, 0.9, 0.5, dir.path()).unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp_"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
