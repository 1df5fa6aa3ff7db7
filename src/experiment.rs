use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::info;

use crate::checkpoint::{best_checkpoint, load_checkpoint};
use crate::config::ExperimentConfig;
use crate::data::{BatchSource, Dataset, MinibatchIterator, Partition};
use crate::model::{Model, ModelBuilder};
use crate::training::{Termination, TrainingLoop, TrainingSummary};

/// Final report written as `experiment.json` in the output directory.
#[derive(Debug, Serialize)]
pub struct ExperimentReport {
    pub dataset: PathBuf,
    pub images_train: usize,
    pub images_validation: usize,
    pub images_test: usize,
    pub config: ExperimentConfig,
    pub termination: Termination,
    pub epochs_completed: usize,
    pub time_per_epoch_secs: f64,
    pub best_epoch: Option<usize>,
    pub best_val_loss: Option<f32>,
    pub test_loss: Option<f32>,
    pub test_accuracy: Option<f32>,
}

/// Ties a dataset artifact, a model-building capability, and a training
/// configuration together. All side effects stay inside the output
/// directory; the input artifact is never touched.
pub struct ExperimentRunner {
    dataset_path: PathBuf,
    output_dir: PathBuf,
    config: ExperimentConfig,
    cancel: Arc<AtomicBool>,
}

impl ExperimentRunner {
    pub fn new(
        dataset_path: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        config: ExperimentConfig,
    ) -> Self {
        config.validate();
        Self {
            dataset_path: dataset_path.into(),
            output_dir: output_dir.into(),
            config,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_cancellation(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn run(&self, builder: &dyn ModelBuilder) -> Result<(TrainingSummary, ExperimentReport)> {
        fs::create_dir_all(&self.output_dir)
            .with_context(|| format!("Failed to create output directory: {:?}", self.output_dir))?;

        let dataset = Dataset::load(&self.dataset_path)
            .with_context(|| format!("Failed to load dataset artifact: {:?}", self.dataset_path))?;

        let training = &self.config.training;
        let mut train_iter = MinibatchIterator::new(
            &dataset.train,
            training.batch_size,
            true,
            training.shuffle_seed,
        );
        let mut val_iter =
            MinibatchIterator::new(&dataset.validation, training.batch_size, false, 0);

        info!(
            "Starting experiment: {} train / {} validation / {} test images, hidden={:?}",
            dataset.train.len(),
            dataset.validation.len(),
            dataset.test.len(),
            self.config.model.hidden
        );

        let model = builder.build(dataset.shape())?;
        let checkpoint_dir = self.output_dir.join("checkpoints");
        let mut training_loop = TrainingLoop::new(model, training.clone(), &checkpoint_dir)
            .with_cancellation(Arc::clone(&self.cancel));
        let summary = training_loop.run(&mut train_iter, &mut val_iter)?;

        write_json_atomic(&self.output_dir.join("history.json"), &summary.history)?;

        // Test the best snapshot, unless the run diverged.
        let mut test_metrics = None;
        if !summary.failed() && !dataset.test.is_empty() {
            let mut model = training_loop.into_model();
            if let Some(best) = best_checkpoint(&checkpoint_dir)? {
                load_checkpoint(&best.path, model.as_mut())?;
            }
            test_metrics =
                evaluate_partition(model.as_mut(), &dataset.test, training.batch_size)?;
            if let Some((loss, accuracy)) = test_metrics {
                info!("Test loss: {:.6}, test accuracy: {:.3}", loss, accuracy);
            }
        }

        let epochs_completed = summary.history.len();
        let total_time: f64 = summary.history.iter().map(|r| r.duration_secs).sum();
        let report = ExperimentReport {
            dataset: self.dataset_path.clone(),
            images_train: dataset.train.len(),
            images_validation: dataset.validation.len(),
            images_test: dataset.test.len(),
            config: self.config.clone(),
            termination: summary.termination,
            epochs_completed,
            time_per_epoch_secs: if epochs_completed > 0 {
                total_time / epochs_completed as f64
            } else {
                0.0
            },
            best_epoch: summary.best.map(|(epoch, _)| epoch),
            best_val_loss: summary.best.map(|(_, loss)| loss),
            test_loss: test_metrics.map(|(loss, _)| loss),
            test_accuracy: test_metrics.map(|(_, accuracy)| accuracy),
        };
        write_json_atomic(&self.output_dir.join("experiment.json"), &report)?;

        Ok((summary, report))
    }
}

/// Size-weighted loss and accuracy over one full pass of a partition.
pub fn evaluate_partition(
    model: &mut dyn Model,
    partition: &Partition,
    batch_size: usize,
) -> Result<Option<(f32, f32)>> {
    if partition.is_empty() {
        return Ok(None);
    }
    let mut iter = MinibatchIterator::new(partition, batch_size, false, 0);
    let mut total_loss = 0.0f64;
    let mut total_correct = 0.0f64;
    let mut total = 0usize;
    while let Some(batch) = iter.next_batch()? {
        let (loss, accuracy) = model.evaluate(&batch)?;
        total_loss += f64::from(loss) * batch.len() as f64;
        total_correct += f64::from(accuracy) * batch.len() as f64;
        total += batch.len();
    }
    Ok(Some((
        (total_loss / total as f64) as f32,
        (total_correct / total as f64) as f32,
    )))
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .with_context(|| format!("Failed to serialize {:?}", path))?;
    let staged = path.with_extension("json.tmp");
    fs::write(&staged, json).with_context(|| format!("Failed to write {:?}", staged))?;
    fs::rename(&staged, path).with_context(|| format!("Failed to move {:?} into place", path))?;
    Ok(())
}
