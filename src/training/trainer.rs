use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::checkpoint::save_checkpoint;
use crate::config::TrainConfig;
use crate::data::BatchSource;
use crate::error::DivergenceError;
use crate::model::Model;

/// Terminal states of a training run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Termination {
    Converged,
    MaxEpochsReached,
    EarlyStopped,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Initialized,
    Running,
    Finished(Termination),
}

/// Scalar metrics for one completed epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingRecord {
    pub epoch: usize,
    pub train_loss: f32,
    pub val_loss: f32,
    pub val_accuracy: f32,
    pub duration_secs: f64,
}

#[derive(Debug)]
pub struct TrainingSummary {
    pub termination: Termination,
    pub history: Vec<TrainingRecord>,
    /// (epoch, val_loss) of the best epoch seen, if any epoch completed.
    pub best: Option<(usize, f32)>,
    pub failure: Option<DivergenceError>,
}

impl TrainingSummary {
    pub fn failed(&self) -> bool {
        self.termination == Termination::Failed
    }
}

/// Drives epochs over a training partition with periodic validation,
/// early-stop and convergence checks, and checkpoint persistence.
///
/// Single-threaded by design: a minibatch step completes fully before the
/// next begins, and the cancellation flag is only consulted between epochs.
pub struct TrainingLoop {
    model: Box<dyn Model>,
    config: TrainConfig,
    checkpoint_dir: PathBuf,
    cancel: Arc<AtomicBool>,
    state: LoopState,
    last_checkpoint_epoch: Option<usize>,
}

impl TrainingLoop {
    pub fn new(model: Box<dyn Model>, config: TrainConfig, checkpoint_dir: impl Into<PathBuf>) -> Self {
        config.validate();
        Self {
            model,
            config,
            checkpoint_dir: checkpoint_dir.into(),
            cancel: Arc::new(AtomicBool::new(false)),
            state: LoopState::Initialized,
            last_checkpoint_epoch: None,
        }
    }

    /// Share a flag the embedder may set to request a graceful stop.
    pub fn with_cancellation(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Hand the trained model back, e.g. for test-set evaluation.
    pub fn into_model(self) -> Box<dyn Model> {
        self.model
    }

    pub fn run(
        &mut self,
        train: &mut dyn BatchSource,
        validation: &mut dyn BatchSource,
    ) -> Result<TrainingSummary> {
        self.state = LoopState::Running;
        let mut history: Vec<TrainingRecord> = Vec::new();
        let mut best: Option<(usize, f32)> = None;
        let mut best_val = f32::INFINITY;
        let mut stalled_epochs = 0usize;

        for epoch in 1..=self.config.max_epochs {
            if self.cancel.load(Ordering::Relaxed) {
                warn!("Cancellation requested; checkpointing and stopping");
                self.checkpoint(epoch.saturating_sub(1), history.last())?;
                return Ok(self.finish(Termination::Cancelled, history, best, None));
            }

            let started = Instant::now();
            let train_loss = self.train_epoch(train)?;
            if !train_loss.is_finite() {
                return Ok(self.fail(epoch, train_loss, history, best));
            }

            let (val_loss, val_accuracy) = self.validation_epoch(validation)?;
            if !val_loss.is_finite() {
                return Ok(self.fail(epoch, val_loss, history, best));
            }

            let record = TrainingRecord {
                epoch,
                train_loss,
                val_loss,
                val_accuracy,
                duration_secs: started.elapsed().as_secs_f64(),
            };
            info!(
                "Epoch {}/{}: train_loss={:.6} val_loss={:.6} val_acc={:.3} ({:.2}s)",
                epoch,
                self.config.max_epochs,
                record.train_loss,
                record.val_loss,
                record.val_accuracy,
                record.duration_secs
            );
            history.push(record);

            // Early-stop bookkeeping: an epoch counts as progress only when
            // it beats the best validation loss by more than the tolerance.
            if best_val - val_loss > self.config.tolerance {
                stalled_epochs = 0;
            } else {
                stalled_epochs += 1;
            }
            if val_loss < best_val {
                best_val = val_loss;
                best = Some((epoch, val_loss));
            }

            if epoch % self.config.checkpoint_every == 0 {
                self.checkpoint(epoch, history.last())?;
            }

            if let Some(target) = self.config.target_loss {
                if val_loss <= target {
                    info!("Validation loss {:.6} reached target {:.6}", val_loss, target);
                    self.checkpoint(epoch, history.last())?;
                    return Ok(self.finish(Termination::Converged, history, best, None));
                }
            }

            if stalled_epochs >= self.config.patience {
                info!(
                    "No validation improvement for {} epochs; stopping early",
                    stalled_epochs
                );
                self.checkpoint(epoch, history.last())?;
                return Ok(self.finish(Termination::EarlyStopped, history, best, None));
            }
        }

        self.checkpoint(self.config.max_epochs, history.last())?;
        Ok(self.finish(Termination::MaxEpochsReached, history, best, None))
    }

    /// One pass over all training minibatches. Returns the size-weighted
    /// mean loss; a non-finite batch loss is returned immediately.
    fn train_epoch(&mut self, source: &mut dyn BatchSource) -> Result<f32> {
        let mut total_loss = 0.0f64;
        let mut total_examples = 0usize;
        while let Some(batch) = source.next_batch()? {
            let loss = self.model.step(&batch)?;
            if !loss.is_finite() {
                source.reset();
                return Ok(loss);
            }
            total_loss += f64::from(loss) * batch.len() as f64;
            total_examples += batch.len();
        }
        source.reset();
        if total_examples == 0 {
            return Ok(0.0);
        }
        Ok((total_loss / total_examples as f64) as f32)
    }

    /// One pass over all validation minibatches, no parameter updates.
    fn validation_epoch(&mut self, source: &mut dyn BatchSource) -> Result<(f32, f32)> {
        let mut total_loss = 0.0f64;
        let mut total_correct = 0.0f64;
        let mut total_examples = 0usize;
        while let Some(batch) = source.next_batch()? {
            let (loss, accuracy) = self.model.evaluate(&batch)?;
            if !loss.is_finite() {
                source.reset();
                return Ok((loss, 0.0));
            }
            total_loss += f64::from(loss) * batch.len() as f64;
            total_correct += f64::from(accuracy) * batch.len() as f64;
            total_examples += batch.len();
        }
        source.reset();
        if total_examples == 0 {
            return Ok((0.0, 0.0));
        }
        Ok((
            (total_loss / total_examples as f64) as f32,
            (total_correct / total_examples as f64) as f32,
        ))
    }

    /// Snapshot the current model, skipping if this epoch already has one.
    fn checkpoint(&mut self, epoch: usize, last_record: Option<&TrainingRecord>) -> Result<()> {
        if self.last_checkpoint_epoch == Some(epoch) {
            return Ok(());
        }
        // f32::MAX rather than infinity: the metric lands in JSON metadata,
        // and serde_json cannot represent non-finite floats.
        let (val_loss, val_accuracy) = last_record
            .map(|r| (r.val_loss, r.val_accuracy))
            .unwrap_or((f32::MAX, 0.0));
        save_checkpoint(
            self.model.as_ref(),
            epoch,
            val_loss,
            val_accuracy,
            &self.checkpoint_dir,
        )?;
        self.last_checkpoint_epoch = Some(epoch);
        Ok(())
    }

    fn fail(
        &mut self,
        epoch: usize,
        loss: f32,
        history: Vec<TrainingRecord>,
        best: Option<(usize, f32)>,
    ) -> TrainingSummary {
        // The last good checkpoint is deliberately left untouched.
        warn!("Non-finite loss {} at epoch {}; aborting run", loss, epoch);
        self.finish(
            Termination::Failed,
            history,
            best,
            Some(DivergenceError { epoch, loss }),
        )
    }

    fn finish(
        &mut self,
        termination: Termination,
        history: Vec<TrainingRecord>,
        best: Option<(usize, f32)>,
        failure: Option<DivergenceError>,
    ) -> TrainingSummary {
        self.state = LoopState::Finished(termination);
        TrainingSummary {
            termination,
            history,
            best,
            failure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SplitConfig;
    use crate::data::{DatasetBuilder, Image, ImageShape, LabeledExample, MinibatchIterator, Partition};
    use crate::model::testing::FakeModel;
    use tempfile::TempDir;

    fn partition(n: usize) -> Partition {
        let shape = ImageShape::new(1, 1, 1);
        let examples: Vec<LabeledExample> = (0..n)
            .map(|i| LabeledExample {
                image: Image::new(vec![i as f32], shape),
                label: (i % 2) as u8,
                source: format!("img{i}"),
            })
            .collect();
        let split = SplitConfig {
            train: 1.0,
            validation: 0.0,
            test: 0.0,
        };
        DatasetBuilder::new(split, 0)
            .unwrap()
            .build(examples)
            .unwrap()
            .train
    }

    fn config(max_epochs: usize, checkpoint_every: usize) -> TrainConfig {
        TrainConfig {
            batch_size: 4,
            max_epochs,
            patience: 100,
            tolerance: 1e-3,
            checkpoint_every,
            target_loss: None,
            shuffle_seed: 0,
        }
    }

    /// Runs the loop with one batch per epoch, so scripted fake losses map
    /// one-to-one onto epochs.
    fn run_loop(
        model: FakeModel,
        config: TrainConfig,
        dir: &std::path::Path,
    ) -> (TrainingSummary, TrainingLoop) {
        let part = partition(4);
        let mut train = MinibatchIterator::new(&part, 4, false, 0);
        let mut val = MinibatchIterator::new(&part, 4, false, 0);
        let mut training_loop = TrainingLoop::new(Box::new(model), config, dir);
        let summary = training_loop.run(&mut train, &mut val).unwrap();
        (summary, training_loop)
    }

    #[test]
    fn runs_to_max_epochs() {
        let dir = TempDir::new().unwrap();
        let model = FakeModel::constant(0.5, 0.8);
        let (summary, training_loop) = run_loop(model, config(5, 100), dir.path());

        assert_eq!(summary.termination, Termination::MaxEpochsReached);
        assert_eq!(summary.history.len(), 5);
        assert_eq!(
            training_loop.state(),
            LoopState::Finished(Termination::MaxEpochsReached)
        );
        // Terminal state always checkpoints.
        let checkpoints = crate::checkpoint::list_checkpoints(dir.path()).unwrap();
        assert_eq!(checkpoints.len(), 1);
        assert_eq!(checkpoints[0].data.epoch, 5);
    }

    #[test]
    fn checkpoints_on_the_configured_cadence() {
        let dir = TempDir::new().unwrap();
        let model = FakeModel::constant(0.5, 0.8);
        let (_, _) = run_loop(model, config(5, 2), dir.path());

        let epochs: Vec<usize> = crate::checkpoint::list_checkpoints(dir.path())
            .unwrap()
            .iter()
            .map(|c| c.data.epoch)
            .collect();
        assert_eq!(epochs, vec![2, 4, 5]);
    }

    #[test]
    fn early_stops_after_patience_runs_out() {
        let dir = TempDir::new().unwrap();
        let model = FakeModel::scripted(
            vec![0.5],
            vec![(1.0, 0.5), (0.9, 0.5), (0.9, 0.5), (0.9, 0.5), (0.9, 0.5)],
        );
        let mut cfg = config(50, 100);
        cfg.patience = 2;
        cfg.tolerance = 0.01;
        let (summary, _) = run_loop(model, cfg, dir.path());

        assert_eq!(summary.termination, Termination::EarlyStopped);
        // Improvements at epochs 1 and 2, stalls at 3 and 4.
        assert_eq!(summary.history.len(), 4);
        assert_eq!(summary.best, Some((2, 0.9)));
    }

    #[test]
    fn converges_when_target_loss_is_reached() {
        let dir = TempDir::new().unwrap();
        let model = FakeModel::scripted(vec![0.5], vec![(1.0, 0.5), (0.4, 0.9)]);
        let mut cfg = config(50, 100);
        cfg.target_loss = Some(0.45);
        let (summary, _) = run_loop(model, cfg, dir.path());

        assert_eq!(summary.termination, Termination::Converged);
        assert_eq!(summary.history.len(), 2);
    }

    #[test]
    fn nan_loss_fails_and_preserves_previous_checkpoint() {
        let dir = TempDir::new().unwrap();
        let model = FakeModel::scripted(vec![0.5, f32::NAN], vec![(0.5, 0.8)]);
        let (summary, _) = run_loop(model, config(10, 1), dir.path());

        assert_eq!(summary.termination, Termination::Failed);
        assert!(summary.failed());
        assert_eq!(summary.history.len(), 1);
        let failure = summary.failure.unwrap();
        assert_eq!(failure.epoch, 2);
        assert!(failure.loss.is_nan());

        // Only the epoch-1 snapshot exists, with its weights untouched.
        let checkpoints = crate::checkpoint::list_checkpoints(dir.path()).unwrap();
        assert_eq!(checkpoints.len(), 1);
        assert_eq!(checkpoints[0].data.epoch, 1);
        let weights = std::fs::read_to_string(
            dir.path().join(&checkpoints[0].data.model_file),
        )
        .unwrap();
        assert_eq!(weights, "fake-weights after 1 steps");
    }

    #[test]
    fn cancellation_checkpoints_before_exit() {
        let dir = TempDir::new().unwrap();
        let part = partition(4);
        let mut train = MinibatchIterator::new(&part, 4, false, 0);
        let mut val = MinibatchIterator::new(&part, 4, false, 0);

        let cancel = Arc::new(AtomicBool::new(true));
        let mut training_loop =
            TrainingLoop::new(Box::new(FakeModel::constant(0.5, 0.8)), config(10, 100), dir.path())
                .with_cancellation(cancel);
        let summary = training_loop.run(&mut train, &mut val).unwrap();

        assert_eq!(summary.termination, Termination::Cancelled);
        assert!(summary.history.is_empty());
        assert_eq!(crate::checkpoint::list_checkpoints(dir.path()).unwrap().len(), 1);
    }
}
