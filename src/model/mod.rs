pub mod classifier;

pub use classifier::{DefaultBackend, MlpBuilder, MlpClassifier, MlpNet};

use anyhow::Result;
use std::path::Path;

use crate::data::{ImageShape, Minibatch};

/// Opaque model capability consumed by the training loop.
///
/// The loop never touches parameters directly; it only asks for a gradient
/// step, an evaluation, or a weights snapshot. This keeps the loop testable
/// with a scripted fake and the numeric backend swappable.
pub trait Model {
    /// One forward/backward pass plus optimizer update. Returns the batch loss.
    fn step(&mut self, batch: &Minibatch) -> Result<f32>;

    /// Forward pass only. Returns (loss, accuracy) for the batch.
    fn evaluate(&mut self, batch: &Minibatch) -> Result<(f32, f32)>;

    /// Snapshot the trainable parameters to `path`.
    fn save_weights(&self, path: &Path) -> Result<()>;

    /// Restore parameters previously written by `save_weights`.
    fn load_weights(&mut self, path: &Path) -> Result<()>;
}

/// Builds fresh model state for a given input shape.
pub trait ModelBuilder {
    fn build(&self, shape: ImageShape) -> Result<Box<dyn Model>>;
}
