use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::error::DatasetError;

/// Target resolution and decode policy for the image store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub width: u32,
    pub height: u32,
    /// Interpolation used when resizing to the target resolution.
    pub filter: ResizeFilter,
    /// Optional on-disk decode cache, keyed by (relative path, resolution).
    pub cache_dir: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            width: 64,
            height: 64,
            filter: ResizeFilter::Triangle,
            cache_dir: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResizeFilter {
    Nearest,
    Triangle,
    Lanczos,
}

impl ResizeFilter {
    pub fn to_image_filter(self) -> image::imageops::FilterType {
        match self {
            ResizeFilter::Nearest => image::imageops::FilterType::Nearest,
            ResizeFilter::Triangle => image::imageops::FilterType::Triangle,
            ResizeFilter::Lanczos => image::imageops::FilterType::Lanczos3,
        }
    }
}

/// Square-marker overlay policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentConfig {
    /// Probability that an image receives the marker (and label 1).
    pub probability: f64,
    /// Side length range of the square, in pixels. Clamped to fit.
    pub min_side: u32,
    pub max_side: u32,
    /// Marker intensity on every channel, in the normalized [0,1] range.
    pub marker_value: f32,
}

impl Default for AugmentConfig {
    fn default() -> Self {
        Self {
            probability: 0.5,
            min_side: 16,
            max_side: 16,
            marker_value: 1.0,
        }
    }
}

impl AugmentConfig {
    pub fn validate(&self) {
        assert!(
            (0.0..=1.0).contains(&self.probability),
            "probability must be within [0,1]"
        );
        assert!(self.min_side > 0, "min_side must be > 0");
        assert!(self.max_side >= self.min_side, "max_side must be >= min_side");
        assert!(
            (0.0..=1.0).contains(&self.marker_value),
            "marker_value must be within [0,1]"
        );
    }
}

/// Train/validation/test partition proportions. Must sum to 1.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitConfig {
    pub train: f32,
    pub validation: f32,
    pub test: f32,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            train: 0.8,
            validation: 0.1,
            test: 0.1,
        }
    }
}

impl SplitConfig {
    pub fn validate(&self) -> Result<(), DatasetError> {
        let bad = |msg: &str| DatasetError::BadProportions {
            train: self.train,
            validation: self.validation,
            test: self.test,
            msg: msg.to_string(),
        };
        if self.train < 0.0 || self.validation < 0.0 || self.test < 0.0 {
            return Err(bad("proportions must be non-negative"));
        }
        let sum = self.train + self.validation + self.test;
        if (sum - 1.0).abs() > 1e-4 {
            return Err(bad("proportions must sum to 1"));
        }
        Ok(())
    }
}

/// Classifier architecture: one hidden width per layer. Depth is the
/// experiment input; an empty list is a plain linear probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub hidden: Vec<usize>,
    pub learning_rate: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            hidden: vec![64],
            learning_rate: 1e-3,
        }
    }
}

impl ModelConfig {
    pub fn validate(&self) {
        assert!(self.learning_rate > 0.0, "learning_rate must be > 0");
        for width in &self.hidden {
            assert!(*width > 0, "hidden widths must be > 0");
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub batch_size: usize,
    pub max_epochs: usize,
    /// Early stop after this many epochs without validation improvement.
    pub patience: usize,
    /// Minimum validation-loss improvement that counts as progress.
    pub tolerance: f32,
    /// Checkpoint every this many epochs (terminal states always checkpoint).
    pub checkpoint_every: usize,
    /// Validation loss at or below this value counts as converged.
    pub target_loss: Option<f32>,
    /// Seed for per-epoch minibatch shuffling.
    pub shuffle_seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_epochs: 50,
            patience: 10,
            tolerance: 1e-4,
            checkpoint_every: 5,
            target_loss: None,
            shuffle_seed: 0,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) {
        assert!(self.batch_size > 0, "batch_size must be > 0");
        assert!(self.max_epochs > 0, "max_epochs must be > 0");
        assert!(self.patience > 0, "patience must be > 0");
        assert!(self.tolerance >= 0.0, "tolerance must be >= 0");
        assert!(self.checkpoint_every > 0, "checkpoint_every must be > 0");
    }
}

/// Everything a `train` invocation needs, loadable from a JSON file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub model: ModelConfig,
    pub training: TrainConfig,
}

impl ExperimentConfig {
    pub fn validate(&self) {
        self.model.validate();
        self.training.validate();
    }
}

impl fmt::Display for ExperimentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
