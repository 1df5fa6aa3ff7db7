// Library exports for use in other binaries and integration tests

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod experiment;
pub mod model;
pub mod synth;
pub mod training;

// Re-export commonly used types
pub use config::{AugmentConfig, ExperimentConfig, ModelConfig, SplitConfig, StoreConfig, TrainConfig};
pub use data::{Dataset, DatasetBuilder, ImageStore, LabelAugmenter, MinibatchIterator};
pub use experiment::{ExperimentRunner, ExperimentReport};
pub use training::{Termination, TrainingLoop, TrainingSummary};
