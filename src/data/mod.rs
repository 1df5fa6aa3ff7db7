mod augment;
mod batcher;
mod dataset;
mod store;

pub use augment::{write_augmented_copies, LabelAugmenter};
pub use batcher::{BatchSource, Minibatch, MinibatchIterator};
pub use dataset::{
    Dataset, DatasetBuilder, DatasetMetadata, Partition, PartitionCounts, PartitionMeta,
    ARTIFACT_VERSION,
};
pub use store::{DecodeStats, ImageStore, StoredImage};

use serde::{Deserialize, Serialize};

/// Fixed channels x height x width extent of every decoded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageShape {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl ImageShape {
    pub fn new(channels: usize, height: usize, width: usize) -> Self {
        Self {
            channels,
            height,
            width,
        }
    }

    /// Number of f32 values in one image.
    pub fn len(&self) -> usize {
        self.channels * self.height * self.width
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Display for ImageShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}x{}", self.channels, self.height, self.width)
    }
}

/// A decoded image: CHW pixel data normalized to [0,1].
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pub pixels: Vec<f32>,
    pub shape: ImageShape,
}

impl Image {
    pub fn new(pixels: Vec<f32>, shape: ImageShape) -> Self {
        assert_eq!(pixels.len(), shape.len(), "pixel buffer does not match shape");
        Self { pixels, shape }
    }
}

/// An image plus its binary marker label and provenance id.
#[derive(Debug, Clone)]
pub struct LabeledExample {
    pub image: Image,
    /// 1 if the marker was overlaid, 0 otherwise.
    pub label: u8,
    /// Source identifier (original file path) for leakage checks.
    pub source: String,
}
