use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use super::{ImageShape, LabeledExample};
use crate::config::SplitConfig;
use crate::error::{DatasetError, DatasetResult};

/// Bumped whenever the on-disk layout changes, so stale artifacts are
/// rejected instead of silently misread.
pub const ARTIFACT_VERSION: u32 = 1;

const PARTITION_NAMES: [&str; 3] = ["train", "validation", "test"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionCounts {
    pub total: usize,
    pub with_marker: usize,
    pub without_marker: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionMeta {
    pub counts: PartitionCounts,
    /// Source id of every example, in partition order. Provenance and
    /// leakage checks read these.
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetMetadata {
    pub version: u32,
    pub shape: ImageShape,
    pub seed: u64,
    pub proportions: SplitConfig,
    pub source_dirs: Vec<String>,
    pub train: PartitionMeta,
    pub validation: PartitionMeta,
    pub test: PartitionMeta,
}

/// One ordered partition, stored as stacked rows.
#[derive(Debug, Clone)]
pub struct Partition {
    pub shape: ImageShape,
    /// Row-major stacked images, `len() * shape.len()` values.
    pub images: Vec<f32>,
    pub labels: Vec<u8>,
    pub sources: Vec<String>,
}

impl Partition {
    fn from_examples(examples: &[LabeledExample], shape: ImageShape) -> Self {
        let mut images = Vec::with_capacity(examples.len() * shape.len());
        let mut labels = Vec::with_capacity(examples.len());
        let mut sources = Vec::with_capacity(examples.len());
        for example in examples {
            images.extend_from_slice(&example.image.pixels);
            labels.push(example.label);
            sources.push(example.source.clone());
        }
        Self {
            shape,
            images,
            labels,
            sources,
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Pixel row for one example.
    pub fn image(&self, index: usize) -> &[f32] {
        let row = self.shape.len();
        &self.images[index * row..(index + 1) * row]
    }

    pub fn counts(&self) -> PartitionCounts {
        let with_marker = self.labels.iter().filter(|l| **l == 1).count();
        PartitionCounts {
            total: self.len(),
            with_marker,
            without_marker: self.len() - with_marker,
        }
    }

    fn meta(&self) -> PartitionMeta {
        PartitionMeta {
            counts: self.counts(),
            sources: self.sources.clone(),
        }
    }
}

/// A built dataset: three disjoint partitions plus metadata. Immutable once
/// persisted; training reads it back read-only.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub metadata: DatasetMetadata,
    pub train: Partition,
    pub validation: Partition,
    pub test: Partition,
}

impl Dataset {
    pub fn shape(&self) -> ImageShape {
        self.metadata.shape
    }

    /// Persist as a directory artifact. The write is staged to a temporary
    /// sibling and renamed into place, so a crash never leaves a partial
    /// artifact at the destination.
    pub fn save(&self, dir: &Path) -> DatasetResult<()> {
        let staging = staging_path(dir)?;
        if staging.exists() {
            fs::remove_dir_all(&staging).map_err(|e| DatasetError::io(&staging, e))?;
        }
        fs::create_dir_all(&staging).map_err(|e| DatasetError::io(&staging, e))?;

        for (name, partition) in self.partitions() {
            write_f32s(&staging.join(format!("{name}_images.f32")), &partition.images)?;
            let labels_path = staging.join(format!("{name}_labels.u8"));
            fs::write(&labels_path, &partition.labels)
                .map_err(|e| DatasetError::io(&labels_path, e))?;
        }

        let metadata_path = staging.join("metadata.json");
        let json = serde_json::to_string_pretty(&self.metadata)
            .map_err(|e| DatasetError::json(&metadata_path, e))?;
        fs::write(&metadata_path, json).map_err(|e| DatasetError::io(&metadata_path, e))?;

        if dir.exists() {
            fs::remove_dir_all(dir).map_err(|e| DatasetError::io(dir, e))?;
        }
        fs::rename(&staging, dir).map_err(|e| DatasetError::io(dir, e))?;
        info!("Saved dataset artifact to {:?}", dir);
        Ok(())
    }

    pub fn load(dir: &Path) -> DatasetResult<Self> {
        let metadata_path = dir.join("metadata.json");
        let json =
            fs::read_to_string(&metadata_path).map_err(|e| DatasetError::io(&metadata_path, e))?;
        let metadata: DatasetMetadata =
            serde_json::from_str(&json).map_err(|e| DatasetError::json(&metadata_path, e))?;

        if metadata.version != ARTIFACT_VERSION {
            return Err(DatasetError::BadArtifact {
                path: dir.to_path_buf(),
                msg: format!(
                    "unsupported artifact version {} (expected {})",
                    metadata.version, ARTIFACT_VERSION
                ),
            });
        }

        let shape = metadata.shape;
        let mut parts = Vec::with_capacity(3);
        for name in PARTITION_NAMES {
            let meta = match name {
                "train" => &metadata.train,
                "validation" => &metadata.validation,
                _ => &metadata.test,
            };
            let images = read_f32s(&dir.join(format!("{name}_images.f32")))?;
            let labels_path = dir.join(format!("{name}_labels.u8"));
            let labels = fs::read(&labels_path).map_err(|e| DatasetError::io(&labels_path, e))?;

            if labels.len() != meta.counts.total || images.len() != meta.counts.total * shape.len()
            {
                return Err(DatasetError::BadArtifact {
                    path: dir.to_path_buf(),
                    msg: format!("{name} partition does not match recorded counts"),
                });
            }
            parts.push(Partition {
                shape,
                images,
                labels,
                sources: meta.sources.clone(),
            });
        }

        let test = parts.pop().expect("three partitions");
        let validation = parts.pop().expect("three partitions");
        let train = parts.pop().expect("three partitions");
        info!(
            "Loaded dataset from {:?} (train={}, validation={}, test={})",
            dir,
            train.len(),
            validation.len(),
            test.len()
        );
        Ok(Self {
            metadata,
            train,
            validation,
            test,
        })
    }

    fn partitions(&self) -> [(&'static str, &Partition); 3] {
        [
            ("train", &self.train),
            ("validation", &self.validation),
            ("test", &self.test),
        ]
    }
}

/// Shuffles labeled examples with a seeded Fisher-Yates pass and slices them
/// into train/validation/test partitions.
pub struct DatasetBuilder {
    split: SplitConfig,
    seed: u64,
    source_dirs: Vec<String>,
}

impl DatasetBuilder {
    pub fn new(split: SplitConfig, seed: u64) -> DatasetResult<Self> {
        split.validate()?;
        Ok(Self {
            split,
            seed,
            source_dirs: Vec::new(),
        })
    }

    /// Record where the raw images came from, for the metadata record.
    pub fn with_source_dirs(mut self, dirs: Vec<String>) -> Self {
        self.source_dirs = dirs;
        self
    }

    pub fn build(&self, mut examples: Vec<LabeledExample>) -> DatasetResult<Dataset> {
        if examples.is_empty() {
            return Err(DatasetError::Empty);
        }

        let shape = examples[0].image.shape;
        for example in &examples {
            if example.image.shape != shape {
                return Err(DatasetError::ShapeMismatch {
                    path: PathBuf::from(&example.source),
                    expected: shape.to_string(),
                    actual: example.image.shape.to_string(),
                });
            }
        }

        let mut rng = StdRng::seed_from_u64(self.seed);
        examples.shuffle(&mut rng);

        let n = examples.len();
        // Validation and test round to the nearest example; train takes the
        // remainder, so sizes always sum to n and stay within 1 of n*p.
        let n_validation = ((n as f64) * f64::from(self.split.validation)).round() as usize;
        let n_test = (((n as f64) * f64::from(self.split.test)).round() as usize).min(n - n_validation);
        let n_train = n - n_validation - n_test;

        let train = Partition::from_examples(&examples[..n_train], shape);
        let validation = Partition::from_examples(&examples[n_train..n_train + n_validation], shape);
        let test = Partition::from_examples(&examples[n_train + n_validation..], shape);

        let metadata = DatasetMetadata {
            version: ARTIFACT_VERSION,
            shape,
            seed: self.seed,
            proportions: self.split,
            source_dirs: self.source_dirs.clone(),
            train: train.meta(),
            validation: validation.meta(),
            test: test.meta(),
        };
        info!(
            "Built dataset: train={:?}, validation={:?}, test={:?}",
            metadata.train.counts, metadata.validation.counts, metadata.test.counts
        );

        Ok(Dataset {
            metadata,
            train,
            validation,
            test,
        })
    }
}

fn staging_path(dir: &Path) -> DatasetResult<PathBuf> {
    let name = dir
        .file_name()
        .ok_or_else(|| DatasetError::BadArtifact {
            path: dir.to_path_buf(),
            msg: "artifact path has no directory name".to_string(),
        })?
        .to_string_lossy();
    Ok(dir.with_file_name(format!(".{name}.staging")))
}

fn write_f32s(path: &Path, values: &[f32]) -> DatasetResult<()> {
    let mut bytes = Vec::with_capacity(values.len() * 4);
    for v in values {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    fs::write(path, bytes).map_err(|e| DatasetError::io(path, e))
}

fn read_f32s(path: &Path) -> DatasetResult<Vec<f32>> {
    let bytes = fs::read(path).map_err(|e| DatasetError::io(path, e))?;
    if bytes.len() % 4 != 0 {
        return Err(DatasetError::BadArtifact {
            path: path.to_path_buf(),
            msg: "array file length is not a multiple of 4".to_string(),
        });
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}
