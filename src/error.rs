use std::path::PathBuf;
use thiserror::Error;

pub type DatasetResult<T> = Result<T, DatasetError>;

/// Errors raised while building, persisting, or reading a dataset artifact.
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("no examples to build a dataset from")]
    Empty,
    #[error("invalid partition proportions (train={train}, validation={validation}, test={test}): {msg}")]
    BadProportions {
        train: f32,
        validation: f32,
        test: f32,
        msg: String,
    },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("image decode error at {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("image shape mismatch at {path}: expected {expected}, got {actual}")]
    ShapeMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    #[error("bad dataset artifact at {path}: {msg}")]
    BadArtifact { path: PathBuf, msg: String },
}

impl DatasetError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DatasetError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        DatasetError::Json {
            path: path.into(),
            source,
        }
    }
}

/// Non-finite loss observed during training. Fatal for the run; the last
/// good checkpoint is kept.
#[derive(Debug, Error)]
#[error("non-finite loss {loss} at epoch {epoch}")]
pub struct DivergenceError {
    pub epoch: usize,
    pub loss: f32,
}
