//! Error types for safegan

use std::path::PathBuf;

use burn::record::RecorderError;
use thiserror::Error;

/// Result type alias for safegan operations
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Unknown option string or out-of-range numeric setting
    #[error("configuration error: {0}")]
    Config(String),

    /// Scene ranges do not partition the pedestrian dimension
    #[error("invalid scene ranges: {0}")]
    SceneRange(String),

    #[error("shape mismatch for {what}: expected {expected:?}, got {actual:?}")]
    Shape {
        what: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("unknown scene: {0}")]
    UnknownScene(String),

    #[error("malformed geometry file {path}: {reason}")]
    Geometry { path: PathBuf, reason: String },

    #[error("restore target not found: {}", .0.display())]
    RestoreNotFound(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("recorder error: {0}")]
    Recorder(String),
}

impl From<RecorderError> for Error {
    fn from(err: RecorderError) -> Self {
        Error::Recorder(format!("{err:?}"))
    }
}

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }
}
