// Error taxonomy for the reprogramming pipeline.
//
// Library functions return anyhow::Result like the rest of the crate; the
// failures callers need to tell apart are raised as ReprogramError so they can
// be recovered with `err.downcast_ref::<ReprogramError>()`.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReprogramError {
    /// Rejected at construction: sizes, channels, label map, hyper-parameters.
    #[error("configuration error: {0}")]
    Config(String),

    /// A tensor reached a transform with a shape it cannot handle.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    Shape {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("device error: {0}")]
    Device(String),

    #[error("checkpoint error: {message} (path: {path:?})")]
    Checkpoint { message: String, path: PathBuf },

    #[error("dataset error: {message} (path: {path:?})")]
    Dataset { message: String, path: PathBuf },

    /// Loss became NaN or infinite. Training stops rather than stepping on it.
    #[error("non-finite loss {value} at epoch {epoch}, batch {batch}")]
    NonFinite { epoch: usize, batch: usize, value: f32 },
}

impl ReprogramError {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        ReprogramError::Config(msg.into())
    }

    pub fn shape(expected: Vec<usize>, actual: Vec<usize>) -> Self {
        ReprogramError::Shape { expected, actual }
    }

    pub fn checkpoint<S: Into<String>>(msg: S, path: impl Into<PathBuf>) -> Self {
        ReprogramError::Checkpoint { message: msg.into(), path: path.into() }
    }

    pub fn dataset<S: Into<String>>(msg: S, path: impl Into<PathBuf>) -> Self {
        ReprogramError::Dataset { message: msg.into(), path: path.into() }
    }
}
