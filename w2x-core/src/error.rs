//! Error kinds surfaced by the conversion engine.

use std::{io, path::PathBuf};

use thiserror::Error;

/// Convenience alias used throughout the engine.
pub type Result<T, E = ConvertError> = std::result::Result<T, E>;

/// Placeholder path reported for I/O on in-memory readers and writers.
pub const STREAM_PATH: &str = "<stream>";

/// Every failure the engine can report. All of them are fatal to the current call only.
#[derive(Debug, Error)]
pub enum ConvertError {
    /// Malformed model data: bad shapes, missing fields, broken layer chaining.
    #[error("invalid model data: {0}")]
    Format(String),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The compute backend could not allocate, dispatch or read back.
    #[error("compute backend failure: {0:#}")]
    Backend(anyhow::Error),

    #[error("plane count mismatch: expected {expected}, got {actual}")]
    PlaneCountMismatch { expected: usize, actual: usize },

    /// The tile budget leaves no room inside the padding border.
    #[error("tile budget {width}x{height} is too small for a border of {border} pixels")]
    InvalidTileBudget {
        width: usize,
        height: usize,
        border: usize,
    },

    /// A plane with inconsistent or empty dimensions reached the engine.
    #[error("invalid plane: {0}")]
    InvalidPlane(String),
}

impl ConvertError {
    pub fn format(message: impl Into<String>) -> Self {
        Self::Format(message.into())
    }

    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn backend(error: impl Into<anyhow::Error>) -> Self {
        Self::Backend(error.into())
    }

    /// Re-tag stream I/O errors with the file they actually came from.
    pub(crate) fn at_path(self, path: impl Into<PathBuf>) -> Self {
        match self {
            Self::Io { source, .. } => Self::Io {
                path: path.into(),
                source,
            },
            other => other,
        }
    }
}

/// Map a read error to the matching kind: truncation is a format problem.
pub(crate) fn read_error(source: io::Error, what: &str) -> ConvertError {
    if source.kind() == io::ErrorKind::UnexpectedEof {
        ConvertError::Format(format!("unexpected end of data while reading {what}"))
    } else {
        ConvertError::io(STREAM_PATH, source)
    }
}
