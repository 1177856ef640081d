//! Error types for the hotplug governor.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for governor operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the platform backends, the tunable surface and the
/// configuration loader. The decision loop itself never fails.
#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid value for {attribute}: {reason}")]
    InvalidTunable {
        attribute: &'static str,
        reason: String,
    },

    #[error("{0} is read-only")]
    ReadOnly(&'static str),

    #[error("unknown attribute: {0}")]
    UnknownAttribute(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
