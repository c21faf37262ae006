use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that abort a run before (or instead of) starting the workers.
///
/// Transient conditions (empty polls, partial bursts) and malformed
/// frames are never reported through this type: they are counted.
#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("ill-formed file {path}: {reason}")]
    Format { path: PathBuf, reason: String },
    #[error("setup failed: {0}")]
    Setup(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    /// A queue failed while the workers were running
    #[error("worker failure: {0}")]
    Worker(String),
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
