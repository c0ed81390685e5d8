//! Error types for labvm

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result type alias using labvm Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while preparing a lab launch.
///
/// Every variant is fatal to a launch sequence: callers report it and stop,
/// nothing is rolled back.
#[derive(Error, Debug)]
pub enum Error {
    /// A required declaration field or command argument is absent or empty
    #[error("missing parameter: {0}")]
    MissingParameter(String),

    /// Disk or master image does not exist
    #[error("image not found: {}", .0.display())]
    ImageNotFound(PathBuf),

    /// Tap, image or VM name is already claimed
    #[error("{resource} is already in use{}", holder_suffix(.holder))]
    ResourceInUse {
        resource: String,
        holder: Option<String>,
    },

    /// Memory allocation below the supported minimum
    #[error(
        "insufficient memory for {vm}: {requested} MiB requested, \
         at least {minimum} MiB required"
    )]
    InsufficientMemory {
        vm: String,
        requested: u32,
        minimum: u32,
    },

    /// A companion resource never became ready
    #[error("{} not ready after {attempts} attempts ({interval:?} interval)", .path.display())]
    ReadinessTimeout {
        path: PathBuf,
        attempts: u32,
        interval: Duration,
    },

    /// A required external tool is not installed
    #[error("required command `{0}` not found in PATH")]
    MissingDependency(String),

    /// Configuration and declaration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// External command failures
    #[error("Command error: {0}")]
    Command(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

fn holder_suffix(holder: &Option<String>) -> String {
    match holder {
        Some(h) => format!(" by {h}"),
        None => String::new(),
    }
}

impl Error {
    pub(crate) fn in_use(resource: impl Into<String>, holder: Option<String>) -> Self {
        Error::ResourceInUse {
            resource: resource.into(),
            holder,
        }
    }
}
