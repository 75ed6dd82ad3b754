use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the graph, mount and bundle layers.
#[derive(Error, Debug)]
pub enum GraphError {
    /// Name, tag, digest or ID that does not resolve in the store
    #[error("No such image: {0}")]
    ReferenceNotFound(String),

    /// Listing filter that cannot be interpreted
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    /// Storage driver could not allocate or hand back the ephemeral layer
    #[error("Failed to allocate layer {id}: {message}")]
    AllocationFailed { id: String, message: String },

    /// Bind mount (or its option parsing) failed
    #[error("Failed to mount {}: {message}", destination.display())]
    MountFailed {
        destination: PathBuf,
        message: String,
    },

    #[error("Unsupported mount option '{0}'")]
    InvalidMountOption(String),

    #[error("Unsupported storage driver: {0}")]
    UnsupportedDriver(String),

    /// Unmount of a previously created mount failed
    #[error("Failed to unmount {}: {message}", target.display())]
    UnmountFailed { target: PathBuf, message: String },

    /// Directory walk while building a bundle failed
    #[error("Failed to archive {}: {source}", path.display())]
    WalkError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Parent pointers that loop or point nowhere
    #[error("Corrupt image graph: {0}")]
    CorruptGraph(String),

    /// Interrupted by the user before the operation finished
    #[error("Interrupted")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, GraphError>;
