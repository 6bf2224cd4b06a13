use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by the job engine: path resolution, persisted state and
/// the readiness protocol.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The relative path contains a reserved character (`%`, `#`), is
    /// absolute, or escapes its root.
    #[error("invalid path format: {path:?}")]
    InvalidPath { path: String },

    /// A filesystem operation on a content or state file failed.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A record or sidecar could not be encoded or decoded.
    #[error("malformed state file {}: {source}", path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The record's parameters do not match what the job type expects.
    #[error("invalid parameters for job '{id}': {source}")]
    InvalidParams {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    /// No record exists for the requested job id.
    #[error("job record not found: {id}")]
    RecordNotFound { id: String },

    /// The record has already been picked up by a worker and is
    /// informational only.
    #[error("job '{id}' is already {state} (pid {pid:?})")]
    AlreadyClaimed {
        id: String,
        state: String,
        pid: Option<u32>,
    },

    /// The record on disk belongs to a different job type than requested.
    #[error("job '{id}' is a {actual} job, not {expected}")]
    KindMismatch {
        id: String,
        expected: String,
        actual: String,
    },

    /// A producer tried to restart a content path that is already ready.
    #[error("content path is already ready: {path}")]
    AlreadyReady { path: String },

    /// A process tried to finalize a sidecar it does not own.
    #[error("content path {path} is owned by job '{owner}' (pid {pid})")]
    NotOwner {
        path: String,
        owner: String,
        pid: u32,
    },

    /// A readiness wait exceeded its configured timeout.
    #[error("timed out waiting for {path} to become ready")]
    WaitTimeout { path: String },

    /// A batch pattern failed to compile.
    #[error("invalid pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// A batch template names a group the video pattern does not have.
    #[error("template {template:?} refers to unknown group {group:?}; write ${{1}} when a name character follows the group number")]
    Template { template: String, group: String },
}

impl CoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CoreError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T, E = CoreError> = std::result::Result<T, E>;
