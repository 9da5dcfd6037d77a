//! Shared error type for the execution core (spec.md §7).

use std::path::PathBuf;

/// Errors produced anywhere in the execution core.
///
/// `FrameRead` is the only variant a caller is expected to recover from
/// within a run: `ExecutionApp::func` catches it and converts it to the
/// `-1` slot sentinel. Every other variant aborts the current run.
#[derive(thiserror::Error, Debug)]
pub enum ExecutionError {
    #[error("configuration error: {0}")]
    UserConfig(String),

    #[error("frame read error at index {index}: {message}")]
    FrameRead { index: usize, message: String },

    #[error("shape inconsistency at node {node_id}: {message}")]
    ShapeInconsistency { node_id: usize, message: String },

    #[error("internal error: {0}")]
    Internal(String),

    #[error("storage error writing {path}: {message}")]
    Storage { path: PathBuf, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, ExecutionError>;

impl ExecutionError {
    pub fn user_config(msg: impl Into<String>) -> Self {
        ExecutionError::UserConfig(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        ExecutionError::Internal(msg.into())
    }

    pub fn storage(path: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        ExecutionError::Storage {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// True for the one error kind that is locally recoverable per task.
    pub fn is_frame_read(&self) -> bool {
        matches!(self, ExecutionError::FrameRead { .. })
    }
}
