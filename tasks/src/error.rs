//! Task error types

use crate::entry::TaskId;
use polaris_common::DeviceError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Task {0} not found")]
    NotFound(TaskId),

    #[error("Task {0} is still executing")]
    StillExecuting(TaskId),

    #[error("Queue is {state}, cannot {operation}")]
    BadQueueState { state: String, operation: String },

    #[error("Task store error: {0}")]
    Store(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("Timeout waiting for {0}")]
    Timeout(String),

    #[error("Task cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Cannot run task: {0}")]
    Unsupported(String),

    #[error("Cannot start executor thread: {0}")]
    Spawn(String),
}

pub type TaskResult<T> = Result<T, TaskError>;
