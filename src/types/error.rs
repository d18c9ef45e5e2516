//! Error types for the edgehelm runtime.

use thiserror::Error;

use super::{RunId, StreamId, TaskId, TaskState};

/// Top-level runtime error type.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] MetricsError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Configuration-related errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Failed to read config file {path}: {message}")]
    Io { path: String, message: String },

    #[error("Failed to parse config file: {0}")]
    Parse(String),
}

/// Scheduler errors. Validation and precondition failures leave all
/// state unchanged.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Invalid resource profile: {reason}")]
    InvalidProfile { reason: String },

    #[error("Task not found: {task_id}")]
    TaskNotFound { task_id: TaskId },

    #[error("Run not found: {run_id}")]
    RunNotFound { run_id: RunId },

    #[error("Task {task_id} is already in terminal state {state}")]
    AlreadyTerminal { task_id: TaskId, state: TaskState },

    #[error("Task {task_id} already has an active run")]
    AlreadyRunning { task_id: TaskId },

    #[error("Invalid state transition for task {task_id}: {from} -> {to}")]
    InvalidStateTransition {
        task_id: TaskId,
        from: TaskState,
        to: TaskState,
    },

    #[error("Task launch failed for {task_id}: {reason}")]
    LaunchFailed { task_id: TaskId, reason: String },

    #[error("Scheduler is shutting down")]
    ShuttingDown,

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] MetricsError),
}

/// Policy validation and activation errors.
#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("Invalid policy '{name}': {reason}")]
    InvalidPolicy { name: String, reason: String },

    #[error("Unknown policy preset: {0}")]
    UnknownPreset(String),
}

/// Metrics gateway errors.
#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Stream not found: {stream_id}")]
    StreamNotFound { stream_id: StreamId },

    #[error("Invalid sample interval: {reason}")]
    InvalidInterval { reason: String },

    #[error("Snapshot collection failed: {0}")]
    CollectionFailed(String),
}

/// Storage errors. Transient conditions are retried with bounded backoff
/// before surfacing.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Result alias used across the runtime.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
