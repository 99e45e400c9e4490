//! Error types for relayflow

use thiserror::Error;

/// relayflow error types
#[derive(Error, Debug)]
pub enum FlowError {
    /// Flow configuration errors (registration after start, invalid graph)
    #[error("Flow configuration error: {0}")]
    Config(String),

    /// DAG errors
    #[error("Cycle detected in DAG: {0}")]
    CycleDetected(String),

    /// Data store lookup miss
    #[error("Data not found: '{0}'")]
    DataNotFound(String),

    /// JSON encode/decode errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Unknown node key
    #[error("Node '{0}' is not registered")]
    NodeNotFound(String),

    /// Output written through a context whose node already completed
    #[error("Node '{0}' already completed, its outputs are sealed")]
    NodeAlreadyCompleted(String),

    /// Persisted payload does not match the registered flow
    #[error("Persisted flow corrupted: {0}")]
    CorruptedPayload(String),

    /// Persisted payload written by an unknown codec version
    #[error("Unsupported payload version {0}")]
    UnsupportedVersion(u32),

    /// Shared flow state lock was poisoned
    #[error("Flow state lock poisoned")]
    LockPoisoned,

    /// A round task was lost before reporting back
    #[error("Round task failed to join: {0}")]
    TaskJoin(String),

    /// YAML parsing errors
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    /// YAML size exceeded limit
    #[error("Workflow YAML exceeds 1MB limit (size: {0} bytes)")]
    YamlSizeExceeded(usize),

    /// Node count exceeded limit
    #[error("Node count {count} exceeds limit of {limit}")]
    NodeCountExceeded { count: usize, limit: usize },

    /// Node name validation error
    #[error("Node name '{name}' exceeds {max} characters")]
    NodeNameTooLong { name: String, max: usize },

    /// Invalid node name format
    #[error("Invalid node name '{name}': only alphanumeric, underscore, and dash allowed")]
    InvalidNodeName { name: String },

    /// Missing node dependency
    #[error("Node '{node}' depends on non-existent node '{dependency}'")]
    MissingDependency { node: String, dependency: String },

    /// Workflow validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Command validation errors
    #[error("Command exceeds {limit} bytes")]
    CommandTooLong { limit: usize },

    /// Argument validation errors
    #[error("Argument count {count} exceeds limit of {limit}")]
    ArgCountExceeded { count: usize, limit: usize },

    #[error("Argument exceeds {limit} bytes")]
    ArgTooLong { limit: usize },

    /// Path validation errors
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Path traversal attempt
    #[error("Path traversal detected in: {0}")]
    PathTraversal(String),

    /// Flow name missing from the registry
    #[error("Flow '{0}' is not registered")]
    FlowNotRegistered(String),

    /// Job id missing from the job store
    #[error("Job '{0}' not found")]
    JobNotFound(String),

    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Command stopped because its round was cancelled
    #[error("Command '{0}' cancelled")]
    Cancelled(String),

    /// Generic error
    #[error("Error: {0}")]
    Other(String),
}

impl<T> From<std::sync::PoisonError<T>> for FlowError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        FlowError::LockPoisoned
    }
}

/// Result type alias using FlowError
pub type Result<T> = std::result::Result<T, FlowError>;
