//! Error types for the solver orchestration layer.

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Solve error: {0}")]
    Solve(#[from] SolveError),
}

/// Worker-context errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Worker context for generation {generation} failed to start: {reason}")]
    Spawn { generation: u64, reason: String },

    #[error("Worker context for generation {generation} is closed")]
    Closed { generation: u64 },

    #[error(
        "Worker context for generation {generation} refused: {detached} terminated solver threads still running"
    )]
    Saturated { generation: u64, detached: usize },
}

/// Message protocol errors. Never fatal: callers log and drop the message.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Task lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task is already working on generation {generation}")]
    Busy { generation: u64 },

    #[error("No worker context available: {0}")]
    NoWorker(#[source] WorkerError),
}

/// Errors reported by a solver implementation.
#[derive(Debug, thiserror::Error)]
pub enum SolveError {
    #[error("Invalid solver input: {0}")]
    InvalidInput(String),

    #[error("No feasible assignment: {0}")]
    Infeasible(String),

    #[error("Solver failed: {0}")]
    Failed(String),
}

/// A solution index that does not resolve in the plan's lesson table.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Lesson index {index} on day {day}, period {period} is out of range (table has {len} lessons)")]
pub struct InvalidAssignment {
    pub day: usize,
    pub period: usize,
    pub index: usize,
    pub len: usize,
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
