//! Error types for the evaluator pool.

use crate::types::EvalOutcome;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to pool callers.
///
/// Per-evaluation failures (parse errors, evaluator exits, timeouts) are not
/// errors; they are carried in [`EvalOutcome`] and returned as values.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The token does not name a live reservation.
    #[error("invalid reservation")]
    InvalidReservation,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The pool manager is gone; all reservations are lost.
    #[error("pool manager is not running")]
    Shutdown,

    /// The worker stub's command loop is gone.
    #[error("worker not responding")]
    WorkerUnavailable,

    #[error("failed to spawn evaluator: {0}")]
    Spawn(String),

    #[error("memory probe failed: {0}")]
    MemoryProbe(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("evaluation did not return a value")]
    EvalFailed(EvalOutcome),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
