use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a worker slot. Stable across subprocess recycling; the OS pid
/// behind it changes every time the stub respawns its evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque lease on a worker. Comparable, not dereferenceable by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReservationToken(Uuid);

impl ReservationToken {
    pub(crate) fn mint() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ReservationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle to an initialization snippet registered with `require_code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequireToken(Uuid);

impl RequireToken {
    pub(crate) fn mint() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for RequireToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Resident-memory ceiling for a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemLimit {
    /// Use the pool's configured default.
    #[default]
    Default,
    /// No ceiling.
    Unbounded,
    /// Explicit ceiling in KiB.
    KiB(u64),
}

/// Whether the evaluator state survived the call. `Break` means callers must
/// not assume variable persistence: the subprocess (or its state) did not
/// survive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvalStatus {
    Continue,
    Break,
}

/// Why a worker subprocess went away during an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitCause {
    /// The evaluator exited, voluntarily or by crash.
    Code(i32),
    /// The client timeout fired; the subprocess was killed.
    Timeout,
}

/// Result of one evaluation.
///
/// Also the wire shape of an evaluator reply (the evaluator never produces
/// `Exit { cause: Timeout }`; that variant is synthesized by the worker stub).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "camelCase")]
pub enum EvalOutcome {
    /// The snippet evaluated.
    #[serde(rename_all = "camelCase")]
    Ok {
        /// Captured standard output, opaque bytes.
        output: Vec<u8>,
        /// The evaluator's return value.
        return_value: serde_json::Value,
        /// Last error text recorded by the evaluator.
        last_error: String,
        status: EvalStatus,
    },
    /// The evaluator rejected the snippet's syntax.
    #[serde(rename_all = "camelCase")]
    ParseError { message: String, status: EvalStatus },
    /// The subprocess is gone; it will be respawned on next use.
    Exit { cause: ExitCause },
}

impl EvalOutcome {
    /// Continue/break status, if this outcome carries one.
    pub fn status(&self) -> Option<EvalStatus> {
        match self {
            EvalOutcome::Ok { status, .. } | EvalOutcome::ParseError { status, .. } => {
                Some(*status)
            }
            EvalOutcome::Exit { .. } => None,
        }
    }

    /// Override the status, e.g. after the worker was recycled for a memory
    /// overrun. No effect on `Exit` outcomes.
    pub(crate) fn set_status(&mut self, new: EvalStatus) {
        match self {
            EvalOutcome::Ok { status, .. } | EvalOutcome::ParseError { status, .. } => {
                *status = new;
            }
            EvalOutcome::Exit { .. } => {}
        }
    }
}

/// Scalar argument for the `call`/`call_return` snippet builders.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarArg {
    Str(String),
    Int(i64),
    Float(f64),
}

impl From<&str> for ScalarArg {
    fn from(value: &str) -> Self {
        ScalarArg::Str(value.to_string())
    }
}

impl From<String> for ScalarArg {
    fn from(value: String) -> Self {
        ScalarArg::Str(value)
    }
}

impl From<i64> for ScalarArg {
    fn from(value: i64) -> Self {
        ScalarArg::Int(value)
    }
}

impl From<f64> for ScalarArg {
    fn from(value: f64) -> Self {
        ScalarArg::Float(value)
    }
}
