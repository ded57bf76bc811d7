//! evalpool: a pool manager for persistent script evaluator subprocesses.
//!
//! Clients submit code snippets and receive structured results. Each
//! evaluator subprocess is long-lived and serves many evaluations, which
//! amortizes interpreter startup cost; a per-worker resident-memory ceiling
//! bounds the damage a rogue snippet can do.
//!
//! # Architecture
//!
//! - A worker stub ([`worker`]) owns each subprocess: framing, timeout
//!   enforcement, memory sampling, automatic respawn.
//! - The pool manager ([`pool`]) is the single coordinator: free/reserved
//!   pools, strict-FIFO waiting, rolling restarts, init snippet replay.
//! - [`client::PoolClient`] is the callable surface.
//! - The [`supervisor`] launches the fixed worker set; the manager discovers
//!   it lazily on first use.

pub mod client;
pub mod config;
pub mod error;
pub mod ipc;
pub mod pool;
pub mod supervisor;
pub mod types;
pub mod worker;

pub use client::PoolClient;
pub use config::PoolConfig;
pub use error::{Error, Result};
pub use pool::spawn_pool;
pub use types::{
    EvalOutcome, EvalStatus, ExitCause, MemLimit, RequireToken, ReservationToken, ScalarArg,
};
