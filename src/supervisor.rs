//! Supervisor: launches the fixed worker set and exposes child enumeration.
//!
//! The pool manager does not start workers; it discovers them here, lazily,
//! by enumerating supervised children and keeping the ones tagged as
//! evaluator workers.

use tracing::info;

use crate::types::WorkerId;
use crate::worker::{spawn_worker, WorkerConfig, WorkerHandle};

/// Tag identifying evaluator workers among supervised children.
pub const WORKER_TAG: &str = "evaluator";

/// Kind of supervised child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildKind {
    Worker,
    Other,
}

/// One supervised child, as reported by [`Supervisor::enumerate_children`].
#[derive(Debug, Clone)]
pub struct ChildInfo {
    pub id: String,
    /// Current OS pid, if the child's subprocess is running.
    pub pid: Option<u32>,
    pub kind: ChildKind,
    pub tags: Vec<String>,
    /// Present when the child is an evaluator worker.
    pub worker: Option<WorkerHandle>,
}

/// Enumeration interface the pool manager consumes, once, on first use.
pub trait Supervisor: Send + Sync {
    fn enumerate_children(&self) -> Vec<ChildInfo>;
}

/// Launches and owns the fixed set of evaluator workers.
pub struct WorkerSupervisor {
    workers: Vec<WorkerHandle>,
}

impl WorkerSupervisor {
    /// Spawn `count` worker stubs, each running its own evaluator subprocess.
    pub fn start(config: WorkerConfig, count: usize) -> Self {
        let workers: Vec<WorkerHandle> = (0..count)
            .map(|i| spawn_worker(WorkerId(i), config.clone()))
            .collect();
        info!(count, "worker supervisor started");
        Self { workers }
    }

    /// Stop every worker and kill its subprocess.
    pub async fn shutdown(&self) {
        for worker in &self.workers {
            worker.shutdown().await;
        }
    }
}

impl Supervisor for WorkerSupervisor {
    fn enumerate_children(&self) -> Vec<ChildInfo> {
        self.workers
            .iter()
            .map(|worker| ChildInfo {
                id: format!("worker-{}", worker.id()),
                pid: worker.pid(),
                kind: ChildKind::Worker,
                tags: vec![WORKER_TAG.to_string()],
                worker: Some(worker.clone()),
            })
            .collect()
    }
}
