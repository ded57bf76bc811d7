//! Pool manager: the single coordinator owning the scheduler state.
//!
//! The manager is a serializer task reading commands off a channel; at most
//! one handler runs at a time, so all mutation of the `free`/`reserved`/
//! `waiting` pools is sequential. Blocking work (evaluations, memory probes,
//! the flushing pokes of a rolling restart) never runs on the manager task:
//! it is handed to detached tasks that reply to the caller directly.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::client::PoolClient;
use crate::error::{Error, Result};
use crate::supervisor::{ChildKind, Supervisor, WORKER_TAG};
use crate::types::{EvalOutcome, MemLimit, RequireToken, ReservationToken, WorkerId};
use crate::worker::WorkerHandle;

/// A granted lease: token plus everything a detached task needs to use it.
#[derive(Debug)]
pub(crate) struct Lease {
    token: ReservationToken,
    worker: WorkerHandle,
    max_mem_kib: Option<u64>,
}

/// Reply shape of a waiting reservation request.
pub(crate) enum WaiterReply {
    /// External `reserve`: the caller wants the bare token.
    Token(oneshot::Sender<ReservationToken>),
    /// Internal transient eval: the detached task needs the full lease.
    Lease(oneshot::Sender<Lease>),
}

struct Waiter {
    max_mem_kib: Option<u64>,
    reply: WaiterReply,
}

struct Reservation {
    worker: WorkerId,
    max_mem_kib: Option<u64>,
}

struct RestartOp {
    /// Workers still to cycle through a restart.
    pending: HashSet<WorkerId>,
    /// Everyone to acknowledge, exactly once, when `pending` empties.
    reply_to: Vec<oneshot::Sender<()>>,
}

struct RequireEntry {
    token: RequireToken,
    code: String,
}

/// Commands serialized onto the manager task.
pub(crate) enum PoolCmd {
    Eval {
        code: String,
        token: Option<ReservationToken>,
        timeout: Option<Duration>,
        reply: oneshot::Sender<Result<EvalOutcome>>,
    },
    Reserve {
        limit: MemLimit,
        reply: oneshot::Sender<ReservationToken>,
    },
    Release {
        token: ReservationToken,
        /// `None` for internal releases (transient evals, flushing pokes).
        reply: Option<oneshot::Sender<Result<()>>>,
    },
    GetMemory {
        token: ReservationToken,
        reply: oneshot::Sender<Result<u64>>,
    },
    RestartAll {
        /// `None` when the restart was triggered internally.
        reply: Option<oneshot::Sender<()>>,
    },
    RequireCode {
        code: String,
        reply: oneshot::Sender<RequireToken>,
    },
    UnrequireCode {
        token: RequireToken,
        reply: oneshot::Sender<()>,
    },
    Shutdown,
}

/// Start the pool manager task. Workers are discovered from `supervisor`
/// lazily, on first use.
pub fn spawn_pool(supervisor: Arc<dyn Supervisor>, default_max_mem_kib: Option<u64>) -> PoolClient {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let manager = PoolManager {
        supervisor,
        default_max_mem_kib,
        cmd_tx: cmd_tx.clone(),
        workers: HashMap::new(),
        free: VecDeque::new(),
        reserved: HashMap::new(),
        waiting: VecDeque::new(),
        restart: None,
        requires: Vec::new(),
        discovered: false,
    };
    tokio::spawn(manager.run(cmd_rx));
    PoolClient::new(cmd_tx)
}

struct PoolManager {
    supervisor: Arc<dyn Supervisor>,
    default_max_mem_kib: Option<u64>,
    /// Own sender, for flushing pokes and transient-eval releases.
    cmd_tx: mpsc::UnboundedSender<PoolCmd>,
    workers: HashMap<WorkerId, WorkerHandle>,
    free: VecDeque<WorkerId>,
    reserved: HashMap<ReservationToken, Reservation>,
    waiting: VecDeque<Waiter>,
    restart: Option<RestartOp>,
    requires: Vec<RequireEntry>,
    discovered: bool,
}

impl PoolManager {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<PoolCmd>) {
        debug!("pool manager started");
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                PoolCmd::Eval {
                    code,
                    token,
                    timeout,
                    reply,
                } => self.handle_eval(code, token, timeout, reply),
                PoolCmd::Reserve { limit, reply } => {
                    let max_mem_kib = self.resolve_limit(limit);
                    self.handle_reserve(max_mem_kib, WaiterReply::Token(reply));
                }
                PoolCmd::Release { token, reply } => self.handle_release(token, reply).await,
                PoolCmd::GetMemory { token, reply } => self.handle_get_memory(token, reply),
                PoolCmd::RestartAll { reply } => self.handle_restart_all(reply),
                PoolCmd::RequireCode { code, reply } => {
                    let token = RequireToken::mint();
                    debug!(%token, "init snippet registered");
                    self.requires.push(RequireEntry { token, code });
                    let _ = reply.send(token);
                }
                PoolCmd::UnrequireCode { token, reply } => {
                    self.handle_unrequire(token, reply);
                }
                PoolCmd::Shutdown => break,
            }
        }
        info!("pool manager stopped");
    }

    fn resolve_limit(&self, limit: MemLimit) -> Option<u64> {
        match limit {
            MemLimit::Default => self.default_max_mem_kib,
            MemLimit::Unbounded => None,
            MemLimit::KiB(kib) => Some(kib),
        }
    }

    /// Enumerate supervised children and keep the evaluator workers.
    /// Runs exactly once, on first use.
    fn discover_workers(&mut self) {
        self.discovered = true;
        for child in self.supervisor.enumerate_children() {
            if child.kind != ChildKind::Worker
                || !child.tags.iter().any(|tag| tag == WORKER_TAG)
            {
                continue;
            }
            let Some(handle) = child.worker else {
                continue;
            };
            debug!(id = %child.id, pid = ?child.pid, "discovered evaluator worker");
            self.free.push_back(handle.id());
            self.workers.insert(handle.id(), handle);
        }
        info!(count = self.workers.len(), "worker pool discovered");
    }

    // ── Reservation ─────────────────────────────────────────────────────────

    fn handle_reserve(&mut self, max_mem_kib: Option<u64>, reply: WaiterReply) {
        // Tie-break: anyone already waiting goes first, even if a worker is
        // free. Jumping the queue would break FIFO service order.
        if !self.waiting.is_empty() {
            self.waiting.push_back(Waiter { max_mem_kib, reply });
            return;
        }
        if !self.discovered {
            self.discover_workers();
        }
        match self.free.pop_front() {
            Some(worker) => self.grant(worker, max_mem_kib, reply),
            None => self.waiting.push_back(Waiter { max_mem_kib, reply }),
        }
    }

    /// Mint a reservation for `worker` and deliver it.
    fn grant(&mut self, worker: WorkerId, max_mem_kib: Option<u64>, reply: WaiterReply) {
        let token = ReservationToken::mint();
        self.reserved.insert(
            token,
            Reservation {
                worker,
                max_mem_kib,
            },
        );
        let Some(handle) = self.workers.get(&worker).cloned() else {
            panic!("granting reservation on unknown worker {worker}");
        };

        let delivered = match reply {
            WaiterReply::Token(tx) => tx.send(token).is_ok(),
            WaiterReply::Lease(tx) => tx
                .send(Lease {
                    token,
                    worker: handle,
                    max_mem_kib,
                })
                .is_ok(),
        };
        if !delivered {
            // The requester went away before the grant arrived; reclaim the
            // worker through the normal release path.
            warn!(%token, "reservation grant not delivered, releasing");
            let _ = self.cmd_tx.send(PoolCmd::Release { token, reply: None });
        }
    }

    async fn handle_release(
        &mut self,
        token: ReservationToken,
        reply: Option<oneshot::Sender<Result<()>>>,
    ) {
        let Some(reservation) = self.reserved.remove(&token) else {
            debug!(%token, "release of unknown reservation");
            if let Some(tx) = reply {
                let _ = tx.send(Err(Error::InvalidReservation));
            }
            return;
        };
        let worker = reservation.worker;

        // Restart fence: a worker flagged for restart must be recycled before
        // it returns to the free pool or reaches a waiter.
        let flagged = self
            .restart
            .as_mut()
            .is_some_and(|op| op.pending.remove(&worker));
        if flagged {
            let requires: Vec<String> = self.requires.iter().map(|r| r.code.clone()).collect();
            let Some(handle) = self.workers.get(&worker).cloned() else {
                panic!("restarting unknown worker {worker}");
            };
            debug!(%worker, "restart fence: recycling before reuse");
            if let Err(e) = handle.restart(requires).await {
                warn!(%worker, "worker restart failed: {e}");
            }
            if self.restart.as_ref().is_some_and(|op| op.pending.is_empty()) {
                if let Some(op) = self.restart.take() {
                    info!("rolling restart complete");
                    for tx in op.reply_to {
                        let _ = tx.send(());
                    }
                }
            }
        }

        // Hand off: tail-push then head-pop keeps the released worker last in
        // line unless it was the only one available.
        self.free.push_back(worker);
        if let Some(waiter) = self.waiting.pop_front() {
            let Some(next) = self.free.pop_front() else {
                panic!("free pool empty immediately after push");
            };
            self.grant(next, waiter.max_mem_kib, waiter.reply);
        }

        if let Some(tx) = reply {
            let _ = tx.send(Ok(()));
        }
    }

    // ── Evaluation dispatch ─────────────────────────────────────────────────

    fn handle_eval(
        &mut self,
        code: String,
        token: Option<ReservationToken>,
        timeout: Option<Duration>,
        reply: oneshot::Sender<Result<EvalOutcome>>,
    ) {
        match token {
            Some(token) => {
                let Some(reservation) = self.reserved.get(&token) else {
                    let _ = reply.send(Err(Error::InvalidReservation));
                    return;
                };
                let Some(worker) = self.workers.get(&reservation.worker).cloned() else {
                    panic!(
                        "reservation {token} names unknown worker {}",
                        reservation.worker
                    );
                };
                let max_mem_kib = reservation.max_mem_kib;
                // The reservation pins the worker; the manager records nothing
                // about the detached task.
                tokio::spawn(async move {
                    let result = worker.evaluate(code, timeout, max_mem_kib).await;
                    let _ = reply.send(result);
                });
            }
            None => {
                // Transient acquisition through the same path as a client:
                // reserve, evaluate, release.
                let (lease_tx, lease_rx) = oneshot::channel();
                let max_mem_kib = self.default_max_mem_kib;
                self.handle_reserve(max_mem_kib, WaiterReply::Lease(lease_tx));
                let manager = self.cmd_tx.clone();
                tokio::spawn(async move {
                    let Ok(lease) = lease_rx.await else {
                        let _ = reply.send(Err(Error::Shutdown));
                        return;
                    };
                    let result = lease
                        .worker
                        .evaluate(code, timeout, lease.max_mem_kib)
                        .await;
                    let _ = reply.send(result);
                    let _ = manager.send(PoolCmd::Release {
                        token: lease.token,
                        reply: None,
                    });
                });
            }
        }
    }

    fn handle_get_memory(
        &mut self,
        token: ReservationToken,
        reply: oneshot::Sender<Result<u64>>,
    ) {
        let Some(reservation) = self.reserved.get(&token) else {
            let _ = reply.send(Err(Error::InvalidReservation));
            return;
        };
        let Some(worker) = self.workers.get(&reservation.worker).cloned() else {
            panic!(
                "reservation {token} names unknown worker {}",
                reservation.worker
            );
        };
        tokio::spawn(async move {
            let _ = reply.send(worker.measure_memory().await);
        });
    }

    // ── Rolling restart ─────────────────────────────────────────────────────

    fn handle_restart_all(&mut self, reply: Option<oneshot::Sender<()>>) {
        // At most one restart operation; late callers join its reply list and
        // observe the in-flight completion.
        if let Some(op) = self.restart.as_mut() {
            if let Some(tx) = reply {
                op.reply_to.push(tx);
            }
            return;
        }

        if !self.discovered {
            self.discover_workers();
        }

        let pending: HashSet<WorkerId> = self.workers.keys().copied().collect();
        if pending.is_empty() {
            if let Some(tx) = reply {
                let _ = tx.send(());
            }
            return;
        }

        let count = pending.len();
        info!(count, "rolling restart started");
        self.restart = Some(RestartOp {
            pending,
            reply_to: reply.into_iter().collect(),
        });

        // Flushing pokes: one trivial eval per live worker, enqueued as
        // independent callers. Idle workers pick one up and release; reserved
        // workers restart when their real owner releases.
        for _ in 0..count {
            let (tx, _rx) = oneshot::channel();
            let _ = self.cmd_tx.send(PoolCmd::Eval {
                code: String::new(),
                token: None,
                timeout: None,
                reply: tx,
            });
        }
    }

    fn handle_unrequire(&mut self, token: RequireToken, reply: oneshot::Sender<()>) {
        let before = self.requires.len();
        self.requires.retain(|entry| entry.token != token);
        let removed = self.requires.len() != before;

        // Acknowledge the caller first; the rolling restart this triggers
        // reports to no one, so the caller is notified exactly once.
        let _ = reply.send(());

        if removed {
            debug!(%token, "init snippet removed, starting rolling restart");
            self.handle_restart_all(None);
        } else {
            debug!(%token, "unrequire of unknown token");
        }
    }
}
