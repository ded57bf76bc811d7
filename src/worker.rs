//! Worker stub: the in-process actor owning one evaluator subprocess.
//!
//! Each worker runs as a dedicated task driven by a command channel, so all
//! operations on a given subprocess are serialized. The stub is responsible
//! for framing, timeout enforcement, memory sampling and automatic respawn;
//! the pool manager never touches the subprocess directly.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::ipc::{EvalRequest, FrameReader, FrameWriter};
use crate::types::{EvalOutcome, EvalStatus, ExitCause, WorkerId};

/// Ceiling on how long one init snippet may take after a respawn.
const INIT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long to wait for a voluntarily-exiting evaluator before killing it.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// How a worker subprocess is launched and initialized.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Path to the evaluator binary.
    pub program: PathBuf,
    /// Extra arguments passed to the evaluator.
    pub args: Vec<String>,
    /// Init snippets replayed after every spawn, in order.
    pub init: Vec<String>,
}

/// Commands handled by the worker task, one at a time.
#[derive(Debug)]
enum WorkerCmd {
    Evaluate {
        code: String,
        timeout: Option<Duration>,
        max_mem_kib: Option<u64>,
        reply: oneshot::Sender<Result<EvalOutcome>>,
    },
    MeasureMemory {
        reply: oneshot::Sender<Result<u64>>,
    },
    Restart {
        init: Vec<String>,
        reply: oneshot::Sender<()>,
    },
    Shutdown,
}

/// Handle to a worker task. Cloning is cheap; all commands are serialized by
/// the task's command loop.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    id: WorkerId,
    cmd_tx: mpsc::Sender<WorkerCmd>,
    current_pid: Arc<AtomicU32>,
}

impl WorkerHandle {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// OS pid of the current subprocess, if one is running.
    pub fn pid(&self) -> Option<u32> {
        match self.current_pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Evaluate a snippet, bounded by `timeout` and `max_mem_kib`.
    ///
    /// Routine evaluation failures (parse error, evaluator exit, timeout)
    /// come back as `Ok(outcome)`; `Err` means the stub itself is unusable.
    pub async fn evaluate(
        &self,
        code: String,
        timeout: Option<Duration>,
        max_mem_kib: Option<u64>,
    ) -> Result<EvalOutcome> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(WorkerCmd::Evaluate {
                code,
                timeout,
                max_mem_kib,
                reply: tx,
            })
            .await
            .map_err(|_| Error::WorkerUnavailable)?;
        rx.await.map_err(|_| Error::WorkerUnavailable)?
    }

    /// Resident set size of the subprocess in KiB, respawning it first if it
    /// is not alive.
    pub async fn measure_memory(&self) -> Result<u64> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(WorkerCmd::MeasureMemory { reply: tx })
            .await
            .map_err(|_| Error::WorkerUnavailable)?;
        rx.await.map_err(|_| Error::WorkerUnavailable)?
    }

    /// Force the subprocess to exit, respawn it and replay `init` in order.
    pub async fn restart(&self, init: Vec<String>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(WorkerCmd::Restart { init, reply: tx })
            .await
            .map_err(|_| Error::WorkerUnavailable)?;
        rx.await.map_err(|_| Error::WorkerUnavailable)
    }

    /// Kill the subprocess and stop the worker task.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(WorkerCmd::Shutdown).await;
    }
}

/// Spawn a worker task and return its handle. The first subprocess spawn
/// happens eagerly; a failure there is retried on first use.
pub fn spawn_worker(id: WorkerId, config: WorkerConfig) -> WorkerHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let current_pid = Arc::new(AtomicU32::new(0));

    let task = WorkerTask {
        id,
        config,
        session: None,
        incarnation: 0,
        current_pid: current_pid.clone(),
    };
    tokio::spawn(task.run(cmd_rx));

    WorkerHandle {
        id,
        cmd_tx,
        current_pid,
    }
}

/// A live subprocess with its framed streams.
struct Session {
    child: Child,
    pid: u32,
    writer: FrameWriter<ChildStdin>,
    reader: FrameReader<ChildStdout>,
}

/// What one request/reply exchange with the subprocess produced.
enum Exchange {
    Reply(EvalOutcome),
    Dead(Option<i32>),
    TimedOut,
}

/// Write a request and read the matching reply, bounded by `timeout`.
///
/// On any stream failure the subprocess is presumed dead; its exit status is
/// collected so the caller can report it.
async fn exchange(session: &mut Session, req: &EvalRequest, timeout: Option<Duration>) -> Exchange {
    if session.writer.send(req).await.is_err() {
        return Exchange::Dead(reap(&mut session.child).await);
    }

    let read = session.reader.recv::<EvalOutcome>();
    let reply = match timeout {
        Some(limit) => match tokio::time::timeout(limit, read).await {
            Ok(reply) => reply,
            Err(_) => return Exchange::TimedOut,
        },
        None => read.await,
    };

    match reply {
        Ok(Some(outcome)) => Exchange::Reply(outcome),
        Ok(None) => Exchange::Dead(reap(&mut session.child).await),
        Err(e) => {
            warn!("unreadable evaluator reply: {e}");
            let _ = session.child.start_kill();
            Exchange::Dead(reap(&mut session.child).await)
        }
    }
}

/// Collect the exit code of a dead (or dying) subprocess.
async fn reap(child: &mut Child) -> Option<i32> {
    match tokio::time::timeout(REAP_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) => status.code(),
        Ok(Err(_)) => None,
        Err(_) => {
            let _ = child.start_kill();
            child.wait().await.ok().and_then(|s| s.code())
        }
    }
}

struct WorkerTask {
    id: WorkerId,
    config: WorkerConfig,
    session: Option<Session>,
    incarnation: u64,
    current_pid: Arc<AtomicU32>,
}

impl WorkerTask {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<WorkerCmd>) {
        if let Err(e) = self.ensure_alive().await {
            warn!(worker = %self.id, "initial evaluator spawn failed: {e}");
        }

        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                WorkerCmd::Evaluate {
                    code,
                    timeout,
                    max_mem_kib,
                    reply,
                } => {
                    let outcome = self.evaluate(code, timeout, max_mem_kib).await;
                    let _ = reply.send(outcome);
                }
                WorkerCmd::MeasureMemory { reply } => {
                    let result = self.measure_memory().await;
                    let _ = reply.send(result);
                }
                WorkerCmd::Restart { init, reply } => {
                    self.config.init = init;
                    self.recycle("restart requested").await;
                    let _ = reply.send(());
                }
                WorkerCmd::Shutdown => break,
            }
        }

        debug!(worker = %self.id, "worker stub stopping");
        self.kill_child().await;
    }

    /// Spawn the subprocess if there is no live session, then replay the
    /// cached init snippets.
    async fn ensure_alive(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }

        let mut child = Command::new(&self.config.program)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Spawn(format!("{}: {e}", self.config.program.display())))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Spawn("evaluator stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Spawn("evaluator stdout not captured".to_string()))?;

        let pid = child.id().unwrap_or(0);
        self.incarnation += 1;
        self.current_pid.store(pid, Ordering::SeqCst);
        info!(
            worker = %self.id,
            pid,
            incarnation = self.incarnation,
            "evaluator spawned"
        );

        self.session = Some(Session {
            child,
            pid,
            writer: FrameWriter::new(stdin),
            reader: FrameReader::new(stdout),
        });

        self.replay_init().await;
        Ok(())
    }

    /// Replay every init snippet, in order, on the fresh subprocess.
    ///
    /// A snippet that fails is logged and skipped; a snippet that kills the
    /// subprocess aborts the replay and leaves the worker dead until next use.
    async fn replay_init(&mut self) {
        if self.config.init.is_empty() {
            return;
        }
        let init = self.config.init.clone();
        let mut died = false;

        if let Some(session) = self.session.as_mut() {
            for (idx, code) in init.iter().enumerate() {
                let req = EvalRequest {
                    code: code.clone(),
                    timeout_ms: Some(INIT_TIMEOUT.as_millis() as u64),
                    max_mem_kib: None,
                };
                match exchange(session, &req, Some(INIT_TIMEOUT)).await {
                    Exchange::Reply(EvalOutcome::Ok { .. }) => {}
                    Exchange::Reply(other) => {
                        error!(worker = %self.id, snippet = idx, ?other, "init snippet did not evaluate cleanly");
                    }
                    Exchange::TimedOut => {
                        error!(worker = %self.id, snippet = idx, "init snippet timed out");
                        let _ = session.child.start_kill();
                        died = true;
                        break;
                    }
                    Exchange::Dead(code) => {
                        error!(worker = %self.id, snippet = idx, ?code, "evaluator died during init");
                        died = true;
                        break;
                    }
                }
            }
        }

        if died {
            self.clear_session();
        }
    }

    async fn evaluate(
        &mut self,
        code: String,
        timeout: Option<Duration>,
        max_mem_kib: Option<u64>,
    ) -> Result<EvalOutcome> {
        self.ensure_alive().await?;
        let Some(session) = self.session.as_mut() else {
            return Err(Error::Spawn("evaluator did not survive init".to_string()));
        };

        let req = EvalRequest {
            code,
            timeout_ms: timeout.map(|t| t.as_millis() as u64),
            max_mem_kib,
        };

        match exchange(session, &req, timeout).await {
            Exchange::Reply(outcome) => {
                if let EvalOutcome::Exit { .. } = outcome {
                    // The evaluator announced its own exit. Reap now; respawn
                    // happens lazily on next use.
                    debug!(worker = %self.id, "evaluator exited voluntarily");
                    self.reap_and_clear().await;
                    return Ok(outcome);
                }
                Ok(self.enforce_memory_ceiling(outcome, max_mem_kib).await)
            }
            Exchange::TimedOut => {
                warn!(worker = %self.id, "evaluation timed out, recycling evaluator");
                self.recycle("evaluation timeout").await;
                Ok(EvalOutcome::Exit {
                    cause: ExitCause::Timeout,
                })
            }
            Exchange::Dead(code) => {
                info!(worker = %self.id, ?code, "evaluator died during evaluation, respawning");
                self.clear_session();
                if let Err(e) = self.ensure_alive().await {
                    warn!(worker = %self.id, "respawn failed: {e}");
                }
                Ok(EvalOutcome::Exit {
                    cause: ExitCause::Code(code.unwrap_or(-1)),
                })
            }
        }
    }

    /// Sample resident memory after a reply; recycle the subprocess and
    /// downgrade the outcome to `break` when it exceeds the ceiling.
    async fn enforce_memory_ceiling(
        &mut self,
        mut outcome: EvalOutcome,
        max_mem_kib: Option<u64>,
    ) -> EvalOutcome {
        let Some(limit) = max_mem_kib else {
            return outcome;
        };
        match self.sample_rss().await {
            Ok(rss) if rss > limit => {
                warn!(
                    worker = %self.id,
                    rss_kib = rss,
                    limit_kib = limit,
                    "resident memory over ceiling, recycling evaluator"
                );
                self.recycle("memory ceiling exceeded").await;
                outcome.set_status(EvalStatus::Break);
            }
            Ok(_) => {}
            Err(e) => warn!(worker = %self.id, "memory probe failed: {e}"),
        }
        outcome
    }

    async fn measure_memory(&mut self) -> Result<u64> {
        self.ensure_alive().await?;
        self.sample_rss().await
    }

    /// `ps -o rss=` against the subprocess pid; the canonical measurement.
    async fn sample_rss(&self) -> Result<u64> {
        let Some(session) = self.session.as_ref() else {
            return Err(Error::MemoryProbe("no live evaluator".to_string()));
        };
        let output = Command::new("ps")
            .args(["-o", "rss=", "-p"])
            .arg(session.pid.to_string())
            .output()
            .await?;
        if !output.status.success() {
            return Err(Error::MemoryProbe(format!(
                "ps exited with {}",
                output.status
            )));
        }
        let text = String::from_utf8_lossy(&output.stdout);
        text.trim()
            .parse::<u64>()
            .map_err(|e| Error::MemoryProbe(format!("unparsable rss {:?}: {e}", text.trim())))
    }

    /// Kill the current subprocess and bring up a fresh, initialized one.
    async fn recycle(&mut self, reason: &str) {
        debug!(worker = %self.id, reason, "recycling evaluator subprocess");
        self.kill_child().await;
        if let Err(e) = self.ensure_alive().await {
            error!(worker = %self.id, "respawn after recycle failed: {e}");
        }
    }

    async fn kill_child(&mut self) {
        if let Some(mut session) = self.session.take() {
            let _ = session.child.start_kill();
            let _ = session.child.wait().await;
            self.current_pid.store(0, Ordering::SeqCst);
        }
    }

    /// Wait for a voluntarily-exiting subprocess, then forget it.
    async fn reap_and_clear(&mut self) {
        if let Some(mut session) = self.session.take() {
            reap(&mut session.child).await;
            self.current_pid.store(0, Ordering::SeqCst);
        }
    }

    fn clear_session(&mut self) {
        self.session = None;
        self.current_pid.store(0, Ordering::SeqCst);
    }
}
