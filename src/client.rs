//! Client façade: the callable surface of the pool.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};
use crate::pool::PoolCmd;
use crate::types::{EvalOutcome, MemLimit, RequireToken, ReservationToken, ScalarArg};

/// Stateless entry points to the pool. Cloning is cheap; every call is
/// serialized onto the pool manager.
#[derive(Clone)]
pub struct PoolClient {
    cmd_tx: mpsc::UnboundedSender<PoolCmd>,
}

impl PoolClient {
    pub(crate) fn new(cmd_tx: mpsc::UnboundedSender<PoolCmd>) -> Self {
        Self { cmd_tx }
    }

    /// Helper to send a command and wait for its reply.
    async fn send<T, F>(&self, make_cmd: F) -> Result<T>
    where
        F: FnOnce(oneshot::Sender<T>) -> PoolCmd,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(make_cmd(reply_tx))
            .map_err(|_| Error::Shutdown)?;
        reply_rx.await.map_err(|_| Error::Shutdown)
    }

    /// Evaluate a snippet on any free worker, waiting FIFO if none is free.
    pub async fn eval(&self, code: impl Into<String>) -> Result<EvalOutcome> {
        self.eval_with(code, None, None).await
    }

    /// Evaluate with an explicit reservation and/or timeout.
    ///
    /// Without a token the manager transiently acquires a worker through the
    /// same reservation path as any client. A `timeout` of `None` means
    /// unbounded.
    pub async fn eval_with(
        &self,
        code: impl Into<String>,
        token: Option<ReservationToken>,
        timeout: Option<Duration>,
    ) -> Result<EvalOutcome> {
        if timeout == Some(Duration::ZERO) {
            return Err(Error::InvalidArgument("timeout must be positive".to_string()));
        }
        let code = code.into();
        self.send(|reply| PoolCmd::Eval {
            code,
            token,
            timeout,
            reply,
        })
        .await?
    }

    /// Reserve a worker with the pool's default memory ceiling. Blocks, in
    /// strict FIFO order, until a worker is available.
    pub async fn reserve(&self) -> Result<ReservationToken> {
        self.reserve_with(MemLimit::Default).await
    }

    /// Reserve a worker with an explicit memory ceiling.
    pub async fn reserve_with(&self, limit: MemLimit) -> Result<ReservationToken> {
        if limit == MemLimit::KiB(0) {
            return Err(Error::InvalidArgument(
                "memory ceiling must be positive".to_string(),
            ));
        }
        self.send(|reply| PoolCmd::Reserve { limit, reply }).await
    }

    /// Return a reserved worker to the pool. The token is dead afterwards.
    pub async fn release(&self, token: ReservationToken) -> Result<()> {
        self.send(|reply| PoolCmd::Release {
            token,
            reply: Some(reply),
        })
        .await?
    }

    /// Resident set size of the reserved worker, in KiB.
    pub async fn get_memory(&self, token: ReservationToken) -> Result<u64> {
        self.send(|reply| PoolCmd::GetMemory { token, reply })
            .await?
    }

    /// Recycle every worker at its next release boundary. Returns once all
    /// workers live at the time of the call have been restarted.
    pub async fn restart_all(&self) -> Result<()> {
        self.send(|reply| PoolCmd::RestartAll { reply: Some(reply) })
            .await
    }

    /// Register an init snippet replayed on every worker respawn. Follow
    /// with [`restart_all`](Self::restart_all) to apply it to live workers.
    pub async fn require_code(&self, code: impl Into<String>) -> Result<RequireToken> {
        let code = code.into();
        self.send(|reply| PoolCmd::RequireCode { code, reply }).await
    }

    /// Remove a registered init snippet. Triggers a rolling restart; this
    /// call does not wait for it to finish.
    pub async fn unrequire_code(&self, token: RequireToken) -> Result<()> {
        self.send(|reply| PoolCmd::UnrequireCode { token, reply })
            .await
    }

    /// Stop the pool manager. Outstanding waiters observe [`Error::Shutdown`].
    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(PoolCmd::Shutdown);
    }

    /// Evaluate `function(args...)`, quoting scalar arguments.
    pub async fn call(&self, function: &str, args: &[ScalarArg]) -> Result<EvalOutcome> {
        self.eval(build_call(function, args, false)).await
    }

    /// Like [`call`](Self::call), but yields the evaluator's return value.
    pub async fn call_return(
        &self,
        function: &str,
        args: &[ScalarArg],
    ) -> Result<serde_json::Value> {
        match self.eval(build_call(function, args, true)).await? {
            EvalOutcome::Ok { return_value, .. } => Ok(return_value),
            other => Err(Error::EvalFailed(other)),
        }
    }
}

/// Build a `function(args...)` snippet, optionally returning its value.
fn build_call(function: &str, args: &[ScalarArg], want_return: bool) -> String {
    let rendered: Vec<String> = args.iter().map(quote_scalar).collect();
    let call = format!("{}({})", function, rendered.join(", "));
    if want_return {
        format!("return {call};")
    } else {
        format!("{call};")
    }
}

/// Render a scalar as a snippet literal. Strings become single-quoted
/// literals with `'` and `\` backslash-escaped; numbers render naturally.
fn quote_scalar(arg: &ScalarArg) -> String {
    match arg {
        ScalarArg::Str(s) => {
            let mut quoted = String::with_capacity(s.len() + 2);
            quoted.push('\'');
            for ch in s.chars() {
                if ch == '\'' || ch == '\\' {
                    quoted.push('\\');
                }
                quoted.push(ch);
            }
            quoted.push('\'');
            quoted
        }
        ScalarArg::Int(n) => n.to_string(),
        ScalarArg::Float(f) => f.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_plain_string() {
        assert_eq!(quote_scalar(&ScalarArg::from("hello")), "'hello'");
    }

    #[test]
    fn escapes_quotes_and_backslashes() {
        assert_eq!(
            quote_scalar(&ScalarArg::from(r"it's a \ test")),
            r"'it\'s a \\ test'"
        );
    }

    #[test]
    fn renders_numbers_naturally() {
        assert_eq!(quote_scalar(&ScalarArg::Int(-7)), "-7");
        assert_eq!(quote_scalar(&ScalarArg::Float(2.5)), "2.5");
    }

    #[test]
    fn builds_call_snippets() {
        let args = [ScalarArg::from("a'b"), ScalarArg::Int(3)];
        assert_eq!(build_call("doThing", &args, false), r"doThing('a\'b', 3);");
        assert_eq!(
            build_call("doThing", &args, true),
            r"return doThing('a\'b', 3);"
        );
        assert_eq!(build_call("noArgs", &[], true), "return noArgs();");
    }
}
