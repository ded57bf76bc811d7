//! Wire framing for the evaluator subprocess protocol.
//!
//! Each message is a 4-byte big-endian length prefix followed by a JSON
//! payload. Requests travel over the subprocess's stdin, replies over its
//! stdout. The reply shape is [`crate::types::EvalOutcome`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Evaluation request sent to the evaluator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalRequest {
    /// The snippet to evaluate.
    pub code: String,
    /// Client timeout in milliseconds. Advisory to the evaluator; enforced
    /// by the worker stub regardless.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Resident-memory ceiling in KiB. Advisory to the evaluator; measured
    /// externally by the worker stub.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_mem_kib: Option<u64>,
}

/// Writer half of a framed channel.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Send one framed message.
    pub async fn send<T: Serialize>(&mut self, msg: &T) -> Result<()> {
        let payload =
            serde_json::to_vec(msg).map_err(|e| Error::Protocol(format!("encode: {e}")))?;
        self.inner
            .write_all(&(payload.len() as u32).to_be_bytes())
            .await?;
        self.inner.write_all(&payload).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

/// Reader half of a framed channel.
pub struct FrameReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Receive one framed message.
    ///
    /// Returns `None` on a clean EOF (the peer closed its end).
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        // Length prefix (4 bytes, big-endian)
        let mut len_buf = [0u8; 4];
        match self.inner.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_be_bytes(len_buf) as usize;

        if len == 0 {
            return Err(Error::Protocol("empty frame".to_string()));
        }

        let mut payload = vec![0u8; len];
        self.inner.read_exact(&mut payload).await?;

        let msg = serde_json::from_slice(&payload)
            .map_err(|e| Error::Protocol(format!("decode: {e}")))?;
        Ok(Some(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EvalOutcome, EvalStatus, ExitCause};

    #[test]
    fn request_omits_absent_options() {
        let req = EvalRequest {
            code: "return 1;".to_string(),
            timeout_ms: None,
            max_mem_kib: None,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"code":"return 1;"}"#);
    }

    #[test]
    fn reply_tags() {
        let ok = EvalOutcome::Ok {
            output: b"hi\n".to_vec(),
            return_value: serde_json::json!(42),
            last_error: String::new(),
            status: EvalStatus::Continue,
        };
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["result"], "ok");
        assert_eq!(json["returnValue"], 42);
        assert_eq!(json["status"], "continue");

        let exit = EvalOutcome::Exit {
            cause: ExitCause::Code(3),
        };
        let json = serde_json::to_value(&exit).unwrap();
        assert_eq!(json["result"], "exit");
        assert_eq!(json["cause"]["code"], 3);
    }

    #[test]
    fn reply_round_trip() {
        let outcome = EvalOutcome::ParseError {
            message: "unknown command: ][".to_string(),
            status: EvalStatus::Break,
        };
        let bytes = serde_json::to_vec(&outcome).unwrap();
        let back: EvalOutcome = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, outcome);
    }

    #[tokio::test]
    async fn framed_round_trip_over_duplex() {
        let (client, server) = tokio::io::duplex(256);

        let mut writer = FrameWriter::new(server);
        let mut reader = FrameReader::new(client);

        let req = EvalRequest {
            code: "echo 'x';".to_string(),
            timeout_ms: Some(500),
            max_mem_kib: None,
        };
        writer.send(&req).await.unwrap();
        let got: EvalRequest = reader.recv().await.unwrap().unwrap();
        assert_eq!(got.code, req.code);
        assert_eq!(got.timeout_ms, Some(500));

        drop(writer);
        let eof: Option<EvalRequest> = reader.recv().await.unwrap();
        assert!(eof.is_none());
    }
}
