//! Reference evaluator subprocess.
//!
//! Speaks the framed wire protocol on stdin/stdout and interprets a tiny
//! command language, enough to exercise every pool code path from the
//! integration suite: `echo`, `return`, `sleep`, `alloc`, `set`/`get`,
//! `error`, `exit`. Statements are separated by `;`; anything unknown yields
//! a `parseError` reply. Not an embedding of a real interpreter.

use std::collections::HashMap;

use anyhow::Result;
use tokio::io::BufReader;
use tracing::info;
use tracing_subscriber::EnvFilter;

use evalpool::ipc::{EvalRequest, FrameReader, FrameWriter};
use evalpool::types::{EvalOutcome, EvalStatus, ExitCause};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Log to stderr; stdout carries IPC frames.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let mut reader = FrameReader::new(BufReader::new(tokio::io::stdin()));
    let mut writer = FrameWriter::new(tokio::io::stdout());

    let mut globals: HashMap<String, String> = HashMap::new();
    let mut ballast: Vec<Vec<u8>> = Vec::new();

    while let Some(request) = reader.recv::<EvalRequest>().await? {
        let reply = evaluate(&request.code, &mut globals, &mut ballast).await;
        writer.send(&reply).await?;
        if let EvalOutcome::Exit {
            cause: ExitCause::Code(code),
        } = &reply
        {
            info!(code, "exiting on request");
            std::process::exit(*code);
        }
    }

    Ok(())
}

async fn evaluate(
    code: &str,
    globals: &mut HashMap<String, String>,
    ballast: &mut Vec<Vec<u8>>,
) -> EvalOutcome {
    let mut output: Vec<u8> = Vec::new();
    let mut return_value = serde_json::Value::Null;
    let mut last_error = String::new();

    for statement in code.split(';') {
        let statement = statement.trim();
        if statement.is_empty() {
            continue;
        }
        let (command, rest) = statement
            .split_once(char::is_whitespace)
            .map(|(cmd, rest)| (cmd, rest.trim()))
            .unwrap_or((statement, ""));

        match command {
            "echo" => {
                output.extend_from_slice(unquote(rest).as_bytes());
                output.push(b'\n');
            }
            "return" => {
                return_value = serde_json::from_str(rest)
                    .unwrap_or_else(|_| serde_json::Value::String(unquote(rest)));
            }
            "sleep" => match rest.parse::<u64>() {
                Ok(ms) => tokio::time::sleep(std::time::Duration::from_millis(ms)).await,
                Err(_) => return parse_error(statement),
            },
            "alloc" => match rest.parse::<usize>() {
                // Filled, so the pages are actually resident.
                Ok(kib) => ballast.push(vec![0xA5; kib * 1024]),
                Err(_) => return parse_error(statement),
            },
            "set" => match rest.split_once(char::is_whitespace) {
                Some((key, value)) => {
                    globals.insert(key.to_string(), unquote(value.trim()));
                }
                None => return parse_error(statement),
            },
            "get" => {
                return_value = globals
                    .get(rest)
                    .cloned()
                    .map(serde_json::Value::String)
                    .unwrap_or(serde_json::Value::Null);
            }
            "error" => {
                last_error = unquote(rest);
            }
            "exit" => {
                let code = rest.parse::<i32>().unwrap_or(0);
                return EvalOutcome::Exit {
                    cause: ExitCause::Code(code),
                };
            }
            _ => return parse_error(statement),
        }
    }

    EvalOutcome::Ok {
        output,
        return_value,
        last_error,
        status: EvalStatus::Continue,
    }
}

fn parse_error(statement: &str) -> EvalOutcome {
    EvalOutcome::ParseError {
        message: format!("unknown command: {statement}"),
        status: EvalStatus::Break,
    }
}

/// Strip a surrounding single-quoted literal and its backslash escapes.
/// Unquoted text passes through unchanged.
fn unquote(text: &str) -> String {
    let inner = match text
        .strip_prefix('\'')
        .and_then(|t| t.strip_suffix('\''))
    {
        Some(inner) => inner,
        None => return text.to_string(),
    };
    let mut out = String::with_capacity(inner.len());
    let mut escaped = false;
    for ch in inner.chars() {
        if escaped {
            out.push(ch);
            escaped = false;
        } else if ch == '\\' {
            escaped = true;
        } else {
            out.push(ch);
        }
    }
    out
}
