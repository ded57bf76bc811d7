//! Pool configuration.
//!
//! Defines the structure of the pool configuration file on disk
//! (`evalpool.toml` by convention).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::worker::WorkerConfig;

/// Configuration for the evaluator pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Path to the interpreter binary.
    pub interpreter: PathBuf,
    /// Extra arguments passed to the interpreter.
    #[serde(default)]
    pub interpreter_args: Vec<String>,
    /// Snippet evaluated after every subprocess spawn, before anything else.
    #[serde(default)]
    pub init_snippet: Option<String>,
    /// Default resident-memory ceiling per reservation, in KiB.
    /// Absent means unbounded.
    #[serde(default)]
    pub default_max_mem_kib: Option<u64>,
    /// Number of concurrent workers.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl PoolConfig {
    pub fn new(interpreter: impl Into<PathBuf>) -> Self {
        Self {
            interpreter: interpreter.into(),
            interpreter_args: Vec::new(),
            init_snippet: None,
            default_max_mem_kib: None,
            workers: default_workers(),
        }
    }

    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    /// The per-worker launch configuration derived from this pool config.
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            program: self.interpreter.clone(),
            args: self.interpreter_args.clone(),
            init: self.init_snippet.iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn minimal_config_gets_defaults() {
        let config: PoolConfig = toml::from_str(r#"interpreter = "/usr/bin/scripteval""#).unwrap();
        assert_eq!(config.interpreter, PathBuf::from("/usr/bin/scripteval"));
        assert!(config.interpreter_args.is_empty());
        assert!(config.init_snippet.is_none());
        assert!(config.default_max_mem_kib.is_none());
        assert!(config.workers >= 1);
    }

    #[test]
    fn full_config_round_trips_into_worker_config() {
        let config: PoolConfig = toml::from_str(
            r#"
interpreter = "/opt/eval/bin/eval"
interpreter_args = ["--quiet"]
init_snippet = "set mode server;"
default_max_mem_kib = 262144
workers = 4
"#,
        )
        .unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.default_max_mem_kib, Some(262_144));

        let worker = config.worker_config();
        assert_eq!(worker.program, PathBuf::from("/opt/eval/bin/eval"));
        assert_eq!(worker.args, vec!["--quiet".to_string()]);
        assert_eq!(worker.init, vec!["set mode server;".to_string()]);
    }

    #[test]
    fn load_reads_a_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"interpreter = "/usr/bin/scripteval""#).unwrap();
        writeln!(file, "workers = 2").unwrap();

        let config = PoolConfig::load(file.path()).unwrap();
        assert_eq!(config.workers, 2);
    }

    #[test]
    fn load_rejects_bad_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "interpreter = ").unwrap();

        let err = PoolConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
