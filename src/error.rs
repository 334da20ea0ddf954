use std::path::PathBuf;
use std::time::Duration;

/// Fatal errors: raised before any server is spawned, or while sampling and
/// writing the report.
#[derive(Debug, thiserror::Error)]
pub enum BenchError {
    #[error("config error: {0}")]
    Config(String),

    #[error("error reading config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("error parsing config {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("no source files found under {0}")]
    NoSourceFiles(PathBuf),

    #[error("no identifier tokens found in {0}")]
    NoOccurrences(PathBuf),

    #[error("failed to pick a usable symbol after {attempts} files; last error: {last}")]
    PickExhausted { attempts: usize, last: String },

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Errors from one protocol session. These never abort a benchmark: they are
/// folded into the per-server result for the run.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("{server}: failed to start {program}: {source}")]
    Spawn {
        server: String,
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{server}: process not started")]
    NotStarted { server: String },

    #[error(
        "{server}: timeout after {secs:.1}s waiting for response to {method}{tail}",
        secs = .timeout.as_secs_f64(),
        tail = tail_suffix(.server, .stderr_tail)
    )]
    Timeout {
        server: String,
        method: String,
        timeout: Duration,
        stderr_tail: String,
    },

    #[error("{server}: LSP error for {method}: {code} {message}")]
    Protocol {
        server: String,
        method: String,
        code: i64,
        message: String,
    },

    #[error("{server}: connection closed while waiting for {method}")]
    Closed { server: String, method: String },

    #[error("{server}: stdin closed, cannot send {method}")]
    WriterClosed { server: String, method: String },

    #[error("{path}: {source}")]
    Document {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ClientError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::Timeout { .. })
    }
}

fn tail_suffix(server: &str, tail: &str) -> String {
    if tail.is_empty() {
        String::new()
    } else {
        format!("\n--- {} stderr (tail) ---\n{}", server, tail)
    }
}
