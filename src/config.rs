use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::BenchError;

// ── Config ──────────────────────────────────────────────────────────────────

/// Everything one benchmark invocation needs. Built from a YAML file, CLI
/// flags, or directly by a caller linking the library.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BenchConfig {
    pub root: PathBuf,
    #[serde(default)]
    pub servers: Vec<ServerSpec>,
    #[serde(default = "default_runs")]
    pub runs: usize,
    /// Seconds per definition request.
    #[serde(default = "default_timeout")]
    pub timeout_secs: f64,
    /// Seconds for the `initialize` round trip.
    #[serde(default = "default_init_timeout")]
    pub init_timeout_secs: f64,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: f64,
    /// Sent to every server via `workspace/didChangeConfiguration`.
    #[serde(default)]
    pub settings: Option<Value>,
    /// Servers that get the indexing-off settings payload.
    #[serde(default)]
    pub disable_indexing: Vec<String>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub output: Option<PathBuf>,
    #[serde(default)]
    pub trace: bool,
    /// Pause between `didOpen` and the definition request.
    #[serde(default)]
    pub didopen_warmup_ms: u64,
    #[serde(default = "default_language_id")]
    pub language_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ServerSpec {
    pub name: String,
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Overrides the global `settings` for this server.
    #[serde(default)]
    pub settings: Option<Value>,
}

fn default_runs() -> usize {
    1
}
fn default_timeout() -> f64 {
    10.0
}
fn default_init_timeout() -> f64 {
    120.0
}
fn default_shutdown_timeout() -> f64 {
    5.0
}
fn default_language_id() -> String {
    "python".to_string()
}

impl ServerSpec {
    pub fn new(name: &str, cmd: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            cmd: cmd.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            settings: None,
        }
    }

    /// Split a shell-style command line (`"pyright-langserver --stdio"`).
    pub fn from_command_line(name: &str, command: &str) -> Result<Self, BenchError> {
        let argv = shlex::split(command)
            .ok_or_else(|| BenchError::Config(format!("{}: unbalanced quotes in command", name)))?;
        let (cmd, args) = argv
            .split_first()
            .ok_or_else(|| BenchError::Config(format!("{}: empty command", name)))?;
        Ok(Self {
            name: name.to_string(),
            cmd: cmd.clone(),
            args: args.to_vec(),
            settings: None,
        })
    }
}

impl BenchConfig {
    pub fn new(root: impl Into<PathBuf>, servers: Vec<ServerSpec>) -> Self {
        Self {
            root: root.into(),
            servers,
            runs: default_runs(),
            timeout_secs: default_timeout(),
            init_timeout_secs: default_init_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            settings: None,
            disable_indexing: Vec::new(),
            seed: None,
            output: None,
            trace: false,
            didopen_warmup_ms: 0,
            language_id: default_language_id(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, BenchError> {
        let content = std::fs::read_to_string(path).map_err(|source| BenchError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let mut cfg: BenchConfig =
            serde_yaml::from_str(&content).map_err(|source| BenchError::ConfigParse {
                path: path.to_path_buf(),
                source,
            })?;
        // relative roots are relative to the config file
        if cfg.root.is_relative() {
            if let Some(dir) = path.parent() {
                cfg.root = dir.join(&cfg.root);
            }
        }
        Ok(cfg)
    }

    /// Fail on anything that would make the run meaningless, before any
    /// server process exists.
    pub fn validate(&self) -> Result<(), BenchError> {
        let err = |msg: String| Err(BenchError::Config(msg));
        if self.servers.is_empty() {
            return err("no servers selected".into());
        }
        if !self.root.is_dir() {
            return err(format!("root is not a directory: {}", self.root.display()));
        }
        if self.runs == 0 {
            return err("runs must be at least 1".into());
        }
        for (what, secs) in [
            ("timeout", self.timeout_secs),
            ("init timeout", self.init_timeout_secs),
            ("shutdown timeout", self.shutdown_timeout_secs),
        ] {
            if !(secs.is_finite() && secs > 0.0) {
                return err(format!("{} must be a positive number of seconds", what));
            }
        }
        let mut seen = HashSet::new();
        for s in &self.servers {
            if s.name.trim().is_empty() {
                return err("server with empty name".into());
            }
            if s.cmd.trim().is_empty() {
                return err(format!("{}: empty command", s.name));
            }
            if !seen.insert(s.name.as_str()) {
                return err(format!("duplicate server name: {}", s.name));
            }
        }
        for name in &self.disable_indexing {
            if !seen.contains(name.as_str()) {
                return err(format!("disable_indexing names unknown server: {}", name));
            }
        }
        Ok(())
    }

    pub fn server_names(&self) -> Vec<String> {
        self.servers.iter().map(|s| s.name.clone()).collect()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.init_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.shutdown_timeout_secs)
    }

    /// Settings pushed to `server` after `initialized`, if any. A per-server
    /// payload replaces the global one; the indexing-off payload sits
    /// underneath whatever the user supplied.
    pub fn settings_for(&self, server: &ServerSpec) -> Option<Value> {
        let explicit = server.settings.clone().or_else(|| self.settings.clone());
        if !self.disable_indexing.iter().any(|n| n == &server.name) {
            return explicit;
        }
        let mut merged = indexing_off_settings();
        match explicit {
            None => Some(merged),
            Some(Value::Object(user)) => {
                if let Value::Object(base) = &mut merged {
                    base.extend(user);
                }
                Some(merged)
            }
            Some(other) => Some(other),
        }
    }
}

/// Turns off workspace indexing and library scanning on servers that
/// understand `python.analysis` settings.
pub fn indexing_off_settings() -> Value {
    json!({
        "python": {
            "analysis": {
                "indexing": false,
                "autoSearchPaths": false,
                "useLibraryCodeForTypes": false,
            }
        }
    })
}

pub const EXAMPLE_CONFIG: &str = r#"# Go-to-definition benchmark configuration

# Source tree to sample from (relative paths are relative to this file)
root: .

# Number of random cases; each is sent to every server in parallel
runs: 20

# Seconds per definition request; timeouts count as errors, not latency
timeout_secs: 10
# Seconds allowed for initialize (cold start indexing can be slow)
init_timeout_secs: 120

# Fix the seed to replay the same cases
# seed: 0

# Write the JSON report here
output: defbench.json

# Optional settings pushed to every server after initialize
# settings:
#   python:
#     analysis:
#       typeCheckingMode: off

# Servers that should skip background indexing
# disable_indexing: [pyright]

servers:
  - name: pyright
    cmd: pyright-langserver
    args: ["--stdio"]

  # - name: pyrefly
  #   cmd: pyrefly
  #   args: ["lsp"]
  #
  # - name: ty
  #   cmd: ty
  #   args: ["server"]
"#;

pub fn init_config(path: &Path) -> Result<(), BenchError> {
    if path.exists() {
        return Err(BenchError::Config(format!("{} already exists", path.display())));
    }
    std::fs::write(path, EXAMPLE_CONFIG).map_err(|source| BenchError::Io {
        path: path.to_path_buf(),
        source,
    })
}
