//! Randomized go-to-definition benchmark for language servers.
//!
//! Each run samples one identifier occurrence from a source tree, sends the
//! same `textDocument/definition` request to every configured server over a
//! fresh stdio session, and records correctness and latency per server.

pub mod case;
pub mod client;
pub mod config;
pub mod error;
pub mod progress;
pub mod protocol;
pub mod report;
pub mod runner;
pub mod sampler;
pub mod summary;
pub mod transport;

pub use case::{BenchmarkCase, CasePicker};
pub use client::LspClient;
pub use config::{BenchConfig, ServerSpec};
pub use error::{BenchError, ClientError};
pub use protocol::{DefinitionResult, Location, Position, Range};
pub use report::Report;
pub use runner::{run_benchmark, run_benchmark_with, RunObserver};
pub use summary::{LatencyStats, ServerSummary};
