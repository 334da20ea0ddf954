//! Run orchestration.
//!
//! Each run draws one case and sends it to every configured server at the
//! same time, one short-lived worker thread per server. Workers only touch
//! their own client; the report and the aggregate buckets belong to the
//! coordinating thread, which folds results in as workers finish.

use serde_json::Value;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use crate::case::{BenchmarkCase, CasePicker};
use crate::client::LspClient;
use crate::config::{BenchConfig, ServerSpec};
use crate::error::{BenchError, ClientError};
use crate::protocol::DefinitionResult;
use crate::report::{CaseRecord, Report, ServerCaseResult, Unresolved, UnresolvedReason};
use crate::summary::Bucket;

/// Hooks for progress display. Every call happens on the coordinating thread.
pub trait RunObserver {
    fn server_unavailable(&mut self, _name: &str, _cmd: &str) {}
    fn case_picked(&mut self, _run: usize, _runs: usize, _case: &BenchmarkCase, _servers: &[&str]) {}
    fn server_finished(&mut self, _name: &str, _result: &ServerCaseResult) {}
    fn run_finished(&mut self, _run: usize) {}
}

/// Observer that shows nothing.
pub struct Quiet;

impl RunObserver for Quiet {}

struct ResolvedServer<'a> {
    spec: &'a ServerSpec,
    program: PathBuf,
    settings: Option<Value>,
}

enum SessionOutcome {
    Completed(DefinitionResult),
    Failed(String),
}

pub fn run_benchmark(config: &BenchConfig) -> Result<Report, BenchError> {
    run_benchmark_with(config, &mut Quiet)
}

/// Run the whole benchmark and return the report, also writing it to
/// `config.output` when set.
pub fn run_benchmark_with(
    config: &BenchConfig,
    observer: &mut dyn RunObserver,
) -> Result<Report, BenchError> {
    config.validate()?;
    let root = std::fs::canonicalize(&config.root).map_err(|source| BenchError::Io {
        path: config.root.clone(),
        source,
    })?;
    let seed = config.seed.unwrap_or_else(rand::random);
    let mut picker = CasePicker::new(&root, seed)?;
    tracing::info!(
        root = %root.display(),
        seed,
        files = picker.files().len(),
        runs = config.runs,
        "starting benchmark"
    );

    let mut available = Vec::new();
    let mut unavailable = Vec::new();
    for spec in &config.servers {
        match resolve_program(&spec.cmd) {
            Some(program) => available.push(ResolvedServer {
                spec,
                program,
                settings: config.settings_for(spec),
            }),
            None => {
                tracing::warn!(server = %spec.name, cmd = %spec.cmd, "command not found, skipping");
                observer.server_unavailable(&spec.name, &spec.cmd);
                let msg = format!("server unavailable: command not found: {}", spec.cmd);
                unavailable.push((spec.name.clone(), msg));
            }
        }
    }
    let running: Vec<&str> = available.iter().map(|s| s.spec.name.as_str()).collect();

    let mut report = Report::new(&root, seed, config.runs, config.server_names());
    let mut buckets: BTreeMap<String, Bucket> = config
        .servers
        .iter()
        .map(|s| (s.name.clone(), Bucket::default()))
        .collect();

    for run in 0..config.runs {
        let case = picker.pick()?;
        // the progress display prints its own header per run
        tracing::debug!(
            "run {}/{}: {}:{}:{} token={} kind={}",
            run + 1,
            config.runs,
            case.file.display(),
            case.position.line + 1,
            case.position.character + 1,
            case.token,
            case.kind
        );
        observer.case_picked(run, config.runs, &case, &running);
        let mut record = CaseRecord::new(run, &case);

        for (name, msg) in &unavailable {
            let result = ServerCaseResult::failed(msg.clone());
            observer.server_finished(name, &result);
            record.results.insert(name.clone(), result);
            record.unresolved.insert(
                name.clone(),
                Unresolved {
                    picked: record.picked.clone(),
                    reason: UnresolvedReason::ServerUnavailable,
                    error: Some(msg.clone()),
                },
            );
            if let Some(bucket) = buckets.get_mut(name) {
                bucket.record_failure();
            }
        }

        let (tx, rx) = mpsc::channel();
        let root: &Path = &root;
        thread::scope(|scope| {
            for server in &available {
                let tx = tx.clone();
                let case = case.clone();
                scope.spawn(move || {
                    let outcome = run_session_guarded(server, &case, config, root);
                    let _ = tx.send((server.spec.name.clone(), outcome));
                });
            }
            drop(tx);

            for (name, outcome) in rx {
                let result = fold_outcome(&mut record, &mut buckets, &name, outcome);
                observer.server_finished(&name, &result);
            }
        });

        report.cases.push(record);
        observer.run_finished(run);
    }

    for (name, bucket) in &buckets {
        report.summary.insert(name.clone(), bucket.summarize(config.runs));
    }
    if let Some(path) = &config.output {
        report.write(path)?;
        tracing::info!(path = %path.display(), "report written");
    }
    Ok(report)
}

/// Locate a server executable before any connection attempt.
fn resolve_program(cmd: &str) -> Option<PathBuf> {
    let found = which::which(cmd).ok()?;
    Some(std::fs::canonicalize(&found).unwrap_or(found))
}

fn run_session_guarded(
    server: &ResolvedServer,
    case: &BenchmarkCase,
    config: &BenchConfig,
    root: &Path,
) -> SessionOutcome {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| run_session(server, case, config, root)));
    match outcome {
        Ok(Ok(result)) => SessionOutcome::Completed(result),
        Ok(Err(e)) => SessionOutcome::Failed(e.to_string()),
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "worker panicked".to_string());
            SessionOutcome::Failed(format!("{}: {}", server.spec.name, msg))
        }
    }
}

/// One full session: spawn, handshake, open the case file, ask for the
/// definition, tear down.
fn run_session(
    server: &ResolvedServer,
    case: &BenchmarkCase,
    config: &BenchConfig,
    root: &Path,
) -> Result<DefinitionResult, ClientError> {
    let bytes = std::fs::read(&case.file).map_err(|source| ClientError::Document {
        path: case.file.clone(),
        source,
    })?;
    let text = String::from_utf8_lossy(&bytes);

    let mut client = LspClient::spawn(
        &server.spec.name,
        &server.program,
        &server.spec.args,
        root,
        config.trace,
    )?;
    let outcome = query(&mut client, server, case, &text, config);
    log_server_messages(&client);
    client.shutdown(config.shutdown_timeout());
    outcome
}

fn query(
    client: &mut LspClient,
    server: &ResolvedServer,
    case: &BenchmarkCase,
    text: &str,
    config: &BenchConfig,
) -> Result<DefinitionResult, ClientError> {
    client.initialize(config.init_timeout())?;
    if let Some(settings) = &server.settings {
        client.change_configuration(settings)?;
    }
    client.open_document(&case.uri, text, &config.language_id)?;
    if config.didopen_warmup_ms > 0 {
        thread::sleep(Duration::from_millis(config.didopen_warmup_ms));
    }
    Ok(client.definition(&case.uri, case.position, config.timeout()))
}

/// Surface server-side errors reported through `window/*Message`.
fn log_server_messages(client: &LspClient) {
    let notes = client.take_notifications();
    for note in &notes {
        let method = note.get("method").and_then(Value::as_str).unwrap_or("");
        if !matches!(method, "window/logMessage" | "window/showMessage") {
            continue;
        }
        let params = note.get("params");
        let level = params.and_then(|p| p.get("type")).and_then(Value::as_i64);
        let text = params
            .and_then(|p| p.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("");
        if level == Some(1) {
            tracing::warn!(server = client.name(), "{}", text);
        } else {
            tracing::trace!(server = client.name(), "{}", text);
        }
    }
    tracing::debug!(server = client.name(), count = notes.len(), "server messages");
}

fn fold_outcome(
    record: &mut CaseRecord,
    buckets: &mut BTreeMap<String, Bucket>,
    name: &str,
    outcome: SessionOutcome,
) -> ServerCaseResult {
    let bucket = buckets.entry(name.to_string()).or_default();
    let (result, unresolved) = match outcome {
        SessionOutcome::Completed(res) => {
            let payload = ServerCaseResult::from_result(&res);
            bucket.record(&res, payload.any_valid());
            let unresolved = payload.unresolved_reason().map(|reason| Unresolved {
                picked: record.picked.clone(),
                reason,
                error: res.error.clone(),
            });
            (payload, unresolved)
        }
        SessionOutcome::Failed(msg) => {
            tracing::warn!(server = name, "session failed: {}", msg);
            bucket.record_failure();
            let unresolved = Unresolved {
                picked: record.picked.clone(),
                reason: UnresolvedReason::ServerException,
                error: Some(msg.clone()),
            };
            (ServerCaseResult::failed(msg), Some(unresolved))
        }
    };
    if let Some(unresolved) = unresolved {
        record.unresolved.insert(name.to_string(), unresolved);
    }
    record.results.insert(name.to_string(), result.clone());
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Location, Position, Range};
    use crate::sampler::OccurrenceKind;

    fn record() -> CaseRecord {
        CaseRecord::new(
            0,
            &BenchmarkCase {
                file: "/src/a.py".into(),
                uri: "file:///src/a.py".into(),
                position: Position::new(0, 0),
                token: "os".into(),
                line_text: "import os".into(),
                kind: OccurrenceKind::ImportedName,
            },
        )
    }

    #[test]
    fn folding_a_valid_result() {
        let mut rec = record();
        let mut buckets = BTreeMap::new();
        let res = DefinitionResult::success(
            vec![Location {
                uri: "file:///lib/os.py".into(),
                range: Range {
                    start: Position::new(3, 0),
                    end: Position::new(3, 2),
                },
            }],
            4.0,
        );
        let out = fold_outcome(&mut rec, &mut buckets, "s", SessionOutcome::Completed(res));
        assert!(out.ok && out.found && out.any_valid());
        assert!(rec.unresolved.is_empty());
        let s = buckets["s"].summarize(1);
        assert_eq!((s.ok, s.found, s.valid, s.errors), (1, 1, 1, 0));
    }

    #[test]
    fn folding_an_empty_result_marks_unresolved() {
        let mut rec = record();
        let mut buckets = BTreeMap::new();
        fold_outcome(
            &mut rec,
            &mut buckets,
            "s",
            SessionOutcome::Completed(DefinitionResult::success(vec![], 1.0)),
        );
        assert_eq!(rec.unresolved["s"].reason, UnresolvedReason::NoDefinitionLocations);
        assert_eq!(buckets["s"].ok, 1);
    }

    #[test]
    fn folding_a_session_failure() {
        let mut rec = record();
        let mut buckets = BTreeMap::new();
        let out = fold_outcome(&mut rec, &mut buckets, "s", SessionOutcome::Failed("spawn failed".into()));
        assert!(!out.ok);
        assert_eq!(out.latency_ms, None);
        assert_eq!(rec.unresolved["s"].reason, UnresolvedReason::ServerException);
        assert_eq!(rec.unresolved["s"].error.as_deref(), Some("spawn failed"));
        let s = buckets["s"].summarize(1);
        assert_eq!(s.errors, 1);
        assert_eq!(s.latency_ms.count, 0);
    }

    #[test]
    fn missing_commands_do_not_resolve() {
        assert!(resolve_program("defbench-no-such-server-xyz").is_none());
    }
}
