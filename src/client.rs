//! LSP client for a single benchmark session.
//!
//! Owns the server subprocess and three background threads: a writer that is
//! the only thing touching stdin, a reader that demultiplexes stdout into
//! per-request wait channels and a notification channel, and a stderr reader
//! that keeps a bounded tail for timeout diagnostics.

use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::ClientError;
use crate::protocol::{normalize_definition, path_to_uri, DefinitionResult, Position};
use crate::transport;

/// Lines of stderr kept per server.
const STDERR_TAIL_LINES: usize = 200;
/// Lines of that tail attached to a timeout error.
const TIMEOUT_TAIL_LINES: usize = 40;
const EXIT_GRACE: Duration = Duration::from_secs(3);

type Pending = Arc<Mutex<HashMap<u64, SyncSender<Value>>>>;

/// Work for the stdin writer thread.
enum Outbound {
    Message(Value),
    /// Close stdin once everything queued ahead of it is written.
    Close,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct LspClient {
    name: String,
    root: PathBuf,
    trace: bool,
    child: Option<Child>,
    outbox: Sender<Outbound>,
    next_id: u64,
    pending: Pending,
    notifications: Receiver<Value>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    shut_down: bool,
}

impl LspClient {
    /// Spawn `program args..` in `root` with all three stdio streams piped.
    pub fn spawn(
        name: &str,
        program: &Path,
        args: &[String],
        root: &Path,
        trace: bool,
    ) -> Result<Self, ClientError> {
        let mut child = Command::new(program)
            .args(args)
            .current_dir(root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ClientError::Spawn {
                server: name.to_string(),
                program: program.display().to_string(),
                source,
            })?;

        let not_started = || ClientError::NotStarted {
            server: name.to_string(),
        };
        let stdin = child.stdin.take().ok_or_else(not_started)?;
        let stdout = child.stdout.take().ok_or_else(not_started)?;
        let stderr = child.stderr.take().ok_or_else(not_started)?;

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let (tx, rx) = mpsc::channel();
        let (outbox, queued) = mpsc::channel();

        {
            let name = name.to_string();
            spawn_worker(format!("{}-lsp-tx", name), move || {
                writer_thread(&name, stdin, &queued)
            });
        }
        {
            let name = name.to_string();
            let pending = Arc::clone(&pending);
            let outbox = outbox.clone();
            spawn_worker(format!("{}-lsp-rx", name), move || {
                reader_thread(&name, stdout, &*pending, &outbox, &tx)
            });
        }
        {
            let tail = Arc::clone(&stderr_tail);
            spawn_worker(format!("{}-lsp-stderr", name), move || {
                stderr_thread(stderr, &*tail)
            });
        }

        tracing::debug!(server = name, program = %program.display(), "spawned");
        Ok(Self {
            name: name.to_string(),
            root: root.to_path_buf(),
            trace,
            child: Some(child),
            outbox,
            next_id: 1,
            pending,
            notifications: rx,
            stderr_tail,
            shut_down: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }

    /// `initialize` handshake followed by the `initialized` notification.
    /// Returns the server's `InitializeResult`.
    pub fn initialize(&mut self, timeout: Duration) -> Result<Value, ClientError> {
        let root_uri = path_to_uri(&self.root);
        let folder_name = self
            .root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.root.display().to_string());
        let params = json!({
            "processId": std::process::id(),
            "rootUri": root_uri,
            "capabilities": {
                "textDocument": {
                    "definition": { "dynamicRegistration": false, "linkSupport": true },
                },
                "workspace": {
                    "workspaceFolders": true,
                    "configuration": true,
                },
            },
            "workspaceFolders": [{ "uri": root_uri, "name": folder_name }],
            "clientInfo": { "name": "defbench", "version": env!("CARGO_PKG_VERSION") },
            "trace": if self.trace { "verbose" } else { "off" },
        });
        let result = self.request("initialize", params, timeout)?;
        self.notify("initialized", json!({}))?;
        Ok(result)
    }

    pub fn change_configuration(&mut self, settings: &Value) -> Result<(), ClientError> {
        self.notify(
            "workspace/didChangeConfiguration",
            json!({ "settings": settings }),
        )
    }

    pub fn open_document(
        &mut self,
        uri: &str,
        text: &str,
        language_id: &str,
    ) -> Result<(), ClientError> {
        self.notify(
            "textDocument/didOpen",
            json!({
                "textDocument": {
                    "uri": uri,
                    "languageId": language_id,
                    "version": 1,
                    "text": text,
                }
            }),
        )
    }

    /// Issue `textDocument/definition` and time only that round trip.
    /// Failures come back as `ok == false`, never as an error.
    pub fn definition(&mut self, uri: &str, position: Position, timeout: Duration) -> DefinitionResult {
        let params = json!({
            "textDocument": { "uri": uri },
            "position": { "line": position.line, "character": position.character },
        });
        let start = Instant::now();
        let outcome = self.request("textDocument/definition", params, timeout);
        let ms = start.elapsed().as_secs_f64() * 1000.0;
        match outcome {
            Ok(result) => DefinitionResult::success(normalize_definition(&result), ms),
            Err(e) => {
                tracing::debug!(server = %self.name, "definition failed: {}", e);
                DefinitionResult::failure(&e, Some(ms))
            }
        }
    }

    /// Send a request and block until its response or `timeout`. Returns the
    /// `result` member; a JSON-RPC `error` member becomes `ClientError::Protocol`.
    pub fn request(&mut self, method: &str, params: Value, timeout: Duration) -> Result<Value, ClientError> {
        let id = self.next_id;
        self.next_id += 1;

        let (tx, rx) = mpsc::sync_channel(1);
        lock(&self.pending).insert(id, tx);
        if let Err(e) = self.send(message(Some(id), method, params)) {
            lock(&self.pending).remove(&id);
            return Err(e);
        }

        let outcome = rx.recv_timeout(timeout);
        lock(&self.pending).remove(&id);

        let resp = match outcome {
            Ok(resp) => resp,
            Err(RecvTimeoutError::Timeout) => {
                return Err(ClientError::Timeout {
                    server: self.name.clone(),
                    method: method.to_string(),
                    timeout,
                    stderr_tail: self.stderr_tail_text(TIMEOUT_TAIL_LINES),
                })
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(ClientError::Closed {
                    server: self.name.clone(),
                    method: method.to_string(),
                })
            }
        };

        if let Some(err) = resp.get("error") {
            return Err(ClientError::Protocol {
                server: self.name.clone(),
                method: method.to_string(),
                code: err.get("code").and_then(Value::as_i64).unwrap_or(0),
                message: err
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
            });
        }
        Ok(resp.get("result").cloned().unwrap_or(Value::Null))
    }

    pub fn notify(&mut self, method: &str, params: Value) -> Result<(), ClientError> {
        self.send(message(None, method, params))
    }

    /// Everything the server sent that was not a response to one of our
    /// requests, in arrival order.
    pub fn take_notifications(&self) -> Vec<Value> {
        self.notifications.try_iter().collect()
    }

    pub fn stderr_tail_text(&self, max_lines: usize) -> String {
        let tail = lock(&self.stderr_tail);
        let skip = tail.len().saturating_sub(max_lines);
        tail.iter().skip(skip).cloned().collect::<Vec<_>>().join("\n")
    }

    /// Best-effort `shutdown` + `exit`, then wait for the process, killing it
    /// if it outlives the grace period. Safe to call more than once.
    pub fn shutdown(&mut self, timeout: Duration) {
        if self.child.is_none() {
            return;
        }
        if !self.shut_down {
            self.shut_down = true;
            if let Err(e) = self.request("shutdown", Value::Null, timeout) {
                tracing::debug!(server = %self.name, "shutdown request failed: {}", e);
            }
            if let Err(e) = self.notify("exit", Value::Null) {
                tracing::debug!(server = %self.name, "exit notification failed: {}", e);
            }
        }
        let _ = self.outbox.send(Outbound::Close);
        if let Some(mut child) = self.child.take() {
            wait_or_kill(&mut child, EXIT_GRACE);
        }
        tracing::debug!(server = %self.name, "stopped");
    }

    /// Queue `msg` for the writer thread. Never blocks on the pipe.
    fn send(&self, msg: Value) -> Result<(), ClientError> {
        let method = msg.get("method").and_then(Value::as_str).unwrap_or("response").to_string();
        tracing::trace!(server = %self.name, "-> {}", method);
        self.outbox
            .send(Outbound::Message(msg))
            .map_err(|_| ClientError::WriterClosed {
                server: self.name.clone(),
                method,
            })
    }
}

impl Drop for LspClient {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

fn message(id: Option<u64>, method: &str, params: Value) -> Value {
    let mut msg = json!({ "jsonrpc": "2.0", "method": method });
    if let Some(id) = id {
        msg["id"] = json!(id);
    }
    if !params.is_null() {
        msg["params"] = params;
    }
    msg
}

fn spawn_worker<F>(name: String, f: F)
where
    F: FnOnce() + Send + 'static,
{
    if let Err(e) = std::thread::Builder::new().name(name.clone()).spawn(f) {
        tracing::warn!("failed to start thread {}: {}", name, e);
    }
}

/// Sole owner of the server's stdin. A server that stops reading stalls only
/// this thread, so stdout keeps draining and request timeouts still fire.
fn writer_thread<W: Write>(name: &str, mut stdin: W, queued: &Receiver<Outbound>) {
    for item in queued.iter() {
        let Outbound::Message(msg) = item else {
            break;
        };
        if let Err(e) = transport::write_message(&mut stdin, &msg) {
            tracing::debug!(server = name, "stdin write failed: {}", e);
            break;
        }
    }
    tracing::trace!(server = name, "stdin closed");
}

fn reader_thread<R: Read>(
    name: &str,
    stdout: R,
    pending: &Mutex<HashMap<u64, SyncSender<Value>>>,
    outbox: &Sender<Outbound>,
    notifications: &Sender<Value>,
) {
    let mut reader = BufReader::new(stdout);
    loop {
        match transport::read_message(&mut reader) {
            Ok(Some(msg)) => route(name, msg, pending, outbox, notifications),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(server = name, "stdout read failed: {}", e);
                break;
            }
        }
    }
    // Dropping the senders wakes every waiter with `Disconnected`.
    lock(pending).clear();
    tracing::trace!(server = name, "stdout closed");
}

/// Deliver one inbound message. Responses go to their waiter if one is still
/// registered; late responses are dropped. Server requests are answered with
/// a null result and forwarded alongside notifications.
fn route(
    name: &str,
    msg: Value,
    pending: &Mutex<HashMap<u64, SyncSender<Value>>>,
    outbox: &Sender<Outbound>,
    notifications: &Sender<Value>,
) {
    let method = msg.get("method").and_then(Value::as_str).map(str::to_string);
    let id = msg.get("id").filter(|v| !v.is_null()).cloned();
    match (method, id) {
        (Some(method), Some(id)) => {
            tracing::trace!(server = name, "<- request {} id={}", method, id);
            let reply = json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": server_request_result(&method, &msg),
            });
            if outbox.send(Outbound::Message(reply)).is_err() {
                tracing::debug!(server = name, "reply to {} dropped: stdin closed", method);
            }
            let _ = notifications.send(msg);
        }
        (Some(method), None) => {
            tracing::trace!(server = name, "<- notify {}", method);
            let _ = notifications.send(msg);
        }
        (None, Some(id)) => {
            tracing::trace!(server = name, "<- response id={}", id);
            let waiter = id.as_u64().and_then(|id| lock(pending).remove(&id));
            match waiter {
                Some(waiter) => match waiter.try_send(msg) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                        tracing::trace!(server = name, "dropping late response id={}", id)
                    }
                },
                None => tracing::trace!(server = name, "dropping unmatched response id={}", id),
            }
        }
        (None, None) => {
            let _ = notifications.send(msg);
        }
    }
}

fn server_request_result(method: &str, msg: &Value) -> Value {
    match method {
        "workspace/configuration" => {
            let n = msg
                .pointer("/params/items")
                .and_then(Value::as_array)
                .map_or(0, Vec::len);
            Value::Array(vec![Value::Null; n])
        }
        _ => Value::Null,
    }
}

fn stderr_thread<R: Read>(stderr: R, tail: &Mutex<VecDeque<String>>) {
    let reader = BufReader::new(stderr);
    for line in reader.split(b'\n') {
        let Ok(line) = line else {
            return;
        };
        let text = String::from_utf8_lossy(&line).trim_end_matches('\r').to_string();
        let mut tail = lock(tail);
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(text);
    }
}

fn wait_or_kill(child: &mut Child, grace: Duration) {
    let deadline = Instant::now() + grace;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) if Instant::now() < deadline => std::thread::sleep(Duration::from_millis(20)),
            _ => break,
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}
