//! A scriptable stand-in language server.
//!
//! Speaks Content-Length framed JSON-RPC over stdin/stdout and answers
//! `textDocument/definition` according to `--mode`. Every inbound message is
//! echoed to stderr so clients can be tested against a known stderr tail.

use clap::{Parser, ValueEnum};
use serde_json::{json, Value};
use std::io;
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use defbench::transport::{read_message, write_message};

#[derive(Parser, Debug)]
#[command(name = "stub-lsp", about = "Scriptable LSP server for exercising defbench")]
struct Args {
    /// How to answer textDocument/definition
    #[arg(long, value_enum, default_value_t = Mode::Location)]
    mode: Mode,

    /// Line (0-based) of the returned definition
    #[arg(long, default_value_t = 0)]
    line: i64,

    /// Character (0-based) of the returned definition
    #[arg(long, default_value_t = 0)]
    character: i64,

    /// URI of the returned definition (default: the queried document)
    #[arg(long)]
    target_uri: Option<String>,

    /// Sleep before answering a definition request (milliseconds)
    #[arg(long, default_value_t = 0)]
    delay_ms: u64,

    /// Send a workspace/configuration request after `initialized`
    #[arg(long)]
    ask_configuration: bool,

    /// Exit abruptly when this method arrives
    #[arg(long)]
    crash_on: Option<String>,

    /// After `initialized`, write this many logMessage notifications before
    /// reading stdin again
    #[arg(long, default_value_t = 0)]
    flood: usize,

    /// Point the returned definition at the queried position
    #[arg(long)]
    echo_position: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// A single Location
    Location,
    /// A one-element LocationLink array
    Link,
    /// An empty array
    Empty,
    /// A null result
    Null,
    /// Never answer
    Hang,
    /// A JSON-RPC error
    Error,
    /// One good Location, one with negative coordinates, one malformed item
    Mixed,
}

enum Reply {
    Result(Value),
    Error(i64, String),
    Silent,
}

fn main() -> ExitCode {
    let args = Args::parse();
    match serve(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("stub-lsp: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn serve(args: &Args) -> io::Result<()> {
    let stdin = io::stdin();
    let mut reader = stdin.lock();
    let mut out = io::stdout();
    let mut next_id = 1u64;

    while let Some(msg) = read_message(&mut reader)? {
        let method = msg.get("method").and_then(Value::as_str).unwrap_or("");
        let id = msg.get("id").cloned();
        if method.is_empty() {
            eprintln!("stub-lsp: <- response {}", id.unwrap_or(Value::Null));
            continue;
        }
        eprintln!("stub-lsp: <- {}", method);

        if args.crash_on.as_deref() == Some(method) {
            eprintln!("stub-lsp: crashing on {}", method);
            std::process::exit(3);
        }
        if method == "exit" {
            return Ok(());
        }

        let Some(id) = id else {
            if method == "initialized" {
                if args.ask_configuration {
                    let request = json!({
                        "jsonrpc": "2.0",
                        "id": format!("stub-{}", next_id),
                        "method": "workspace/configuration",
                        "params": { "items": [{ "section": "python" }] },
                    });
                    next_id += 1;
                    write_message(&mut out, &request)?;
                }
                for i in 0..args.flood {
                    let note = json!({
                        "jsonrpc": "2.0",
                        "method": "window/logMessage",
                        "params": { "type": 4, "message": format!("stub-lsp: indexing chunk {} of {}", i + 1, args.flood) },
                    });
                    write_message(&mut out, &note)?;
                }
            }
            continue;
        };

        let reply = match method {
            "initialize" => Reply::Result(json!({
                "capabilities": { "definitionProvider": true, "textDocumentSync": 1 },
                "serverInfo": { "name": "stub-lsp", "version": env!("CARGO_PKG_VERSION") },
            })),
            "textDocument/definition" => {
                if args.delay_ms > 0 {
                    thread::sleep(Duration::from_millis(args.delay_ms));
                }
                definition_reply(args, msg.get("params").unwrap_or(&Value::Null))
            }
            _ => Reply::Result(Value::Null),
        };

        let response = match reply {
            Reply::Result(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
            Reply::Error(code, message) => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": code, "message": message },
            }),
            Reply::Silent => {
                eprintln!("stub-lsp: not answering {}", method);
                continue;
            }
        };
        write_message(&mut out, &response)?;
    }
    Ok(())
}

fn definition_reply(args: &Args, params: &Value) -> Reply {
    let queried = params
        .pointer("/textDocument/uri")
        .and_then(Value::as_str)
        .unwrap_or("file:///unknown.py");
    let uri = args.target_uri.as_deref().unwrap_or(queried);
    let (line, character) = if args.echo_position {
        (
            params.pointer("/position/line").and_then(Value::as_i64).unwrap_or(0),
            params.pointer("/position/character").and_then(Value::as_i64).unwrap_or(0),
        )
    } else {
        (args.line, args.character)
    };
    let range = |line: i64, character: i64| {
        json!({
            "start": { "line": line, "character": character },
            "end": { "line": line, "character": character + 3 },
        })
    };

    match args.mode {
        Mode::Location => Reply::Result(json!({ "uri": uri, "range": range(line, character) })),
        Mode::Link => Reply::Result(json!([{
            "targetUri": uri,
            "targetRange": range(line, 0),
            "targetSelectionRange": range(line, character),
        }])),
        Mode::Empty => Reply::Result(json!([])),
        Mode::Null => Reply::Result(Value::Null),
        Mode::Hang => Reply::Silent,
        Mode::Error => Reply::Error(-32603, "stub failure".to_string()),
        Mode::Mixed => Reply::Result(json!([
            { "uri": uri, "range": range(line, character) },
            { "uri": uri, "range": range(-1, 0) },
            { "uri": uri },
        ])),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["stub-lsp"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    fn params() -> Value {
        json!({ "textDocument": { "uri": "file:///w/a.py" }, "position": { "line": 1, "character": 19 } })
    }

    #[test]
    fn location_defaults_to_queried_document() {
        let Reply::Result(v) = definition_reply(&args(&["--line", "1"]), &params()) else {
            panic!("expected a result");
        };
        assert_eq!(v["uri"], "file:///w/a.py");
        assert_eq!(v["range"]["start"]["line"], 1);
    }

    #[test]
    fn modes() {
        assert!(matches!(definition_reply(&args(&["--mode", "hang"]), &params()), Reply::Silent));
        assert!(matches!(
            definition_reply(&args(&["--mode", "error"]), &params()),
            Reply::Error(-32603, _)
        ));
        let Reply::Result(v) = definition_reply(&args(&["--mode", "mixed"]), &params()) else {
            panic!("expected a result");
        };
        assert_eq!(v.as_array().map(Vec::len), Some(3));
        let Reply::Result(v) = definition_reply(
            &args(&["--mode", "link", "--target-uri", "file:///lib/os.py"]),
            &params(),
        ) else {
            panic!("expected a result");
        };
        assert_eq!(v[0]["targetUri"], "file:///lib/os.py");
    }

    #[test]
    fn echo_position_points_at_the_query() {
        let Reply::Result(v) = definition_reply(&args(&["--echo-position", "--line", "9"]), &params()) else {
            panic!("expected a result");
        };
        assert_eq!(v["range"]["start"]["line"], 1);
        assert_eq!(v["range"]["start"]["character"], 19);
    }
}
