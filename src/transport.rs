//! `Content-Length` framing for JSON-RPC over a byte stream.

use serde_json::Value;
use std::io::{self, BufRead, Write};

/// Write one compact JSON message with its `Content-Length` header.
pub fn write_message<W: Write>(writer: &mut W, msg: &Value) -> io::Result<()> {
    let body = serde_json::to_string(msg)?;
    write!(writer, "Content-Length: {}\r\n\r\n{}", body.len(), body)?;
    writer.flush()
}

/// Read the next JSON message. Returns `Ok(None)` on a clean or truncated EOF.
///
/// Header blocks without a `Content-Length`, and bodies that are not JSON,
/// are discarded and reading moves on to the next message.
pub fn read_message<R: BufRead>(reader: &mut R) -> io::Result<Option<Value>> {
    let mut line = Vec::new();
    loop {
        let mut content_length: Option<usize> = None;
        let mut in_header = false;
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line)? == 0 {
                return Ok(None);
            }
            let text = String::from_utf8_lossy(&line);
            let t = text.trim();
            if t.is_empty() {
                if in_header {
                    break;
                }
                continue;
            }
            in_header = true;
            if let Some((key, value)) = t.split_once(':') {
                if key.trim().eq_ignore_ascii_case("content-length") {
                    content_length = value.trim().parse().ok();
                }
            }
        }

        let Some(len) = content_length else {
            tracing::trace!("discarding header block without Content-Length");
            continue;
        };
        let mut body = vec![0u8; len];
        match reader.read_exact(&mut body) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        match serde_json::from_slice::<Value>(&body) {
            Ok(msg) => return Ok(Some(msg)),
            Err(e) => tracing::debug!("discarding unparsable message body: {}", e),
        }
    }
}
