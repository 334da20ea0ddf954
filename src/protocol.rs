//! LSP data model for definition results, plus the normalizer and validator
//! applied to every `textDocument/definition` response.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use url::Url;

use crate::error::ClientError;

/// Zero-based line/character pair. Signed because servers are free to send
/// garbage and the validator has to be able to see it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub line: i64,
    pub character: i64,
}

impl Position {
    pub fn new(line: i64, character: i64) -> Self {
        Self { line, character }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub uri: String,
    pub range: Range,
}

/// Outcome of one definition round trip. `ok` and `found` are independent:
/// an empty answer is still a successful answer.
#[derive(Debug, Clone, PartialEq)]
pub struct DefinitionResult {
    pub ok: bool,
    pub found: bool,
    pub n_locations: usize,
    pub latency_ms: Option<f64>,
    pub error: Option<String>,
    pub timed_out: bool,
    pub locations: Vec<Location>,
}

impl DefinitionResult {
    pub fn success(locations: Vec<Location>, latency_ms: f64) -> Self {
        Self {
            ok: true,
            found: !locations.is_empty(),
            n_locations: locations.len(),
            latency_ms: Some(latency_ms),
            error: None,
            timed_out: false,
            locations,
        }
    }

    pub fn failure(err: &ClientError, latency_ms: Option<f64>) -> Self {
        Self {
            ok: false,
            found: false,
            n_locations: 0,
            latency_ms,
            error: Some(err.to_string()),
            timed_out: err.is_timeout(),
            locations: Vec::new(),
        }
    }
}

/// Flatten a raw definition `result` into locations.
///
/// Accepts `null`, a single `Location` or `LocationLink`, or an array mixing
/// either shape. Items that don't look like one of them are skipped.
pub fn normalize_definition(result: &Value) -> Vec<Location> {
    match result {
        Value::Null => Vec::new(),
        Value::Array(items) => items.iter().filter_map(location_from).collect(),
        other => location_from(other).into_iter().collect(),
    }
}

fn location_from(item: &Value) -> Option<Location> {
    let obj = item.as_object()?;
    let (uri, range) = if obj.contains_key("targetUri") && obj.contains_key("targetRange") {
        (obj.get("targetUri")?, obj.get("targetRange")?)
    } else {
        (obj.get("uri")?, obj.get("range")?)
    };
    Some(Location {
        uri: uri.as_str()?.to_string(),
        range: Range {
            start: position_from(range.get("start")?)?,
            end: position_from(range.get("end")?)?,
        },
    })
}

fn position_from(v: &Value) -> Option<Position> {
    Some(Position {
        line: int_field(v, "line")?,
        character: int_field(v, "character")?,
    })
}

fn int_field(v: &Value, key: &str) -> Option<i64> {
    let field = v.get(key)?;
    field
        .as_i64()
        .or_else(|| field.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
}

/// Structural sanity check for a definition target.
///
/// Locations outside the benchmarked tree (stdlib, site-packages, bundled
/// stubs) are fine; only unresolvable URIs and negative coordinates fail.
pub fn is_valid_location(loc: &Location) -> bool {
    if uri_to_path(&loc.uri).is_none() {
        return false;
    }
    let Range { start, end } = loc.range;
    start.line >= 0 && start.character >= 0 && end.line >= 0 && end.character >= 0
}

pub fn path_to_uri(p: &Path) -> String {
    let abs = std::fs::canonicalize(p).unwrap_or_else(|_| p.to_path_buf());
    Url::from_file_path(&abs)
        .map(|u| u.to_string())
        .unwrap_or_else(|_| format!("file://{}", abs.display()))
}

/// Resolve a `file:` URI (or a bare path) to a filesystem path. Other schemes
/// don't resolve.
pub fn uri_to_path(uri: &str) -> Option<PathBuf> {
    if uri.trim().is_empty() {
        return None;
    }
    match Url::parse(uri) {
        Ok(url) if url.scheme() == "file" => url.to_file_path().ok(),
        // `C:\foo` parses as scheme `c`
        Ok(url) if url.scheme().len() == 1 => Some(PathBuf::from(uri)),
        Ok(_) => None,
        Err(_) => Some(PathBuf::from(uri)),
    }
}
