//! The machine-readable report envelope.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::case::BenchmarkCase;
use crate::error::BenchError;
use crate::protocol::{is_valid_location, DefinitionResult, Position};
use crate::sampler::OccurrenceKind;
use crate::summary::ServerSummary;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub root: String,
    pub seed: u64,
    pub runs: usize,
    pub servers: Vec<String>,
    pub cases: Vec<CaseRecord>,
    pub summary: BTreeMap<String, ServerSummary>,
    pub ts: f64,
}

impl Report {
    pub fn new(root: &Path, seed: u64, runs: usize, servers: Vec<String>) -> Self {
        Self {
            root: root.display().to_string(),
            seed,
            runs,
            servers,
            cases: Vec::new(),
            summary: BTreeMap::new(),
            ts: unix_ts(),
        }
    }

    pub fn write(&self, path: &Path) -> Result<(), BenchError> {
        let io_err = |source| BenchError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(io_err)?;
        }
        let pretty = serde_json::to_string_pretty(self)?;
        std::fs::write(path, pretty).map_err(io_err)
    }

    pub fn read(path: &Path) -> Result<Self, BenchError> {
        let content = std::fs::read_to_string(path).map_err(|source| BenchError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseRecord {
    pub run: usize,
    pub picked: PickedCase,
    pub results: BTreeMap<String, ServerCaseResult>,
    pub unresolved: BTreeMap<String, Unresolved>,
}

impl CaseRecord {
    pub fn new(run: usize, case: &BenchmarkCase) -> Self {
        Self {
            run,
            picked: PickedCase::from(case),
            results: BTreeMap::new(),
            unresolved: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PickedCase {
    pub file: String,
    pub uri: String,
    pub line: i64,
    pub character: i64,
    pub line_1b: i64,
    pub character_1b: i64,
    pub token: String,
    pub kind: OccurrenceKind,
    pub line_text: String,
}

impl From<&BenchmarkCase> for PickedCase {
    fn from(case: &BenchmarkCase) -> Self {
        Self {
            file: case.file.display().to_string(),
            uri: case.uri.clone(),
            line: case.position.line,
            character: case.position.character,
            line_1b: case.position.line + 1,
            character_1b: case.position.character + 1,
            token: case.token.clone(),
            kind: case.kind,
            line_text: case.line_text.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerCaseResult {
    pub ok: bool,
    pub found: bool,
    pub n_locations: usize,
    pub latency_ms: Option<f64>,
    pub error: Option<String>,
    pub locations: Vec<LocationRecord>,
}

impl ServerCaseResult {
    /// Report form of a definition result, with every location validated.
    pub fn from_result(result: &DefinitionResult) -> Self {
        Self {
            ok: result.ok,
            found: result.found,
            n_locations: result.n_locations,
            latency_ms: result.latency_ms,
            error: result.error.clone(),
            locations: result
                .locations
                .iter()
                .map(|loc| LocationRecord {
                    uri: loc.uri.clone(),
                    start: loc.range.start,
                    end: loc.range.end,
                    valid: is_valid_location(loc),
                })
                .collect(),
        }
    }

    /// A run where no definition result exists at all.
    pub fn failed(error: String) -> Self {
        Self {
            ok: false,
            found: false,
            n_locations: 0,
            latency_ms: None,
            error: Some(error),
            locations: Vec::new(),
        }
    }

    pub fn any_valid(&self) -> bool {
        self.locations.iter().any(|l| l.valid)
    }

    /// Why this result doesn't count as resolved, if it doesn't.
    pub fn unresolved_reason(&self) -> Option<UnresolvedReason> {
        if self.locations.is_empty() {
            Some(UnresolvedReason::NoDefinitionLocations)
        } else if !self.any_valid() {
            Some(UnresolvedReason::NoValidFileLocation)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationRecord {
    pub uri: String,
    pub start: Position,
    pub end: Position,
    pub valid: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedReason {
    NoDefinitionLocations,
    NoValidFileLocation,
    ServerException,
    ServerUnavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unresolved {
    #[serde(flatten)]
    pub picked: PickedCase,
    pub reason: UnresolvedReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn unix_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Location, Range};
    use serde_json::json;

    fn case() -> BenchmarkCase {
        BenchmarkCase {
            file: "/src/a.py".into(),
            uri: "file:///src/a.py".into(),
            position: Position::new(1, 19),
            token: "getcwd".into(),
            line_text: "def f(): return os.getcwd()".into(),
            kind: OccurrenceKind::ImportedAttrCall,
        }
    }

    fn loc(uri: &str, line: i64) -> Location {
        Location {
            uri: uri.into(),
            range: Range {
                start: Position::new(line, 0),
                end: Position::new(line, 3),
            },
        }
    }

    #[test]
    fn picked_case_is_one_and_zero_based() {
        let v = serde_json::to_value(PickedCase::from(&case())).unwrap();
        assert_eq!(v["line"], 1);
        assert_eq!(v["line_1b"], 2);
        assert_eq!(v["character"], 19);
        assert_eq!(v["character_1b"], 20);
        assert_eq!(v["kind"], "imported_attr_call");
    }

    #[test]
    fn unresolved_reasons() {
        let empty = ServerCaseResult::from_result(&DefinitionResult::success(vec![], 1.0));
        assert_eq!(empty.unresolved_reason(), Some(UnresolvedReason::NoDefinitionLocations));

        let bad = ServerCaseResult::from_result(&DefinitionResult::success(vec![loc("file:///x.py", -1)], 1.0));
        assert_eq!(bad.unresolved_reason(), Some(UnresolvedReason::NoValidFileLocation));

        let good = ServerCaseResult::from_result(&DefinitionResult::success(
            vec![loc("file:///x.py", -1), loc("file:///y.py", 4)],
            1.0,
        ));
        assert!(good.any_valid());
        assert_eq!(good.unresolved_reason(), None);
    }

    #[test]
    fn serialized_shape() {
        let result = ServerCaseResult::from_result(&DefinitionResult::success(vec![loc("file:///y.py", 4)], 2.5));
        let v = serde_json::to_value(&result).unwrap();
        assert_eq!(
            v,
            json!({
                "ok": true, "found": true, "n_locations": 1, "latency_ms": 2.5, "error": null,
                "locations": [{
                    "uri": "file:///y.py",
                    "start": {"line": 4, "character": 0},
                    "end": {"line": 4, "character": 3},
                    "valid": true
                }]
            })
        );

        let unresolved = Unresolved {
            picked: PickedCase::from(&case()),
            reason: UnresolvedReason::ServerException,
            error: Some("boom".into()),
        };
        let v = serde_json::to_value(&unresolved).unwrap();
        assert_eq!(v["reason"], "server_exception");
        assert_eq!(v["token"], "getcwd");
        assert_eq!(v["error"], "boom");
    }

    #[test]
    fn floats_survive_a_write_read_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        let mut report = Report::new(Path::new("/src"), 1, 1, vec!["stub".into()]);
        let mut record = CaseRecord::new(0, &case());
        let mut ts = 1_760_000_000.000_370_3;
        for i in 0..500 {
            report.ts = ts;
            let ms = 0.1 + 0.2 + i as f64 / 7.0;
            record.results.insert(
                "stub".into(),
                ServerCaseResult::from_result(&DefinitionResult::success(vec![loc("file:///y.py", 1)], ms)),
            );
            report.cases = vec![record.clone()];
            report.write(&path).unwrap();

            let back = Report::read(&path).unwrap();
            assert_eq!(back.ts.to_bits(), ts.to_bits(), "ts {}", ts);
            assert_eq!(back.cases[0].results["stub"].latency_ms, Some(ms));
            ts += 0.000_123_7;
        }
    }

    #[test]
    fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/nested/report.json");
        let mut report = Report::new(Path::new("/src"), 7, 1, vec!["stub".into()]);
        let mut record = CaseRecord::new(0, &case());
        record.results.insert("stub".into(), ServerCaseResult::failed("unavailable".into()));
        report.cases.push(record);
        report.write(&path).unwrap();

        let back = Report::read(&path).unwrap();
        assert_eq!(back, report);
        let raw: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        for key in ["root", "seed", "runs", "servers", "cases", "summary", "ts"] {
            assert!(raw.get(key).is_some(), "missing {}", key);
        }
    }
}
