//! Turning sampled occurrences into reproducible benchmark cases.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::BenchError;
use crate::protocol::{path_to_uri, Position};
use crate::sampler::{collect_occurrences, discover_source_files, Occurrence, OccurrenceKind};

/// Files tried per case before giving up on the run.
pub const MAX_FILE_TRIES: usize = 50;

/// One query submitted identically to every server in a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BenchmarkCase {
    pub file: PathBuf,
    pub uri: String,
    pub position: Position,
    pub token: String,
    pub line_text: String,
    pub kind: OccurrenceKind,
}

/// Seeded case source over a fixed file list. The same seed over an
/// unchanged tree yields the same sequence of cases.
pub struct CasePicker {
    files: Vec<PathBuf>,
    rng: StdRng,
    max_file_tries: usize,
}

impl CasePicker {
    pub fn new(root: &Path, seed: u64) -> Result<Self, BenchError> {
        Ok(Self {
            files: discover_source_files(root)?,
            rng: StdRng::seed_from_u64(seed),
            max_file_tries: MAX_FILE_TRIES,
        })
    }

    pub fn with_max_file_tries(mut self, tries: usize) -> Self {
        self.max_file_tries = tries.max(1);
        self
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Pick a random file and a case in it, moving on to another random file
    /// when one has nothing usable.
    pub fn pick(&mut self) -> Result<BenchmarkCase, BenchError> {
        let mut last_err = None;
        for _ in 0..self.max_file_tries {
            let Some(file) = self.files.choose(&mut self.rng).cloned() else {
                break;
            };
            match case_from_file(&file, &mut self.rng) {
                Ok(case) => return Ok(case),
                Err(e) => {
                    tracing::debug!("no case in {}: {}", file.display(), e);
                    last_err = Some(e);
                }
            }
        }
        Err(BenchError::PickExhausted {
            attempts: self.max_file_tries,
            last: last_err.map(|e| e.to_string()).unwrap_or_default(),
        })
    }
}

/// Draw one occurrence from `file`. Imported symbols are preferred whenever
/// the file has any, since they usually resolve across files.
pub fn case_from_file<R: Rng + ?Sized>(file: &Path, rng: &mut R) -> Result<BenchmarkCase, BenchError> {
    let bytes = std::fs::read(file).map_err(|source| BenchError::Io {
        path: file.to_path_buf(),
        source,
    })?;
    let text = String::from_utf8_lossy(&bytes);
    let lines: Vec<&str> = text.lines().collect();

    let candidates: Vec<Occurrence> = collect_occurrences(&text)
        .into_iter()
        .filter(|o| (1..=lines.len()).contains(&o.line))
        .collect();
    let preferred: Vec<&Occurrence> = candidates.iter().filter(|o| o.kind.is_imported()).collect();
    let chosen = if preferred.is_empty() {
        candidates.choose(rng)
    } else {
        preferred.choose(rng).copied()
    };
    let occ = chosen.ok_or_else(|| BenchError::NoOccurrences(file.to_path_buf()))?;

    let line0 = occ.line - 1;
    Ok(BenchmarkCase {
        file: file.to_path_buf(),
        uri: path_to_uri(file),
        position: Position::new(line0 as i64, occ.column as i64),
        token: occ.token.clone(),
        line_text: lines[line0].to_string(),
        kind: occ.kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn tree(files: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (rel, body) in files {
            let p = dir.path().join(rel);
            fs::create_dir_all(p.parent().unwrap()).unwrap();
            fs::write(p, body).unwrap();
        }
        dir
    }

    #[test]
    fn prefers_imported_occurrences() {
        let dir = tree(&[(
            "m.py",
            "import os\nlocal = 1\nother = local + local\nprint(os.sep)\n",
        )]);
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..20 {
            let case = case_from_file(&dir.path().join("m.py"), &mut rng).unwrap();
            assert!(case.kind.is_imported(), "{:?}", case);
        }
    }

    #[test]
    fn falls_back_to_all_candidates_without_imports() {
        let dir = tree(&[("m.py", "value = 1\nprint(value)\n")]);
        let mut rng = StdRng::seed_from_u64(3);
        let case = case_from_file(&dir.path().join("m.py"), &mut rng).unwrap();
        assert!(!case.kind.is_imported());
        assert!(["value", "print"].contains(&case.token.as_str()));
    }

    #[test]
    fn case_fields_are_consistent() {
        let dir = tree(&[("pkg/a.py", "import os\ndef f(): return os.getcwd()\n")]);
        let path = dir.path().join("pkg/a.py");
        let mut rng = StdRng::seed_from_u64(0);
        let case = case_from_file(&path, &mut rng).unwrap();

        assert_eq!(case.position.line, 1);
        assert_eq!(case.line_text, "def f(): return os.getcwd()");
        let col = case.position.character as usize;
        assert_eq!(&case.line_text[col..col + case.token.len()], case.token);
        assert!(case.uri.starts_with("file://"));
        assert!(case.uri.ends_with("pkg/a.py"));
    }

    #[test]
    fn same_seed_same_sequence() {
        let dir = tree(&[
            ("a.py", "import os\nos.getcwd()\n"),
            ("b.py", "import sys\nsys.exit(0)\nx = sys.argv\n"),
            ("c/d.py", "def g(y):\n    return len(y)\n"),
        ]);
        let seq = |seed| {
            let mut picker = CasePicker::new(dir.path(), seed).unwrap();
            (0..10).map(|_| picker.pick().unwrap()).collect::<Vec<_>>()
        };
        assert_eq!(seq(42), seq(42));
    }

    #[test]
    fn retries_then_gives_up() {
        let dir = tree(&[("empty.py", ""), ("also_empty.py", "\n\n")]);
        let mut picker = CasePicker::new(dir.path(), 9).unwrap().with_max_file_tries(5);
        match picker.pick() {
            Err(BenchError::PickExhausted { attempts, last }) => {
                assert_eq!(attempts, 5);
                assert!(last.contains("no identifier tokens"), "{}", last);
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
    }

    #[test]
    fn retry_finds_the_usable_file() {
        let dir = tree(&[("empty.py", ""), ("full.py", "import json\njson.dumps({})\n")]);
        let mut picker = CasePicker::new(dir.path(), 5).unwrap();
        for _ in 0..5 {
            let case = picker.pick().unwrap();
            assert!(case.file.ends_with("full.py"));
        }
    }
}
