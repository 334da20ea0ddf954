//! Per-server aggregation across runs.

use serde::{Deserialize, Serialize};

use crate::protocol::DefinitionResult;

/// Running counts for one server over one benchmark invocation.
#[derive(Debug, Clone, Default)]
pub struct Bucket {
    pub ok: usize,
    pub found: usize,
    pub valid: usize,
    pub errors: usize,
    pub timeouts: usize,
    pub latencies_ms: Vec<f64>,
}

impl Bucket {
    /// Fold in a completed definition round trip. Latency only counts when
    /// the request succeeded, so timeout ceilings never skew the numbers.
    pub fn record(&mut self, result: &DefinitionResult, any_valid: bool) {
        if result.ok {
            self.ok += 1;
            if let Some(ms) = result.latency_ms {
                self.latencies_ms.push(ms);
            }
        } else {
            self.errors += 1;
            if result.timed_out {
                self.timeouts += 1;
            }
        }
        if result.found {
            self.found += 1;
        }
        if any_valid {
            self.valid += 1;
        }
    }

    /// A run where the session itself failed or the server was unavailable.
    pub fn record_failure(&mut self) {
        self.errors += 1;
    }

    pub fn summarize(&self, runs: usize) -> ServerSummary {
        ServerSummary {
            ok: self.ok,
            ok_pct: pct(self.ok, runs),
            found: self.found,
            found_pct: pct(self.found, runs),
            valid: self.valid,
            valid_pct: pct(self.valid, runs),
            errors: self.errors,
            timeouts: self.timeouts,
            latency_ms: LatencyStats::from_samples(&self.latencies_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSummary {
    pub ok: usize,
    pub ok_pct: f64,
    pub found: usize,
    pub found_pct: f64,
    pub valid: usize,
    pub valid_pct: f64,
    pub errors: usize,
    pub timeouts: usize,
    pub latency_ms: LatencyStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub count: usize,
    pub p50: Option<f64>,
    pub p95: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub mean: Option<f64>,
}

impl LatencyStats {
    pub fn from_samples(samples: &[f64]) -> Self {
        let mut sorted = samples.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let n = sorted.len();
        Self {
            count: n,
            p50: percentile(&sorted, 0.50),
            p95: percentile(&sorted, 0.95),
            min: sorted.first().copied(),
            max: sorted.last().copied(),
            mean: (n > 0).then(|| sorted.iter().sum::<f64>() / n as f64),
        }
    }
}

/// Nearest-rank percentile over sorted samples: the element at
/// `floor(len * q)`, no interpolation.
pub fn percentile(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let idx = ((sorted.len() as f64) * q) as usize;
    sorted.get(idx.min(sorted.len() - 1)).copied()
}

fn pct(count: usize, runs: usize) -> f64 {
    if runs == 0 {
        0.0
    } else {
        (100.0 * count as f64 / runs as f64).min(100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClientError;
    use crate::protocol::{Location, Position, Range};
    use std::time::Duration;

    fn loc() -> Location {
        Location {
            uri: "file:///a.py".into(),
            range: Range {
                start: Position::new(0, 0),
                end: Position::new(0, 1),
            },
        }
    }

    fn timeout() -> DefinitionResult {
        let err = ClientError::Timeout {
            server: "s".into(),
            method: "textDocument/definition".into(),
            timeout: Duration::from_secs(10),
            stderr_tail: String::new(),
        };
        DefinitionResult::failure(&err, Some(10_000.0))
    }

    #[test]
    fn percentages_are_count_over_runs() {
        let mut b = Bucket::default();
        b.record(&DefinitionResult::success(vec![loc()], 5.0), true);
        b.record(&DefinitionResult::success(vec![loc()], 7.0), false);
        b.record(&DefinitionResult::success(vec![], 3.0), false);
        b.record(&timeout(), false);
        let s = b.summarize(4);
        assert_eq!((s.ok, s.found, s.valid, s.errors), (3, 2, 1, 1));
        assert_eq!(s.ok_pct, 75.0);
        assert_eq!(s.found_pct, 50.0);
        assert_eq!(s.valid_pct, 25.0);
        for p in [s.ok_pct, s.found_pct, s.valid_pct] {
            assert!((0.0..=100.0).contains(&p));
        }
    }

    #[test]
    fn ok_without_locations_is_legal() {
        let mut b = Bucket::default();
        let empty = DefinitionResult::success(vec![], 1.5);
        assert!(empty.ok && !empty.found);
        b.record(&empty, false);
        let s = b.summarize(1);
        assert_eq!((s.ok, s.found, s.valid), (1, 0, 0));
        assert_eq!(s.latency_ms.count, 1);
    }

    #[test]
    fn always_timing_out_has_no_latency() {
        let mut b = Bucket::default();
        for _ in 0..6 {
            b.record(&timeout(), false);
        }
        let s = b.summarize(6);
        assert_eq!(s.errors, 6);
        assert_eq!(s.timeouts, 6);
        assert_eq!(s.ok_pct, 0.0);
        assert_eq!(s.latency_ms.count, 0);
        assert_eq!(s.latency_ms.p50, None);
        assert_eq!(s.latency_ms.mean, None);
    }

    #[test]
    fn session_failures_count_as_errors() {
        let mut b = Bucket::default();
        b.record_failure();
        b.record(&DefinitionResult::success(vec![loc()], 2.0), true);
        let s = b.summarize(2);
        assert_eq!(s.errors, 1);
        assert_eq!(s.valid_pct, 50.0);
    }

    #[test]
    fn percentiles_truncate_index() {
        let samples: Vec<f64> = (1..=10).rev().map(|v| v as f64).collect();
        let stats = LatencyStats::from_samples(&samples);
        // sorted 1..=10: idx 5 -> 6.0, idx floor(9.5) = 9 -> 10.0
        assert_eq!(stats.p50, Some(6.0));
        assert_eq!(stats.p95, Some(10.0));
        assert_eq!(stats.min, Some(1.0));
        assert_eq!(stats.max, Some(10.0));
        assert_eq!(stats.mean, Some(5.5));

        assert_eq!(percentile(&[4.0], 0.95), Some(4.0));
        assert_eq!(percentile(&[1.0, 2.0, 3.0], 0.5), Some(2.0));
        assert_eq!(percentile(&[], 0.5), None);
    }

    #[test]
    fn zero_runs_is_zero_percent() {
        assert_eq!(Bucket::default().summarize(0).ok_pct, 0.0);
    }
}
