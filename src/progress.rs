//! Terminal progress: one spinner per server per run, plus the closing
//! summary table. Everything goes to stderr so stdout stays clean.

use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::time::Duration;

use crate::case::BenchmarkCase;
use crate::report::{Report, ServerCaseResult};
use crate::runner::RunObserver;

#[derive(Default)]
pub struct ConsoleProgress {
    multi: MultiProgress,
    bars: HashMap<String, ProgressBar>,
}

impl ConsoleProgress {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RunObserver for ConsoleProgress {
    fn server_unavailable(&mut self, name: &str, cmd: &str) {
        eprintln!("  {} {} -- {} not found", style("skip").yellow(), name, cmd);
    }

    fn case_picked(&mut self, run: usize, runs: usize, case: &BenchmarkCase, servers: &[&str]) {
        eprintln!(
            "\n{} {}:{}:{}  {} {}",
            style(format!("[{}/{}]", run + 1, runs)).bold(),
            case.file.display(),
            case.position.line + 1,
            case.position.character + 1,
            style(&case.token).cyan(),
            style(case.kind).dim()
        );
        self.bars.clear();
        for name in servers {
            let pb = self.multi.add(spinner(name));
            pb.set_message("waiting for definition");
            self.bars.insert(name.to_string(), pb);
        }
    }

    fn server_finished(&mut self, name: &str, result: &ServerCaseResult) {
        match self.bars.remove(name) {
            Some(pb) => finish(&pb, result),
            None => {
                let pb = self.multi.add(spinner(name));
                finish(&pb, result);
            }
        }
    }

    fn run_finished(&mut self, _run: usize) {
        for (_, pb) in self.bars.drain() {
            pb.finish_and_clear();
        }
    }
}

fn spinner(label: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::with_template("  {spinner:.cyan} {prefix:<20} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_chars("🌑🌒🌓🌔🌕🌖🌗🌘 ");
    pb.set_style(style);
    pb.set_prefix(label.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn finish(pb: &ProgressBar, result: &ServerCaseResult) {
    let latency = result
        .latency_ms
        .map(|ms| format!("{:.1}ms", ms))
        .unwrap_or_else(|| "-".to_string());
    let msg = if !result.ok {
        let error = result.error.as_deref().unwrap_or("failed");
        format!("{}  {}", style("fail").red().bold(), first_line(error))
    } else if result.any_valid() {
        format!(
            "{}  {}  ({} location{})",
            style("pass").green().bold(),
            latency,
            result.n_locations,
            if result.n_locations == 1 { "" } else { "s" }
        )
    } else if result.found {
        format!("{}  {}  (no usable file location)", style("miss").yellow().bold(), latency)
    } else {
        format!("{}  {}  (no definition)", style("miss").yellow().bold(), latency)
    };
    pb.finish_with_message(msg);
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or("")
}

fn opt_ms(v: Option<f64>) -> String {
    v.map(|ms| format!("{:.1}", ms)).unwrap_or_else(|| "-".to_string())
}

/// Closing per-server table.
pub fn print_summary(report: &Report) {
    eprintln!(
        "\n{}",
        style(format!("Summary ({} runs, seed {})", report.runs, report.seed)).bold()
    );
    eprintln!(
        "  {:<20} {:>7} {:>7} {:>7} {:>6} {:>8} {:>9} {:>9}",
        style("server").dim(),
        style("ok%").dim(),
        style("found%").dim(),
        style("valid%").dim(),
        style("errors").dim(),
        style("timeouts").dim(),
        style("p50 ms").dim(),
        style("p95 ms").dim()
    );
    for name in &report.servers {
        let Some(s) = report.summary.get(name) else {
            continue;
        };
        eprintln!(
            "  {:<20} {:>7.1} {:>7.1} {:>7.1} {:>6} {:>8} {:>9} {:>9}",
            style(name).bold(),
            s.ok_pct,
            s.found_pct,
            s.valid_pct,
            s.errors,
            s.timeouts,
            opt_ms(s.latency_ms.p50),
            opt_ms(s.latency_ms.p95)
        );
    }
}
