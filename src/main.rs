use clap::{Parser, Subcommand};
use console::style;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use defbench::config::{init_config, BenchConfig, ServerSpec};
use defbench::error::BenchError;
use defbench::progress::{print_summary, ConsoleProgress};
use defbench::runner::{run_benchmark_with, Quiet, RunObserver};

#[derive(Parser, Debug)]
#[command(
    name = "defbench",
    version,
    about = "Randomized go-to-definition benchmark for LSP servers"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// YAML config file; flags below override its values
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Source tree to sample cases from (workspace folder)
    #[arg(long)]
    root: Option<PathBuf>,

    /// Comma-separated server names to run (default: every configured server)
    #[arg(long, value_delimiter = ',', value_name = "NAMES")]
    servers: Vec<String>,

    /// Server command line, e.g. --cmd "pyright=pyright-langserver --stdio"
    #[arg(long = "cmd", value_name = "NAME=COMMAND")]
    cmds: Vec<String>,

    /// Number of random cases
    #[arg(long)]
    runs: Option<usize>,

    /// Seconds per definition request (timeouts are errors, not latency)
    #[arg(long, value_name = "SECS")]
    timeout: Option<f64>,

    /// Seconds allowed for initialize
    #[arg(long, value_name = "SECS")]
    init_timeout: Option<f64>,

    /// JSON object sent via workspace/didChangeConfiguration to every server
    #[arg(long, value_name = "JSON")]
    settings_json: Option<String>,

    /// Send the indexing-off settings to this server (repeatable)
    #[arg(long, value_name = "NAME")]
    disable_indexing: Vec<String>,

    /// RNG seed for repeatable case selection
    #[arg(long)]
    seed: Option<u64>,

    /// Write the machine-readable report here
    #[arg(long, value_name = "PATH")]
    json: Option<PathBuf>,

    /// Log every LSP message and ask servers for verbose traces
    #[arg(long)]
    trace: bool,

    /// Milliseconds to wait between didOpen and the definition request
    #[arg(long, value_name = "MS")]
    didopen_warmup_ms: Option<u64>,

    /// No spinners or summary table
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write an example config file
    Init {
        #[arg(default_value = "defbench.yaml")]
        path: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.trace);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("error:").red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(trace: bool) {
    let default = if trace { "defbench=trace" } else { "defbench=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: Cli) -> Result<(), BenchError> {
    if let Some(Command::Init { path }) = &cli.command {
        init_config(path)?;
        eprintln!("  {} {}", style("created").green().bold(), path.display());
        return Ok(());
    }

    let cfg = build_config(&cli)?;
    if let Some(path) = &cli.config {
        eprintln!("  {} {}", style("config").dim(), path.display());
    }
    eprintln!("  {} {}", style("root").dim(), cfg.root.display());

    let report = if cli.quiet {
        run_benchmark_with(&cfg, &mut Quiet)?
    } else {
        let mut progress = ConsoleProgress::new();
        let observer: &mut dyn RunObserver = &mut progress;
        run_benchmark_with(&cfg, observer)?
    };

    if !cli.quiet {
        print_summary(&report);
    }
    if let Some(path) = &cfg.output {
        eprintln!("\n  {} {}", style("->").green().bold(), path.display());
    }
    Ok(())
}

/// File values first, then CLI overrides.
fn build_config(cli: &Cli) -> Result<BenchConfig, BenchError> {
    let mut cfg = match &cli.config {
        Some(path) => BenchConfig::load(path)?,
        None => BenchConfig::new(".", Vec::new()),
    };

    if let Some(root) = &cli.root {
        cfg.root = root.clone();
    }
    for entry in &cli.cmds {
        let (name, command) = entry
            .split_once('=')
            .ok_or_else(|| BenchError::Config(format!("--cmd expects NAME=COMMAND, got {:?}", entry)))?;
        let spec = ServerSpec::from_command_line(name.trim(), command)?;
        match cfg.servers.iter_mut().find(|s| s.name == spec.name) {
            Some(existing) => {
                existing.cmd = spec.cmd;
                existing.args = spec.args;
            }
            None => cfg.servers.push(spec),
        }
    }
    if !cli.servers.is_empty() {
        let wanted: Vec<String> = cli
            .servers
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        for name in &wanted {
            if !cfg.servers.iter().any(|s| &s.name == name) {
                return Err(BenchError::Config(format!(
                    "no command configured for server {:?} (use --cmd {}=...)",
                    name, name
                )));
            }
        }
        cfg.servers.retain(|s| wanted.contains(&s.name));
    }

    if let Some(runs) = cli.runs {
        cfg.runs = runs;
    }
    if let Some(secs) = cli.timeout {
        cfg.timeout_secs = secs;
    }
    if let Some(secs) = cli.init_timeout {
        cfg.init_timeout_secs = secs;
    }
    if let Some(raw) = &cli.settings_json {
        let value = serde_json::from_str(raw)
            .map_err(|e| BenchError::Config(format!("--settings-json must be valid JSON: {}", e)))?;
        cfg.settings = Some(value);
    }
    for name in &cli.disable_indexing {
        if !cfg.disable_indexing.contains(name) {
            cfg.disable_indexing.push(name.clone());
        }
    }
    // indexing flags for servers filtered out above are moot
    let names = cfg.server_names();
    cfg.disable_indexing.retain(|n| names.contains(n) || cli.disable_indexing.contains(n));

    if cli.seed.is_some() {
        cfg.seed = cli.seed;
    }
    if let Some(path) = &cli.json {
        cfg.output = Some(path.clone());
    }
    if let Some(ms) = cli.didopen_warmup_ms {
        cfg.didopen_warmup_ms = ms;
    }
    cfg.trace |= cli.trace;

    cfg.validate()?;
    Ok(cfg)
}
