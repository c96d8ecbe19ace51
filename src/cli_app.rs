//! Top-level CLI definition and dispatch.

use std::io::{self, IsTerminal, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Duration, Utc};
use clap::{Args, Parser, Subcommand};
use colored::{ColoredString, Colorize, control};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;

use integration_gate::core::clock::{Clock, ManualClock};
use integration_gate::core::config::Config;
use integration_gate::engine::orchestrator::Orchestrator;
use integration_gate::engine::workers::{PoolStats, ReconcilePool, ReconcileRequest};
use integration_gate::logger::dual::{ActivityLoggerHandle, DualLoggerConfig, spawn_logger};
use integration_gate::model::scenario::{ExecutionSource, Param, ParamValue, ScenarioDefinition};
use integration_gate::model::version_set::{
    ComponentRef, RerunScope, TestingOutcome, VersionSet,
};
use integration_gate::platform::collaborators::{Collaborators, ExecutionEngine, VersionSetStore};
use integration_gate::platform::memory::{
    MemoryCatalog, MemoryExecutionEngine, MemoryVersionSetStore, RecordingPublisher,
    result_payload,
};
use integration_gate::status::codec;
use integration_gate::status::map::{StatusMap, TestStatus};

const SIMULATED_APPLICATION: &str = "demo-shop";

/// Integration gate: launches, tracks and converges integration test runs.
#[derive(Debug, Parser)]
#[command(
    name = "igate",
    author,
    version,
    about = "Integration Gate - test run reconciliation engine",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// View and validate configuration.
    Config(ConfigArgs),
    /// Inspect encoded status maps.
    Status(StatusArgs),
    /// Drive in-memory version sets through the full lifecycle.
    Simulate(SimulateArgs),
}

#[derive(Debug, Clone, Args, Serialize, Default)]
struct ConfigArgs {
    /// Config operation to run.
    #[command(subcommand)]
    command: Option<ConfigCommand>,
}

#[derive(Debug, Clone, Subcommand, Serialize)]
enum ConfigCommand {
    /// Print resolved config file path.
    Path,
    /// Print effective merged configuration.
    Show,
    /// Validate configuration and exit.
    Validate,
}

#[derive(Debug, Clone, Args, Serialize)]
struct StatusArgs {
    #[command(subcommand)]
    command: StatusCommand,
}

#[derive(Debug, Clone, Subcommand, Serialize)]
enum StatusCommand {
    /// Decode a status map payload and summarize it.
    Decode(DecodeArgs),
}

#[derive(Debug, Clone, Args, Serialize)]
struct DecodeArgs {
    /// File holding the payload, or `-` for stdin.
    #[arg(value_name = "FILE")]
    input: String,
}

#[derive(Debug, Clone, Args, Serialize)]
struct SimulateArgs {
    /// Version sets to create.
    #[arg(long, default_value_t = 3)]
    version_sets: usize,
    /// Scenarios in the catalog.
    #[arg(long, default_value_t = 4)]
    scenarios: usize,
    /// Probability that a run passes.
    #[arg(long, default_value_t = 0.8)]
    pass_rate: f64,
    /// RNG seed; the same seed reproduces the same outcomes.
    #[arg(long, default_value_t = 42)]
    seed: u64,
    /// Times every event is delivered, to exercise idempotency.
    #[arg(long, default_value_t = 2)]
    duplicates: usize,
    /// Worker threads (defaults to the configured count).
    #[arg(long)]
    workers: Option<usize>,
    /// Rerun failed scenarios once and re-observe.
    #[arg(long)]
    rerun_failed: bool,
    /// Write engine activity to the configured JSONL/SQLite logs.
    #[arg(long)]
    activity_log: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid user input at runtime.
    #[error("{0}")]
    User(String),
    /// Environment/runtime failure.
    #[error("{0}")]
    Runtime(String),
    /// JSON serialization failed.
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    /// Output write failed.
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Runtime(_) | Self::Io(_) => 2,
            Self::Json(_) => 3,
        }
    }
}

/// Dispatch CLI commands.
pub fn run(cli: &Cli) -> Result<(), CliError> {
    if cli.no_color {
        control::set_override(false);
    }

    match &cli.command {
        Command::Config(args) => run_config(cli, args),
        Command::Status(args) => match &args.command {
            StatusCommand::Decode(decode) => run_status_decode(cli, decode),
        },
        Command::Simulate(args) => run_simulate(cli, args),
    }
}

// ──────────────────── config ────────────────────

fn run_config(cli: &Cli, args: &ConfigArgs) -> Result<(), CliError> {
    match &args.command {
        None | Some(ConfigCommand::Path) => {
            let path = cli.config.clone().unwrap_or_else(Config::default_path);
            let exists = path.exists();
            match output_mode(cli) {
                OutputMode::Human => {
                    println!("{}", path.display());
                    if !exists {
                        println!("  (file does not exist; defaults will be used)");
                    }
                }
                OutputMode::Json => write_json_line(&json!({
                    "command": "config path",
                    "path": path.to_string_lossy(),
                    "exists": exists,
                }))?,
            }
            Ok(())
        }
        Some(ConfigCommand::Show) => {
            let config = load_config(cli)?;
            match output_mode(cli) {
                OutputMode::Human => {
                    let toml_str = toml::to_string_pretty(&config)
                        .map_err(|e| CliError::Runtime(format!("serialize config: {e}")))?;
                    println!("{toml_str}");
                }
                OutputMode::Json => write_json_line(&json!({
                    "command": "config show",
                    "config": serde_json::to_value(&config)?,
                }))?,
            }
            Ok(())
        }
        Some(ConfigCommand::Validate) => match Config::load(cli.config.as_deref()) {
            Ok(config) => {
                let hash = config
                    .stable_hash()
                    .map_err(|e| CliError::Runtime(e.to_string()))?;
                match output_mode(cli) {
                    OutputMode::Human => {
                        println!("{}", "Configuration is valid.".green());
                        println!("  Source: {}", config.paths.config_file.display());
                        println!("  Hash: {hash}");
                    }
                    OutputMode::Json => write_json_line(&json!({
                        "command": "config validate",
                        "valid": true,
                        "path": config.paths.config_file.to_string_lossy(),
                        "hash": hash,
                    }))?,
                }
                Ok(())
            }
            Err(e) => {
                match output_mode(cli) {
                    OutputMode::Human => eprintln!("{} {e}", "Configuration is INVALID:".red()),
                    OutputMode::Json => write_json_line(&json!({
                        "command": "config validate",
                        "valid": false,
                        "code": e.code(),
                        "error": e.to_string(),
                    }))?,
                }
                Err(CliError::User(format!("invalid config: {e}")))
            }
        },
    }
}

fn load_config(cli: &Cli) -> Result<Config, CliError> {
    Config::load(cli.config.as_deref()).map_err(|e| CliError::Runtime(e.to_string()))
}

// ──────────────────── status decode ────────────────────

fn run_status_decode(cli: &Cli, args: &DecodeArgs) -> Result<(), CliError> {
    let (label, raw) = if args.input == "-" {
        let mut buf = String::new();
        io::stdin().read_to_string(&mut buf)?;
        ("stdin".to_string(), buf)
    } else {
        let raw = std::fs::read_to_string(&args.input)
            .map_err(|e| CliError::User(format!("read {}: {e}", args.input)))?;
        (args.input.clone(), raw)
    };
    let map = decode_payload(&label, &raw)?;

    match output_mode(cli) {
        OutputMode::Human => print_status_map(&label, &map),
        OutputMode::Json => {
            let entries: Vec<Value> = map
                .iter()
                .map(serde_json::to_value)
                .collect::<Result<_, _>>()?;
            write_json_line(&json!({
                "command": "status decode",
                "source": label,
                "entries": entries,
                "summary": map.summary(),
                "all_terminal": map.iter().all(|e| e.status.is_terminal()),
            }))?;
        }
    }
    Ok(())
}

/// Accept either the raw status map array or a whole version set record.
fn decode_payload(label: &str, raw: &str) -> Result<StatusMap, CliError> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        let version_set: VersionSet = serde_json::from_str(trimmed)
            .map_err(|e| CliError::User(format!("{label}: not a version set record: {e}")))?;
        return codec::read_from(&version_set).map_err(|e| CliError::User(e.to_string()));
    }
    codec::decode(label, Some(trimmed)).map_err(|e| CliError::User(e.to_string()))
}

fn paint(status: TestStatus) -> ColoredString {
    let label = status.as_str();
    match status {
        TestStatus::Passed => label.green(),
        TestStatus::Failed | TestStatus::Invalid => label.red(),
        TestStatus::Deleted => label.magenta(),
        TestStatus::InProgress => label.yellow(),
        TestStatus::Pending => label.normal(),
    }
}

fn print_status_map(label: &str, map: &StatusMap) {
    println!("{} {label}", "Status map".bold());
    if map.is_empty() {
        println!("  (no entries)");
        return;
    }
    for entry in map.iter() {
        println!(
            "  {:<32} {:<12} gen={} run={} {}",
            entry.scenario,
            paint(entry.status),
            entry.generation,
            entry.test_run_name.as_deref().unwrap_or("-"),
            entry.detail.dimmed(),
        );
    }
    println!("  {}", map.summary());
}

// ──────────────────── simulate ────────────────────

/// What one simulated version set ended up with.
#[derive(Debug, Clone, Serialize)]
struct SimulatedVersionSet {
    id: String,
    trigger: String,
    outcome: Option<TestingOutcome>,
    message: Option<String>,
    entries: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
struct PoolTotals {
    processed: u64,
    failed: u64,
    requeued: u64,
    dropped: u64,
}

impl PoolTotals {
    fn add(&mut self, stats: PoolStats) {
        self.processed += stats.processed;
        self.failed += stats.failed;
        self.requeued += stats.requeued;
        self.dropped += stats.dropped;
    }
}

#[derive(Debug, Clone, Serialize)]
struct SimulationReport {
    seed: u64,
    runs_created: u64,
    conflicts: u64,
    pool: PoolTotals,
    version_sets: Vec<SimulatedVersionSet>,
}

fn run_simulate(cli: &Cli, args: &SimulateArgs) -> Result<(), CliError> {
    if !(0.0..=1.0).contains(&args.pass_rate) {
        return Err(CliError::User(format!(
            "--pass-rate must be within 0..=1, got {}",
            args.pass_rate
        )));
    }
    let config = load_config(cli)?;

    let (logger, logger_join) = if args.activity_log {
        let (handle, join) = spawn_logger(DualLoggerConfig::from_config(&config))
            .map_err(|e| CliError::Runtime(e.to_string()))?;
        (handle, Some(join))
    } else {
        (ActivityLoggerHandle::detached(), None)
    };

    let report = simulate(&config, args, logger.clone());

    logger.shutdown();
    if let Some(join) = logger_join {
        let _ = join.join();
    }
    let report = report?;

    match output_mode(cli) {
        OutputMode::Human => print_simulation(&report),
        OutputMode::Json => {
            let mut payload = serde_json::to_value(&report)?;
            payload["command"] = json!("simulate");
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn simulate(
    config: &Config,
    args: &SimulateArgs,
    logger: ActivityLoggerHandle,
) -> Result<SimulationReport, CliError> {
    let runtime = |e: integration_gate::core::errors::GateError| CliError::Runtime(e.to_string());
    let mut rng = StdRng::seed_from_u64(args.seed);
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let store = Arc::new(MemoryVersionSetStore::new());
    let engine = Arc::new(MemoryExecutionEngine::new(clock.clone()));
    let catalog = Arc::new(MemoryCatalog::new(simulated_catalog(args.scenarios)));

    for index in 0..args.version_sets {
        let trigger = if index % 2 == 0 { "push" } else { "pull_request" };
        store.insert(VersionSet::new(
            format!("vs-{index}"),
            SIMULATED_APPLICATION,
            trigger,
            vec![ComponentRef {
                name: "frontend".to_string(),
                container_image: format!("registry.example/frontend@sha256:{:064x}", rng.random::<u64>()),
                source: None,
            }],
            clock.now(),
        ));
    }

    let collaborators = Collaborators::new(store.clone(), catalog, engine.clone())
        .with_publisher(Arc::new(RecordingPublisher::new()))
        .with_clock(clock.clone());
    let orchestrator = Orchestrator::new(collaborators, config.clone(), logger);
    let mut workers = config.workers.clone();
    if let Some(count) = args.workers {
        workers.count = count.max(1);
    }
    let ids: Vec<String> = (0..args.version_sets).map(|i| format!("vs-{i}")).collect();
    let mut totals = PoolTotals::default();

    let discover: Vec<ReconcileRequest> = ids
        .iter()
        .map(|id| ReconcileRequest::VersionSetChanged(id.clone()))
        .collect();
    totals.add(run_phase(&orchestrator, &workers, &discover, args.duplicates)?);
    let observed = complete_runs(&engine, &clock, &mut rng, args.pass_rate).map_err(runtime)?;
    totals.add(run_phase(&orchestrator, &workers, &observed, args.duplicates)?);

    if args.rerun_failed {
        let mut reruns = Vec::new();
        for id in &ids {
            let map = orchestrator.status_map(id).map_err(runtime)?;
            reruns.extend(
                map.iter()
                    .filter(|e| matches!(e.status, TestStatus::Failed | TestStatus::Invalid))
                    .map(|e| ReconcileRequest::RerunRequested {
                        id: id.clone(),
                        scope: RerunScope::Scenario(e.scenario.clone()),
                    }),
            );
        }
        totals.add(run_phase(&orchestrator, &workers, &reruns, 1)?);
        let observed =
            complete_runs(&engine, &clock, &mut rng, args.pass_rate).map_err(runtime)?;
        totals.add(run_phase(&orchestrator, &workers, &observed, args.duplicates)?);
    }

    let mut version_sets = Vec::new();
    for id in &ids {
        let record = store.get(id).map_err(runtime)?.value;
        let entries = codec::read_from(&record).map_err(runtime)?.len();
        version_sets.push(SimulatedVersionSet {
            id: id.clone(),
            trigger: record.trigger_context.clone(),
            outcome: record.testing_finished.as_ref().map(|f| f.outcome),
            message: record.testing_finished.map(|f| f.message),
            entries,
        });
    }

    Ok(SimulationReport {
        seed: args.seed,
        runs_created: engine.submissions(),
        conflicts: store.conflicts(),
        pool: totals,
        version_sets,
    })
}

fn simulated_catalog(count: usize) -> Vec<ScenarioDefinition> {
    (0..count)
        .map(|index| ScenarioDefinition {
            name: format!("scenario-{index}"),
            application: SIMULATED_APPLICATION.to_string(),
            source: ExecutionSource {
                resolver: "git".to_string(),
                params: vec![
                    Param::new("url", ParamValue::single("https://git.example/demo-tests")),
                    Param::new("pathInRepo", ParamValue::single(format!("tests/{index}.yaml"))),
                ],
            },
            params: vec![Param::new("TIMEOUT", ParamValue::single("30m"))],
            // Every third scenario only gates pushes.
            contexts: if index % 3 == 2 {
                vec!["push".to_string()]
            } else {
                Vec::new()
            },
            valid: true,
            optional: index % 4 == 3,
        })
        .collect()
}

/// Deliver every request `duplicates` times through a fresh pool and drain it.
fn run_phase(
    orchestrator: &Orchestrator,
    workers: &integration_gate::core::config::WorkerConfig,
    requests: &[ReconcileRequest],
    duplicates: usize,
) -> Result<PoolStats, CliError> {
    let pool = ReconcilePool::spawn(orchestrator.clone(), workers)
        .map_err(|e| CliError::Runtime(e.to_string()))?;
    for _ in 0..duplicates.max(1) {
        for request in requests {
            pool.submit(request.clone())
                .map_err(|e| CliError::Runtime(e.to_string()))?;
        }
    }
    Ok(pool.shutdown())
}

/// Finish every running run with a random verdict. Returns the observation
/// requests for them.
fn complete_runs(
    engine: &MemoryExecutionEngine,
    clock: &ManualClock,
    rng: &mut StdRng,
    pass_rate: f64,
) -> integration_gate::core::errors::Result<Vec<ReconcileRequest>> {
    let mut requests = Vec::new();
    for name in engine.run_names() {
        let Some(run) = engine.get(&name)? else {
            continue;
        };
        if run.finished {
            continue;
        }
        clock.advance(Duration::seconds(rng.random_range(5..=90)));
        let now = clock.now();
        engine.complete(&name, result_payload(rng.random_bool(pass_rate), now), now)?;
        requests.push(ReconcileRequest::TestRunChanged(name));
    }
    Ok(requests)
}

fn print_simulation(report: &SimulationReport) {
    println!("{} (seed {})", "Simulation".bold(), report.seed);
    for vs in &report.version_sets {
        let outcome = match vs.outcome {
            Some(TestingOutcome::Passed) => "passed".green(),
            Some(TestingOutcome::Failed) => "failed".red(),
            None => "unfinished".yellow(),
        };
        println!(
            "  {:<8} {:<13} {:<11} {}",
            vs.id,
            vs.trigger,
            outcome,
            vs.message.as_deref().unwrap_or("-")
        );
    }
    println!(
        "  runs created={} conflicts={} processed={} failed={} requeued={} dropped={}",
        report.runs_created,
        report.conflicts,
        report.pool.processed,
        report.pool.failed,
        report.pool.requeued,
        report.pool.dropped
    );
}

// ──────────────────── output ────────────────────

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("IGATE_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref(), io::stdout().is_terminal())
}

fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>, stdout_is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }

    let fallback = if stdout_is_tty {
        OutputMode::Human
    } else {
        OutputMode::Json
    };

    match env_mode
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => OutputMode::Json,
        Some("human") => OutputMode::Human,
        _ => fallback,
    }
}
