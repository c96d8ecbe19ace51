#![allow(dead_code)]

use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, ExitStatus};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Duration, Utc};

use integration_gate::core::clock::{Clock, ManualClock};
use integration_gate::core::config::Config;
use integration_gate::engine::orchestrator::Orchestrator;
use integration_gate::engine::retry::RetryPolicy;
use integration_gate::logger::dual::ActivityLoggerHandle;
use integration_gate::model::scenario::{ExecutionSource, Param, ParamValue, ScenarioDefinition};
use integration_gate::model::version_set::{ComponentRef, VersionSet};
use integration_gate::platform::collaborators::{Collaborators, VersionSetStore};
use integration_gate::platform::memory::{
    MemoryCatalog, MemoryExecutionEngine, MemoryVersionSetStore, RecordingPublisher,
    result_payload,
};
use integration_gate::status::map::StatusMapEntry;

// ──────────────────── CLI runner ────────────────────

pub struct CmdResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub log_path: PathBuf,
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn resolve_bin_path() -> PathBuf {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_igate") {
        return PathBuf::from(path);
    }

    let exe_name = if cfg!(windows) { "igate.exe" } else { "igate" };
    let fallback = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(PathBuf::from))
        .and_then(|deps| deps.parent().map(PathBuf::from))
        .map(|debug_dir| debug_dir.join(exe_name));

    match fallback {
        Some(path) if path.exists() => path,
        _ => panic!("unable to resolve igate binary path for integration test"),
    }
}

/// Run the CLI, keeping a log of the invocation for failed assertions.
pub fn run_cli_case(case_name: &str, args: &[&str]) -> CmdResult {
    let root = std::env::temp_dir().join("igate-test-logs");
    fs::create_dir_all(&root).expect("create temp test log dir");

    let log_path = root.join(format!("{}-{}.log", sanitize(case_name), now_millis()));
    let bin_path = resolve_bin_path();

    let output = Command::new(&bin_path)
        .args(args)
        .env("RUST_BACKTRACE", "1")
        .env_remove("IGATE_OUTPUT_FORMAT")
        .output()
        .expect("execute igate command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    let mut log_content = String::new();
    let _ = writeln!(log_content, "case={case_name}");
    let _ = writeln!(log_content, "bin={}", bin_path.display());
    let _ = writeln!(log_content, "args={args:?}");
    let _ = writeln!(log_content, "status={}", output.status);
    log_content.push_str("----- stdout -----\n");
    log_content.push_str(&stdout);
    log_content.push('\n');
    log_content.push_str("----- stderr -----\n");
    log_content.push_str(&stderr);
    log_content.push('\n');
    fs::write(&log_path, log_content).expect("write test log");

    CmdResult {
        status: output.status,
        stdout,
        stderr,
        log_path,
    }
}

// ──────────────────── in-memory gate ────────────────────

pub const APP: &str = "shop";

pub fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
        .expect("valid timestamp")
        .with_timezone(&Utc)
}

pub fn scenario(name: &str) -> ScenarioDefinition {
    ScenarioDefinition {
        name: name.to_string(),
        application: APP.to_string(),
        source: ExecutionSource {
            resolver: "git".to_string(),
            params: vec![Param::new(
                "url",
                ParamValue::single("https://git.example/shop-tests"),
            )],
        },
        params: Vec::new(),
        contexts: Vec::new(),
        valid: true,
        optional: false,
    }
}

pub fn scenario_for(name: &str, contexts: &[&str]) -> ScenarioDefinition {
    let mut def = scenario(name);
    def.contexts = contexts.iter().map(ToString::to_string).collect();
    def
}

pub fn version_set(id: &str, trigger: &str) -> VersionSet {
    VersionSet::new(
        id,
        APP,
        trigger,
        vec![ComponentRef {
            name: "frontend".to_string(),
            container_image: "registry.example/shop/frontend@sha256:abc123".to_string(),
            source: None,
        }],
        t0(),
    )
}

/// Every collaborator in memory, wired to one manual clock.
pub struct Gate {
    pub store: Arc<MemoryVersionSetStore>,
    pub catalog: Arc<MemoryCatalog>,
    pub engine: Arc<MemoryExecutionEngine>,
    pub publisher: Arc<RecordingPublisher>,
    pub clock: Arc<ManualClock>,
    pub orchestrator: Orchestrator,
}

impl Gate {
    pub fn new(scenarios: Vec<ScenarioDefinition>) -> Self {
        Self::with_retry(scenarios, RetryPolicy::immediate(50))
    }

    pub fn with_retry(scenarios: Vec<ScenarioDefinition>, retry: RetryPolicy) -> Self {
        let clock = Arc::new(ManualClock::new(t0()));
        let store = Arc::new(MemoryVersionSetStore::new());
        let catalog = Arc::new(MemoryCatalog::new(scenarios));
        let engine = Arc::new(MemoryExecutionEngine::new(clock.clone()));
        let publisher = Arc::new(RecordingPublisher::new());
        let collaborators = Collaborators::new(store.clone(), catalog.clone(), engine.clone())
            .with_publisher(publisher.clone())
            .with_clock(clock.clone());
        let orchestrator = Orchestrator::new(
            collaborators,
            Config::default(),
            ActivityLoggerHandle::detached(),
        )
        .with_retry_policy(retry);
        Self {
            store,
            catalog,
            engine,
            publisher,
            clock,
            orchestrator,
        }
    }

    pub fn add_version_set(&self, id: &str, trigger: &str) {
        self.store.insert(version_set(id, trigger));
    }

    pub fn record(&self, id: &str) -> VersionSet {
        self.store.get(id).expect("version set exists").value
    }

    pub fn entry(&self, id: &str, scenario: &str) -> StatusMapEntry {
        self.orchestrator
            .status_map(id)
            .expect("status map decodes")
            .get(scenario)
            .cloned()
            .unwrap_or_else(|| panic!("no entry for {scenario}"))
    }

    pub fn current_run(&self, id: &str, scenario: &str) -> String {
        self.entry(id, scenario)
            .test_run_name
            .unwrap_or_else(|| panic!("{scenario} has no run"))
    }

    /// Advance the clock and finish `run` with a pass/fail payload.
    pub fn complete(&self, run: &str, succeeded: bool) {
        self.clock.advance(Duration::seconds(30));
        let now = self.clock.now();
        self.engine
            .complete(run, result_payload(succeeded, now), now)
            .expect("run exists");
    }
}
