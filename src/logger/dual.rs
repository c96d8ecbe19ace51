//! Dual-write coordinator: every activity event goes to the JSONL log and, when
//! enabled, to SQLite.
//!
//! A dedicated logger thread owns both sinks. Reconciliation workers send
//! `ActivityEvent`s over a bounded crossbeam channel with `try_send`, so a slow
//! disk never stalls reconciliation; overflow is counted and reported.

#![allow(missing_docs)]

use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

use crate::core::config::Config;
use crate::core::errors::{GateError, Result};
use crate::logger::jsonl::{EventType, JsonlConfig, JsonlWriter, LogEntry, Severity};
#[cfg(feature = "sqlite")]
use crate::logger::sqlite::{ActivityRow, SqliteLogger, VerdictRow};
use crate::status::map::TestStatus;

/// Events between recovery attempts while the JSONL writer is degraded.
const RECOVERY_INTERVAL: u64 = 256;

/// Why an update to a status entry was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Not strictly newer than the stored entry.
    Stale,
    /// For a generation the entry has moved past.
    Superseded,
}

impl RejectReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stale => "stale",
            Self::Superseded => "superseded",
        }
    }
}

#[derive(Debug, Clone)]
pub enum ActivityEvent {
    EngineStarted {
        version: String,
        config_hash: String,
    },
    EngineStopped {
        reason: String,
        processed: u64,
    },
    ScenariosDiscovered {
        version_set: String,
        selected: usize,
        added: Vec<String>,
    },
    TestRunLaunched {
        version_set: String,
        scenario: String,
        test_run: String,
        generation: u64,
        /// The run already existed; the submission was collapsed into it.
        already_existed: bool,
    },
    LaunchFailed {
        version_set: String,
        scenario: String,
        code: String,
        message: String,
    },
    ReservedParamDropped {
        version_set: String,
        scenario: String,
        param: String,
    },
    StatusRecorded {
        version_set: String,
        scenario: String,
        status: TestStatus,
        detail: String,
        test_run: Option<String>,
        generation: u64,
    },
    UpdateRejected {
        version_set: String,
        scenario: String,
        test_run: String,
        reason: RejectReason,
    },
    RerunApplied {
        version_set: String,
        scope: String,
        reset: Vec<String>,
        unknown: Vec<String>,
    },
    TestingFinished {
        version_set: String,
        passed: bool,
        summary: String,
    },
    ConflictRetry {
        version_set: String,
        attempts: u32,
        exhausted: bool,
    },
    PublishFailed {
        version_set: String,
        scenario: String,
        code: String,
        message: String,
    },
    Error {
        code: String,
        message: String,
    },
    /// Asks the logger thread to flush and exit.
    Shutdown,
}

impl ActivityEvent {
    /// Error event from a gate error.
    #[must_use]
    pub fn error(error: &GateError) -> Self {
        Self::Error {
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}

// ──────────────────── public handle ────────────────────

/// Cheaply cloneable sender for activity events. Never blocks.
#[derive(Clone)]
pub struct ActivityLoggerHandle {
    tx: Sender<ActivityEvent>,
    dropped_events: Arc<AtomicU64>,
}

impl ActivityLoggerHandle {
    /// Handle with no logger thread behind it; every event is discarded.
    #[must_use]
    pub fn detached() -> Self {
        let (tx, _rx) = bounded(1);
        Self {
            tx,
            dropped_events: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Handle whose events land on the returned receiver instead of a logger
    /// thread.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, Receiver<ActivityEvent>) {
        let (tx, rx) = bounded(capacity.max(1));
        let handle = Self {
            tx,
            dropped_events: Arc::new(AtomicU64::new(0)),
        };
        (handle, rx)
    }

    /// Queue an event. A full channel drops it and bumps the dropped counter.
    pub fn send(&self, event: ActivityEvent) {
        if let Err(TrySendError::Full(_)) = self.tx.try_send(event) {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
        // Disconnected: no logger running, nothing to record.
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Ask the logger thread to flush and exit. Blocks until queued.
    pub fn shutdown(&self) {
        let _ = self.tx.send(ActivityEvent::Shutdown);
    }
}

// ──────────────────── configuration ────────────────────

pub struct DualLoggerConfig {
    /// `None` disables the SQLite sink.
    pub sqlite_path: Option<PathBuf>,
    pub jsonl_config: JsonlConfig,
    pub channel_capacity: usize,
    pub retention_days: u32,
}

impl DualLoggerConfig {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            sqlite_path: config
                .logging
                .sqlite_enabled
                .then(|| config.paths.sqlite_db.clone()),
            jsonl_config: JsonlConfig::from_config(&config.logging, &config.paths),
            channel_capacity: config.logging.channel_capacity,
            retention_days: config.logging.sqlite_retention_days,
        }
    }
}

impl Default for DualLoggerConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

// ──────────────────── spawn ────────────────────

/// Spawn the logger thread. It runs until `shutdown()` or until every handle
/// has been dropped.
pub fn spawn_logger(
    config: DualLoggerConfig,
) -> Result<(ActivityLoggerHandle, thread::JoinHandle<()>)> {
    let (tx, rx) = bounded::<ActivityEvent>(config.channel_capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    let handle = ActivityLoggerHandle {
        tx,
        dropped_events: Arc::clone(&dropped),
    };

    let join = thread::Builder::new()
        .name("igate-logger".to_string())
        .spawn(move || logger_thread_main(&rx, config, &dropped))
        .map_err(|e| GateError::Runtime {
            details: format!("failed to spawn logger thread: {e}"),
        })?;

    Ok((handle, join))
}

// ──────────────────── logger thread ────────────────────

fn logger_thread_main(rx: &Receiver<ActivityEvent>, config: DualLoggerConfig, dropped: &AtomicU64) {
    #[cfg(feature = "sqlite")]
    let mut sqlite = config.sqlite_path.and_then(|p| match SqliteLogger::open(&p) {
        Ok(db) => {
            if let Err(e) = db.prune_activity_log(config.retention_days) {
                eprintln!("[IG-DUAL] activity prune failed: {e}");
            }
            Some(db)
        }
        Err(e) => {
            eprintln!("[IG-DUAL] failed to open SQLite at {}: {e}", p.display());
            None
        }
    });
    #[cfg(not(feature = "sqlite"))]
    let _ = (config.sqlite_path, config.retention_days);

    let mut jsonl = JsonlWriter::open(config.jsonl_config);
    #[cfg(feature = "sqlite")]
    let mut sqlite_failures: u32 = 0;
    let mut seen: u64 = 0;

    while let Ok(event) = rx.recv() {
        let d = dropped.swap(0, Ordering::Relaxed);
        if d > 0 {
            let mut warn = LogEntry::new(EventType::Error, Severity::Warning);
            warn.count = Some(d);
            warn.details = Some(format!("{d} log events dropped due to back-pressure"));
            jsonl.write_entry(&warn);
        }

        if matches!(event, ActivityEvent::Shutdown) {
            break;
        }

        seen += 1;
        if seen % RECOVERY_INTERVAL == 0 && jsonl.state() != "normal" {
            jsonl.try_recover();
        }
        jsonl.write_entry(&event_to_log_entry(&event));

        #[cfg(feature = "sqlite")]
        if let Some(db) = &sqlite {
            let activity_ok = db.log_activity(&event_to_activity_row(&event)).is_ok();
            let verdict_ok = event_to_verdict_row(&event)
                .as_ref()
                .is_none_or(|row| db.log_verdict(row).is_ok());
            if activity_ok && verdict_ok {
                sqlite_failures = 0;
            } else {
                sqlite_failures += 1;
                if sqlite_failures >= 3 {
                    eprintln!("[IG-DUAL] SQLite write failed {sqlite_failures} times, disabling");
                    sqlite = None;
                }
            }
        }
    }

    jsonl.flush();
    jsonl.fsync();
}

// ──────────────────── event conversion ────────────────────

fn scoped(event: EventType, severity: Severity, version_set: &str) -> LogEntry {
    let mut e = LogEntry::new(event, severity);
    e.version_set = Some(version_set.to_string());
    e
}

#[allow(clippy::too_many_lines)]
fn event_to_log_entry(event: &ActivityEvent) -> LogEntry {
    match event {
        ActivityEvent::EngineStarted {
            version,
            config_hash,
        } => {
            let mut e = LogEntry::new(EventType::EngineStart, Severity::Info);
            e.details = Some(format!("version={version} config_hash={config_hash}"));
            e.ok = Some(true);
            e
        }
        ActivityEvent::EngineStopped { reason, processed } => {
            let mut e = LogEntry::new(EventType::EngineStop, Severity::Info);
            e.count = Some(*processed);
            e.details = Some(format!("reason={reason}"));
            e.ok = Some(true);
            e
        }
        ActivityEvent::ScenariosDiscovered {
            version_set,
            selected,
            added,
        } => {
            let mut e = scoped(EventType::ScenariosDiscovered, Severity::Info, version_set);
            e.count = u64::try_from(*selected).ok();
            if !added.is_empty() {
                e.details = Some(format!("added={}", added.join(",")));
            }
            e
        }
        ActivityEvent::TestRunLaunched {
            version_set,
            scenario,
            test_run,
            generation,
            already_existed,
        } => {
            let mut e = scoped(EventType::TestRunLaunch, Severity::Info, version_set);
            e.scenario = Some(scenario.clone());
            e.test_run = Some(test_run.clone());
            e.generation = Some(*generation);
            e.ok = Some(true);
            if *already_existed {
                e.details = Some("run already existed".to_string());
            }
            e
        }
        ActivityEvent::LaunchFailed {
            version_set,
            scenario,
            code,
            message,
        } => {
            let mut e = scoped(EventType::LaunchFailure, Severity::Warning, version_set);
            e.scenario = Some(scenario.clone());
            e.ok = Some(false);
            e.error_code = Some(code.clone());
            e.error_message = Some(message.clone());
            e
        }
        ActivityEvent::ReservedParamDropped {
            version_set,
            scenario,
            param,
        } => {
            let mut e = scoped(EventType::ReservedParamDropped, Severity::Warning, version_set);
            e.scenario = Some(scenario.clone());
            e.details = Some(format!("param {param} collides with the reserved name"));
            e
        }
        ActivityEvent::StatusRecorded {
            version_set,
            scenario,
            status,
            detail,
            test_run,
            generation,
        } => {
            let mut e = scoped(EventType::StatusRecorded, Severity::Info, version_set);
            e.scenario = Some(scenario.clone());
            e.status = Some(status.as_str().to_string());
            e.test_run.clone_from(test_run);
            e.generation = Some(*generation);
            e.details = Some(detail.clone());
            e
        }
        ActivityEvent::UpdateRejected {
            version_set,
            scenario,
            test_run,
            reason,
        } => {
            let mut e = scoped(EventType::UpdateRejected, Severity::Info, version_set);
            e.scenario = Some(scenario.clone());
            e.test_run = Some(test_run.clone());
            e.details = Some(reason.as_str().to_string());
            e
        }
        ActivityEvent::RerunApplied {
            version_set,
            scope,
            reset,
            unknown,
        } => {
            let mut e = scoped(EventType::RerunApplied, Severity::Info, version_set);
            e.count = u64::try_from(reset.len()).ok();
            let mut details = format!("scope={scope} reset={}", reset.join(","));
            if !unknown.is_empty() {
                let _ = write!(details, " unknown={}", unknown.join(","));
            }
            e.details = Some(details);
            e
        }
        ActivityEvent::TestingFinished {
            version_set,
            passed,
            summary,
        } => {
            let mut e = scoped(EventType::TestingFinished, Severity::Info, version_set);
            e.ok = Some(*passed);
            e.details = Some(summary.clone());
            e
        }
        ActivityEvent::ConflictRetry {
            version_set,
            attempts,
            exhausted,
        } => {
            let severity = if *exhausted {
                Severity::Warning
            } else {
                Severity::Info
            };
            let mut e = scoped(EventType::ConflictRetry, severity, version_set);
            e.attempts = Some(*attempts);
            e.ok = Some(!exhausted);
            e
        }
        ActivityEvent::PublishFailed {
            version_set,
            scenario,
            code,
            message,
        } => {
            let mut e = scoped(EventType::PublishFailure, Severity::Warning, version_set);
            e.scenario = Some(scenario.clone());
            e.ok = Some(false);
            e.error_code = Some(code.clone());
            e.error_message = Some(message.clone());
            e
        }
        ActivityEvent::Error { code, message } => {
            let mut e = LogEntry::new(EventType::Error, Severity::Critical);
            e.error_code = Some(code.clone());
            e.error_message = Some(message.clone());
            e.ok = Some(false);
            e
        }
        ActivityEvent::Shutdown => LogEntry::new(EventType::EngineStop, Severity::Info),
    }
}

#[cfg(feature = "sqlite")]
fn event_to_activity_row(event: &ActivityEvent) -> ActivityRow {
    let entry = event_to_log_entry(event);
    ActivityRow {
        timestamp: entry.ts,
        event_type: entry.event.as_str().to_string(),
        severity: entry.severity.as_str().to_string(),
        version_set: entry.version_set,
        scenario: entry.scenario,
        test_run: entry.test_run,
        attempts: entry.attempts.map(i64::from),
        success: i32::from(entry.ok.unwrap_or(true)),
        error_code: entry.error_code,
        error_message: entry.error_message,
        details: entry.details.or(entry.status),
    }
}

#[cfg(feature = "sqlite")]
fn event_to_verdict_row(event: &ActivityEvent) -> Option<VerdictRow> {
    match event {
        ActivityEvent::StatusRecorded {
            version_set,
            scenario,
            status,
            detail,
            test_run,
            generation,
        } => Some(VerdictRow {
            timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            version_set: version_set.clone(),
            scenario: scenario.clone(),
            status: status.as_str().to_string(),
            detail: detail.clone(),
            test_run: test_run.clone(),
            generation: i64::try_from(*generation).ok(),
        }),
        _ => None,
    }
}
