//! In-memory collaborators with real optimistic-concurrency semantics and
//! fault injection, for tests and the `simulate` command.

#![allow(missing_docs)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::json;

use crate::core::clock::Clock;
use crate::core::errors::{GateError, Result};
use crate::model::scenario::ScenarioDefinition;
use crate::model::test_run::{LABEL_SCENARIO, LABEL_VERSION_SET, TestRunObservation, TestRunSpec};
use crate::model::version_set::{VersionSet, Versioned};
use crate::platform::collaborators::{
    ExecutionEngine, ScenarioCatalog, StatusPublisher, SubmitOutcome, VersionSetStore,
};
use crate::status::map::TestStatus;

// ──────────────────── version set store ────────────────────

/// Version set store keeping a monotonically increasing resource version.
#[derive(Debug, Default)]
pub struct MemoryVersionSetStore {
    records: RwLock<HashMap<String, Versioned<VersionSet>>>,
    next_version: AtomicU64,
    injected_conflicts: AtomicU32,
    conflicts: AtomicU64,
    writes: AtomicU64,
}

impl MemoryVersionSetStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Create or replace a record unconditionally. Returns its version.
    pub fn insert(&self, version_set: VersionSet) -> u64 {
        let version = self.bump();
        self.records.write().insert(
            version_set.id.clone(),
            Versioned {
                value: version_set,
                resource_version: version,
            },
        );
        version
    }

    /// Unconditional edit, as an external actor racing the engine would make.
    pub fn edit(&self, id: &str, edit: impl FnOnce(&mut VersionSet)) -> Result<u64> {
        let version = self.bump();
        let mut records = self.records.write();
        let record = records.get_mut(id).ok_or_else(|| GateError::NotFound {
            kind: "version set",
            name: id.to_string(),
        })?;
        edit(&mut record.value);
        record.resource_version = version;
        Ok(version)
    }

    pub fn remove(&self, id: &str) -> bool {
        self.records.write().remove(id).is_some()
    }

    /// Make the next `n` conditional writes lose their race.
    pub fn inject_conflicts(&self, n: u32) {
        self.injected_conflicts.store(n, Ordering::SeqCst);
    }

    /// Conditional writes rejected so far.
    pub fn conflicts(&self) -> u64 {
        self.conflicts.load(Ordering::SeqCst)
    }

    /// Conditional writes accepted so far.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }
}

impl VersionSetStore for MemoryVersionSetStore {
    fn get(&self, id: &str) -> Result<Versioned<VersionSet>> {
        self.records
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| GateError::NotFound {
                kind: "version set",
                name: id.to_string(),
            })
    }

    fn update(&self, expected_version: u64, version_set: VersionSet) -> Result<u64> {
        let mut records = self.records.write();
        let record = records
            .get_mut(&version_set.id)
            .ok_or_else(|| GateError::NotFound {
                kind: "version set",
                name: version_set.id.clone(),
            })?;

        let injected = self
            .injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            // Simulate a competing writer landing first.
            record.resource_version = self.bump();
        }
        if record.resource_version != expected_version {
            self.conflicts.fetch_add(1, Ordering::SeqCst);
            return Err(GateError::conflict(version_set.id));
        }

        let version = self.bump();
        record.value = version_set;
        record.resource_version = version;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(version)
    }

    fn list_by_application(&self, application: &str) -> Result<Vec<Versioned<VersionSet>>> {
        let mut found: Vec<_> = self
            .records
            .read()
            .values()
            .filter(|r| r.value.application == application)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.value.id.cmp(&b.value.id));
        Ok(found)
    }
}

// ──────────────────── scenario catalog ────────────────────

#[derive(Debug, Default)]
pub struct MemoryCatalog {
    scenarios: RwLock<Vec<ScenarioDefinition>>,
    failing: AtomicBool,
}

impl MemoryCatalog {
    #[must_use]
    pub fn new(scenarios: Vec<ScenarioDefinition>) -> Self {
        Self {
            scenarios: RwLock::new(scenarios),
            failing: AtomicBool::new(false),
        }
    }

    /// Insert or replace a definition by name.
    pub fn upsert(&self, scenario: ScenarioDefinition) {
        let mut scenarios = self.scenarios.write();
        if let Some(existing) = scenarios.iter_mut().find(|s| s.name == scenario.name) {
            *existing = scenario;
        } else {
            scenarios.push(scenario);
        }
    }

    pub fn remove(&self, name: &str) {
        self.scenarios.write().retain(|s| s.name != name);
    }

    /// Make lookups fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl ScenarioCatalog for MemoryCatalog {
    fn list_by_application(&self, application: &str) -> Result<Vec<ScenarioDefinition>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(GateError::Collaborator {
                collaborator: "scenario catalog",
                details: "catalog lookup failed".to_string(),
            });
        }
        Ok(self
            .scenarios
            .read()
            .iter()
            .filter(|s| s.application == application)
            .cloned()
            .collect())
    }
}

// ──────────────────── execution engine ────────────────────

/// Execution engine holding runs in memory; tests drive completion by hand.
pub struct MemoryExecutionEngine {
    runs: RwLock<BTreeMap<String, TestRunObservation>>,
    specs: RwLock<BTreeMap<String, TestRunSpec>>,
    rejected_scenarios: RwLock<HashSet<String>>,
    unavailable: AtomicBool,
    submissions: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl MemoryExecutionEngine {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            runs: RwLock::new(BTreeMap::new()),
            specs: RwLock::new(BTreeMap::new()),
            rejected_scenarios: RwLock::new(HashSet::new()),
            unavailable: AtomicBool::new(false),
            submissions: AtomicU64::new(0),
            clock,
        }
    }

    /// Reject every submission for `scenario`.
    pub fn reject_scenario(&self, scenario: &str) {
        self.rejected_scenarios.write().insert(scenario.to_string());
    }

    /// Fail every call as if the engine were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Runs created (not counting idempotent re-submissions).
    pub fn submissions(&self) -> u64 {
        self.submissions.load(Ordering::SeqCst)
    }

    pub fn run_names(&self) -> Vec<String> {
        self.runs.read().keys().cloned().collect()
    }

    pub fn spec(&self, name: &str) -> Option<TestRunSpec> {
        self.specs.read().get(name).cloned()
    }

    /// Runs labelled for this (version set, scenario) pair, in name order.
    pub fn runs_for(&self, version_set: &str, scenario: &str) -> Vec<TestRunObservation> {
        self.runs
            .read()
            .values()
            .filter(|run| {
                run.labels.get(LABEL_VERSION_SET).map(String::as_str) == Some(version_set)
                    && run.labels.get(LABEL_SCENARIO).map(String::as_str) == Some(scenario)
            })
            .cloned()
            .collect()
    }

    /// Finish a run with a raw result payload.
    pub fn complete(
        &self,
        name: &str,
        result: serde_json::Value,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.with_run(name, |run| {
            run.finished = true;
            run.completion_time = Some(at);
            run.result = Some(result);
        })
    }

    /// Flag a run for deletion; it disappears once no holds remain.
    pub fn request_deletion(&self, name: &str, at: DateTime<Utc>) -> Result<()> {
        self.with_run(name, |run| run.deletion_requested_at = Some(at))?;
        self.collect_garbage();
        Ok(())
    }

    /// Remove deletion-requested runs with no protective hold left.
    pub fn collect_garbage(&self) -> usize {
        let mut runs = self.runs.write();
        let before = runs.len();
        runs.retain(|_, run| !(run.deletion_requested() && run.holds.is_empty()));
        before - runs.len()
    }

    fn with_run(&self, name: &str, f: impl FnOnce(&mut TestRunObservation)) -> Result<()> {
        let mut runs = self.runs.write();
        let run = runs.get_mut(name).ok_or_else(|| GateError::NotFound {
            kind: "test run",
            name: name.to_string(),
        })?;
        f(run);
        Ok(())
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(GateError::Collaborator {
                collaborator: "execution engine",
                details: "engine unreachable".to_string(),
            });
        }
        Ok(())
    }
}

impl ExecutionEngine for MemoryExecutionEngine {
    fn submit(&self, spec: &TestRunSpec) -> Result<SubmitOutcome> {
        self.check_available()?;
        if let Some(scenario) = spec.labels.get(LABEL_SCENARIO)
            && self.rejected_scenarios.read().contains(scenario)
        {
            return Err(GateError::Launch {
                scenario: scenario.clone(),
                details: "admission webhook denied the request".to_string(),
            });
        }

        let mut runs = self.runs.write();
        if runs.contains_key(&spec.name) {
            return Ok(SubmitOutcome::AlreadyExists);
        }
        let now = self.clock.now();
        runs.insert(
            spec.name.clone(),
            TestRunObservation {
                name: spec.name.clone(),
                labels: spec.labels.clone(),
                annotations: BTreeMap::new(),
                created_at: now,
                start_time: Some(now),
                completion_time: None,
                finished: false,
                deletion_requested_at: None,
                result: None,
                holds: spec.holds.clone(),
            },
        );
        self.specs.write().insert(spec.name.clone(), spec.clone());
        self.submissions.fetch_add(1, Ordering::SeqCst);
        Ok(SubmitOutcome::Submitted)
    }

    fn get(&self, name: &str) -> Result<Option<TestRunObservation>> {
        self.check_available()?;
        Ok(self.runs.read().get(name).cloned())
    }

    fn annotate(&self, name: &str, key: &str, value: &str) -> Result<()> {
        self.check_available()?;
        self.with_run(name, |run| {
            run.annotations.insert(key.to_string(), value.to_string());
        })
    }

    fn set_protective_hold(&self, name: &str) -> Result<()> {
        self.check_available()?;
        self.with_run(name, |run| {
            run.holds
                .insert(crate::model::test_run::PROTECTIVE_HOLD.to_string());
        })
    }

    fn clear_protective_hold(&self, name: &str) -> Result<()> {
        self.check_available()?;
        {
            let mut runs = self.runs.write();
            let Some(run) = runs.get_mut(name) else {
                return Ok(());
            };
            run.holds.remove(crate::model::test_run::PROTECTIVE_HOLD);
        }
        self.collect_garbage();
        Ok(())
    }
}

/// Result payload in the shape the outcome evaluator expects.
#[must_use]
pub fn result_payload(succeeded: bool, at: DateTime<Utc>) -> serde_json::Value {
    let (result, failures) = if succeeded {
        ("SUCCESS", 0)
    } else {
        ("FAILURE", 1)
    };
    json!({
        "succeeded": succeeded,
        "tasks": [{
            "name": "run-tests",
            "test_output": {
                "result": result,
                "timestamp": at.to_rfc3339(),
                "successes": 3,
                "failures": failures,
                "warnings": 0,
            }
        }]
    })
}

// ──────────────────── publisher ────────────────────

/// One delivered notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub version_set: String,
    pub scenario: String,
    pub status: TestStatus,
    pub detail: String,
}

/// Publisher that records every notification it accepts.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    delivered: Mutex<Vec<Notification>>,
    failing: AtomicBool,
}

impl RecordingPublisher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn delivered(&self) -> Vec<Notification> {
        self.delivered.lock().clone()
    }
}

impl StatusPublisher for RecordingPublisher {
    fn notify(
        &self,
        version_set: &str,
        scenario: &str,
        status: TestStatus,
        detail: &str,
    ) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(GateError::Collaborator {
                collaborator: "status publisher",
                details: "provider API returned 502".to_string(),
            });
        }
        self.delivered.lock().push(Notification {
            version_set: version_set.to_string(),
            scenario: scenario.to_string(),
            status,
            detail: detail.to_string(),
        });
        Ok(())
    }
}
