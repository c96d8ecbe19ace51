//! TestRun: one execution of a scenario against a version set, as submitted
//! to and observed from the execution engine.

#![allow(missing_docs)]

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::errors::{GateError, Result};
use crate::model::scenario::{ExecutionSource, Param};

/// Label naming the owning version set.
pub const LABEL_VERSION_SET: &str = "integration-gate/version-set";
/// Label naming the scenario the run executes.
pub const LABEL_SCENARIO: &str = "integration-gate/scenario";
/// Label carrying the status-entry generation the run was launched for.
pub const LABEL_GENERATION: &str = "integration-gate/generation";
/// Label naming the owning application.
pub const LABEL_APPLICATION: &str = "integration-gate/application";
/// Annotation written once the run's terminal outcome is recorded.
pub const ANNOTATION_RECORDED_STATUS: &str = "integration-gate/recorded-status";
/// Protective hold preventing deletion before the outcome is recorded.
pub const PROTECTIVE_HOLD: &str = "integration-gate/test-run-hold";

/// Everything the execution engine needs to create a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRunSpec {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub source: ExecutionSource,
    pub params: Vec<Param>,
    pub holds: BTreeSet<String>,
}

/// Snapshot of a run's state as reported by the execution engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRunObservation {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub completion_time: Option<DateTime<Utc>>,
    pub finished: bool,
    pub deletion_requested_at: Option<DateTime<Utc>>,
    /// Raw result payload, present once the run has produced one.
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub holds: BTreeSet<String>,
}

impl TestRunObservation {
    #[must_use]
    pub fn deletion_requested(&self) -> bool {
        self.deletion_requested_at.is_some()
    }

    #[must_use]
    pub fn has_protective_hold(&self) -> bool {
        self.holds.contains(PROTECTIVE_HOLD)
    }

    /// Timestamp of the state this observation reports, used as the merge key.
    #[must_use]
    pub fn event_time(&self) -> DateTime<Utc> {
        if self.finished {
            return self.completion_time.unwrap_or(self.created_at);
        }
        if let Some(deleted_at) = self.deletion_requested_at {
            return deleted_at;
        }
        self.start_time.unwrap_or(self.created_at)
    }
}

/// Owning (version set, scenario, generation) of a run, extracted from its labels.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunOwner {
    pub version_set: String,
    pub scenario: String,
    pub generation: u64,
}

impl RunOwner {
    /// Typed extraction from run labels; runs lacking them are not ours.
    pub fn from_labels(run: &str, labels: &BTreeMap<String, String>) -> Result<Self> {
        let get = |key: &str| {
            labels
                .get(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| GateError::UnownedTestRun {
                    run: run.to_string(),
                    details: format!("missing label {key}"),
                })
        };
        let version_set = get(LABEL_VERSION_SET)?.clone();
        let scenario = get(LABEL_SCENARIO)?.clone();
        let raw_generation = get(LABEL_GENERATION)?;
        let generation =
            raw_generation
                .parse::<u64>()
                .map_err(|error| GateError::UnownedTestRun {
                    run: run.to_string(),
                    details: format!("{LABEL_GENERATION}={raw_generation:?}: {error}"),
                })?;
        Ok(Self {
            version_set,
            scenario,
            generation,
        })
    }

    /// Labels identifying this owner on a new run.
    #[must_use]
    pub fn to_labels(&self, application: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_VERSION_SET.to_string(), self.version_set.clone()),
            (LABEL_SCENARIO.to_string(), self.scenario.clone()),
            (LABEL_GENERATION.to_string(), self.generation.to_string()),
            (LABEL_APPLICATION.to_string(), application.to_string()),
        ])
    }
}
