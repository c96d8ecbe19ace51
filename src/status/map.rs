//! Per-version-set status map: one entry per scenario, mutated only through
//! merge operations that tolerate out-of-order and repeated observations.
//!
//! Rules enforced here:
//! - an update replaces an entry only when its timestamp is strictly newer
//! - an update tagged with a generation only lands on an entry of that generation
//! - a rerun reset bumps the generation, so late updates for the previous run
//!   are rejected instead of resurrecting it
//! - observations of the entry's own run are ordered by the run's event
//!   times, so the engine's launch stamps never outrank what the run reports

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::clock::stamp_after;

// ──────────────────── status ────────────────────

/// Lifecycle state of one scenario within a version set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Pending,
    InProgress,
    Passed,
    Failed,
    Invalid,
    Deleted,
}

impl TestStatus {
    pub const ALL: [Self; 6] = [
        Self::Pending,
        Self::InProgress,
        Self::Passed,
        Self::Failed,
        Self::Invalid,
        Self::Deleted,
    ];

    /// Terminal statuses only change through an explicit rerun.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::InProgress)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Invalid => "invalid",
            Self::Deleted => "deleted",
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ──────────────────── entry ────────────────────

/// Status of one scenario for the current lifecycle generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusMapEntry {
    pub scenario: String,
    pub status: TestStatus,
    #[serde(default)]
    pub detail: String,
    /// Run launched for this generation; `None` until claimed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_run_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
    pub last_update_time: DateTime<Utc>,
    #[serde(default)]
    pub generation: u64,
    /// Event time of the last state reported by the tracked run itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_time: Option<DateTime<Utc>>,
}

impl StatusMapEntry {
    fn pending(scenario: &str, now: DateTime<Utc>) -> Self {
        Self {
            scenario: scenario.to_string(),
            status: TestStatus::Pending,
            detail: "pending".to_string(),
            test_run_name: None,
            start_time: None,
            completion_time: None,
            last_update_time: now,
            generation: 0,
            observed_time: None,
        }
    }

    /// Pending with no run claimed yet.
    #[must_use]
    pub fn awaiting_claim(&self) -> bool {
        self.status == TestStatus::Pending && self.test_run_name.is_none()
    }

    /// Whether `run` is the current attempt's run for `generation`.
    #[must_use]
    pub fn tracks(&self, run: &str, generation: u64) -> bool {
        self.generation == generation && self.test_run_name.as_deref() == Some(run)
    }
}

// ──────────────────── updates ────────────────────

/// A proposed change to one entry, applied with [`StatusMap::update_if_newer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub scenario: String,
    pub status: TestStatus,
    pub detail: String,
    pub time: DateTime<Utc>,
    pub test_run_name: Option<String>,
    /// When set, the update only applies to an entry of this generation.
    pub generation: Option<u64>,
    pub start_time: Option<DateTime<Utc>>,
    pub completion_time: Option<DateTime<Utc>>,
}

impl StatusUpdate {
    pub fn new(
        scenario: impl Into<String>,
        status: TestStatus,
        detail: impl Into<String>,
        time: DateTime<Utc>,
    ) -> Self {
        Self {
            scenario: scenario.into(),
            status,
            detail: detail.into(),
            time,
            test_run_name: None,
            generation: None,
            start_time: None,
            completion_time: None,
        }
    }

    #[must_use]
    pub fn with_run(mut self, run: impl Into<String>) -> Self {
        self.test_run_name = Some(run.into());
        self
    }

    #[must_use]
    pub fn for_generation(mut self, generation: u64) -> Self {
        self.generation = Some(generation);
        self
    }

    #[must_use]
    pub fn started_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.start_time = at;
        self
    }

    #[must_use]
    pub fn completed_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.completion_time = at;
        self
    }
}

/// Result of a merge attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Applied,
    /// Timestamp not strictly newer than the stored entry.
    Stale,
    /// Update belongs to a generation the entry has moved past.
    Superseded,
}

impl MergeOutcome {
    #[must_use]
    pub const fn applied(self) -> bool {
        matches!(self, Self::Applied)
    }
}

// ──────────────────── map ────────────────────

/// Keyed collection of status entries for one version set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusMap {
    entries: BTreeMap<String, StatusMapEntry>,
}

/// Per-status counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusSummary {
    pub total: usize,
    pub counts: BTreeMap<TestStatus, usize>,
}

impl StatusSummary {
    #[must_use]
    pub fn count(&self, status: TestStatus) -> usize {
        self.counts.get(&status).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn terminal(&self) -> usize {
        self.counts
            .iter()
            .filter(|(status, _)| status.is_terminal())
            .map(|(_, n)| n)
            .sum()
    }
}

impl fmt::Display for StatusSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} terminal", self.terminal(), self.total)?;
        for (status, n) in &self.counts {
            write!(f, ", {status}={n}")?;
        }
        Ok(())
    }
}

impl StatusMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from decoded entries; a repeated scenario key is rejected.
    pub fn from_entries(
        entries: impl IntoIterator<Item = StatusMapEntry>,
    ) -> std::result::Result<Self, String> {
        let mut map = BTreeMap::new();
        for entry in entries {
            if entry.scenario.trim().is_empty() {
                return Err("entry with empty scenario name".to_string());
            }
            if map.contains_key(&entry.scenario) {
                return Err(format!("duplicate entry for scenario {}", entry.scenario));
            }
            map.insert(entry.scenario.clone(), entry);
        }
        Ok(Self { entries: map })
    }

    #[must_use]
    pub fn get(&self, scenario: &str) -> Option<&StatusMapEntry> {
        self.entries.get(scenario)
    }

    /// Entries ordered by scenario name.
    pub fn iter(&self) -> impl Iterator<Item = &StatusMapEntry> {
        self.entries.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add a Pending entry for every name not yet present. Returns the names added.
    pub fn init_entries<'a>(
        &mut self,
        names: impl IntoIterator<Item = &'a str>,
        now: DateTime<Utc>,
    ) -> Vec<String> {
        let mut added = Vec::new();
        for name in names {
            if !self.entries.contains_key(name) {
                self.entries
                    .insert(name.to_string(), StatusMapEntry::pending(name, now));
                added.push(name.to_string());
            }
        }
        added
    }

    /// Merge an update: absent entries are created, present ones replaced only
    /// when the update is strictly newer and of the same generation.
    pub fn update_if_newer(&mut self, update: StatusUpdate) -> MergeOutcome {
        let Some(entry) = self.entries.get_mut(&update.scenario) else {
            let entry = StatusMapEntry {
                scenario: update.scenario.clone(),
                status: update.status,
                detail: update.detail,
                test_run_name: update.test_run_name,
                start_time: update.start_time,
                completion_time: update.completion_time,
                last_update_time: update.time,
                generation: update.generation.unwrap_or(0),
                observed_time: None,
            };
            self.entries.insert(update.scenario, entry);
            return MergeOutcome::Applied;
        };

        if update.generation.is_some_and(|g| g != entry.generation) {
            return MergeOutcome::Superseded;
        }
        if update.time <= entry.last_update_time {
            return MergeOutcome::Stale;
        }

        if update
            .test_run_name
            .as_ref()
            .is_some_and(|run| entry.test_run_name.as_ref() != Some(run))
        {
            entry.observed_time = None;
        }
        let time = update.time;
        apply(entry, update, time);
        MergeOutcome::Applied
    }

    /// Merge an observation reported by the entry's tracked run.
    ///
    /// Ordering is judged against the run's previously observed event time.
    /// Before the first observation any state of the run replaces a
    /// non-terminal entry; at an equal event time a terminal state replaces a
    /// non-terminal one. The stored `last_update_time` never moves backwards.
    pub fn observe_run(&mut self, update: StatusUpdate) -> MergeOutcome {
        let Some(entry) = self.entries.get_mut(&update.scenario) else {
            return MergeOutcome::Superseded;
        };
        let tracked = update.test_run_name.is_some()
            && update.test_run_name == entry.test_run_name
            && update.generation.is_none_or(|g| g == entry.generation);
        if !tracked {
            return MergeOutcome::Superseded;
        }

        let newer = match entry.observed_time {
            None => !entry.status.is_terminal(),
            Some(previous) => {
                update.time > previous
                    || (update.time == previous
                        && update.status.is_terminal()
                        && !entry.status.is_terminal())
            }
        };
        if !newer {
            return MergeOutcome::Stale;
        }

        entry.observed_time = Some(update.time);
        let time = stamp_after(entry.last_update_time, update.time);
        apply(entry, update, time);
        MergeOutcome::Applied
    }

    /// Start a new lifecycle generation for `scenario`. Returns the new generation.
    pub fn reset_for_rerun(&mut self, scenario: &str, now: DateTime<Utc>) -> Option<u64> {
        let entry = self.entries.get_mut(scenario)?;
        entry.status = TestStatus::Pending;
        entry.detail = "rerun requested".to_string();
        entry.test_run_name = None;
        entry.start_time = None;
        entry.completion_time = None;
        entry.observed_time = None;
        entry.last_update_time = stamp_after(entry.last_update_time, now);
        entry.generation += 1;
        Some(entry.generation)
    }

    /// Record `run` as the run about to be launched for a Pending, unclaimed
    /// entry of `generation`. Returns false when the entry is not claimable.
    pub fn claim_launch(
        &mut self,
        scenario: &str,
        run: &str,
        generation: u64,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(entry) = self.entries.get_mut(scenario) else {
            return false;
        };
        if !entry.awaiting_claim() || entry.generation != generation {
            return false;
        }
        entry.test_run_name = Some(run.to_string());
        entry.detail = "test run launch pending".to_string();
        entry.last_update_time = stamp_after(entry.last_update_time, now);
        true
    }

    /// Every selected scenario has an entry and every entry is terminal.
    pub fn is_converged<'a>(&self, selected: impl IntoIterator<Item = &'a str>) -> bool {
        selected
            .into_iter()
            .all(|name| self.entries.contains_key(name))
            && self.entries.values().all(|e| e.status.is_terminal())
    }

    #[must_use]
    pub fn summary(&self) -> StatusSummary {
        let mut summary = StatusSummary {
            total: self.entries.len(),
            counts: BTreeMap::new(),
        };
        for entry in self.entries.values() {
            *summary.counts.entry(entry.status).or_insert(0) += 1;
        }
        summary
    }
}

fn apply(entry: &mut StatusMapEntry, update: StatusUpdate, time: DateTime<Utc>) {
    entry.status = update.status;
    entry.detail = update.detail;
    entry.last_update_time = time;
    if update.test_run_name.is_some() {
        entry.test_run_name = update.test_run_name;
    }
    if update.start_time.is_some() {
        entry.start_time = update.start_time;
    }
    if update.completion_time.is_some() {
        entry.completion_time = update.completion_time;
    }
}
