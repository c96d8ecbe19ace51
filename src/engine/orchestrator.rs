//! Reconciliation state machine for one version set.
//!
//! Every entry point re-derives what to do from the stored status map, so
//! running any of them twice, concurrently, or after a crash is harmless:
//!
//! - Discover: select scenarios, add Pending entries, consume a rerun marker,
//!   and claim a deterministic run name for each unclaimed Pending entry.
//! - Launch: submit every claimed Pending entry (idempotent), then record
//!   InProgress, or Invalid when the submission is rejected.
//! - Observe: evaluate a run and merge the verdict under the timestamp and
//!   generation guards; release the run's protective hold once recorded.
//! - Converge-check: mark testing finished once every entry is terminal.
//! - Rerun: reset targeted terminal entries into a new generation.
//!
//! The status map is the only shared state. Each write goes through
//! [`mutate_version_set`], which redoes the mutation on a fresh copy after a
//! lost race.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::core::clock::stamp_after;
use crate::core::config::Config;
use crate::core::errors::{GateError, Result};
use crate::engine::evaluator::evaluate;
use crate::engine::launcher::{TestRunLauncher, build_spec};
use crate::engine::retry::{Change, Mutation, RetryPolicy, mutate_version_set};
use crate::engine::selector::ScenarioSelector;
use crate::logger::dual::{ActivityEvent, ActivityLoggerHandle, RejectReason};
use crate::model::scenario::ScenarioDefinition;
use crate::model::test_run::{ANNOTATION_RECORDED_STATUS, RunOwner, TestRunObservation};
use crate::model::version_set::{RerunScope, TestingFinished, TestingOutcome, VersionSet};
use crate::platform::collaborators::{Collaborators, SubmitOutcome};
use crate::status::codec;
use crate::status::map::{MergeOutcome, StatusMap, StatusSummary, StatusUpdate, TestStatus};

const DETAIL_NOT_APPLICABLE: &str = "scenario no longer applicable";
const DETAIL_LAUNCHED: &str = "test run launched";

// ──────────────────── reports ────────────────────

/// A run submitted during Launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRecord {
    pub scenario: String,
    pub test_run: String,
    pub generation: u64,
    pub already_existed: bool,
}

/// A submission the execution engine refused; the entry is now Invalid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchFailure {
    pub scenario: String,
    pub code: &'static str,
    pub detail: String,
}

/// What a rerun request did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RerunReport {
    pub scope: RerunScope,
    /// Entries moved into a new generation (or created, for a selected
    /// scenario that had none).
    pub reset: Vec<String>,
    /// Targeted entries left alone because they are still Pending/InProgress.
    pub active: Vec<String>,
    /// Names that are not currently selected. Their entries, if any, are
    /// left untouched.
    pub unknown: Vec<String>,
}

/// Outcome of one [`Orchestrator::reconcile_version_set`] pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub version_set: String,
    pub selected: Vec<String>,
    /// Entries created by this pass.
    pub added: Vec<String>,
    /// Unclaimed Pending entries whose scenario is no longer selected.
    pub invalidated: Vec<String>,
    pub rerun: Option<RerunReport>,
    pub launched: Vec<LaunchRecord>,
    pub launch_failures: Vec<LaunchFailure>,
    /// Testing-finished was marked by this pass.
    pub finished_now: bool,
    pub converged: bool,
    pub summary: StatusSummary,
}

/// How an observed run was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObserveOutcome {
    /// The verdict was merged into the status map.
    Recorded(TestStatus),
    /// The map already holds something at least as new.
    Stale,
    /// The run belongs to an older generation or is not the tracked run.
    Superseded,
    /// The run carries no usable ownership labels.
    Unowned,
    /// The execution engine no longer knows the run.
    RunGone,
    /// The owning version set no longer exists.
    VersionSetGone,
}

/// Outcome of one [`Orchestrator::reconcile_test_run_event`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObserveReport {
    pub test_run: String,
    pub owner: Option<RunOwner>,
    pub outcome: ObserveOutcome,
    pub hold_cleared: bool,
    pub hold_restored: bool,
    pub finished_now: bool,
}

impl ObserveReport {
    fn new(test_run: &str, owner: Option<RunOwner>, outcome: ObserveOutcome) -> Self {
        Self {
            test_run: test_run.to_string(),
            owner,
            outcome,
            hold_cleared: false,
            hold_restored: false,
            finished_now: false,
        }
    }
}

// ──────────────────── internal mutation results ────────────────────

#[derive(Debug, Default)]
struct Discovery {
    added: Vec<String>,
    invalidated: Vec<String>,
    /// Entries whose run could not even be built.
    rejected: Vec<LaunchFailure>,
    rerun: Option<RerunReport>,
}

/// Result of submitting one claimed entry.
struct Submission {
    scenario: String,
    test_run: String,
    generation: u64,
    already_existed: bool,
    result: std::result::Result<(), (&'static str, String)>,
}

/// A status written by the engine itself, for logging and publishing.
#[derive(Debug, Clone)]
struct Recorded {
    scenario: String,
    status: TestStatus,
    detail: String,
    test_run: Option<String>,
    generation: u64,
}

#[derive(Debug, Default)]
struct Finalized {
    recorded: Vec<Recorded>,
    finished: Option<TestingFinished>,
}

// ──────────────────── orchestrator ────────────────────

/// Drives version sets toward "testing finished".
#[derive(Clone)]
pub struct Orchestrator {
    collaborators: Collaborators,
    config: Config,
    retry: RetryPolicy,
    logger: ActivityLoggerHandle,
}

impl Orchestrator {
    pub fn new(collaborators: Collaborators, config: Config, logger: ActivityLoggerHandle) -> Self {
        let retry = RetryPolicy::from_config(&config.engine);
        Self {
            collaborators,
            config,
            retry,
            logger,
        }
    }

    /// Replace the conflict retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn logger(&self) -> &ActivityLoggerHandle {
        &self.logger
    }

    /// Current decoded status map of a version set.
    pub fn status_map(&self, version_set: &str) -> Result<StatusMap> {
        let record = self.collaborators.store.get(version_set)?;
        codec::read_from(&record.value)
    }

    /// Discover, launch and converge-check one version set. Consumes a rerun
    /// marker left on the record.
    pub fn reconcile_version_set(&self, id: &str) -> Result<ReconcileReport> {
        self.reconcile(id, None)
    }

    /// Re-reconcile every version set of `application`, as needed after its
    /// scenario catalog changed. Every version set is attempted; the first
    /// failure is returned once all have run.
    pub fn reconcile_application(&self, application: &str) -> Result<Vec<ReconcileReport>> {
        let records = self.collaborators.store.list_by_application(application)?;
        let mut reports = Vec::with_capacity(records.len());
        let mut first_error = None;
        for record in records {
            match self.reconcile_version_set(&record.value.id) {
                Ok(report) => reports.push(report),
                // Deleted since it was listed.
                Err(GateError::NotFound { .. }) => {}
                Err(error) => {
                    self.logger.send(ActivityEvent::error(&error));
                    first_error.get_or_insert(error);
                }
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(reports),
        }
    }

    /// Reset the targeted entries into a new generation, then launch them.
    pub fn request_rerun(&self, id: &str, scope: RerunScope) -> Result<ReconcileReport> {
        self.reconcile(id, Some(scope))
    }

    fn reconcile(&self, id: &str, requested: Option<RerunScope>) -> Result<ReconcileReport> {
        let record = self.collaborators.store.get(id)?;
        let selected = ScenarioSelector::new(self.collaborators.catalog.as_ref())
            .select(&record.value)?;
        let selected_names: Vec<String> = selected.iter().map(|s| s.name.clone()).collect();

        // Discover (+ rerun) and claim in one write.
        let discovered = self.mutate(id, |vs| {
            let now = self.collaborators.clock.now();
            let mut map = codec::read_from(vs)?;
            let before = map.clone();
            let mut discovery = Discovery::default();

            let marker = vs.rerun_marker();
            let marker_present = vs.clear_rerun_marker();
            let mut reset_any = false;
            for scope in [marker, requested.clone()].into_iter().flatten() {
                let report = apply_rerun(&mut map, &scope, &selected_names, now);
                reset_any |= !report.reset.is_empty();
                discovery.rerun = Some(match discovery.rerun.take() {
                    Some(earlier) => merge_rerun(earlier, report),
                    None => report,
                });
            }

            discovery.added = map.init_entries(selected_names.iter().map(String::as_str), now);
            discovery.invalidated = invalidate_inapplicable(&mut map, &selected_names, now);

            for scenario in &selected {
                let Some(entry) = map.get(&scenario.name) else {
                    continue;
                };
                if !entry.awaiting_claim() {
                    continue;
                }
                let generation = entry.generation;
                match build_spec(vs, scenario, generation, &self.config.launcher) {
                    Ok(plan) => {
                        map.claim_launch(&scenario.name, plan.run_name(), generation, now);
                    }
                    Err(error) => {
                        let last = entry.last_update_time;
                        let update = StatusUpdate::new(
                            scenario.name.clone(),
                            TestStatus::Invalid,
                            error.to_string(),
                            stamp_after(last, now),
                        )
                        .for_generation(generation);
                        if map.update_if_newer(update).applied() {
                            discovery.rejected.push(LaunchFailure {
                                scenario: scenario.name.clone(),
                                code: error.code(),
                                detail: error.to_string(),
                            });
                        }
                    }
                }
            }

            let finished_cleared = (reset_any || !discovery.added.is_empty())
                && vs.testing_finished.take().is_some();
            if map == before && !marker_present && !finished_cleared {
                return Ok(Change::Unchanged(discovery));
            }
            codec::write_to(vs, &map)?;
            Ok(Change::Write(discovery))
        })?;

        let discovery = discovered.value;
        self.logger.send(ActivityEvent::ScenariosDiscovered {
            version_set: id.to_string(),
            selected: selected.len(),
            added: discovery.added.clone(),
        });
        if let Some(rerun) = &discovery.rerun {
            self.logger.send(ActivityEvent::RerunApplied {
                version_set: id.to_string(),
                scope: rerun.scope.to_string(),
                reset: rerun.reset.clone(),
                unknown: rerun.unknown.clone(),
            });
        }
        for scenario in &discovery.invalidated {
            self.publish(id, scenario, TestStatus::Invalid, DETAIL_NOT_APPLICABLE);
        }
        for failure in &discovery.rejected {
            self.logger.send(ActivityEvent::LaunchFailed {
                version_set: id.to_string(),
                scenario: failure.scenario.clone(),
                code: failure.code.to_string(),
                message: failure.detail.clone(),
            });
            self.publish(id, &failure.scenario, TestStatus::Invalid, &failure.detail);
        }

        // Launch every claimed Pending entry.
        let map = codec::read_from(&discovered.version_set)?;
        let (submissions, orphans, launch_error) =
            self.submit_claimed(&discovered.version_set, &map, &selected);

        // Record launch results and converge-check in one write.
        let finalized = self.mutate(id, |vs| {
            let now = self.collaborators.clock.now();
            let mut map = codec::read_from(vs)?;
            let mut finalized = Finalized::default();

            for submission in &submissions {
                let (status, detail) = match &submission.result {
                    Ok(()) => (TestStatus::InProgress, DETAIL_LAUNCHED.to_string()),
                    Err((_, detail)) => (TestStatus::Invalid, detail.clone()),
                };
                if let Some(recorded) = record_launch_result(
                    &mut map,
                    &submission.scenario,
                    &submission.test_run,
                    submission.generation,
                    status,
                    &detail,
                    now,
                ) {
                    finalized.recorded.push(recorded);
                }
            }
            for (scenario, run, generation) in &orphans {
                if let Some(recorded) = record_launch_result(
                    &mut map,
                    scenario,
                    run,
                    *generation,
                    TestStatus::Invalid,
                    DETAIL_NOT_APPLICABLE,
                    now,
                ) {
                    finalized.recorded.push(recorded);
                }
            }

            finalized.finished = mark_if_converged(vs, &map, &selected, now);
            if finalized.recorded.is_empty() && finalized.finished.is_none() {
                return Ok(Change::Unchanged(finalized));
            }
            codec::write_to(vs, &map)?;
            Ok(Change::Write(finalized))
        })?;

        let mut launched = Vec::new();
        let mut launch_failures = discovery.rejected;
        for submission in submissions {
            match submission.result {
                Ok(()) => launched.push(LaunchRecord {
                    scenario: submission.scenario,
                    test_run: submission.test_run,
                    generation: submission.generation,
                    already_existed: submission.already_existed,
                }),
                Err((code, detail)) => launch_failures.push(LaunchFailure {
                    scenario: submission.scenario,
                    code,
                    detail,
                }),
            }
        }
        for record in &finalized.value.recorded {
            self.log_recorded(id, record);
            self.publish(id, &record.scenario, record.status, &record.detail);
        }
        let finished_now = self.log_finished(id, finalized.value.finished.as_ref());

        if let Some(error) = launch_error {
            return Err(error);
        }

        let map = codec::read_from(&finalized.version_set)?;
        Ok(ReconcileReport {
            version_set: id.to_string(),
            converged: map.is_converged(selected_names.iter().map(String::as_str)),
            summary: map.summary(),
            selected: selected_names,
            added: discovery.added,
            invalidated: discovery.invalidated,
            rerun: discovery.rerun,
            launched,
            launch_failures,
            finished_now,
        })
    }

    /// Submit each claimed Pending entry. Returns the submissions made, claimed
    /// entries whose scenario vanished and whose run never materialized, and
    /// the first retryable failure (those entries stay claimed for next time).
    fn submit_claimed(
        &self,
        version_set: &VersionSet,
        map: &StatusMap,
        selected: &[ScenarioDefinition],
    ) -> (Vec<Submission>, Vec<(String, String, u64)>, Option<GateError>) {
        let launcher = TestRunLauncher::new(
            self.collaborators.executor.as_ref(),
            &self.config.launcher,
        );
        let mut submissions = Vec::new();
        let mut orphans = Vec::new();
        let mut first_error = None;

        for entry in map.iter() {
            if entry.status != TestStatus::Pending {
                continue;
            }
            let Some(run) = entry.test_run_name.clone() else {
                continue;
            };
            let Some(scenario) = selected.iter().find(|s| s.name == entry.scenario) else {
                match self.collaborators.executor.get(&run) {
                    Ok(None) => orphans.push((entry.scenario.clone(), run, entry.generation)),
                    Ok(Some(_)) => {}
                    Err(error) => {
                        first_error.get_or_insert(error);
                    }
                }
                continue;
            };

            let result = build_spec(version_set, scenario, entry.generation, &self.config.launcher)
                .and_then(|mut plan| {
                    for param in &plan.dropped_params {
                        self.logger.send(ActivityEvent::ReservedParamDropped {
                            version_set: version_set.id.clone(),
                            scenario: scenario.name.clone(),
                            param: param.clone(),
                        });
                    }
                    // The claimed name is authoritative even if naming config changed since.
                    plan.spec.name.clone_from(&run);
                    launcher.submit(&plan)
                });

            match result {
                Ok(outcome) => {
                    self.logger.send(ActivityEvent::TestRunLaunched {
                        version_set: version_set.id.clone(),
                        scenario: scenario.name.clone(),
                        test_run: run.clone(),
                        generation: entry.generation,
                        already_existed: outcome == SubmitOutcome::AlreadyExists,
                    });
                    submissions.push(Submission {
                        scenario: scenario.name.clone(),
                        test_run: run,
                        generation: entry.generation,
                        already_existed: outcome == SubmitOutcome::AlreadyExists,
                        result: Ok(()),
                    });
                }
                Err(error) if error.is_retryable() => {
                    first_error.get_or_insert(error);
                }
                Err(error) => {
                    self.logger.send(ActivityEvent::LaunchFailed {
                        version_set: version_set.id.clone(),
                        scenario: scenario.name.clone(),
                        code: error.code().to_string(),
                        message: error.to_string(),
                    });
                    submissions.push(Submission {
                        scenario: scenario.name.clone(),
                        test_run: run,
                        generation: entry.generation,
                        already_existed: false,
                        result: Err((error.code(), error.to_string())),
                    });
                }
            }
        }
        (submissions, orphans, first_error)
    }

    /// Observe one run: merge its verdict, maintain its protective hold, and
    /// converge-check the owning version set once the verdict is terminal.
    pub fn reconcile_test_run_event(&self, run: &str) -> Result<ObserveReport> {
        let Some(observation) = self.collaborators.executor.get(run)? else {
            return Ok(ObserveReport::new(run, None, ObserveOutcome::RunGone));
        };
        let owner = match RunOwner::from_labels(run, &observation.labels) {
            Ok(owner) => owner,
            Err(error) => {
                self.logger.send(ActivityEvent::error(&error));
                return Ok(ObserveReport::new(run, None, ObserveOutcome::Unowned));
            }
        };

        let verdict = evaluate(&observation);
        let update = StatusUpdate::new(
            owner.scenario.clone(),
            verdict.status,
            verdict.detail.clone(),
            observation.event_time(),
        )
        .with_run(run)
        .for_generation(owner.generation)
        .started_at(observation.start_time)
        .completed_at(observation.completion_time);

        let merged = self.mutate(&owner.version_set, |vs| {
            let mut map = codec::read_from(vs)?;
            let tracked = map
                .get(&owner.scenario)
                .is_some_and(|entry| entry.tracks(run, owner.generation));
            if !tracked {
                return Ok(Change::Unchanged(MergeOutcome::Superseded));
            }
            let outcome = map.observe_run(update.clone());
            if !outcome.applied() {
                return Ok(Change::Unchanged(outcome));
            }
            codec::write_to(vs, &map)?;
            Ok(Change::Write(outcome))
        });
        let merged = match merged {
            Ok(merged) => merged,
            Err(GateError::NotFound { .. }) => {
                let mut report =
                    ObserveReport::new(run, Some(owner), ObserveOutcome::VersionSetGone);
                report.hold_cleared = self.release_hold(&observation)?;
                return Ok(report);
            }
            Err(error) => return Err(error),
        };

        let version_set = owner.version_set.clone();
        let outcome = match merged.value {
            MergeOutcome::Applied => ObserveOutcome::Recorded(verdict.status),
            MergeOutcome::Stale => ObserveOutcome::Stale,
            MergeOutcome::Superseded => ObserveOutcome::Superseded,
        };
        let map = codec::read_from(&merged.version_set)?;
        let current = map
            .get(&owner.scenario)
            .filter(|entry| entry.tracks(run, owner.generation));
        // The entry for this run holds a terminal status: nothing left to protect.
        let settled = current.is_some_and(|entry| entry.status.is_terminal());
        let running = current.is_some_and(|entry| !entry.status.is_terminal());
        let mut report = ObserveReport::new(run, Some(owner.clone()), outcome.clone());

        match outcome {
            ObserveOutcome::Recorded(status) => {
                self.log_recorded(
                    &version_set,
                    &Recorded {
                        scenario: owner.scenario.clone(),
                        status,
                        detail: verdict.detail.clone(),
                        test_run: Some(run.to_string()),
                        generation: owner.generation,
                    },
                );
                self.publish(&version_set, &owner.scenario, status, &verdict.detail);
                if status.is_terminal() {
                    self.annotate_recorded(&observation, status);
                }
            }
            ObserveOutcome::Stale | ObserveOutcome::Superseded => {
                self.logger.send(ActivityEvent::UpdateRejected {
                    version_set: version_set.clone(),
                    scenario: owner.scenario.clone(),
                    test_run: run.to_string(),
                    reason: if outcome == ObserveOutcome::Superseded {
                        RejectReason::Superseded
                    } else {
                        RejectReason::Stale
                    },
                });
            }
            _ => {}
        }

        if settled || report.outcome == ObserveOutcome::Superseded {
            report.hold_cleared = self.release_hold(&observation)?;
        } else if running && !verdict.status.is_terminal() && !observation.has_protective_hold() {
            self.collaborators.executor.set_protective_hold(run)?;
            report.hold_restored = true;
        }

        if settled {
            let selected = ScenarioSelector::new(self.collaborators.catalog.as_ref())
                .select(&merged.version_set)?;
            let finished = self.mutate(&version_set, |vs| {
                let now = self.collaborators.clock.now();
                let map = codec::read_from(vs)?;
                Ok(match mark_if_converged(vs, &map, &selected, now) {
                    Some(finished) => Change::Write(Some(finished)),
                    None => Change::Unchanged(None),
                })
            })?;
            report.finished_now = self.log_finished(&version_set, finished.value.as_ref());
        }

        Ok(report)
    }

    /// [`mutate_version_set`] under this engine's retry policy, logging lost races.
    fn mutate<T, F>(&self, id: &str, mutate: F) -> Result<Mutation<T>>
    where
        F: FnMut(&mut VersionSet) -> Result<Change<T>>,
    {
        match mutate_version_set(self.collaborators.store.as_ref(), id, &self.retry, mutate) {
            Ok(mutation) => {
                if mutation.attempts > 1 {
                    self.logger.send(ActivityEvent::ConflictRetry {
                        version_set: id.to_string(),
                        attempts: mutation.attempts,
                        exhausted: false,
                    });
                }
                Ok(mutation)
            }
            Err(error) => {
                if let GateError::Conflict { attempts, .. } = &error {
                    self.logger.send(ActivityEvent::ConflictRetry {
                        version_set: id.to_string(),
                        attempts: *attempts,
                        exhausted: true,
                    });
                }
                Err(error)
            }
        }
    }

    /// Best-effort notification of a newly recorded terminal status; failures
    /// are logged and otherwise ignored.
    fn publish(&self, version_set: &str, scenario: &str, status: TestStatus, detail: &str) {
        if !status.is_terminal() {
            return;
        }
        if let Err(error) =
            self.collaborators
                .publisher
                .notify(version_set, scenario, status, detail)
        {
            self.logger.send(ActivityEvent::PublishFailed {
                version_set: version_set.to_string(),
                scenario: scenario.to_string(),
                code: error.code().to_string(),
                message: error.to_string(),
            });
        }
    }

    fn annotate_recorded(&self, observation: &TestRunObservation, status: TestStatus) {
        if observation
            .annotations
            .get(ANNOTATION_RECORDED_STATUS)
            .is_some_and(|recorded| recorded == status.as_str())
        {
            return;
        }
        if let Err(error) = self.collaborators.executor.annotate(
            &observation.name,
            ANNOTATION_RECORDED_STATUS,
            status.as_str(),
        ) {
            self.logger.send(ActivityEvent::error(&error));
        }
    }

    fn release_hold(&self, observation: &TestRunObservation) -> Result<bool> {
        if !observation.has_protective_hold() {
            return Ok(false);
        }
        self.collaborators
            .executor
            .clear_protective_hold(&observation.name)?;
        Ok(true)
    }

    fn log_recorded(&self, version_set: &str, recorded: &Recorded) {
        self.logger.send(ActivityEvent::StatusRecorded {
            version_set: version_set.to_string(),
            scenario: recorded.scenario.clone(),
            status: recorded.status,
            detail: recorded.detail.clone(),
            test_run: recorded.test_run.clone(),
            generation: recorded.generation,
        });
    }

    fn log_finished(&self, version_set: &str, finished: Option<&TestingFinished>) -> bool {
        let Some(finished) = finished else {
            return false;
        };
        self.logger.send(ActivityEvent::TestingFinished {
            version_set: version_set.to_string(),
            passed: finished.outcome == TestingOutcome::Passed,
            summary: finished.message.clone(),
        });
        true
    }
}

// ──────────────────── status map transitions ────────────────────

/// Reset every targeted terminal entry into a new generation.
///
/// `All` targets the selected scenarios. A selected scenario without an entry
/// gets a fresh Pending one. Names that are not selected are reported unknown,
/// since a reset entry for them could never launch.
fn apply_rerun(
    map: &mut StatusMap,
    scope: &RerunScope,
    selected: &[String],
    now: DateTime<Utc>,
) -> RerunReport {
    let targets: Vec<String> = match scope {
        RerunScope::All => selected.to_vec(),
        RerunScope::Scenario(name) => vec![name.clone()],
    };
    let mut report = RerunReport {
        scope: scope.clone(),
        reset: Vec::new(),
        active: Vec::new(),
        unknown: Vec::new(),
    };
    for name in targets {
        if !selected.contains(&name) {
            report.unknown.push(name);
            continue;
        }
        match map.get(&name).map(|entry| entry.status) {
            Some(status) if !status.is_terminal() => report.active.push(name),
            Some(_) => {
                map.reset_for_rerun(&name, now);
                report.reset.push(name);
            }
            None => {
                map.init_entries([name.as_str()], now);
                report.reset.push(name);
            }
        }
    }
    report
}

/// Combine a marker-driven rerun with an explicitly requested one.
fn merge_rerun(earlier: RerunReport, later: RerunReport) -> RerunReport {
    let scope = if earlier.scope == RerunScope::All {
        RerunScope::All
    } else {
        later.scope
    };
    let reset: BTreeSet<String> = earlier.reset.into_iter().chain(later.reset).collect();
    let active: BTreeSet<String> = earlier
        .active
        .into_iter()
        .chain(later.active)
        .filter(|name| !reset.contains(name))
        .collect();
    let unknown: BTreeSet<String> = earlier.unknown.into_iter().chain(later.unknown).collect();
    RerunReport {
        scope,
        reset: reset.into_iter().collect(),
        active: active.into_iter().collect(),
        unknown: unknown.into_iter().collect(),
    }
}

/// Mark never-claimed Pending entries of unselected scenarios Invalid.
fn invalidate_inapplicable(
    map: &mut StatusMap,
    selected: &[String],
    now: DateTime<Utc>,
) -> Vec<String> {
    let stale: Vec<(String, u64, DateTime<Utc>)> = map
        .iter()
        .filter(|entry| entry.awaiting_claim() && !selected.contains(&entry.scenario))
        .map(|entry| {
            (
                entry.scenario.clone(),
                entry.generation,
                entry.last_update_time,
            )
        })
        .collect();

    let mut invalidated = Vec::new();
    for (scenario, generation, last) in stale {
        let update = StatusUpdate::new(
            scenario.clone(),
            TestStatus::Invalid,
            DETAIL_NOT_APPLICABLE,
            stamp_after(last, now),
        )
        .for_generation(generation);
        if map.update_if_newer(update).applied() {
            invalidated.push(scenario);
        }
    }
    invalidated
}

/// Record the result of submitting `run`, provided the entry still waits on it.
///
/// InProgress is stamped one tick after the claim. States the run reports
/// later are ordered by the run's own event times (see [`StatusMap::observe_run`]).
fn record_launch_result(
    map: &mut StatusMap,
    scenario: &str,
    run: &str,
    generation: u64,
    status: TestStatus,
    detail: &str,
    now: DateTime<Utc>,
) -> Option<Recorded> {
    let entry = map.get(scenario)?;
    if entry.status != TestStatus::Pending || !entry.tracks(run, generation) {
        return None;
    }
    let last = entry.last_update_time;
    let update = if status == TestStatus::InProgress {
        StatusUpdate::new(scenario, status, detail, stamp_after(last, last))
            .with_run(run)
            .started_at(Some(now))
    } else {
        StatusUpdate::new(scenario, status, detail, stamp_after(last, now))
    }
    .for_generation(generation);

    map.update_if_newer(update).applied().then(|| Recorded {
        scenario: scenario.to_string(),
        status,
        detail: detail.to_string(),
        test_run: Some(run.to_string()),
        generation,
    })
}

/// Set `testing_finished` the first time the map converges.
///
/// The outcome is Passed iff every selected, non-optional scenario Passed.
fn mark_if_converged(
    version_set: &mut VersionSet,
    map: &StatusMap,
    selected: &[ScenarioDefinition],
    now: DateTime<Utc>,
) -> Option<TestingFinished> {
    if version_set.is_testing_finished()
        || !map.is_converged(selected.iter().map(|s| s.name.as_str()))
    {
        return None;
    }
    let passed = selected
        .iter()
        .filter(|scenario| !scenario.optional)
        .all(|scenario| {
            map.get(&scenario.name)
                .is_some_and(|entry| entry.status == TestStatus::Passed)
        });
    let outcome = if passed {
        TestingOutcome::Passed
    } else {
        TestingOutcome::Failed
    };
    let finished = TestingFinished {
        at: now,
        outcome,
        message: format!("{outcome}: {}", map.summary()),
    };
    version_set.testing_finished = Some(finished.clone());
    Some(finished)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use chrono::Duration;

    use crate::core::clock::{Clock, ManualClock};
    use crate::model::scenario::ExecutionSource;
    use crate::model::test_run::{PROTECTIVE_HOLD, TestRunSpec};
    use crate::platform::collaborators::{ExecutionEngine, VersionSetStore};
    use crate::platform::memory::{
        MemoryCatalog, MemoryExecutionEngine, MemoryVersionSetStore, RecordingPublisher,
        result_payload,
    };
    use crate::status::map::StatusMapEntry;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn scenario(name: &str) -> ScenarioDefinition {
        ScenarioDefinition {
            name: name.into(),
            application: "shop".into(),
            source: ExecutionSource {
                resolver: "git".into(),
                params: Vec::new(),
            },
            params: Vec::new(),
            contexts: Vec::new(),
            valid: true,
            optional: false,
        }
    }

    struct Harness {
        store: Arc<MemoryVersionSetStore>,
        engine: Arc<MemoryExecutionEngine>,
        publisher: Arc<RecordingPublisher>,
        clock: Arc<ManualClock>,
        orchestrator: Orchestrator,
    }

    impl Harness {
        fn new(scenarios: Vec<ScenarioDefinition>) -> Self {
            Self::with_version_set(
                scenarios,
                VersionSet::new("vs-1", "shop", "push", Vec::new(), t0()),
            )
        }

        fn with_version_set(scenarios: Vec<ScenarioDefinition>, version_set: VersionSet) -> Self {
            let clock = Arc::new(ManualClock::new(t0()));
            let store = Arc::new(MemoryVersionSetStore::new());
            store.insert(version_set);
            let engine = Arc::new(MemoryExecutionEngine::new(clock.clone()));
            let publisher = Arc::new(RecordingPublisher::new());
            let collaborators = Collaborators::new(
                store.clone(),
                Arc::new(MemoryCatalog::new(scenarios)),
                engine.clone(),
            )
            .with_publisher(publisher.clone())
            .with_clock(clock.clone());
            let orchestrator = Orchestrator::new(
                collaborators,
                Config::default(),
                ActivityLoggerHandle::detached(),
            )
            .with_retry_policy(RetryPolicy::immediate(5));
            Self {
                store,
                engine,
                publisher,
                clock,
                orchestrator,
            }
        }

        fn entry(&self, scenario: &str) -> StatusMapEntry {
            self.orchestrator
                .status_map("vs-1")
                .unwrap()
                .get(scenario)
                .cloned()
                .unwrap()
        }

        fn finish(&self, scenario: &str, succeeded: bool) -> String {
            let run = self.entry(scenario).test_run_name.unwrap();
            self.clock.advance(Duration::seconds(30));
            let now = self.clock.now();
            self.engine
                .complete(&run, result_payload(succeeded, now), now)
                .unwrap();
            run
        }

        fn version_set(&self) -> VersionSet {
            self.store.get("vs-1").unwrap().value
        }
    }

    #[test]
    fn discovery_launches_each_scenario_once() {
        let h = Harness::new(vec![scenario("login-test"), scenario("checkout-test")]);

        let first = h.orchestrator.reconcile_version_set("vs-1").unwrap();
        assert_eq!(first.selected, ["checkout-test", "login-test"]);
        assert_eq!(first.added.len(), 2);
        assert_eq!(first.launched.len(), 2);

        let second = h.orchestrator.reconcile_version_set("vs-1").unwrap();
        assert!(second.added.is_empty());
        assert!(second.launched.is_empty());
        assert_eq!(h.engine.submissions(), 2);

        let entry = h.entry("login-test");
        assert_eq!(entry.status, TestStatus::InProgress);
        assert_eq!(entry.detail, DETAIL_LAUNCHED);
        assert!(entry.test_run_name.unwrap().starts_with("login-test-"));
    }

    #[test]
    fn completed_run_is_recorded_and_released() {
        let h = Harness::new(vec![scenario("login-test")]);
        h.orchestrator.reconcile_version_set("vs-1").unwrap();
        let run = h.finish("login-test", true);

        let report = h.orchestrator.reconcile_test_run_event(&run).unwrap();
        assert_eq!(report.outcome, ObserveOutcome::Recorded(TestStatus::Passed));
        assert!(report.hold_cleared);
        assert!(report.finished_now);

        let observed = h.engine.get(&run).unwrap().unwrap();
        assert!(!observed.holds.contains(PROTECTIVE_HOLD));
        assert_eq!(observed.annotations[ANNOTATION_RECORDED_STATUS], "passed");

        let finished = h.version_set().testing_finished.unwrap();
        assert_eq!(finished.outcome, TestingOutcome::Passed);

        let statuses: Vec<TestStatus> = h.publisher.delivered().iter().map(|n| n.status).collect();
        assert_eq!(statuses, [TestStatus::Passed]);

        let again = h.orchestrator.reconcile_test_run_event(&run).unwrap();
        assert_eq!(again.outcome, ObserveOutcome::Stale);
        assert!(!again.finished_now);
    }

    #[test]
    fn converge_marks_failed_outcome_once() {
        let h = Harness::new(vec![scenario("login-test"), scenario("checkout-test")]);
        h.orchestrator.reconcile_version_set("vs-1").unwrap();

        let login = h.finish("login-test", true);
        let report = h.orchestrator.reconcile_test_run_event(&login).unwrap();
        assert!(!report.finished_now);
        assert!(!h.version_set().is_testing_finished());

        let checkout = h.finish("checkout-test", false);
        let report = h.orchestrator.reconcile_test_run_event(&checkout).unwrap();
        assert!(report.finished_now);
        let finished = h.version_set().testing_finished.unwrap();
        assert_eq!(finished.outcome, TestingOutcome::Failed);
        assert!(finished.message.starts_with("failed: 2/2 terminal"));

        h.clock.advance(Duration::minutes(1));
        let rerun = h.orchestrator.reconcile_version_set("vs-1").unwrap();
        assert!(!rerun.finished_now);
        assert_eq!(h.version_set().testing_finished.unwrap().at, finished.at);
    }

    #[test]
    fn optional_failure_does_not_fail_outcome() {
        let mut flaky = scenario("flaky-test");
        flaky.optional = true;
        let h = Harness::new(vec![scenario("login-test"), flaky]);
        h.orchestrator.reconcile_version_set("vs-1").unwrap();

        let login = h.finish("login-test", true);
        h.orchestrator.reconcile_test_run_event(&login).unwrap();
        let flaky = h.finish("flaky-test", false);
        h.orchestrator.reconcile_test_run_event(&flaky).unwrap();

        let finished = h.version_set().testing_finished.unwrap();
        assert_eq!(finished.outcome, TestingOutcome::Passed);
    }

    #[test]
    fn rejected_launch_is_invalid_and_converges() {
        let h = Harness::new(vec![scenario("login-test")]);
        h.engine.reject_scenario("login-test");

        let report = h.orchestrator.reconcile_version_set("vs-1").unwrap();
        assert!(report.launched.is_empty());
        assert_eq!(report.launch_failures.len(), 1);
        assert_eq!(report.launch_failures[0].code, "IG-2003");
        assert!(report.finished_now);
        assert!(report.converged);

        let entry = h.entry("login-test");
        assert_eq!(entry.status, TestStatus::Invalid);
        assert!(entry.detail.contains("admission webhook denied"));
        assert_eq!(
            h.version_set().testing_finished.unwrap().outcome,
            TestingOutcome::Failed
        );
    }

    #[test]
    fn unavailable_engine_keeps_claim_for_retry() {
        let h = Harness::new(vec![scenario("login-test")]);
        h.engine.set_unavailable(true);

        let err = h.orchestrator.reconcile_version_set("vs-1").unwrap_err();
        assert!(err.is_retryable());
        let claimed = h.entry("login-test");
        assert_eq!(claimed.status, TestStatus::Pending);
        let claimed_run = claimed.test_run_name.unwrap();

        h.engine.set_unavailable(false);
        let report = h.orchestrator.reconcile_version_set("vs-1").unwrap();
        assert_eq!(report.launched.len(), 1);
        assert_eq!(report.launched[0].test_run, claimed_run);
        assert_eq!(h.engine.submissions(), 1);
    }

    #[test]
    fn rerun_launches_new_generation_and_supersedes_old_run() {
        let h = Harness::new(vec![scenario("login-test")]);
        h.orchestrator.reconcile_version_set("vs-1").unwrap();
        let old_run = h.finish("login-test", false);
        h.orchestrator.reconcile_test_run_event(&old_run).unwrap();
        assert!(h.version_set().is_testing_finished());

        h.clock.advance(Duration::seconds(5));
        let report = h
            .orchestrator
            .request_rerun("vs-1", RerunScope::Scenario("login-test".into()))
            .unwrap();
        let rerun = report.rerun.unwrap();
        assert_eq!(rerun.reset, ["login-test"]);
        assert_eq!(report.launched.len(), 1);
        assert_eq!(report.launched[0].generation, 1);
        assert_ne!(report.launched[0].test_run, old_run);
        assert!(!h.version_set().is_testing_finished());

        let stale = h.orchestrator.reconcile_test_run_event(&old_run).unwrap();
        assert_eq!(stale.outcome, ObserveOutcome::Superseded);
        assert_eq!(h.entry("login-test").status, TestStatus::InProgress);
    }

    #[test]
    fn rerun_of_active_or_unknown_entries_changes_nothing() {
        let h = Harness::new(vec![scenario("login-test")]);
        h.orchestrator.reconcile_version_set("vs-1").unwrap();
        let before = h.entry("login-test");

        let report = h.orchestrator.request_rerun("vs-1", RerunScope::All).unwrap();
        assert_eq!(report.rerun.as_ref().unwrap().active, ["login-test"]);
        let report = h
            .orchestrator
            .request_rerun("vs-1", RerunScope::Scenario("nope".into()))
            .unwrap();
        assert_eq!(report.rerun.unwrap().unknown, ["nope"]);
        assert_eq!(h.entry("login-test"), before);
    }

    #[test]
    fn rerun_marker_is_consumed() {
        let h = Harness::new(vec![scenario("login-test")]);
        h.orchestrator.reconcile_version_set("vs-1").unwrap();
        let run = h.finish("login-test", true);
        h.orchestrator.reconcile_test_run_event(&run).unwrap();

        h.store
            .edit("vs-1", |vs| vs.set_rerun_marker(&RerunScope::All))
            .unwrap();
        let report = h.orchestrator.reconcile_version_set("vs-1").unwrap();
        assert_eq!(report.rerun.unwrap().reset, ["login-test"]);
        assert!(h.version_set().rerun_marker().is_none());
        assert_eq!(h.entry("login-test").generation, 1);
    }

    #[test]
    fn unclaimed_entry_of_retired_scenario_is_invalidated() {
        let mut vs = VersionSet::new("vs-1", "shop", "push", Vec::new(), t0());
        let mut map = StatusMap::new();
        map.init_entries(["retired-test"], t0());
        codec::write_to(&mut vs, &map).unwrap();
        let h = Harness::with_version_set(vec![scenario("login-test")], vs);

        let report = h.orchestrator.reconcile_version_set("vs-1").unwrap();
        assert_eq!(report.invalidated, ["retired-test"]);
        let entry = h.entry("retired-test");
        assert_eq!(entry.status, TestStatus::Invalid);
        assert_eq!(entry.detail, DETAIL_NOT_APPLICABLE);
        assert!(entry.last_update_time > t0());
    }

    #[test]
    fn run_of_deleted_version_set_only_loses_hold() {
        let h = Harness::new(vec![scenario("login-test")]);
        h.orchestrator.reconcile_version_set("vs-1").unwrap();
        let run = h.entry("login-test").test_run_name.unwrap();
        h.store.remove("vs-1");

        let report = h.orchestrator.reconcile_test_run_event(&run).unwrap();
        assert_eq!(report.outcome, ObserveOutcome::VersionSetGone);
        assert!(report.hold_cleared);
        assert!(!h.engine.get(&run).unwrap().unwrap().has_protective_hold());
    }

    #[test]
    fn lost_hold_is_restored_on_running_run() {
        let h = Harness::new(vec![scenario("login-test")]);
        h.orchestrator.reconcile_version_set("vs-1").unwrap();
        let run = h.entry("login-test").test_run_name.unwrap();
        h.engine.clear_protective_hold(&run).unwrap();

        let report = h.orchestrator.reconcile_test_run_event(&run).unwrap();
        assert!(report.hold_restored);
        assert!(h.engine.get(&run).unwrap().unwrap().has_protective_hold());
    }

    #[test]
    fn unlabelled_and_missing_runs_are_ignored() {
        let h = Harness::new(vec![scenario("login-test")]);
        h.engine
            .submit(&TestRunSpec {
                name: "stray".into(),
                labels: BTreeMap::new(),
                source: ExecutionSource {
                    resolver: "git".into(),
                    params: Vec::new(),
                },
                params: Vec::new(),
                holds: BTreeSet::new(),
            })
            .unwrap();

        let stray = h.orchestrator.reconcile_test_run_event("stray").unwrap();
        assert_eq!(stray.outcome, ObserveOutcome::Unowned);
        let gone = h.orchestrator.reconcile_test_run_event("never-existed").unwrap();
        assert_eq!(gone.outcome, ObserveOutcome::RunGone);
        assert_eq!(h.store.writes(), 0);
    }

    #[test]
    fn merged_reruns_keep_union_of_resets() {
        let earlier = RerunReport {
            scope: RerunScope::All,
            reset: vec!["a".into()],
            active: vec!["b".into()],
            unknown: Vec::new(),
        };
        let later = RerunReport {
            scope: RerunScope::Scenario("a".into()),
            reset: Vec::new(),
            active: vec!["a".into()],
            unknown: vec!["zzz".into()],
        };
        let merged = merge_rerun(earlier, later);
        assert_eq!(merged.scope, RerunScope::All);
        assert_eq!(merged.reset, ["a"]);
        assert_eq!(merged.active, ["b"]);
        assert_eq!(merged.unknown, ["zzz"]);
    }
}
