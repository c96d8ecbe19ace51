//! Test-run construction and submission.
//!
//! Run names are a pure function of (version set, scenario, generation), so
//! two workers launching the same attempt submit the same name and the
//! execution engine's idempotent submit collapses them into one run.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::core::config::LauncherConfig;
use crate::core::errors::{GateError, Result};
use crate::model::scenario::{Param, ParamValue, ScenarioDefinition};
use crate::model::test_run::{PROTECTIVE_HOLD, RunOwner, TestRunSpec};
use crate::model::version_set::VersionSet;
use crate::platform::collaborators::{ExecutionEngine, SubmitOutcome};

/// Upper bound on object names in the execution engine.
pub const MAX_RUN_NAME_LEN: usize = 63;
/// Hex characters of the attempt digest kept in a run name.
const DIGEST_HEX_LEN: usize = 10;

static RUN_NAME_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").ok());

/// A ready-to-submit run plus what had to be left out of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub spec: TestRunSpec,
    /// Scenario params dropped because they collide with the reserved name.
    pub dropped_params: Vec<String>,
}

impl LaunchPlan {
    #[must_use]
    pub fn run_name(&self) -> &str {
        &self.spec.name
    }
}

/// Deterministic run name for one attempt of `scenario` against `version_set`.
pub fn run_name(prefix: &str, version_set: &str, scenario: &str, generation: u64) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(version_set.as_bytes());
    hasher.update([0]);
    hasher.update(scenario.as_bytes());
    hasher.update([0]);
    hasher.update(generation.to_be_bytes());
    let digest = hasher.finalize();
    let mut suffix = String::with_capacity(DIGEST_HEX_LEN);
    for byte in digest.iter().take(DIGEST_HEX_LEN / 2) {
        let _ = write!(suffix, "{byte:02x}");
    }

    let stem: String = format!("{prefix}{scenario}")
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                c
            } else {
                '-'
            }
        })
        .collect();
    let room = MAX_RUN_NAME_LEN - DIGEST_HEX_LEN - 1;
    let stem = stem
        .get(..room.min(stem.len()))
        .unwrap_or(&stem)
        .trim_matches('-');

    let name = if stem.is_empty() {
        format!("run-{suffix}")
    } else {
        format!("{stem}-{suffix}")
    };
    if !RUN_NAME_RE.as_ref().is_some_and(|re| re.is_match(&name)) {
        return Err(GateError::Launch {
            scenario: scenario.to_string(),
            details: format!("generated run name {name:?} is not a valid object name"),
        });
    }
    Ok(name)
}

/// Build the run for `scenario` at `generation`. Pure; nothing is submitted.
pub fn build_spec(
    version_set: &VersionSet,
    scenario: &ScenarioDefinition,
    generation: u64,
    config: &LauncherConfig,
) -> Result<LaunchPlan> {
    let name = run_name(
        &config.run_name_prefix,
        &version_set.id,
        &scenario.name,
        generation,
    )?;

    let snapshot = serde_json::to_string(&version_set.components).map_err(|error| {
        GateError::Launch {
            scenario: scenario.name.clone(),
            details: format!("version set components do not serialize: {error}"),
        }
    })?;

    let mut params = vec![Param::new(
        config.reserved_param_name.clone(),
        ParamValue::Single(snapshot),
    )];
    let mut dropped_params = Vec::new();
    for param in &scenario.params {
        if param.name == config.reserved_param_name {
            dropped_params.push(param.name.clone());
        } else {
            params.push(param.clone());
        }
    }

    let owner = RunOwner {
        version_set: version_set.id.clone(),
        scenario: scenario.name.clone(),
        generation,
    };
    Ok(LaunchPlan {
        spec: TestRunSpec {
            name,
            labels: owner.to_labels(&version_set.application),
            source: scenario.source.clone(),
            params,
            holds: BTreeSet::from([PROTECTIVE_HOLD.to_string()]),
        },
        dropped_params,
    })
}

/// Submits planned runs to the execution engine.
pub struct TestRunLauncher<'a> {
    executor: &'a dyn ExecutionEngine,
    config: &'a LauncherConfig,
}

impl<'a> TestRunLauncher<'a> {
    pub fn new(executor: &'a dyn ExecutionEngine, config: &'a LauncherConfig) -> Self {
        Self { executor, config }
    }

    /// Submit a plan. A run that already exists under the plan's name is ours.
    pub fn submit(&self, plan: &LaunchPlan) -> Result<SubmitOutcome> {
        self.executor.submit(&plan.spec)
    }

    /// Build and submit in one step. Returns the run name.
    pub fn launch(
        &self,
        version_set: &VersionSet,
        scenario: &ScenarioDefinition,
        generation: u64,
    ) -> Result<String> {
        let plan = build_spec(version_set, scenario, generation, self.config)?;
        self.submit(&plan)?;
        Ok(plan.spec.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::SystemClock;
    use crate::model::scenario::ExecutionSource;
    use crate::model::test_run::{LABEL_GENERATION, LABEL_SCENARIO, LABEL_VERSION_SET};
    use crate::model::version_set::ComponentRef;
    use crate::platform::memory::MemoryExecutionEngine;
    use chrono::Utc;
    use std::sync::Arc;

    fn version_set() -> VersionSet {
        VersionSet::new(
            "shop-vs-42",
            "shop",
            "push",
            vec![ComponentRef {
                name: "frontend".into(),
                container_image: "quay.io/shop/frontend@sha256:abc".into(),
                source: None,
            }],
            Utc::now(),
        )
    }

    fn scenario(params: Vec<Param>) -> ScenarioDefinition {
        ScenarioDefinition {
            name: "login-test".into(),
            application: "shop".into(),
            source: ExecutionSource {
                resolver: "git".into(),
                params: vec![Param::new("url", ParamValue::single("https://git.example/t"))],
            },
            params,
            contexts: Vec::new(),
            valid: true,
            optional: false,
        }
    }

    #[test]
    fn run_name_is_deterministic_per_attempt() {
        let a = run_name("", "vs-1", "login-test", 0).unwrap();
        let b = run_name("", "vs-1", "login-test", 0).unwrap();
        let rerun = run_name("", "vs-1", "login-test", 1).unwrap();
        let other = run_name("", "vs-2", "login-test", 0).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, rerun);
        assert_ne!(a, other);
        assert!(a.starts_with("login-test-"));
        assert_eq!(a.len(), "login-test-".len() + DIGEST_HEX_LEN);
    }

    #[test]
    fn run_name_is_sanitized_and_bounded() {
        let long = "Very_Long.Scenario".repeat(8);
        let name = run_name("ci-", "vs-1", &long, 3).unwrap();
        assert!(name.len() <= MAX_RUN_NAME_LEN);
        assert!(name.starts_with("ci-very-long-scenario"));
        assert!(!name.contains('_') && !name.contains('.'));

        let odd = run_name("", "vs-1", "___", 0).unwrap();
        assert!(odd.starts_with("run-"));
    }

    #[test]
    fn spec_carries_snapshot_labels_and_hold() {
        let config = LauncherConfig::default();
        let plan = build_spec(
            &version_set(),
            &scenario(vec![Param::new("TIMEOUT", ParamValue::single("30m"))]),
            2,
            &config,
        )
        .unwrap();

        assert!(plan.dropped_params.is_empty());
        assert_eq!(plan.spec.params[0].name, "SNAPSHOT");
        let ParamValue::Single(snapshot) = &plan.spec.params[0].value else {
            panic!("snapshot must be a single value");
        };
        assert!(snapshot.contains("quay.io/shop/frontend"));
        assert_eq!(plan.spec.params[1].name, "TIMEOUT");
        assert_eq!(plan.spec.labels[LABEL_VERSION_SET], "shop-vs-42");
        assert_eq!(plan.spec.labels[LABEL_SCENARIO], "login-test");
        assert_eq!(plan.spec.labels[LABEL_GENERATION], "2");
        assert!(plan.spec.holds.contains(PROTECTIVE_HOLD));
    }

    #[test]
    fn reserved_param_cannot_be_overridden() {
        let config = LauncherConfig::default();
        let plan = build_spec(
            &version_set(),
            &scenario(vec![Param::new("SNAPSHOT", ParamValue::single("{}"))]),
            0,
            &config,
        )
        .unwrap();

        assert_eq!(plan.dropped_params, ["SNAPSHOT"]);
        let snapshots: Vec<_> = plan
            .spec
            .params
            .iter()
            .filter(|p| p.name == "SNAPSHOT")
            .collect();
        assert_eq!(snapshots.len(), 1);
        assert_ne!(snapshots[0].value, ParamValue::single("{}"));
    }

    #[test]
    fn reserved_name_follows_config() {
        let config = LauncherConfig {
            reserved_param_name: "VERSION_SET".into(),
            run_name_prefix: String::new(),
        };
        let plan = build_spec(
            &version_set(),
            &scenario(vec![Param::new("SNAPSHOT", ParamValue::single("kept"))]),
            0,
            &config,
        )
        .unwrap();
        assert!(plan.dropped_params.is_empty());
        assert_eq!(plan.spec.params[0].name, "VERSION_SET");
        assert_eq!(plan.spec.params.len(), 2);
    }

    #[test]
    fn launch_submits_once_per_name() {
        let engine = MemoryExecutionEngine::new(Arc::new(SystemClock));
        let config = LauncherConfig::default();
        let launcher = TestRunLauncher::new(&engine, &config);
        let vs = version_set();
        let s = scenario(Vec::new());

        let first = launcher.launch(&vs, &s, 0).unwrap();
        let second = launcher.launch(&vs, &s, 0).unwrap();
        assert_eq!(first, second);
        assert_eq!(engine.submissions(), 1);
    }

    #[test]
    fn rejected_submission_is_a_launch_error() {
        let engine = MemoryExecutionEngine::new(Arc::new(SystemClock));
        engine.reject_scenario("login-test");
        let config = LauncherConfig::default();
        let err = TestRunLauncher::new(&engine, &config)
            .launch(&version_set(), &scenario(Vec::new()), 0)
            .unwrap_err();
        assert!(matches!(err, GateError::Launch { .. }));
        assert!(!err.is_retryable());
    }
}
