//! VersionSet: the immutable set of component artifacts under test, plus the
//! mutable metadata bag the engine keeps its status map in.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata key carrying the encoded status map.
pub const STATUS_MAP_KEY: &str = "integration-gate/test-status";
/// Metadata key an external actor sets to request a rerun (`all` or a scenario name).
pub const RERUN_MARKER_KEY: &str = "integration-gate/rerun";
/// Marker value requesting a rerun of every scenario.
pub const RERUN_ALL: &str = "all";

/// Exact artifact reference for one component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentRef {
    pub name: String,
    pub container_image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ComponentSource>,
}

/// Where a component's artifact was built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentSource {
    pub url: String,
    pub revision: String,
}

/// Overall result recorded once every tracked scenario is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestingOutcome {
    Passed,
    Failed,
}

impl fmt::Display for TestingOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passed => write!(f, "passed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Externally visible "testing finished" marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestingFinished {
    pub at: DateTime<Utc>,
    pub outcome: TestingOutcome,
    pub message: String,
}

/// Scope of a rerun request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RerunScope {
    All,
    Scenario(String),
}

impl RerunScope {
    /// Typed extraction of a marker value. Blank markers carry no request.
    #[must_use]
    pub fn from_marker(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else if trimmed == RERUN_ALL {
            Some(Self::All)
        } else {
            Some(Self::Scenario(trimmed.to_string()))
        }
    }

    /// Marker value for this scope.
    #[must_use]
    pub fn as_marker(&self) -> &str {
        match self {
            Self::All => RERUN_ALL,
            Self::Scenario(name) => name,
        }
    }
}

impl fmt::Display for RerunScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_marker())
    }
}

/// A point-in-time set of component versions for one application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionSet {
    pub id: String,
    pub application: String,
    pub components: Vec<ComponentRef>,
    /// Kind of source event that produced this set (e.g. `push`, `pull_request`).
    pub trigger_context: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub testing_finished: Option<TestingFinished>,
}

impl VersionSet {
    pub fn new(
        id: impl Into<String>,
        application: impl Into<String>,
        trigger_context: impl Into<String>,
        components: Vec<ComponentRef>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            application: application.into(),
            components,
            trigger_context: trigger_context.into(),
            created_at,
            metadata: BTreeMap::new(),
            testing_finished: None,
        }
    }

    /// Raw encoded status map, if one was ever written.
    #[must_use]
    pub fn status_payload(&self) -> Option<&str> {
        self.metadata.get(STATUS_MAP_KEY).map(String::as_str)
    }

    pub fn set_status_payload(&mut self, payload: String) {
        self.metadata.insert(STATUS_MAP_KEY.to_string(), payload);
    }

    /// Pending rerun request left on the record, if any.
    #[must_use]
    pub fn rerun_marker(&self) -> Option<RerunScope> {
        self.metadata
            .get(RERUN_MARKER_KEY)
            .and_then(|raw| RerunScope::from_marker(raw))
    }

    pub fn set_rerun_marker(&mut self, scope: &RerunScope) {
        self.metadata
            .insert(RERUN_MARKER_KEY.to_string(), scope.as_marker().to_string());
    }

    /// Returns whether a marker was present.
    pub fn clear_rerun_marker(&mut self) -> bool {
        self.metadata.remove(RERUN_MARKER_KEY).is_some()
    }

    /// Whether testing has been marked finished.
    #[must_use]
    pub fn is_testing_finished(&self) -> bool {
        self.testing_finished.is_some()
    }
}

/// A record together with the store's optimistic-concurrency token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub value: T,
    pub resource_version: u64,
}
