//! Collaborator traits: the external systems the engine reads from and writes to.

#![allow(missing_docs)]

use std::sync::Arc;

use crate::core::clock::{Clock, SystemClock};
use crate::core::errors::Result;
use crate::model::scenario::ScenarioDefinition;
use crate::model::test_run::{TestRunObservation, TestRunSpec};
use crate::model::version_set::{VersionSet, Versioned};
use crate::status::map::TestStatus;

/// Long-lived record of version sets with optimistic concurrency.
pub trait VersionSetStore: Send + Sync {
    /// Read a version set; may be served from a cache.
    fn get(&self, id: &str) -> Result<Versioned<VersionSet>>;

    /// Read the authoritative latest copy, used after a lost write race.
    fn get_latest(&self, id: &str) -> Result<Versioned<VersionSet>> {
        self.get(id)
    }

    /// Conditional write: succeeds only if the stored version still equals
    /// `expected_version`, otherwise fails with `GateError::Conflict`.
    fn update(&self, expected_version: u64, version_set: VersionSet) -> Result<u64>;

    fn list_by_application(&self, application: &str) -> Result<Vec<Versioned<VersionSet>>>;
}

/// Catalog of scenario definitions.
pub trait ScenarioCatalog: Send + Sync {
    fn list_by_application(&self, application: &str) -> Result<Vec<ScenarioDefinition>>;
}

/// Outcome of an idempotent submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Submitted,
    /// A run with the same name already exists; it is treated as ours.
    AlreadyExists,
}

/// Engine that actually executes test runs.
pub trait ExecutionEngine: Send + Sync {
    /// Create a run. Submitting an existing name is not an error.
    fn submit(&self, spec: &TestRunSpec) -> Result<SubmitOutcome>;

    /// Current state of a run, or `None` if it no longer exists.
    fn get(&self, name: &str) -> Result<Option<TestRunObservation>>;

    fn annotate(&self, name: &str, key: &str, value: &str) -> Result<()>;

    fn set_protective_hold(&self, name: &str) -> Result<()>;

    fn clear_protective_hold(&self, name: &str) -> Result<()>;
}

/// Reports recorded verdicts to interested parties. Invoked only for newly
/// recorded terminal statuses; delivery is best effort.
pub trait StatusPublisher: Send + Sync {
    fn notify(
        &self,
        version_set: &str,
        scenario: &str,
        status: TestStatus,
        detail: &str,
    ) -> Result<()>;
}

/// Publisher that discards everything.
#[derive(Debug, Default)]
pub struct NoopPublisher;

impl StatusPublisher for NoopPublisher {
    fn notify(&self, _: &str, _: &str, _: TestStatus, _: &str) -> Result<()> {
        Ok(())
    }
}

/// Bundle of collaborators shared by every reconciliation worker.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn VersionSetStore>,
    pub catalog: Arc<dyn ScenarioCatalog>,
    pub executor: Arc<dyn ExecutionEngine>,
    pub publisher: Arc<dyn StatusPublisher>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// Bundle with a no-op publisher and the system clock.
    pub fn new(
        store: Arc<dyn VersionSetStore>,
        catalog: Arc<dyn ScenarioCatalog>,
        executor: Arc<dyn ExecutionEngine>,
    ) -> Self {
        Self {
            store,
            catalog,
            executor,
            publisher: Arc::new(NoopPublisher),
            clock: Arc::new(SystemClock),
        }
    }

    #[must_use]
    pub fn with_publisher(mut self, publisher: Arc<dyn StatusPublisher>) -> Self {
        self.publisher = publisher;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}
