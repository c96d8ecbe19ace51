//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use integration_gate::prelude::*;
//! ```

// Core
pub use crate::core::clock::{Clock, ManualClock, SystemClock};
pub use crate::core::config::Config;
pub use crate::core::errors::{GateError, Result};

// Model
pub use crate::model::scenario::{ExecutionSource, Param, ParamValue, ScenarioDefinition};
pub use crate::model::test_run::{RunOwner, TestRunObservation, TestRunSpec};
pub use crate::model::version_set::{RerunScope, TestingFinished, TestingOutcome, VersionSet};

// Status map
pub use crate::status::map::{StatusMap, StatusMapEntry, StatusUpdate, TestStatus};

// Engine
pub use crate::engine::orchestrator::{
    ObserveOutcome, ObserveReport, Orchestrator, ReconcileReport,
};
pub use crate::engine::workers::{PoolStats, ReconcilePool, ReconcileRequest};

// Collaborators
pub use crate::platform::collaborators::{
    Collaborators, ExecutionEngine, ScenarioCatalog, StatusPublisher, VersionSetStore,
};

// Logging
pub use crate::logger::dual::{ActivityEvent, ActivityLoggerHandle, spawn_logger};
