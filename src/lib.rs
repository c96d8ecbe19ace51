#![forbid(unsafe_code)]

//! Integration gate (igate): drives application version sets toward a
//! "testing finished" verdict.
//!
//! For each version set the engine selects the applicable test scenarios,
//! launches one test run per scenario on an external execution engine,
//! folds run outcomes into a status map stored on the version set, and marks
//! testing finished once every scenario reached a terminal status.
//!
//! # Library usage
//!
//! ```rust,no_run
//! use integration_gate::prelude::*;
//! ```
//!
//! Individual modules can also be imported directly:
//!
//! ```rust,no_run
//! use integration_gate::engine::orchestrator::Orchestrator;
//! use integration_gate::status::map::{StatusMap, TestStatus};
//! ```

pub mod prelude;

pub mod core;
pub mod engine;
pub mod logger;
pub mod model;
pub mod platform;
pub mod status;
