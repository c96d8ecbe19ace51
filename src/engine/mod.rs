//! Reconciliation engine: scenario selection, outcome evaluation, run
//! launching, the orchestration state machine and its worker pool.

pub mod evaluator;
pub mod launcher;
pub mod orchestrator;
pub mod retry;
pub mod selector;
pub mod workers;
