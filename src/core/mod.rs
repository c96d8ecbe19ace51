//! Core types: errors, configuration, the injectable clock.

pub mod clock;
pub mod config;
pub mod errors;
