//! Typed boundary structures for the external records the engine reads and writes.

pub mod scenario;
pub mod test_run;
pub mod version_set;
