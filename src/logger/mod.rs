//! Activity logging: JSONL append-only with graceful degradation, plus an
//! optional SQLite (WAL) sink for activity rows and verdict history.

pub mod dual;
pub mod jsonl;
#[cfg(feature = "sqlite")]
pub mod sqlite;
