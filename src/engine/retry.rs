//! Optimistic-concurrency retry: read, mutate a copy, conditional write, and
//! on a lost race re-read the latest copy and redo the mutation.

use std::thread;
use std::time::Duration;

use rand::Rng;

use crate::core::config::EngineConfig;
use crate::core::errors::{GateError, Result};
use crate::model::version_set::VersionSet;
use crate::platform::collaborators::VersionSetStore;

/// Bounded exponential backoff with optional jitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_attempts: config.max_conflict_retries.max(1),
            base: config.backoff_base(),
            max: config.backoff_max(),
            jitter: config.backoff_jitter,
        }
    }

    /// Policy that retries immediately; useful when a test drives contention.
    #[must_use]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base: Duration::ZERO,
            max: Duration::ZERO,
            jitter: false,
        }
    }

    /// Delay before retry number `retry` (1-based).
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        let ceiling = self.base.saturating_mul(1 << exponent).min(self.max);
        if !self.jitter || ceiling.is_zero() {
            return ceiling;
        }
        let half = ceiling / 2;
        let spread = u64::try_from((ceiling - half).as_micros()).unwrap_or(u64::MAX);
        half + Duration::from_micros(rand::rng().random_range(0..=spread))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// What a mutation decided to do with the record it was handed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change<T> {
    /// Nothing to persist.
    Unchanged(T),
    /// Persist the mutated record.
    Write(T),
}

/// Result of a completed read-mutate-write cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation<T> {
    pub value: T,
    /// The record as read (unchanged) or as written.
    pub version_set: VersionSet,
    pub written: bool,
    /// Attempts used, including the successful one.
    pub attempts: u32,
}

/// Apply `mutate` to version set `id` with conflict retry.
///
/// `mutate` runs against a fresh copy on every attempt, so it must derive
/// everything from the record it is given. An error from `mutate` aborts the
/// cycle without writing. Exhausting the policy yields [`GateError::Conflict`]
/// carrying the attempt count.
pub fn mutate_version_set<T, F>(
    store: &dyn VersionSetStore,
    id: &str,
    policy: &RetryPolicy,
    mut mutate: F,
) -> Result<Mutation<T>>
where
    F: FnMut(&mut VersionSet) -> Result<Change<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let current = if attempt == 1 {
            store.get(id)?
        } else {
            store.get_latest(id)?
        };
        let mut copy = current.value.clone();
        let (value, write) = match mutate(&mut copy)? {
            Change::Unchanged(value) => (value, false),
            Change::Write(value) => (value, true),
        };
        if !write {
            return Ok(Mutation {
                value,
                version_set: current.value,
                written: false,
                attempts: attempt,
            });
        }

        match store.update(current.resource_version, copy.clone()) {
            Ok(_) => {
                return Ok(Mutation {
                    value,
                    version_set: copy,
                    written: true,
                    attempts: attempt,
                });
            }
            Err(error) if error.is_conflict() => {
                if attempt >= policy.max_attempts {
                    return Err(GateError::Conflict {
                        version_set: id.to_string(),
                        attempts: attempt,
                    });
                }
                let delay = policy.delay_for(attempt);
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
            }
            Err(error) => return Err(error),
        }
    }
}
