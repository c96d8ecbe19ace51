//! Reconciliation worker pool.
//!
//! Requests arrive on one bounded crossbeam channel shared by every worker.
//! There is no per-version-set lock: two workers may reconcile the same
//! version set at once and the status map's conditional writes sort it out.
//! A retryable failure is put back on the queue after a short delay, up to
//! `workers.max_requeues` times.

#![allow(missing_docs)]

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};

use crate::core::config::WorkerConfig;
use crate::core::errors::{GateError, Result};
use crate::engine::orchestrator::Orchestrator;
use crate::logger::dual::ActivityEvent;
use crate::model::version_set::RerunScope;

/// How often an idle worker checks whether the pool is draining.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Work item for the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileRequest {
    VersionSetChanged(String),
    TestRunChanged(String),
    RerunRequested { id: String, scope: RerunScope },
    /// The scenario catalog of an application changed.
    ScenariosChanged { application: String },
}

impl ReconcileRequest {
    fn process(&self, orchestrator: &Orchestrator) -> Result<()> {
        match self {
            Self::VersionSetChanged(id) => orchestrator.reconcile_version_set(id).map(drop),
            Self::TestRunChanged(run) => orchestrator.reconcile_test_run_event(run).map(drop),
            Self::RerunRequested { id, scope } => {
                orchestrator.request_rerun(id, scope.clone()).map(drop)
            }
            Self::ScenariosChanged { application } => {
                orchestrator.reconcile_application(application).map(drop)
            }
        }
    }
}

impl fmt::Display for ReconcileRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VersionSetChanged(id) => write!(f, "version set {id}"),
            Self::TestRunChanged(run) => write!(f, "test run {run}"),
            Self::RerunRequested { id, scope } => write!(f, "rerun {scope} of {id}"),
            Self::ScenariosChanged { application } => {
                write!(f, "scenarios of application {application}")
            }
        }
    }
}

#[derive(Debug)]
struct Job {
    request: ReconcileRequest,
    attempt: u32,
}

/// Counters reported when the pool shuts down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Requests that completed successfully.
    pub processed: u64,
    /// Requests that failed for good (non-retryable, or out of requeues).
    pub failed: u64,
    pub requeued: u64,
    /// Requeues lost because the queue was full.
    pub dropped: u64,
}

#[derive(Default)]
struct Shared {
    draining: AtomicBool,
    /// Jobs queued or being worked on.
    outstanding: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    requeued: AtomicU64,
    dropped: AtomicU64,
}

impl Shared {
    fn stats(&self) -> PoolStats {
        PoolStats {
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    fn finished(&self) -> bool {
        self.draining.load(Ordering::SeqCst) && self.outstanding.load(Ordering::SeqCst) == 0
    }
}

/// Fixed set of worker threads draining one bounded request queue.
pub struct ReconcilePool {
    tx: Sender<Job>,
    workers: Vec<thread::JoinHandle<()>>,
    shared: Arc<Shared>,
    orchestrator: Orchestrator,
}

impl ReconcilePool {
    /// Start `config.count` workers.
    pub fn spawn(orchestrator: Orchestrator, config: &WorkerConfig) -> Result<Self> {
        let (tx, rx) = bounded::<Job>(config.queue_capacity.max(1));
        let shared = Arc::new(Shared::default());
        let settings = WorkerSettings {
            max_requeues: config.max_requeues,
            requeue_delay: Duration::from_millis(config.requeue_delay_ms),
        };

        let mut pool = Self {
            tx,
            workers: Vec::with_capacity(config.count),
            shared,
            orchestrator,
        };
        for index in 0..config.count.max(1) {
            let rx = rx.clone();
            let tx = pool.tx.clone();
            let shared = Arc::clone(&pool.shared);
            let orchestrator = pool.orchestrator.clone();
            let handle = thread::Builder::new()
                .name(format!("igate-worker-{index}"))
                .spawn(move || worker_main(&rx, &tx, &shared, &orchestrator, settings))
                .map_err(|source| GateError::Runtime {
                    details: format!("failed to spawn worker thread: {source}"),
                });
            match handle {
                Ok(handle) => pool.workers.push(handle),
                Err(error) => {
                    pool.stop();
                    return Err(error);
                }
            }
        }

        let config_hash = pool
            .orchestrator
            .config()
            .stable_hash()
            .unwrap_or_else(|_| "unknown".to_string());
        pool.orchestrator.logger().send(ActivityEvent::EngineStarted {
            version: env!("CARGO_PKG_VERSION").to_string(),
            config_hash,
        });
        Ok(pool)
    }

    /// Queue a request, blocking while the queue is full.
    pub fn submit(&self, request: ReconcileRequest) -> Result<()> {
        if self.shared.draining.load(Ordering::SeqCst) {
            return Err(GateError::ChannelClosed {
                component: "reconcile pool",
            });
        }
        self.shared.outstanding.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(Job { request, attempt: 0 }).is_err() {
            self.shared.outstanding.fetch_sub(1, Ordering::SeqCst);
            return Err(GateError::ChannelClosed {
                component: "reconcile pool",
            });
        }
        Ok(())
    }

    /// Worker threads running.
    #[must_use]
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Stop accepting work, drain the queue (requeues included), join every
    /// worker, and report the counters.
    pub fn shutdown(mut self) -> PoolStats {
        self.stop();
        let stats = self.shared.stats();
        self.orchestrator.logger().send(ActivityEvent::EngineStopped {
            reason: "worker pool shut down".to_string(),
            processed: stats.processed,
        });
        stats
    }

    fn stop(&mut self) {
        self.shared.draining.store(true, Ordering::SeqCst);
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                self.orchestrator.logger().send(ActivityEvent::Error {
                    code: "IG-3900".to_string(),
                    message: "worker thread panicked".to_string(),
                });
            }
        }
    }
}

impl Drop for ReconcilePool {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Debug, Clone, Copy)]
struct WorkerSettings {
    max_requeues: u32,
    requeue_delay: Duration,
}

fn worker_main(
    rx: &Receiver<Job>,
    tx: &Sender<Job>,
    shared: &Shared,
    orchestrator: &Orchestrator,
    settings: WorkerSettings,
) {
    loop {
        let job = match rx.recv_timeout(POLL_INTERVAL) {
            Ok(job) => job,
            Err(RecvTimeoutError::Timeout) => {
                if shared.finished() {
                    break;
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };

        match job.request.process(orchestrator) {
            Ok(()) => {
                shared.processed.fetch_add(1, Ordering::Relaxed);
            }
            Err(error) if error.is_retryable() && job.attempt < settings.max_requeues => {
                requeue(tx, shared, orchestrator, job, &error, settings.requeue_delay);
            }
            Err(error) => {
                shared.failed.fetch_add(1, Ordering::Relaxed);
                orchestrator.logger().send(ActivityEvent::error(&error));
            }
        }
        shared.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Put `job` back on the queue after `delay`. Never blocks on a full queue:
/// every sender of a requeue is also a consumer. A job that cannot be put back
/// is counted as failed and logged with the error that sent it here.
fn requeue(
    tx: &Sender<Job>,
    shared: &Shared,
    orchestrator: &Orchestrator,
    job: Job,
    error: &GateError,
    delay: Duration,
) {
    if !delay.is_zero() {
        thread::sleep(delay);
    }
    shared.outstanding.fetch_add(1, Ordering::SeqCst);
    let next = Job {
        request: job.request,
        attempt: job.attempt + 1,
    };
    match tx.try_send(next) {
        Ok(()) => {
            shared.requeued.fetch_add(1, Ordering::Relaxed);
        }
        Err(TrySendError::Full(lost) | TrySendError::Disconnected(lost)) => {
            shared.outstanding.fetch_sub(1, Ordering::SeqCst);
            shared.dropped.fetch_add(1, Ordering::Relaxed);
            shared.failed.fetch_add(1, Ordering::Relaxed);
            orchestrator.logger().send(ActivityEvent::Error {
                code: error.code().to_string(),
                message: format!(
                    "dropped {} after {} attempt(s), request queue full: {error}",
                    lost.request,
                    lost.attempt
                ),
            });
        }
    }
}
