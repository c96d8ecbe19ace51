//! Configuration system: TOML file + env var overrides + smart defaults.

#![allow(missing_docs)]

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::errors::{GateError, Result};

/// Kubernetes-style DNS label: what run names and param names must look like.
static NAME_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9]([-_.A-Za-z0-9]*[A-Za-z0-9])?$").ok());

/// Full integration gate configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub workers: WorkerConfig,
    pub launcher: LauncherConfig,
    pub logging: LoggingConfig,
    pub paths: PathsConfig,
}

/// Optimistic-concurrency retry knobs for status map writes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Read-mutate-write attempts before a conflict is surfaced.
    pub max_conflict_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Randomize each backoff in [delay/2, delay].
    pub backoff_jitter: bool,
}

/// Reconciliation worker pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerConfig {
    pub count: usize,
    pub queue_capacity: usize,
    /// Times a retryable failure is put back on the queue before it is dropped.
    pub max_requeues: u32,
    pub requeue_delay_ms: u64,
}

/// How test runs are built.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LauncherConfig {
    /// Param carrying the serialized version set; scenarios may not override it.
    pub reserved_param_name: String,
    /// Prepended to every generated run name.
    pub run_name_prefix: String,
}

/// Activity log tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub jsonl_max_size_bytes: u64,
    pub jsonl_max_rotated_files: u32,
    pub fsync_interval_secs: u64,
    pub channel_capacity: usize,
    pub sqlite_enabled: bool,
    /// Activity rows older than this are pruned when the logger starts.
    pub sqlite_retention_days: u32,
}

/// Filesystem paths used by igate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub config_file: PathBuf,
    pub jsonl_log: PathBuf,
    pub jsonl_fallback: Option<PathBuf>,
    pub sqlite_db: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_conflict_retries: 8,
            backoff_base_ms: 10,
            backoff_max_ms: 1_000,
            backoff_jitter: true,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    #[must_use]
    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: std::thread::available_parallelism().map_or(2, |n| n.get().clamp(2, 8)),
            queue_capacity: 1_024,
            max_requeues: 5,
            requeue_delay_ms: 250,
        }
    }
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            reserved_param_name: "SNAPSHOT".to_string(),
            run_name_prefix: String::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            jsonl_max_size_bytes: 100 * 1024 * 1024,
            jsonl_max_rotated_files: 5,
            fsync_interval_secs: 10,
            channel_capacity: 1_024,
            sqlite_enabled: true,
            sqlite_retention_days: 30,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let home_dir = env::var_os("HOME").map_or_else(
            || {
                eprintln!("[IG-CONFIG] WARNING: HOME not set, falling back to /tmp for data paths");
                PathBuf::from("/tmp")
            },
            PathBuf::from,
        );
        let cfg = home_dir.join(".config").join("igate").join("config.toml");
        let data = home_dir.join(".local").join("share").join("igate");
        Self {
            config_file: cfg,
            jsonl_log: data.join("activity.jsonl"),
            jsonl_fallback: Some(PathBuf::from("/dev/shm/igate.jsonl")),
            sqlite_db: data.join("activity.sqlite3"),
        }
    }
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathsConfig::default().config_file
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);
        let is_explicit_path = path.is_some();

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|source| GateError::Io {
                path: path_buf.clone(),
                source,
            })?;
            let parsed: Self = toml::from_str(&raw)?;
            parsed
        } else if is_explicit_path {
            return Err(GateError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.paths.config_file = path_buf;
        cfg.apply_env_overrides_from(env_var)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Deterministic hash of the effective config for logging.
    ///
    /// FNV-1a keeps the value stable across processes and toolchains.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut u64_var = |name: &str, slot: &mut u64| -> Result<()> {
            if let Some(raw) = lookup(name) {
                *slot = parse_env(name, &raw)?;
            }
            Ok(())
        };
        u64_var("IGATE_ENGINE_BACKOFF_BASE_MS", &mut self.engine.backoff_base_ms)?;
        u64_var("IGATE_ENGINE_BACKOFF_MAX_MS", &mut self.engine.backoff_max_ms)?;
        u64_var(
            "IGATE_WORKERS_REQUEUE_DELAY_MS",
            &mut self.workers.requeue_delay_ms,
        )?;
        u64_var(
            "IGATE_LOGGING_JSONL_MAX_SIZE_BYTES",
            &mut self.logging.jsonl_max_size_bytes,
        )?;

        if let Some(raw) = lookup("IGATE_ENGINE_MAX_CONFLICT_RETRIES") {
            self.engine.max_conflict_retries =
                parse_env("IGATE_ENGINE_MAX_CONFLICT_RETRIES", &raw)?;
        }
        if let Some(raw) = lookup("IGATE_ENGINE_BACKOFF_JITTER") {
            self.engine.backoff_jitter = parse_env("IGATE_ENGINE_BACKOFF_JITTER", &raw)?;
        }
        if let Some(raw) = lookup("IGATE_WORKERS_COUNT") {
            self.workers.count = parse_env("IGATE_WORKERS_COUNT", &raw)?;
        }
        if let Some(raw) = lookup("IGATE_WORKERS_QUEUE_CAPACITY") {
            self.workers.queue_capacity = parse_env("IGATE_WORKERS_QUEUE_CAPACITY", &raw)?;
        }
        if let Some(raw) = lookup("IGATE_WORKERS_MAX_REQUEUES") {
            self.workers.max_requeues = parse_env("IGATE_WORKERS_MAX_REQUEUES", &raw)?;
        }
        if let Some(raw) = lookup("IGATE_LAUNCHER_RESERVED_PARAM_NAME") {
            self.launcher.reserved_param_name = raw;
        }
        if let Some(raw) = lookup("IGATE_LAUNCHER_RUN_NAME_PREFIX") {
            self.launcher.run_name_prefix = raw;
        }
        if let Some(raw) = lookup("IGATE_LOGGING_SQLITE_ENABLED") {
            self.logging.sqlite_enabled = parse_env("IGATE_LOGGING_SQLITE_ENABLED", &raw)?;
        }
        if let Some(raw) = lookup("IGATE_PATHS_JSONL_LOG") {
            self.paths.jsonl_log = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("IGATE_PATHS_SQLITE_DB") {
            self.paths.sqlite_db = PathBuf::from(raw);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.engine.max_conflict_retries == 0 {
            return Err(GateError::InvalidConfig {
                details: "engine.max_conflict_retries must be > 0".to_string(),
            });
        }
        if self.engine.backoff_base_ms > self.engine.backoff_max_ms {
            return Err(GateError::InvalidConfig {
                details: format!(
                    "engine.backoff_base_ms ({}) must be <= engine.backoff_max_ms ({})",
                    self.engine.backoff_base_ms, self.engine.backoff_max_ms
                ),
            });
        }
        if self.workers.count == 0 {
            return Err(GateError::InvalidConfig {
                details: "workers.count must be > 0".to_string(),
            });
        }
        if self.workers.queue_capacity == 0 {
            return Err(GateError::InvalidConfig {
                details: "workers.queue_capacity must be > 0".to_string(),
            });
        }
        if !is_valid_name(&self.launcher.reserved_param_name) {
            return Err(GateError::InvalidConfig {
                details: format!(
                    "launcher.reserved_param_name {:?} is not a valid parameter name",
                    self.launcher.reserved_param_name
                ),
            });
        }
        if !self.launcher.run_name_prefix.is_empty()
            && (self.launcher.run_name_prefix.len() > 20
                || !self
                    .launcher
                    .run_name_prefix
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'))
        {
            return Err(GateError::InvalidConfig {
                details: "launcher.run_name_prefix must be <= 20 chars of [a-z0-9-]".to_string(),
            });
        }
        if self.logging.channel_capacity == 0 {
            return Err(GateError::InvalidConfig {
                details: "logging.channel_capacity must be > 0".to_string(),
            });
        }
        if self.logging.jsonl_max_rotated_files == 0 {
            return Err(GateError::InvalidConfig {
                details: "logging.jsonl_max_rotated_files must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

/// Whether `name` is usable as a parameter or label value.
#[must_use]
pub fn is_valid_name(name: &str) -> bool {
    name.len() <= 253 && NAME_RE.as_ref().is_some_and(|re| re.is_match(name))
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|raw| !raw.trim().is_empty())
}

fn parse_env<T>(name: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|error| GateError::ConfigParse {
            context: "env",
            details: format!("{name}={raw:?}: {error}"),
        })
}

#[cfg(test)]
mod tests {
    use super::{Config, GateError, is_valid_name};
    use std::collections::HashMap;
    use std::path::Path;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(name, value)| ((*name).to_string(), (*value).to_string()))
            .collect()
    }

    #[test]
    fn default_config_is_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_conflict_retries_rejected() {
        let mut cfg = Config::default();
        cfg.engine.max_conflict_retries = 0;
        let err = cfg.validate().expect_err("expected invalid retries");
        assert!(matches!(err, GateError::InvalidConfig { .. }));
    }

    #[test]
    fn backoff_ordering_enforced() {
        let mut cfg = Config::default();
        cfg.engine.backoff_base_ms = 2_000;
        cfg.engine.backoff_max_ms = 100;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn reserved_param_name_must_be_a_name() {
        let mut cfg = Config::default();
        cfg.launcher.reserved_param_name = "not a name".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn run_name_prefix_charset_enforced() {
        let mut cfg = Config::default();
        cfg.launcher.run_name_prefix = "CI_".to_string();
        assert!(cfg.validate().is_err());
        cfg.launcher.run_name_prefix = "ci-".to_string();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn env_overrides_apply() {
        let mut cfg = Config::default();
        let env = vars(&[
            ("IGATE_ENGINE_MAX_CONFLICT_RETRIES", "3"),
            ("IGATE_ENGINE_BACKOFF_JITTER", "false"),
            ("IGATE_WORKERS_COUNT", "12"),
            ("IGATE_LAUNCHER_RESERVED_PARAM_NAME", "VERSION_SET"),
        ]);
        cfg.apply_env_overrides_from(|name| env.get(name).cloned())
            .unwrap();
        assert_eq!(cfg.engine.max_conflict_retries, 3);
        assert!(!cfg.engine.backoff_jitter);
        assert_eq!(cfg.workers.count, 12);
        assert_eq!(cfg.launcher.reserved_param_name, "VERSION_SET");
    }

    #[test]
    fn env_invalid_number_rejected() {
        let mut cfg = Config::default();
        let env = vars(&[("IGATE_WORKERS_COUNT", "many")]);
        let err = cfg
            .apply_env_overrides_from(|name| env.get(name).cloned())
            .unwrap_err();
        assert_eq!(err.code(), "IG-1003");
        assert!(err.to_string().contains("IGATE_WORKERS_COUNT"));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg: Config = toml::from_str("[engine]\nmax_conflict_retries = 2\n").unwrap();
        assert_eq!(cfg.engine.max_conflict_retries, 2);
        assert_eq!(cfg.engine.backoff_base_ms, 10);
        assert_eq!(cfg.launcher.reserved_param_name, "SNAPSHOT");
    }

    #[test]
    fn load_returns_error_for_explicit_missing_path() {
        let err = Config::load(Some(Path::new("/nonexistent/igate/config.toml"))).unwrap_err();
        assert!(matches!(err, GateError::MissingConfig { .. }));
    }

    #[test]
    fn load_reads_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[workers]\ncount = 3\n").unwrap();
        let cfg = Config::load(Some(&path)).unwrap();
        assert_eq!(cfg.workers.count, 3);
        assert_eq!(cfg.paths.config_file, path);
    }

    #[test]
    fn stable_hash_deterministic_and_sensitive() {
        let a = Config::default();
        let mut b = Config::default();
        assert_eq!(a.stable_hash().unwrap(), b.stable_hash().unwrap());
        b.engine.max_conflict_retries += 1;
        assert_ne!(a.stable_hash().unwrap(), b.stable_hash().unwrap());
    }

    #[test]
    fn name_validation() {
        assert!(is_valid_name("SNAPSHOT"));
        assert!(is_valid_name("login-test.v2"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("-leading"));
        assert!(!is_valid_name("has space"));
    }
}
