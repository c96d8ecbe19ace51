//! IG-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, GateError>;

/// Top-level error type for the integration gate.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("[IG-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[IG-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[IG-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[IG-2001] scenario catalog unreadable for application {application}: {details}")]
    Selection {
        application: String,
        details: String,
    },

    #[error("[IG-2002] status map on version set {version_set} is corrupt: {details}")]
    CorruptState {
        version_set: String,
        details: String,
    },

    #[error("[IG-2003] test run launch rejected for scenario {scenario}: {details}")]
    Launch { scenario: String, details: String },

    #[error("[IG-2004] write conflict on version set {version_set} after {attempts} attempt(s)")]
    Conflict { version_set: String, attempts: u32 },

    #[error("[IG-2005] {kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("[IG-2006] test run {run} has no usable ownership labels: {details}")]
    UnownedTestRun { run: String, details: String },

    #[error("[IG-2101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[IG-2102] SQL failure in {context}: {details}")]
    Sql {
        context: &'static str,
        details: String,
    },

    #[error("[IG-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[IG-3003] channel closed in component {component}")]
    ChannelClosed { component: &'static str },

    #[error("[IG-3004] {collaborator} unavailable: {details}")]
    Collaborator {
        collaborator: &'static str,
        details: String,
    },

    #[error("[IG-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl GateError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "IG-1001",
            Self::MissingConfig { .. } => "IG-1002",
            Self::ConfigParse { .. } => "IG-1003",
            Self::Selection { .. } => "IG-2001",
            Self::CorruptState { .. } => "IG-2002",
            Self::Launch { .. } => "IG-2003",
            Self::Conflict { .. } => "IG-2004",
            Self::NotFound { .. } => "IG-2005",
            Self::UnownedTestRun { .. } => "IG-2006",
            Self::Serialization { .. } => "IG-2101",
            Self::Sql { .. } => "IG-2102",
            Self::Io { .. } => "IG-3002",
            Self::ChannelClosed { .. } => "IG-3003",
            Self::Collaborator { .. } => "IG-3004",
            Self::Runtime { .. } => "IG-3900",
        }
    }

    /// Whether re-running the same reconciliation later might resolve the failure.
    ///
    /// `Launch` is not retryable: a rejected submission is recorded as an
    /// Invalid entry.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Selection { .. }
                | Self::CorruptState { .. }
                | Self::Conflict { .. }
                | Self::Io { .. }
                | Self::ChannelClosed { .. }
                | Self::Collaborator { .. }
                | Self::Sql { .. }
                | Self::Runtime { .. }
        )
    }

    /// Whether this is a lost optimistic-concurrency race.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Convenience constructor for a single lost write race.
    #[must_use]
    pub fn conflict(version_set: impl Into<String>) -> Self {
        Self::Conflict {
            version_set: version_set.into(),
            attempts: 1,
        }
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for GateError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sql {
            context: "rusqlite",
            details: value.to_string(),
        }
    }
}

impl From<serde_json::Error> for GateError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for GateError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}
