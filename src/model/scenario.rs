//! ScenarioDefinition: what test logic to run for an application, and when.

#![allow(missing_docs)]

use serde::{Deserialize, Serialize};

/// Value of an extra parameter: a single string or a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Single(String),
    Multi(Vec<String>),
}

impl ParamValue {
    pub fn single(value: impl Into<String>) -> Self {
        Self::Single(value.into())
    }
}

/// Named parameter passed into a test run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub value: ParamValue,
}

impl Param {
    pub fn new(name: impl Into<String>, value: ParamValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// Location of the test logic: a resolver kind plus its locator parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSource {
    /// Resolver used by the execution engine (e.g. `git`, `bundles`).
    pub resolver: String,
    #[serde(default)]
    pub params: Vec<Param>,
}

/// A reusable integration test definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioDefinition {
    pub name: String,
    pub application: String,
    pub source: ExecutionSource,
    #[serde(default)]
    pub params: Vec<Param>,
    /// Trigger contexts this scenario applies to; empty means always.
    #[serde(default)]
    pub contexts: Vec<String>,
    /// Set by external admission. Invalid scenarios are never acted on.
    pub valid: bool,
    /// A failing optional scenario does not fail the overall outcome.
    #[serde(default)]
    pub optional: bool,
}

impl ScenarioDefinition {
    /// Whether this scenario applies to a version set with the given trigger tag.
    #[must_use]
    pub fn applies_to(&self, trigger_context: &str) -> bool {
        self.contexts.is_empty() || self.contexts.iter().any(|c| c == trigger_context)
    }
}
