//! Scenario selection: which catalog entries apply to a version set.

use std::collections::BTreeMap;

use crate::core::errors::{GateError, Result};
use crate::model::scenario::ScenarioDefinition;
use crate::model::version_set::VersionSet;
use crate::platform::collaborators::ScenarioCatalog;

/// Filter `catalog` down to the valid scenarios of `application` that apply to
/// `trigger_context`, sorted by name. The first definition wins on a repeated name.
#[must_use]
pub fn select_scenarios(
    application: &str,
    trigger_context: &str,
    catalog: &[ScenarioDefinition],
) -> Vec<ScenarioDefinition> {
    let mut selected: BTreeMap<&str, &ScenarioDefinition> = BTreeMap::new();
    for scenario in catalog {
        if !scenario.valid
            || scenario.application != application
            || !scenario.applies_to(trigger_context)
        {
            continue;
        }
        selected.entry(scenario.name.as_str()).or_insert(scenario);
    }
    selected.into_values().cloned().collect()
}

/// Catalog-backed selector.
pub struct ScenarioSelector<'a> {
    catalog: &'a dyn ScenarioCatalog,
}

impl<'a> ScenarioSelector<'a> {
    pub fn new(catalog: &'a dyn ScenarioCatalog) -> Self {
        Self { catalog }
    }

    /// Scenarios applicable to `version_set`.
    ///
    /// A catalog failure is reported as [`GateError::Selection`], never as an
    /// empty selection: an empty set would let the version set converge vacuously.
    pub fn select(&self, version_set: &VersionSet) -> Result<Vec<ScenarioDefinition>> {
        let catalog = self
            .catalog
            .list_by_application(&version_set.application)
            .map_err(|error| GateError::Selection {
                application: version_set.application.clone(),
                details: error.to_string(),
            })?;
        Ok(select_scenarios(
            &version_set.application,
            &version_set.trigger_context,
            &catalog,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::scenario::ExecutionSource;
    use crate::platform::memory::MemoryCatalog;
    use chrono::Utc;

    fn scenario(name: &str, application: &str, contexts: &[&str]) -> ScenarioDefinition {
        ScenarioDefinition {
            name: name.to_string(),
            application: application.to_string(),
            source: ExecutionSource {
                resolver: "git".to_string(),
                params: Vec::new(),
            },
            params: Vec::new(),
            contexts: contexts.iter().map(ToString::to_string).collect(),
            valid: true,
            optional: false,
        }
    }

    fn names(selected: &[ScenarioDefinition]) -> Vec<&str> {
        selected.iter().map(|s| s.name.as_str()).collect()
    }

    #[test]
    fn context_filter_excludes_push_only_on_pull_request() {
        let catalog = vec![
            scenario("login-test", "shop", &[]),
            scenario("push-only-test", "shop", &["push"]),
        ];
        let selected = select_scenarios("shop", "pull_request", &catalog);
        assert_eq!(names(&selected), ["login-test"]);

        let selected = select_scenarios("shop", "push", &catalog);
        assert_eq!(names(&selected), ["login-test", "push-only-test"]);
    }

    #[test]
    fn invalid_and_foreign_scenarios_are_skipped() {
        let mut broken = scenario("broken", "shop", &[]);
        broken.valid = false;
        let catalog = vec![broken, scenario("billing", "ledger", &[])];
        assert!(select_scenarios("shop", "push", &catalog).is_empty());
    }

    #[test]
    fn output_is_sorted_and_deduplicated() {
        let mut shadow = scenario("alpha", "shop", &[]);
        shadow.optional = true;
        let catalog = vec![
            scenario("zeta", "shop", &[]),
            scenario("alpha", "shop", &[]),
            shadow,
        ];
        let selected = select_scenarios("shop", "push", &catalog);
        assert_eq!(names(&selected), ["alpha", "zeta"]);
        assert!(!selected[0].optional, "first definition must win");
    }

    #[test]
    fn catalog_failure_is_a_selection_error() {
        let catalog = MemoryCatalog::new(vec![scenario("login-test", "shop", &[])]);
        catalog.set_failing(true);
        let vs = VersionSet::new("vs-1", "shop", "push", Vec::new(), Utc::now());

        let err = ScenarioSelector::new(&catalog).select(&vs).unwrap_err();
        assert!(matches!(err, GateError::Selection { .. }));
        assert!(err.is_retryable());
    }
}
