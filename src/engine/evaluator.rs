//! Outcome evaluation: turn an observed test run into a status verdict.
//!
//! Evaluation is pure and fails closed: anything short of a well-formed,
//! explicitly successful result is recorded as Failed.

use chrono::DateTime;
use serde_json::{Map, Value};

use crate::model::test_run::TestRunObservation;
use crate::status::map::TestStatus;

/// Task results that count toward success.
const PASSING_RESULTS: [&str; 3] = ["SUCCESS", "WARNING", "SKIPPED"];
const KNOWN_RESULTS: [&str; 5] = ["SUCCESS", "FAILURE", "WARNING", "SKIPPED", "ERROR"];

/// Verdict for one observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub status: TestStatus,
    pub detail: String,
}

impl Outcome {
    fn new(status: TestStatus, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }
}

#[must_use]
pub fn evaluate(run: &TestRunObservation) -> Outcome {
    if !run.finished {
        if run.deletion_requested() {
            return Outcome::new(TestStatus::Deleted, "test run was deleted before finishing");
        }
        return Outcome::new(TestStatus::InProgress, "test is running");
    }

    let Some(result) = run.result.as_ref() else {
        return Outcome::new(
            TestStatus::Failed,
            "invalid test result: result payload is missing",
        );
    };

    let errors = validate_result(result);
    if !errors.is_empty() {
        return Outcome::new(
            TestStatus::Failed,
            format!("invalid test result: {}", errors.join("; ")),
        );
    }

    if is_success(result) {
        Outcome::new(TestStatus::Passed, "test passed")
    } else {
        Outcome::new(TestStatus::Failed, "test failed")
    }
}

/// Success indicator of an already-validated payload.
fn is_success(result: &Value) -> bool {
    let succeeded = result.get("succeeded").and_then(Value::as_bool) == Some(true);
    let tasks_pass = result
        .get("tasks")
        .and_then(Value::as_array)
        .is_none_or(|tasks| {
            tasks.iter().all(|task| {
                task.get("test_output")
                    .and_then(|out| out.get("result"))
                    .and_then(Value::as_str)
                    .is_none_or(|r| PASSING_RESULTS.contains(&r))
            })
        });
    succeeded && tasks_pass
}

/// Every schema violation in the payload, in document order.
fn validate_result(result: &Value) -> Vec<String> {
    let mut errors = Vec::new();
    let Some(root) = result.as_object() else {
        errors.push("result must be an object".to_string());
        return errors;
    };

    match root.get("succeeded") {
        Some(Value::Bool(_)) => {}
        Some(_) => errors.push("succeeded must be a boolean".to_string()),
        None => errors.push("succeeded is required".to_string()),
    }

    match root.get("tasks") {
        None | Some(Value::Null) => {}
        Some(Value::Array(tasks)) => {
            for (i, task) in tasks.iter().enumerate() {
                validate_task(i, task, &mut errors);
            }
        }
        Some(_) => errors.push("tasks must be an array".to_string()),
    }
    errors
}

fn validate_task(index: usize, task: &Value, errors: &mut Vec<String>) {
    let Some(task) = task.as_object() else {
        errors.push(format!("tasks[{index}] must be an object"));
        return;
    };
    match task.get("name") {
        Some(Value::String(name)) if !name.is_empty() => {}
        Some(_) => errors.push(format!("tasks[{index}].name must be a non-empty string")),
        None => errors.push(format!("tasks[{index}].name is required")),
    }
    match task.get("test_output") {
        None | Some(Value::Null) => {}
        Some(Value::Object(output)) => validate_output(index, output, errors),
        Some(_) => errors.push(format!("tasks[{index}].test_output must be an object")),
    }
}

fn validate_output(index: usize, output: &Map<String, Value>, errors: &mut Vec<String>) {
    let field = |name: &str| format!("tasks[{index}].test_output.{name}");

    match output.get("result").map(Value::as_str) {
        Some(Some(r)) if KNOWN_RESULTS.contains(&r) => {}
        Some(Some(r)) => errors.push(format!("{} has unknown value {r:?}", field("result"))),
        Some(None) => errors.push(format!("{} must be a string", field("result"))),
        None => errors.push(format!("{} is required", field("result"))),
    }

    match output.get("timestamp").map(Value::as_str) {
        Some(Some(ts)) if DateTime::parse_from_rfc3339(ts).is_ok() => {}
        Some(Some(ts)) => errors.push(format!("{} {ts:?} is not RFC 3339", field("timestamp"))),
        Some(None) => errors.push(format!("{} must be a string", field("timestamp"))),
        None => errors.push(format!("{} is required", field("timestamp"))),
    }

    for counter in ["successes", "failures", "warnings"] {
        match output.get(counter) {
            Some(v) if v.as_u64().is_some() => {}
            Some(_) => errors.push(format!(
                "{} must be a non-negative integer",
                field(counter)
            )),
            None => errors.push(format!("{} is required", field(counter))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::memory::result_payload;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::collections::{BTreeMap, BTreeSet};

    fn run(finished: bool, result: Option<Value>) -> TestRunObservation {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        TestRunObservation {
            name: "login-test-0a1b2c3d4e".into(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            created_at: at,
            start_time: Some(at),
            completion_time: finished.then_some(at),
            finished,
            deletion_requested_at: None,
            result,
            holds: BTreeSet::new(),
        }
    }

    fn output(result: &str) -> Value {
        json!({
            "result": result,
            "timestamp": "2026-03-01T12:00:00Z",
            "successes": 1,
            "failures": 0,
            "warnings": 0
        })
    }

    #[test]
    fn unfinished_run_is_in_progress() {
        let outcome = evaluate(&run(false, None));
        assert_eq!(outcome.status, TestStatus::InProgress);
        assert_eq!(outcome.detail, "test is running");
    }

    #[test]
    fn deletion_before_finish_is_deleted() {
        let mut observed = run(false, None);
        observed.deletion_requested_at = Some(Utc::now());
        assert_eq!(evaluate(&observed).status, TestStatus::Deleted);
    }

    #[test]
    fn successful_payload_passes() {
        let payload = result_payload(true, Utc::now());
        assert_eq!(evaluate(&run(true, Some(payload))).status, TestStatus::Passed);
    }

    #[test]
    fn explicit_failure_is_failed() {
        let payload = result_payload(false, Utc::now());
        let outcome = evaluate(&run(true, Some(payload)));
        assert_eq!(outcome.status, TestStatus::Failed);
        assert_eq!(outcome.detail, "test failed");
    }

    #[test]
    fn warnings_and_skips_still_pass() {
        let payload = json!({
            "succeeded": true,
            "tasks": [
                {"name": "lint", "test_output": output("WARNING")},
                {"name": "e2e", "test_output": output("SKIPPED")},
                {"name": "setup"}
            ]
        });
        assert_eq!(evaluate(&run(true, Some(payload))).status, TestStatus::Passed);
    }

    #[test]
    fn succeeded_flag_overridden_by_failing_task() {
        let payload = json!({
            "succeeded": true,
            "tasks": [{"name": "e2e", "test_output": output("ERROR")}]
        });
        let outcome = evaluate(&run(true, Some(payload)));
        assert_eq!(outcome.status, TestStatus::Failed);
        assert_eq!(outcome.detail, "test failed");
    }

    #[test]
    fn missing_payload_fails_closed() {
        let outcome = evaluate(&run(true, None));
        assert_eq!(outcome.status, TestStatus::Failed);
        assert!(outcome.detail.starts_with("invalid test result: "));
    }

    #[test]
    fn malformed_payload_lists_every_error() {
        let payload = json!({
            "tasks": [{
                "name": "",
                "test_output": {"result": "MAYBE", "timestamp": "yesterday", "successes": -1}
            }]
        });
        let outcome = evaluate(&run(true, Some(payload)));
        assert_eq!(outcome.status, TestStatus::Failed);
        let detail = outcome.detail.strip_prefix("invalid test result: ").unwrap();
        let errors: Vec<&str> = detail.split("; ").collect();
        assert_eq!(errors[0], "succeeded is required");
        assert!(errors.iter().any(|e| e.contains("tasks[0].name")));
        assert!(errors.iter().any(|e| e.contains("\"MAYBE\"")));
        assert!(errors.iter().any(|e| e.contains("RFC 3339")));
        assert!(errors.iter().any(|e| e.contains("successes must be")));
        assert!(errors.iter().any(|e| e.contains("failures is required")));
    }

    #[test]
    fn non_object_payload_is_invalid() {
        let outcome = evaluate(&run(true, Some(json!("ok"))));
        assert_eq!(outcome.detail, "invalid test result: result must be an object");
    }
}
