//! Run execution payloads.
//!
//! Execution records and completions are produced by the control plane and
//! the worker process respectively. This layer forwards them without
//! inspecting their shape, so they stay opaque JSON.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::RunId;

/// Execution record returned when a run attempt is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskRunExecution(pub Value);

impl TaskRunExecution {
    /// Id of the run this execution belongs to (`run.id`).
    #[must_use]
    pub fn run_id(&self) -> Option<RunId> {
        self.0.pointer("/run/id").and_then(Value::as_str).map(RunId::from)
    }
}

/// Outcome reported by the worker process for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskRunCompletion(pub Value);

/// One timing sample collected while preparing a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionMetric {
    pub name: String,
    pub event: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Milliseconds.
    pub duration: i64,
}

/// Request from the control plane to create and execute an attempt on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LazyAttemptPayload {
    pub run_id: RunId,
    pub message_id: String,
    #[serde(default)]
    pub trace_context: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Vec<ExecutionMetric>>,
}

/// Everything the coordinator needs to execute one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRunExecutionPayload {
    pub execution: TaskRunExecution,
    pub trace_context: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<HashMap<String, String>>,
    pub metrics: Vec<ExecutionMetric>,
}

impl TaskRunExecutionPayload {
    /// Assemble a payload from a lazy attempt request.
    ///
    /// `seed` is recorded locally and always precedes the metrics the
    /// control plane supplied.
    #[must_use]
    pub fn from_lazy_attempt(
        execution: TaskRunExecution,
        attempt: LazyAttemptPayload,
        seed: ExecutionMetric,
    ) -> Self {
        let mut metrics = vec![seed];
        metrics.extend(attempt.metrics.unwrap_or_default());

        Self {
            execution,
            trace_context: attempt.trace_context,
            environment: attempt.environment,
            metrics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric(event: &str) -> ExecutionMetric {
        ExecutionMetric {
            name: "start".to_string(),
            event: event.to_string(),
            timestamp: 1_700_000_000_000,
            duration: 12,
        }
    }

    #[test]
    fn test_seed_metric_precedes_supplied_metrics() {
        let attempt = LazyAttemptPayload {
            run_id: RunId::new("run_1"),
            message_id: "msg_1".to_string(),
            trace_context: HashMap::new(),
            environment: None,
            metrics: Some(vec![metric("dequeue"), metric("fetch")]),
        };

        let payload = TaskRunExecutionPayload::from_lazy_attempt(
            TaskRunExecution(serde_json::json!({ "run": { "id": "run_1" } })),
            attempt,
            metric("create_attempt"),
        );

        let events: Vec<_> = payload.metrics.iter().map(|m| m.event.as_str()).collect();
        assert_eq!(events, ["create_attempt", "dequeue", "fetch"]);
    }

    #[test]
    fn test_execution_run_id() {
        let execution = TaskRunExecution(serde_json::json!({ "run": { "id": "run_1" } }));
        assert_eq!(execution.run_id(), Some(RunId::new("run_1")));
        assert_eq!(TaskRunExecution(Value::Null).run_id(), None);
    }

    #[test]
    fn test_lazy_attempt_optional_fields_default() {
        let attempt: LazyAttemptPayload =
            serde_json::from_value(serde_json::json!({ "runId": "run_9", "messageId": "m" }))
                .unwrap();
        assert_eq!(attempt.run_id.as_str(), "run_9");
        assert!(attempt.trace_context.is_empty());
        assert!(attempt.metrics.is_none());
    }
}
