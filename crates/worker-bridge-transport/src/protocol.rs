//! Wire protocol between the local session and the control server.
//!
//! Every frame is a JSON envelope `{"type": TAG, "payload": {...}, "version": "v1"}`.
//! The two directions use disjoint message families.

use serde::{Deserialize, Serialize};
use worker_bridge_core::{
    LazyAttemptPayload, RunId, TaskRunCompletion, TaskRunExecution, WorkerId,
    events::{TaskCompleted, TaskFailedToRun, TaskRunHeartbeat},
};

/// Envelope version stamped on outbound frames.
pub const PROTOCOL_VERSION: &str = "v1";

/// Message from the session to the control server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    /// A bundle can accept runs.
    ReadyForTasks(ReadyForTasks),
    /// Forwarded coordinator event for one bundle.
    BackgroundWorkerMessage(WorkerEventMessage),
}

impl ClientMessage {
    /// Readiness announcement sent right after registration.
    #[must_use]
    pub const fn ready(background_worker_id: WorkerId) -> Self {
        Self::ReadyForTasks(ReadyForTasks {
            background_worker_id,
            in_progress_runs: None,
        })
    }

    /// Readiness replay carrying the runs already executing.
    #[must_use]
    pub const fn ready_with_runs(background_worker_id: WorkerId, runs: Vec<RunId>) -> Self {
        Self::ReadyForTasks(ReadyForTasks {
            background_worker_id,
            in_progress_runs: Some(runs),
        })
    }

    /// Tag used on the wire.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ReadyForTasks(_) => "READY_FOR_TASKS",
            Self::BackgroundWorkerMessage(_) => "BACKGROUND_WORKER_MESSAGE",
        }
    }
}

/// Payload of `READY_FOR_TASKS`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyForTasks {
    /// Bundle that can accept runs.
    pub background_worker_id: WorkerId,
    /// Runs still executing under the bundle. Absent on first announcement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_progress_runs: Option<Vec<RunId>>,
}

/// Outbound `BACKGROUND_WORKER_MESSAGE` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerEventMessage {
    /// Bundle the event belongs to.
    pub background_worker_id: WorkerId,
    /// The event itself.
    pub data: WorkerEvent,
}

/// Coordinator event as carried on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerEvent {
    /// A run is still alive.
    TaskRunHeartbeat {
        /// Run that reported in.
        id: RunId,
    },
    /// A run finished, successfully or not.
    TaskRunCompleted {
        /// Result reported by the worker process.
        completion: TaskRunCompletion,
        /// Execution record the run was started with.
        execution: TaskRunExecution,
    },
    /// The worker process could not run the attempt.
    TaskRunFailedToRun {
        /// Failure reported by the worker process.
        completion: TaskRunCompletion,
    },
}

impl From<TaskRunHeartbeat> for ClientMessage {
    fn from(event: TaskRunHeartbeat) -> Self {
        Self::BackgroundWorkerMessage(WorkerEventMessage {
            background_worker_id: event.background_worker_id,
            data: WorkerEvent::TaskRunHeartbeat { id: event.run_id },
        })
    }
}

impl From<TaskCompleted> for ClientMessage {
    fn from(event: TaskCompleted) -> Self {
        Self::BackgroundWorkerMessage(WorkerEventMessage {
            background_worker_id: event.background_worker_id,
            data: WorkerEvent::TaskRunCompleted {
                completion: event.completion,
                execution: event.execution,
            },
        })
    }
}

impl From<TaskFailedToRun> for ClientMessage {
    fn from(event: TaskFailedToRun) -> Self {
        Self::BackgroundWorkerMessage(WorkerEventMessage {
            background_worker_id: event.background_worker_id,
            data: WorkerEvent::TaskRunFailedToRun {
                completion: event.completion,
            },
        })
    }
}

/// Message from the control server to the session.
///
/// Decoded by [`crate::codec::decode`]; tags this version does not know
/// land in `Unknown` and are ignored by the router.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// `SERVER_READY`: re-advertise every bundle.
    ServerReady(ServerReady),
    /// `BACKGROUND_WORKER_MESSAGE`: a command for one bundle.
    BackgroundWorkerMessage(WorkerCommandMessage),
    /// Any other tag.
    Unknown {
        /// The tag as received.
        kind: String,
    },
}

/// The server finished (re)establishing its side of the session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerReady {
    /// Server instance id, when the server sends one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// Inbound `BACKGROUND_WORKER_MESSAGE` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerCommandMessage {
    /// Bundle the command is for.
    pub background_worker_id: WorkerId,
    /// The command itself.
    pub data: WorkerCommand,
}

/// Command directed at one bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerCommand {
    /// Stop a run. Best effort.
    CancelAttempt {
        /// Run to stop.
        #[serde(rename = "taskRunId")]
        task_run_id: RunId,
    },
    /// Create an attempt for a run and execute it.
    ExecuteRunLazyAttempt {
        /// Run to execute with its trace context and metrics.
        payload: LazyAttemptPayload,
    },
    /// Command type added by a newer server.
    #[serde(other)]
    Unknown,
}
