//! Lifecycle events pushed by the worker coordinator.
//!
//! Each event kind has its own channel with exactly one consumer. The
//! receiving half is handed out once, by value, so a second subscriber
//! cannot exist.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{
    execution::{TaskRunCompletion, TaskRunExecution},
    ids::{RunId, WorkerId},
};

/// A bundle became the coordinator's tracked worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRegistered {
    pub background_worker_id: WorkerId,
}

/// A run reported it is still alive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRunHeartbeat {
    pub background_worker_id: WorkerId,
    pub run_id: RunId,
}

/// A run finished, successfully or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCompleted {
    pub background_worker_id: WorkerId,
    pub completion: TaskRunCompletion,
    pub execution: TaskRunExecution,
}

/// A run could not be started at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailedToRun {
    pub background_worker_id: WorkerId,
    pub completion: TaskRunCompletion,
}

/// Producer side, held by the coordinator. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    registered: mpsc::UnboundedSender<WorkerRegistered>,
    heartbeat: mpsc::UnboundedSender<TaskRunHeartbeat>,
    completed: mpsc::UnboundedSender<TaskCompleted>,
    failed_to_run: mpsc::UnboundedSender<TaskFailedToRun>,
}

impl EventEmitter {
    pub fn worker_registered(&self, event: WorkerRegistered) {
        if self.registered.send(event).is_err() {
            tracing::debug!("worker-registered consumer gone");
        }
    }

    pub fn task_run_heartbeat(&self, event: TaskRunHeartbeat) {
        if self.heartbeat.send(event).is_err() {
            tracing::debug!("heartbeat consumer gone");
        }
    }

    pub fn task_completed(&self, event: TaskCompleted) {
        if self.completed.send(event).is_err() {
            tracing::debug!("task-completed consumer gone");
        }
    }

    pub fn task_failed_to_run(&self, event: TaskFailedToRun) {
        if self.failed_to_run.send(event).is_err() {
            tracing::debug!("task-failed-to-run consumer gone");
        }
    }
}

/// Consumer side. Each receiver is moved into exactly one forwarder.
#[derive(Debug)]
pub struct CoordinatorEvents {
    pub registered: mpsc::UnboundedReceiver<WorkerRegistered>,
    pub heartbeat: mpsc::UnboundedReceiver<TaskRunHeartbeat>,
    pub completed: mpsc::UnboundedReceiver<TaskCompleted>,
    pub failed_to_run: mpsc::UnboundedReceiver<TaskFailedToRun>,
}

/// Create the four event channels.
#[must_use]
pub fn event_channels() -> (EventEmitter, CoordinatorEvents) {
    let (registered_tx, registered_rx) = mpsc::unbounded_channel();
    let (heartbeat_tx, heartbeat_rx) = mpsc::unbounded_channel();
    let (completed_tx, completed_rx) = mpsc::unbounded_channel();
    let (failed_tx, failed_rx) = mpsc::unbounded_channel();

    let emitter = EventEmitter {
        registered: registered_tx,
        heartbeat: heartbeat_tx,
        completed: completed_tx,
        failed_to_run: failed_tx,
    };

    let events = CoordinatorEvents {
        registered: registered_rx,
        heartbeat: heartbeat_rx,
        completed: completed_rx,
        failed_to_run: failed_rx,
    };

    (emitter, events)
}
