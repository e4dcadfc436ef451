//! In-process worker coordinator.
//!
//! Tracks bundles in memory and hands each run to a [`TaskLauncher`], which
//! owns the actual worker processes.

use std::sync::Arc;

use async_trait::async_trait;
use worker_bridge_core::{
    BundleSnapshot, EventEmitter, RunId, TaskRunCompletion, TaskRunExecutionPayload, WorkerBundle,
    WorkerCoordinator, WorkerId, WorkerRegistry,
    events::{TaskCompleted, TaskFailedToRun, TaskRunHeartbeat, WorkerRegistered},
    traits::CoordinatorError,
};

/// How a launched run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum LaunchOutcome {
    /// The run executed and reported a completion, successful or not.
    Completed(TaskRunCompletion),
    /// The worker process could not run it.
    FailedToRun(TaskRunCompletion),
}

/// Runs executions inside a bundle's worker process.
#[async_trait]
pub trait TaskLauncher: Send + Sync + 'static {
    /// Execute one run and wait for it to end.
    async fn launch(
        &self,
        bundle: Arc<WorkerBundle>,
        payload: TaskRunExecutionPayload,
        heartbeat: RunHeartbeat,
    ) -> LaunchOutcome;

    /// Ask a run to stop. Best effort.
    async fn cancel(&self, bundle: &WorkerBundle, run_id: &RunId);
}

/// Lets a launcher report that a run is still alive.
#[derive(Debug, Clone)]
pub struct RunHeartbeat {
    worker_id: WorkerId,
    run_id: RunId,
    events: EventEmitter,
}

impl RunHeartbeat {
    pub fn beat(&self) {
        self.events.task_run_heartbeat(TaskRunHeartbeat {
            background_worker_id: self.worker_id.clone(),
            run_id: self.run_id.clone(),
        });
    }

    #[must_use]
    pub const fn run_id(&self) -> &RunId {
        &self.run_id
    }
}

/// Clears a run from its bundle when dropped, so an abandoned run never
/// stays in progress. A draining bundle is retired with its last run.
struct InProgress<'a> {
    registry: &'a WorkerRegistry,
    bundle: &'a WorkerBundle,
    run_id: RunId,
}

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.bundle.finish_run(&self.run_id);
        if self.registry.retire_if_drained(self.bundle.id()) {
            tracing::info!(worker_id = %self.bundle.id(), "Retired drained worker");
        }
    }
}

/// [`WorkerCoordinator`] that keeps everything in this process.
pub struct LocalCoordinator<L> {
    registry: WorkerRegistry,
    launcher: Arc<L>,
    events: EventEmitter,
}

impl<L: TaskLauncher> LocalCoordinator<L> {
    /// Create a coordinator that reports through `events`.
    #[must_use]
    pub fn new(launcher: Arc<L>, events: EventEmitter) -> Self {
        Self {
            registry: WorkerRegistry::new(),
            launcher,
            events,
        }
    }

    fn bundle(&self, worker_id: &WorkerId) -> Result<Arc<WorkerBundle>, CoordinatorError> {
        self.registry
            .get(worker_id)
            .ok_or_else(|| CoordinatorError::WorkerNotFound(worker_id.clone()))
    }
}

#[async_trait]
impl<L: TaskLauncher> WorkerCoordinator for LocalCoordinator<L> {
    async fn register_worker(&self, bundle: Arc<WorkerBundle>) -> Result<(), CoordinatorError> {
        let worker_id = bundle.id().clone();

        if self.registry.insert(bundle) {
            tracing::info!(worker_id = %worker_id, "Registered worker");
            for retired in self.registry.supersede(&worker_id) {
                tracing::info!(worker_id = %retired, "Retired superseded worker");
            }
            self.events.worker_registered(WorkerRegistered {
                background_worker_id: worker_id,
            });
        } else {
            tracing::debug!(worker_id = %worker_id, "Worker already registered");
        }
        Ok(())
    }

    async fn execute_task_run(
        &self,
        worker_id: &WorkerId,
        payload: TaskRunExecutionPayload,
        message_id: &str,
    ) -> Result<TaskRunCompletion, CoordinatorError> {
        let bundle = self.bundle(worker_id)?;
        let run_id = payload
            .execution
            .run_id()
            .ok_or(CoordinatorError::MissingRunId)?;

        if !bundle.start_run(run_id.clone()) {
            return Err(CoordinatorError::RunInProgress(run_id));
        }
        let guard = InProgress {
            registry: &self.registry,
            bundle: &bundle,
            run_id: run_id.clone(),
        };

        tracing::debug!(
            worker_id = %worker_id,
            run_id = %run_id,
            message_id,
            "Launching run"
        );

        let execution = payload.execution.clone();
        let heartbeat = RunHeartbeat {
            worker_id: worker_id.clone(),
            run_id,
            events: self.events.clone(),
        };
        let outcome = self
            .launcher
            .launch(Arc::clone(&bundle), payload, heartbeat)
            .await;
        drop(guard);

        match outcome {
            LaunchOutcome::Completed(completion) => {
                self.events.task_completed(TaskCompleted {
                    background_worker_id: worker_id.clone(),
                    completion: completion.clone(),
                    execution,
                });
                Ok(completion)
            }
            LaunchOutcome::FailedToRun(completion) => {
                tracing::warn!(worker_id = %worker_id, "Run failed to start");
                self.events.task_failed_to_run(TaskFailedToRun {
                    background_worker_id: worker_id.clone(),
                    completion: completion.clone(),
                });
                Ok(completion)
            }
        }
    }

    async fn cancel_run(&self, worker_id: &WorkerId, run_id: &RunId) {
        match self.registry.get(worker_id) {
            Some(bundle) => self.launcher.cancel(&bundle, run_id).await,
            None => {
                tracing::warn!(
                    worker_id = %worker_id,
                    run_id = %run_id,
                    "Cancel for unknown worker"
                );
            }
        }
    }

    fn current_workers(&self) -> Vec<BundleSnapshot> {
        self.registry.snapshots()
    }
}
