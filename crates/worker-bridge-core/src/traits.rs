//! Contracts for the collaborators this layer drives but does not implement.

use std::{collections::HashMap, path::Path, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    bundle::{BundleSnapshot, WorkerBundle},
    execution::{TaskRunCompletion, TaskRunExecution, TaskRunExecutionPayload},
    ids::{RunId, WorkerId},
    manifest::{BuildManifest, SourceFileMetadata, TaskDescriptor, WorkerManifest},
};

/// Control plane API error.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The server answered and refused the request.
    #[error("Request rejected: {0}")]
    Rejected(String),
    /// The request never got an answer.
    #[error("Request failed: {0}")]
    Transport(String),
}

/// Worker coordinator error.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Worker not found: {0}")]
    WorkerNotFound(WorkerId),
    #[error("Run already in progress: {0}")]
    RunInProgress(RunId),
    #[error("Execution record has no run id")]
    MissingRunId,
}

/// Error produced while materializing a build.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Worker initialization failed: {0}")]
    Initialization(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Metadata describing a build, sent when registering it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundWorkerMetadata {
    pub package_version: String,
    pub cli_package_version: String,
    pub tasks: Vec<TaskDescriptor>,
    pub content_hash: String,
    pub source_files: Vec<SourceFileMetadata>,
}

/// Body of the worker registration request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBackgroundWorkerRequest {
    pub local_only: bool,
    pub metadata: BackgroundWorkerMetadata,
    pub supports_lazy_attempts: bool,
}

impl CreateBackgroundWorkerRequest {
    /// Registration for a worker running on this machine.
    #[must_use]
    pub const fn local(metadata: BackgroundWorkerMetadata) -> Self {
        Self {
            local_only: true,
            metadata,
            supports_lazy_attempts: true,
        }
    }
}

/// Worker record created by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackgroundWorkerRecord {
    pub id: WorkerId,
    #[serde(default)]
    pub version: String,
}

/// Control plane HTTP API.
#[async_trait]
pub trait ApiClient: Send + Sync {
    /// Register a build as a background worker.
    async fn create_background_worker(
        &self,
        project_ref: &str,
        body: &CreateBackgroundWorkerRequest,
    ) -> Result<BackgroundWorkerRecord, ApiError>;

    /// Create an attempt for a run and return its execution record.
    async fn create_task_run_attempt(&self, run_id: &RunId)
    -> Result<TaskRunExecution, ApiError>;

    /// Variables configured for the project on the control plane.
    async fn get_environment_variables(
        &self,
        project_ref: &str,
    ) -> Result<HashMap<String, String>, ApiError>;
}

/// Turns a build artifact into a runnable bundle and reports its tasks.
#[async_trait]
pub trait WorkerBuilder: Send + Sync {
    async fn initialize(
        &self,
        build: &BuildManifest,
        env: &HashMap<String, String>,
        cwd: &Path,
    ) -> Result<WorkerManifest, BuildError>;
}

/// Reads variables declared in a local env file.
pub trait EnvFileSource: Send + Sync {
    /// Load variables from `path`, or from the default location when `None`.
    ///
    /// # Errors
    /// Returns error if the file exists but cannot be read.
    fn load(&self, path: Option<&Path>) -> Result<HashMap<String, String>, std::io::Error>;
}

/// Tracks registered bundles and runs executing under them.
///
/// Implementations push lifecycle events through an
/// [`EventEmitter`](crate::events::EventEmitter).
#[async_trait]
pub trait WorkerCoordinator: Send + Sync {
    /// Track a bundle. Registering the same id again must be a no-op.
    async fn register_worker(&self, bundle: Arc<WorkerBundle>) -> Result<(), CoordinatorError>;

    /// Execute a run and wait for it to finish.
    async fn execute_task_run(
        &self,
        worker_id: &WorkerId,
        payload: TaskRunExecutionPayload,
        message_id: &str,
    ) -> Result<TaskRunCompletion, CoordinatorError>;

    /// Ask a run to stop. Returns without waiting for it.
    async fn cancel_run(&self, worker_id: &WorkerId, run_id: &RunId);

    /// Snapshot of every registered bundle.
    fn current_workers(&self) -> Vec<BundleSnapshot>;
}
