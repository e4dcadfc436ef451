//! Fakes for the external collaborators.

use std::{
    collections::{HashMap, HashSet},
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use tokio::sync::oneshot;
use worker_bridge_core::{
    ApiClient, BuildManifest, EnvFileSource, RunId, TaskDescriptor, TaskRunCompletion,
    TaskRunExecution, TaskRunExecutionPayload, WorkerBuilder, WorkerBundle, WorkerManifest,
    traits::{ApiError, BackgroundWorkerRecord, BuildError, CreateBackgroundWorkerRequest},
};

use crate::coordinator::{LaunchOutcome, RunHeartbeat, TaskLauncher};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Default)]
pub struct FakeApi {
    pub reject_registration: AtomicBool,
    pub fail_remote_env: AtomicBool,
    remote_env: HashMap<String, String>,
    registrations: Mutex<Vec<CreateBackgroundWorkerRequest>>,
    failing_runs: Mutex<HashSet<RunId>>,
    attempts: AtomicUsize,
}

impl FakeApi {
    pub fn with_remote_env(vars: &[(&str, &str)]) -> Self {
        Self {
            remote_env: vars
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            ..Self::default()
        }
    }

    pub fn fail_attempt(&self, run_id: &str) {
        self.failing_runs.lock().unwrap().insert(RunId::new(run_id));
    }

    pub fn registrations(&self) -> Vec<CreateBackgroundWorkerRequest> {
        self.registrations.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ApiClient for FakeApi {
    async fn create_background_worker(
        &self,
        _project_ref: &str,
        body: &CreateBackgroundWorkerRequest,
    ) -> Result<BackgroundWorkerRecord, ApiError> {
        if self.reject_registration.load(Ordering::SeqCst) {
            return Err(ApiError::Rejected("invalid build".to_string()));
        }
        let mut registrations = self.registrations.lock().unwrap();
        registrations.push(body.clone());
        Ok(BackgroundWorkerRecord {
            id: format!("worker_{}", registrations.len()).into(),
            version: "20240101.1".to_string(),
        })
    }

    async fn create_task_run_attempt(&self, run_id: &RunId) -> Result<TaskRunExecution, ApiError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing_runs.lock().unwrap().contains(run_id) {
            return Err(ApiError::Transport("connection reset".to_string()));
        }
        Ok(TaskRunExecution(serde_json::json!({
            "run": { "id": run_id },
            "attempt": { "number": 1 },
        })))
    }

    async fn get_environment_variables(
        &self,
        _project_ref: &str,
    ) -> Result<HashMap<String, String>, ApiError> {
        if self.fail_remote_env.load(Ordering::SeqCst) {
            return Err(ApiError::Transport("timed out".to_string()));
        }
        Ok(self.remote_env.clone())
    }
}

pub struct FakeBuilder {
    tasks: Vec<TaskDescriptor>,
    fail: bool,
    seen_env: Mutex<Option<HashMap<String, String>>>,
}

impl FakeBuilder {
    pub fn with_tasks(tasks: &[(&str, &str, &str)]) -> Self {
        Self {
            tasks: tasks
                .iter()
                .map(|(id, file, export)| TaskDescriptor::new(*id, *file, *export))
                .collect(),
            fail: false,
            seen_env: Mutex::new(None),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::with_tasks(&[])
        }
    }

    pub fn seen_env(&self) -> Option<HashMap<String, String>> {
        self.seen_env.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkerBuilder for FakeBuilder {
    async fn initialize(
        &self,
        _build: &BuildManifest,
        env: &HashMap<String, String>,
        _cwd: &Path,
    ) -> Result<WorkerManifest, BuildError> {
        *self.seen_env.lock().unwrap() = Some(env.clone());
        if self.fail {
            return Err(BuildError::Initialization("worker exited with code 1".to_string()));
        }
        Ok(WorkerManifest::new(self.tasks.clone()))
    }
}

pub struct StaticEnvFile(pub HashMap<String, String>);

impl EnvFileSource for StaticEnvFile {
    fn load(&self, _path: Option<&Path>) -> Result<HashMap<String, String>, std::io::Error> {
        Ok(self.0.clone())
    }
}

/// Launcher whose runs finish when the test says so. Runs without a gate
/// complete immediately.
#[derive(Default)]
pub struct GatedLauncher {
    gates: Mutex<HashMap<RunId, oneshot::Receiver<LaunchOutcome>>>,
    launched: Mutex<Vec<TaskRunExecutionPayload>>,
    cancelled: Mutex<Vec<RunId>>,
}

impl GatedLauncher {
    pub fn gate(&self, run_id: &str) -> oneshot::Sender<LaunchOutcome> {
        let (tx, rx) = oneshot::channel();
        self.gates.lock().unwrap().insert(RunId::new(run_id), rx);
        tx
    }

    pub fn launched(&self) -> Vec<TaskRunExecutionPayload> {
        self.launched.lock().unwrap().clone()
    }

    pub fn cancelled(&self) -> Vec<RunId> {
        self.cancelled.lock().unwrap().clone()
    }
}

pub fn completion(run_id: &str) -> TaskRunCompletion {
    TaskRunCompletion(serde_json::json!({ "id": run_id, "ok": true }))
}

#[async_trait]
impl TaskLauncher for GatedLauncher {
    async fn launch(
        &self,
        _bundle: Arc<WorkerBundle>,
        payload: TaskRunExecutionPayload,
        heartbeat: RunHeartbeat,
    ) -> LaunchOutcome {
        self.launched.lock().unwrap().push(payload);
        heartbeat.beat();

        let gate = self.gates.lock().unwrap().remove(heartbeat.run_id());
        match gate {
            Some(rx) => rx.await.unwrap(),
            None => LaunchOutcome::Completed(completion(heartbeat.run_id().as_str())),
        }
    }

    async fn cancel(&self, _bundle: &WorkerBundle, run_id: &RunId) {
        self.cancelled.lock().unwrap().push(run_id.clone());
    }
}
