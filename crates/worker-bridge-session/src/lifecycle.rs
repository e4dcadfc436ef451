//! Turns build artifacts into registered workers.
//!
//! A build goes through dedup, environment resolution, materialization,
//! validation, publication and registration with the coordinator. Builds are
//! processed one at a time; the hash of the last build that made it all the
//! way through is what later builds are deduplicated against.

use std::{collections::HashMap, sync::Arc};

use tokio::sync::{Mutex, mpsc};
use worker_bridge_core::{
    ApiClient, BuildManifest, EnvFileSource, SourceFile, SourceFileMetadata, TaskDescriptor,
    WorkerBuilder, WorkerBundle, WorkerCoordinator, WorkerId,
    traits::{
        ApiError, BackgroundWorkerMetadata, BuildError, CoordinatorError,
        CreateBackgroundWorkerRequest,
    },
};

use crate::{
    config::SessionConfig,
    env::{EnvLayers, NoEnvFile, protocol_overlay, resolve_environment},
    validation::{ValidationIssue, validate_worker_manifest},
};

/// Build lifecycle error.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("Could not initialize worker: {0}")]
    Initialization(#[from] BuildError),
    #[error("Failed to register worker: {0}")]
    Registration(#[source] ApiError),
    #[error("Coordinator rejected worker: {0}")]
    Coordinator(#[from] CoordinatorError),
}

/// What happened to a build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    /// Same content as the last registered build.
    Skipped,
    /// The build's tasks failed validation and were not published.
    Rejected(ValidationIssue),
    /// Published and handed to the coordinator.
    Initialized(WorkerId),
}

/// Notification for observers of the lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    WorkerSkipped,
    WorkerInitialized { worker_id: WorkerId },
}

/// Drives builds through to registration.
pub struct BuildLifecycleManager<C, A, B> {
    config: Arc<SessionConfig>,
    coordinator: Arc<C>,
    api: Arc<A>,
    builder: B,
    env_file: Arc<dyn EnvFileSource>,
    last_build: Mutex<Option<BuildManifest>>,
    observer: Option<mpsc::UnboundedSender<LifecycleEvent>>,
}

impl<C, A, B> BuildLifecycleManager<C, A, B>
where
    C: WorkerCoordinator,
    A: ApiClient,
    B: WorkerBuilder,
{
    #[must_use]
    pub fn new(config: Arc<SessionConfig>, coordinator: Arc<C>, api: Arc<A>, builder: B) -> Self {
        Self {
            config,
            coordinator,
            api,
            builder,
            env_file: Arc::new(NoEnvFile),
            last_build: Mutex::new(None),
            observer: None,
        }
    }

    /// Read the local env file layer from `source`.
    #[must_use]
    pub fn with_env_file(mut self, source: Arc<dyn EnvFileSource>) -> Self {
        self.env_file = source;
        self
    }

    /// Deliver lifecycle events to `observer`.
    #[must_use]
    pub fn with_observer(mut self, observer: mpsc::UnboundedSender<LifecycleEvent>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Hash of the last build that was registered.
    pub async fn last_build_hash(&self) -> Option<String> {
        self.last_build
            .lock()
            .await
            .as_ref()
            .map(|build| build.content_hash.clone())
    }

    /// Take a build through the lifecycle.
    ///
    /// `stop` is called whenever the build does not end up registered,
    /// including when it is skipped as a duplicate.
    ///
    /// # Errors
    /// Returns error if the build cannot be materialized, the control plane
    /// refuses it, or the coordinator cannot track it. Validation failures
    /// are not errors; they come back as [`BuildOutcome::Rejected`].
    pub async fn initialize_worker<F>(
        &self,
        build: BuildManifest,
        stop: F,
    ) -> Result<BuildOutcome, LifecycleError>
    where
        F: FnOnce() + Send,
    {
        let mut last_build = self.last_build.lock().await;

        if last_build
            .as_ref()
            .is_some_and(|last| last.content_hash == build.content_hash)
        {
            tracing::debug!(content_hash = %build.content_hash, "Build unchanged, skipping");
            self.notify(LifecycleEvent::WorkerSkipped);
            stop();
            return Ok(BuildOutcome::Skipped);
        }

        match self.publish(&build).await {
            Ok(BuildOutcome::Initialized(worker_id)) => {
                *last_build = Some(build);
                self.notify(LifecycleEvent::WorkerInitialized {
                    worker_id: worker_id.clone(),
                });
                Ok(BuildOutcome::Initialized(worker_id))
            }
            Ok(outcome) => {
                stop();
                Ok(outcome)
            }
            Err(e) => {
                tracing::error!(content_hash = %build.content_hash, error = %e, "Build failed");
                stop();
                Err(e)
            }
        }
    }

    async fn publish(&self, build: &BuildManifest) -> Result<BuildOutcome, LifecycleError> {
        let env = self.resolve_env().await;
        let manifest = self
            .builder
            .initialize(build, &env, &self.config.working_dir)
            .await?;

        if let Some(issue) = validate_worker_manifest(&manifest) {
            let report = issue.report(build);
            tracing::error!(content_hash = %build.content_hash, "{report}");
            return Ok(BuildOutcome::Rejected(issue));
        }

        let body = CreateBackgroundWorkerRequest::local(BackgroundWorkerMetadata {
            package_version: build.package_version.clone(),
            cli_package_version: build.cli_package_version.clone(),
            tasks: manifest.tasks.clone(),
            content_hash: build.content_hash.clone(),
            source_files: resolve_source_files(&build.sources, &manifest.tasks),
        });

        let record = self
            .api
            .create_background_worker(&self.config.project_ref, &body)
            .await
            .map_err(LifecycleError::Registration)?;

        tracing::info!(
            worker_id = %record.id,
            version = %record.version,
            tasks = manifest.tasks.len(),
            "Background worker created"
        );

        let worker_id = record.id.clone();
        let bundle = WorkerBundle::new(record.id, build.clone(), manifest, env);
        self.coordinator.register_worker(Arc::new(bundle)).await?;

        Ok(BuildOutcome::Initialized(worker_id))
    }

    async fn resolve_env(&self) -> HashMap<String, String> {
        let remote = match self
            .api
            .get_environment_variables(&self.config.project_ref)
            .await
        {
            Ok(vars) => vars,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to fetch remote environment variables");
                HashMap::new()
            }
        };

        let file = match self.env_file.load(self.config.env_file.as_deref()) {
            Ok(vars) => vars,
            Err(e) => {
                tracing::warn!(
                    path = ?self.config.env_file,
                    error = %e,
                    "Failed to load env file"
                );
                HashMap::new()
            }
        };

        let layers = EnvLayers {
            remote,
            file,
            ..EnvLayers::from_process()
        };
        resolve_environment(layers, protocol_overlay(&self.config))
    }

    fn notify(&self, event: LifecycleEvent) {
        if let Some(observer) = &self.observer {
            if observer.send(event).is_err() {
                tracing::debug!("Lifecycle observer gone");
            }
        }
    }
}

/// Source files that define at least one task, in order of first appearance.
///
/// Tasks pointing at a file missing from `sources` are left out.
#[must_use]
pub fn resolve_source_files(
    sources: &HashMap<String, SourceFile>,
    tasks: &[TaskDescriptor],
) -> Vec<SourceFileMetadata> {
    let mut files: Vec<SourceFileMetadata> = Vec::new();

    for task in tasks {
        if let Some(file) = files.iter_mut().find(|f| f.file_path == task.file_path) {
            file.task_ids.push(task.id.clone());
            continue;
        }

        let Some(source) = sources.get(&task.file_path) else {
            tracing::debug!(file_path = %task.file_path, "No source contents for task file");
            continue;
        };

        files.push(SourceFileMetadata {
            file_path: task.file_path.clone(),
            contents: source.contents.clone(),
            content_hash: source.content_hash.clone(),
            task_ids: vec![task.id.clone()],
        });
    }

    files
}
