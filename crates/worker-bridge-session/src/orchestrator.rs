//! Session orchestration.
//!
//! Wires the coordinator's events to the outbound transport, routes server
//! commands to the coordinator, and runs builds through the lifecycle.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::{sync::mpsc, task::JoinHandle};
use worker_bridge_core::{
    ApiClient, BuildManifest, CoordinatorEvents, EnvFileSource, ExecutionMetric,
    LazyAttemptPayload, RunId, TaskRunExecutionPayload, WorkerBuilder, WorkerCoordinator,
    WorkerId,
    events::WorkerRegistered,
    traits::{ApiError, CoordinatorError},
};
use worker_bridge_transport::{
    ClientMessage, ClientMessageSink, ConnectionState, Frame, MessageRouter, ServerMessageHandler,
    TransportError, TransportEvent, TransportHandle, TransportSession, WorkerCommand,
    WsConnector,
    protocol::{ServerReady, WorkerCommandMessage},
};

use crate::{
    config::{ConfigError, SessionConfig},
    lifecycle::{BuildLifecycleManager, BuildOutcome, LifecycleError, LifecycleEvent},
};

/// Session error.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Failed to create attempt for run {run_id}: {source}")]
    AttemptCreation {
        run_id: RunId,
        #[source]
        source: ApiError,
    },
    #[error("Coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),
}

/// Handlers for inbound server messages.
pub struct SessionHandlers<C, A, S> {
    coordinator: Arc<C>,
    api: Arc<A>,
    sink: Arc<S>,
}

impl<C, A, S> SessionHandlers<C, A, S>
where
    C: WorkerCoordinator,
    A: ApiClient,
    S: ClientMessageSink,
{
    async fn execute_lazy_attempt(
        &self,
        worker_id: &WorkerId,
        attempt: LazyAttemptPayload,
    ) -> Result<(), SessionError> {
        let started_at = Utc::now();
        let run_id = attempt.run_id.clone();

        let execution = self
            .api
            .create_task_run_attempt(&run_id)
            .await
            .map_err(|source| SessionError::AttemptCreation {
                run_id: run_id.clone(),
                source,
            })?;

        let seed = ExecutionMetric {
            name: "start".to_string(),
            event: "create_attempt".to_string(),
            timestamp: started_at.timestamp_millis(),
            duration: (Utc::now() - started_at).num_milliseconds(),
        };

        tracing::debug!(worker_id = %worker_id, run_id = %run_id, "Executing lazy attempt");

        let message_id = attempt.message_id.clone();
        let payload = TaskRunExecutionPayload::from_lazy_attempt(execution, attempt, seed);
        let completion = self
            .coordinator
            .execute_task_run(worker_id, payload, &message_id)
            .await?;

        tracing::debug!(
            worker_id = %worker_id,
            run_id = %run_id,
            completion = ?completion,
            "Lazy attempt finished"
        );
        Ok(())
    }
}

#[async_trait]
impl<C, A, S> ServerMessageHandler for SessionHandlers<C, A, S>
where
    C: WorkerCoordinator + 'static,
    A: ApiClient + 'static,
    S: ClientMessageSink + 'static,
{
    type Error = SessionError;

    async fn server_ready(&self, message: ServerReady) -> Result<(), SessionError> {
        let workers = self.coordinator.current_workers();
        tracing::debug!(
            server_id = ?message.id,
            workers = workers.len(),
            "Server ready, replaying worker readiness"
        );

        for worker in workers {
            self.sink
                .send_message(ClientMessage::ready_with_runs(worker.id, worker.in_progress_runs))?;
        }
        Ok(())
    }

    async fn background_worker_message(
        &self,
        message: WorkerCommandMessage,
    ) -> Result<(), SessionError> {
        let WorkerCommandMessage {
            background_worker_id,
            data,
        } = message;

        match data {
            WorkerCommand::CancelAttempt { task_run_id } => {
                tracing::debug!(
                    worker_id = %background_worker_id,
                    run_id = %task_run_id,
                    "Cancelling attempt"
                );
                self.coordinator
                    .cancel_run(&background_worker_id, &task_run_id)
                    .await;
                Ok(())
            }
            WorkerCommand::ExecuteRunLazyAttempt { payload } => {
                self.execute_lazy_attempt(&background_worker_id, payload)
                    .await
            }
            WorkerCommand::Unknown => {
                tracing::debug!(
                    worker_id = %background_worker_id,
                    "Ignoring worker command with unknown type"
                );
                Ok(())
            }
        }
    }
}

/// One local development session.
///
/// Owns the coordinator's event receivers, so each coordinator event is
/// forwarded exactly once for as long as the coordinator keeps emitting.
pub struct SessionOrchestrator<C, A, B, S = TransportHandle> {
    router: MessageRouter<SessionHandlers<C, A, S>>,
    lifecycle: BuildLifecycleManager<C, A, B>,
    transport: Option<TransportHandle>,
}

impl<C, A, B, S> SessionOrchestrator<C, A, B, S>
where
    C: WorkerCoordinator + 'static,
    A: ApiClient + 'static,
    B: WorkerBuilder,
    S: ClientMessageSink + 'static,
{
    /// Create an orchestrator that writes outbound messages to `sink`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        config: SessionConfig,
        coordinator: Arc<C>,
        api: Arc<A>,
        builder: B,
        events: CoordinatorEvents,
        sink: S,
    ) -> Self {
        let sink = Arc::new(sink);
        spawn_forwarders(events, &sink);

        let handlers = SessionHandlers {
            coordinator: Arc::clone(&coordinator),
            api: Arc::clone(&api),
            sink,
        };
        let lifecycle = BuildLifecycleManager::new(Arc::new(config), coordinator, api, builder);

        Self {
            router: MessageRouter::new(Arc::new(handlers)),
            lifecycle,
            transport: None,
        }
    }

    /// Read the local env file layer from `source`.
    #[must_use]
    pub fn with_env_file(mut self, source: Arc<dyn EnvFileSource>) -> Self {
        self.lifecycle = self.lifecycle.with_env_file(source);
        self
    }

    /// Deliver lifecycle events to `observer`.
    #[must_use]
    pub fn with_observer(mut self, observer: mpsc::UnboundedSender<LifecycleEvent>) -> Self {
        self.lifecycle = self.lifecycle.with_observer(observer);
        self
    }

    /// Decode and dispatch one inbound frame.
    pub fn handle_frame(&self, frame: &Frame) -> Option<JoinHandle<()>> {
        self.router.route(frame)
    }

    /// Run a build through the lifecycle. See
    /// [`BuildLifecycleManager::initialize_worker`].
    ///
    /// # Errors
    /// Returns error if the build cannot be materialized or registered.
    pub async fn initialize_worker<F>(
        &self,
        build: BuildManifest,
        stop: F,
    ) -> Result<BuildOutcome, LifecycleError>
    where
        F: FnOnce() + Send,
    {
        self.lifecycle.initialize_worker(build, stop).await
    }

    pub async fn last_build_hash(&self) -> Option<String> {
        self.lifecycle.last_build_hash().await
    }

    /// State of the owned transport, if any.
    #[must_use]
    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.transport.as_ref().map(TransportHandle::state)
    }

    /// Close the transport if it is connecting or open.
    pub fn shutdown(&self) {
        let Some(transport) = &self.transport else {
            return;
        };

        match transport.state() {
            ConnectionState::Connecting | ConnectionState::Open => {
                tracing::debug!("Closing session transport");
                transport.close();
            }
            ConnectionState::Closed => {
                tracing::debug!("Session transport already closed");
            }
        }
    }
}

impl<C, A, B> SessionOrchestrator<C, A, B, TransportHandle>
where
    C: WorkerCoordinator + 'static,
    A: ApiClient + 'static,
    B: WorkerBuilder,
{
    /// Connect to the control server and start the session.
    ///
    /// The connection is made in the background; messages sent before it is
    /// open are queued.
    ///
    /// # Errors
    /// Returns error if the configured API URL cannot be turned into a
    /// socket URL.
    pub fn start(
        config: SessionConfig,
        coordinator: Arc<C>,
        api: Arc<A>,
        builder: B,
        events: CoordinatorEvents,
    ) -> Result<Self, SessionError> {
        let url = config.websocket_url()?;
        let connector = WsConnector::new(url.as_str(), config.access_token.clone())
            .with_user_agent(config.user_agent());

        tracing::info!(url = %url, project = %config.project_ref, "Starting session");

        let (handle, transport_events) = TransportSession::spawn(
            connector,
            config.reconnect.clone(),
            config.max_queued_messages,
        );

        let mut orchestrator = Self::new(config, coordinator, api, builder, events, handle.clone());
        tokio::spawn(drive_transport(orchestrator.router.clone(), transport_events));
        orchestrator.transport = Some(handle);
        Ok(orchestrator)
    }
}

async fn drive_transport<H: ServerMessageHandler>(
    router: MessageRouter<H>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Message(frame) => {
                router.route(&frame);
            }
            TransportEvent::StateChanged(state) => {
                tracing::debug!(state = ?state, "Connection state changed");
            }
            TransportEvent::Open => tracing::debug!("Connection open"),
            TransportEvent::Closed => tracing::debug!("Connection closed"),
            TransportEvent::Error(e) => tracing::debug!(error = %e, "Connection error"),
            TransportEvent::Failed { retries } => {
                tracing::error!(retries, "Giving up on the control server connection");
            }
        }
    }
    tracing::debug!("Transport event stream ended");
}

fn spawn_forwarders<S>(events: CoordinatorEvents, sink: &Arc<S>)
where
    S: ClientMessageSink + 'static,
{
    let CoordinatorEvents {
        registered,
        heartbeat,
        completed,
        failed_to_run,
    } = events;

    forward(registered, Arc::clone(sink), |event: WorkerRegistered| {
        ClientMessage::ready(event.background_worker_id)
    });
    forward(heartbeat, Arc::clone(sink), ClientMessage::from);
    forward(completed, Arc::clone(sink), ClientMessage::from);
    forward(failed_to_run, Arc::clone(sink), ClientMessage::from);
}

fn forward<T, S>(
    mut events: mpsc::UnboundedReceiver<T>,
    sink: Arc<S>,
    to_message: fn(T) -> ClientMessage,
) where
    T: Send + 'static,
    S: ClientMessageSink + 'static,
{
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let message = to_message(event);
            let kind = message.kind();
            if let Err(e) = sink.send_message(message) {
                tracing::warn!(kind, error = %e, "Failed to forward coordinator event");
            }
        }
    });
}
