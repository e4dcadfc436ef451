//! Dispatch of inbound messages to their handlers.
//!
//! Each decoded message runs on its own task. Nothing serializes handlers
//! against each other, so a handler must not assume any message that arrived
//! earlier has finished.

use std::{fmt::Display, sync::Arc};

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::{
    codec::{self, Frame},
    protocol::{ServerMessage, ServerReady, WorkerCommandMessage},
};

/// Handlers for each inbound message kind.
#[async_trait]
pub trait ServerMessageHandler: Send + Sync + 'static {
    type Error: Display + Send;

    async fn server_ready(&self, message: ServerReady) -> Result<(), Self::Error>;

    async fn background_worker_message(
        &self,
        message: WorkerCommandMessage,
    ) -> Result<(), Self::Error>;
}

/// Decodes frames and hands them to a [`ServerMessageHandler`].
pub struct MessageRouter<H> {
    handler: Arc<H>,
}

impl<H> Clone for MessageRouter<H> {
    fn clone(&self) -> Self {
        Self {
            handler: Arc::clone(&self.handler),
        }
    }
}

impl<H: ServerMessageHandler> MessageRouter<H> {
    #[must_use]
    pub const fn new(handler: Arc<H>) -> Self {
        Self { handler }
    }

    /// Decode a frame and dispatch it.
    ///
    /// Malformed frames are logged and dropped. Returns the handler task, if
    /// one was started.
    pub fn route(&self, frame: &Frame) -> Option<JoinHandle<()>> {
        match codec::decode(frame) {
            Ok(message) => self.dispatch(message),
            Err(e) => {
                tracing::error!(error = %e, "Error while handling websocket message");
                tracing::debug!(frame = ?frame, "Dropped malformed frame");
                None
            }
        }
    }

    /// Dispatch an already decoded message.
    pub fn dispatch(&self, message: ServerMessage) -> Option<JoinHandle<()>> {
        let handler = Arc::clone(&self.handler);

        match message {
            ServerMessage::ServerReady(payload) => Some(tokio::spawn(async move {
                if let Err(e) = handler.server_ready(payload).await {
                    tracing::error!(error = %e, "SERVER_READY handler failed");
                }
            })),
            ServerMessage::BackgroundWorkerMessage(payload) => Some(tokio::spawn(async move {
                let worker_id = payload.background_worker_id.clone();
                if let Err(e) = handler.background_worker_message(payload).await {
                    tracing::error!(
                        worker_id = %worker_id,
                        error = %e,
                        "BACKGROUND_WORKER_MESSAGE handler failed"
                    );
                }
            })),
            ServerMessage::Unknown { kind } => {
                tracing::debug!(kind = %kind, "Ignoring message with unknown type");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::{Notify, mpsc};

    use super::*;

    #[derive(Default)]
    struct Recorder {
        ready: AtomicUsize,
        worker: AtomicUsize,
    }

    #[async_trait]
    impl ServerMessageHandler for Recorder {
        type Error = String;

        async fn server_ready(&self, _message: ServerReady) -> Result<(), String> {
            self.ready.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn background_worker_message(
            &self,
            _message: WorkerCommandMessage,
        ) -> Result<(), String> {
            self.worker.fetch_add(1, Ordering::SeqCst);
            Err("boom".to_string())
        }
    }

    fn frame(value: &serde_json::Value) -> Frame {
        Frame::Text(value.to_string())
    }

    #[tokio::test]
    async fn test_routes_by_type() {
        let recorder = Arc::new(Recorder::default());
        let router = MessageRouter::new(Arc::clone(&recorder));

        let ready = frame(&serde_json::json!({
            "type": "SERVER_READY",
            "payload": { "id": "s1" }
        }));
        router
            .route(&ready)
            .unwrap()
            .await
            .unwrap();
        router
            .route(&frame(&serde_json::json!({
                "type": "BACKGROUND_WORKER_MESSAGE",
                "payload": {
                    "backgroundWorkerId": "w1",
                    "data": { "type": "CANCEL_ATTEMPT", "taskRunId": "run_1" }
                }
            })))
            .unwrap()
            .await
            .unwrap();

        assert_eq!(recorder.ready.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.worker.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_frames_invoke_nothing() {
        let recorder = Arc::new(Recorder::default());
        let router = MessageRouter::new(Arc::clone(&recorder));

        let unknown = frame(&serde_json::json!({ "type": "SOMETHING_NEW", "payload": {} }));
        let malformed = frame(&serde_json::json!({
            "type": "BACKGROUND_WORKER_MESSAGE",
            "payload": 3
        }));

        assert!(router.route(&unknown).is_none());
        assert!(router.route(&Frame::Text("{".to_string())).is_none());
        assert!(router.route(&malformed).is_none());

        assert_eq!(recorder.ready.load(Ordering::SeqCst), 0);
        assert_eq!(recorder.worker.load(Ordering::SeqCst), 0);
    }

    struct Blocking {
        release: Notify,
        finished: mpsc::UnboundedSender<&'static str>,
    }

    #[async_trait]
    impl ServerMessageHandler for Blocking {
        type Error = String;

        async fn server_ready(&self, _message: ServerReady) -> Result<(), String> {
            self.release.notified().await;
            let _ = self.finished.send("ready");
            Ok(())
        }

        async fn background_worker_message(
            &self,
            _message: WorkerCommandMessage,
        ) -> Result<(), String> {
            let _ = self.finished.send("worker");
            self.release.notify_one();
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_handlers_are_not_serialized() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let router = MessageRouter::new(Arc::new(Blocking {
            release: Notify::new(),
            finished: tx,
        }));

        let first = router
            .route(&frame(&serde_json::json!({ "type": "SERVER_READY" })))
            .unwrap();
        let second = router
            .route(&frame(&serde_json::json!({
                "type": "BACKGROUND_WORKER_MESSAGE",
                "payload": {
                    "backgroundWorkerId": "w1",
                    "data": { "type": "CANCEL_ATTEMPT", "taskRunId": "run_1" }
                }
            })))
            .unwrap();

        second.await.unwrap();
        first.await.unwrap();

        assert_eq!(rx.recv().await, Some("worker"));
        assert_eq!(rx.recv().await, Some("ready"));
    }
}
