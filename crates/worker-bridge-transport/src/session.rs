//! Reconnecting duplex session with the control server.
//!
//! A single supervisor task owns the connection. It reconnects with
//! exponential backoff, queues outbound frames while disconnected and reports
//! state changes and inbound frames as [`TransportEvent`]s.

use std::{pin::Pin, time::Duration};

use async_trait::async_trait;
use futures::{Sink, SinkExt, StreamExt, stream::BoxStream};
use tokio::sync::{mpsc, watch};
use worker_bridge_core::Outbox;

use crate::{
    codec::{self, CodecError, Frame},
    protocol::ClientMessage,
};

/// Transport error.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Connection attempt timed out after {0:?}")]
    Timeout(Duration),
    #[error("Invalid connection request: {0}")]
    InvalidRequest(String),
    #[error("Session closed")]
    Closed,
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[cfg(feature = "websocket")]
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Reconnection schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry.
    pub min_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Multiplier applied per consecutive failed attempt.
    pub growth_factor: f64,
    /// Retries allowed after the initial attempt before giving up.
    pub max_retries: u32,
    /// A connection attempt that takes longer than this is abandoned.
    pub connect_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            growth_factor: 1.4,
            max_retries: 64,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `retry` (zero-based), or `None` once the
    /// retry budget is spent.
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Option<Duration> {
        if retry >= self.max_retries {
            return None;
        }

        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let secs = self.min_delay.as_secs_f64() * self.growth_factor.powi(exponent);
        let max = self.max_delay.max(self.min_delay);

        if !secs.is_finite() || secs >= max.as_secs_f64() {
            return Some(max);
        }
        // A negative growth factor can flip the sign on odd retries.
        Some(Duration::from_secs_f64(secs.max(0.0)).max(self.min_delay))
    }
}

/// Connection state, observable for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// Something that happened on the transport.
#[derive(Debug)]
pub enum TransportEvent {
    StateChanged(ConnectionState),
    Open,
    Message(Frame),
    Closed,
    Error(TransportError),
    /// The retry budget is spent; no further attempts will be made.
    Failed { retries: u32 },
}

/// An established duplex connection.
pub struct Connection {
    pub sink: Pin<Box<dyn Sink<Frame, Error = TransportError> + Send>>,
    pub stream: BoxStream<'static, Result<Frame, TransportError>>,
}

/// Establishes connections on behalf of the session.
///
/// Credentials are applied per connection, so a fresh connection is the only
/// way to pick up new ones.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Connection, TransportError>;
}

enum Command {
    Send(Frame),
    Close,
}

/// Handle to a running [`TransportSession`].
#[derive(Clone)]
pub struct TransportHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl TransportHandle {
    /// Queue a frame for delivery.
    ///
    /// While disconnected the frame is held in a bounded queue that drops its
    /// oldest entry when full.
    ///
    /// # Errors
    /// Returns error if the session has shut down.
    pub fn send(&self, frame: Frame) -> Result<(), TransportError> {
        self.commands
            .send(Command::Send(frame))
            .map_err(|_| TransportError::Closed)
    }

    /// Close the connection and stop reconnecting.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }
}

/// Sink for outbound protocol messages.
pub trait ClientMessageSink: Send + Sync {
    /// Encode and queue a message.
    ///
    /// # Errors
    /// Returns error if the message cannot be encoded or the sink is closed.
    fn send_message(&self, message: ClientMessage) -> Result<(), TransportError>;
}

impl ClientMessageSink for TransportHandle {
    fn send_message(&self, message: ClientMessage) -> Result<(), TransportError> {
        self.send(codec::encode(&message)?)
    }
}

impl ClientMessageSink for mpsc::UnboundedSender<ClientMessage> {
    fn send_message(&self, message: ClientMessage) -> Result<(), TransportError> {
        self.send(message).map_err(|_| TransportError::Closed)
    }
}

/// Reconnecting session driven by a [`Connector`].
pub struct TransportSession;

impl TransportSession {
    /// Start the supervisor task.
    ///
    /// The first connection attempt starts immediately.
    pub fn spawn<C: Connector>(
        connector: C,
        policy: ReconnectPolicy,
        max_queued: usize,
    ) -> (TransportHandle, mpsc::UnboundedReceiver<TransportEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        let supervisor = Supervisor {
            connector,
            policy,
            outbox: Outbox::new(max_queued),
            commands: command_rx,
            events: event_tx,
            state: state_tx,
        };
        tokio::spawn(supervisor.run());

        let handle = TransportHandle {
            commands: command_tx,
            state: state_rx,
        };
        (handle, event_rx)
    }
}

enum ConnectOutcome {
    Connected(Connection),
    Failed(TransportError),
    Shutdown,
}

enum PumpExit {
    Dropped(Option<TransportError>),
    Shutdown,
}

struct Supervisor<C> {
    connector: C,
    policy: ReconnectPolicy,
    outbox: Outbox<Frame>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: watch::Sender<ConnectionState>,
}

impl<C: Connector> Supervisor<C> {
    async fn run(mut self) {
        let mut retries: u32 = 0;

        loop {
            self.set_state(ConnectionState::Connecting);

            match self.connect_once().await {
                ConnectOutcome::Connected(connection) => {
                    retries = 0;
                    self.set_state(ConnectionState::Open);
                    self.emit(TransportEvent::Open);

                    let exit = self.pump(connection).await;
                    self.set_state(ConnectionState::Closed);
                    self.emit(TransportEvent::Closed);
                    match exit {
                        PumpExit::Shutdown => return,
                        PumpExit::Dropped(Some(e)) => self.emit(TransportEvent::Error(e)),
                        PumpExit::Dropped(None) => {}
                    }
                }
                ConnectOutcome::Failed(e) => {
                    tracing::debug!(error = %e, retries, "Connection attempt failed");
                    self.emit(TransportEvent::Error(e));
                }
                ConnectOutcome::Shutdown => {
                    self.shutdown();
                    return;
                }
            }

            let Some(delay) = self.policy.delay_for(retries) else {
                tracing::warn!(retries, "Giving up on reconnecting");
                self.set_state(ConnectionState::Closed);
                self.emit(TransportEvent::Failed { retries });
                return;
            };
            retries += 1;

            tracing::debug!(
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                retry = retries,
                "Reconnecting"
            );
            if !self.wait(delay).await {
                self.shutdown();
                return;
            }
        }
    }

    async fn connect_once(&mut self) -> ConnectOutcome {
        let timeout = self.policy.connect_timeout;
        let connect = tokio::time::timeout(timeout, self.connector.connect());
        tokio::pin!(connect);

        loop {
            tokio::select! {
                result = &mut connect => {
                    return match result {
                        Ok(Ok(connection)) => ConnectOutcome::Connected(connection),
                        Ok(Err(e)) => ConnectOutcome::Failed(e),
                        Err(_) => ConnectOutcome::Failed(TransportError::Timeout(timeout)),
                    };
                }
                command = self.commands.recv() => match command {
                    Some(Command::Send(frame)) => enqueue(&mut self.outbox, frame),
                    Some(Command::Close) | None => return ConnectOutcome::Shutdown,
                },
            }
        }
    }

    async fn pump(&mut self, connection: Connection) -> PumpExit {
        let Connection {
            mut sink,
            mut stream,
        } = connection;

        let mut pending: std::collections::VecDeque<Frame> = self.outbox.drain().collect();
        if !pending.is_empty() {
            tracing::debug!(count = pending.len(), "Flushing queued messages");
        }
        while let Some(frame) = pending.pop_front() {
            if let Err(e) = sink.send(frame.clone()).await {
                for frame in std::iter::once(frame).chain(pending) {
                    enqueue(&mut self.outbox, frame);
                }
                return PumpExit::Dropped(Some(e));
            }
        }

        loop {
            tokio::select! {
                incoming = stream.next() => match incoming {
                    Some(Ok(frame)) => self.emit(TransportEvent::Message(frame)),
                    Some(Err(e)) => return PumpExit::Dropped(Some(e)),
                    None => return PumpExit::Dropped(None),
                },
                command = self.commands.recv() => match command {
                    Some(Command::Send(frame)) => {
                        if let Err(e) = sink.send(frame.clone()).await {
                            self.outbox.requeue_front(frame);
                            return PumpExit::Dropped(Some(e));
                        }
                    }
                    Some(Command::Close) | None => {
                        if let Err(e) = sink.close().await {
                            tracing::debug!(error = %e, "Error while closing connection");
                        }
                        return PumpExit::Shutdown;
                    }
                },
            }
        }
    }

    /// Sleep for `delay` while still accepting sends. Returns `false` if the
    /// session was closed meanwhile.
    async fn wait(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                () = &mut sleep => return true,
                command = self.commands.recv() => match command {
                    Some(Command::Send(frame)) => enqueue(&mut self.outbox, frame),
                    Some(Command::Close) | None => return false,
                },
            }
        }
    }

    fn shutdown(&self) {
        self.set_state(ConnectionState::Closed);
        self.emit(TransportEvent::Closed);
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            tracing::debug!(state = ?state, "Connection state changed");
            self.emit(TransportEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}

fn enqueue(outbox: &mut Outbox<Frame>, frame: Frame) {
    if outbox.push(frame).is_some() {
        tracing::warn!(
            dropped_total = outbox.dropped(),
            "Outbound queue full, dropped oldest message"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{
            Arc, Mutex,
            atomic::{AtomicU32, Ordering},
        },
    };

    use futures::channel::mpsc as fmpsc;
    use tokio::sync::oneshot;

    use super::*;

    fn fast_policy(max_retries: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            growth_factor: 2.0,
            max_retries,
            connect_timeout: Duration::from_millis(200),
        }
    }

    struct Remote {
        received: fmpsc::UnboundedReceiver<Frame>,
        outgoing: fmpsc::UnboundedSender<Result<Frame, TransportError>>,
    }

    fn connection_pair() -> (Connection, Remote) {
        let (to_remote, received) = fmpsc::unbounded();
        let (outgoing, from_remote) = fmpsc::unbounded();
        let connection = Connection {
            sink: Box::pin(to_remote.sink_map_err(|_| TransportError::Closed)),
            stream: from_remote.boxed(),
        };
        (connection, Remote { received, outgoing })
    }

    struct Scripted {
        connections: Mutex<VecDeque<Connection>>,
        gate: Mutex<Option<oneshot::Receiver<()>>>,
        attempts: Arc<AtomicU32>,
    }

    impl Scripted {
        fn new(connections: Vec<Connection>) -> Self {
            Self {
                connections: Mutex::new(connections.into()),
                gate: Mutex::new(None),
                attempts: Arc::new(AtomicU32::new(0)),
            }
        }
    }

    #[async_trait]
    impl Connector for Scripted {
        async fn connect(&self) -> Result<Connection, TransportError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let gate = self.gate.lock().unwrap().take();
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            self.connections
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| TransportError::Connect("refused".to_string()))
        }
    }

    async fn next_matching(
        events: &mut mpsc::UnboundedReceiver<TransportEvent>,
        pred: impl Fn(&TransportEvent) -> bool,
    ) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = events.recv().await.expect("event stream ended");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(0), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay_for(1), Some(Duration::from_secs_f64(1.4)));
        assert_eq!(policy.delay_for(10), Some(Duration::from_secs(5)));
        assert_eq!(policy.delay_for(63), Some(Duration::from_secs(5)));
        assert_eq!(policy.delay_for(64), None);
    }

    #[test]
    fn test_negative_growth_never_goes_below_min_delay() {
        let policy = ReconnectPolicy {
            growth_factor: -2.0,
            ..ReconnectPolicy::default()
        };
        assert_eq!(policy.delay_for(1), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay_for(2), Some(Duration::from_secs(4)));
        assert_eq!(policy.delay_for(3), Some(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let connector = Scripted::new(Vec::new());
        let attempts = Arc::clone(&connector.attempts);
        let (handle, mut events) = TransportSession::spawn(connector, fast_policy(3), 10);

        let failed =
            next_matching(&mut events, |e| matches!(e, TransportEvent::Failed { .. })).await;
        assert!(matches!(failed, TransportEvent::Failed { retries: 3 }));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(handle.state(), ConnectionState::Closed);
    }

    struct Stalled {
        attempts: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Connector for Stalled {
        async fn connect(&self) -> Result<Connection, TransportError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            futures::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_stalled_connect_times_out_each_attempt() {
        let attempts = Arc::new(AtomicU32::new(0));
        let connector = Stalled {
            attempts: Arc::clone(&attempts),
        };
        let policy = ReconnectPolicy {
            connect_timeout: Duration::from_millis(30),
            ..fast_policy(2)
        };
        let (_handle, mut events) = TransportSession::spawn(connector, policy, 10);

        let mut timeouts = 0;
        let retries = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await.expect("event stream ended") {
                    TransportEvent::Error(TransportError::Timeout(after)) => {
                        assert_eq!(after, Duration::from_millis(30));
                        timeouts += 1;
                    }
                    TransportEvent::Failed { retries } => return retries,
                    _ => {}
                }
            }
        })
        .await
        .expect("session never gave up");

        assert_eq!(retries, 2);
        assert_eq!(timeouts, 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_queues_while_connecting_and_drops_oldest() {
        let (connection, mut remote) = connection_pair();
        let connector = Scripted::new(vec![connection]);
        let (release, gate) = oneshot::channel();
        *connector.gate.lock().unwrap() = Some(gate);

        let (handle, mut events) = TransportSession::spawn(connector, fast_policy(3), 2);
        for text in ["one", "two", "three"] {
            handle.send(Frame::Text(text.to_string())).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        release.send(()).unwrap();

        next_matching(&mut events, |e| matches!(e, TransportEvent::Open)).await;
        assert_eq!(remote.received.next().await, Some(Frame::Text("two".to_string())));
        assert_eq!(remote.received.next().await, Some(Frame::Text("three".to_string())));

        handle.send(Frame::Text("four".to_string())).unwrap();
        assert_eq!(remote.received.next().await, Some(Frame::Text("four".to_string())));
    }

    #[tokio::test]
    async fn test_reconnects_after_drop_and_delivers_messages() {
        let (first, first_remote) = connection_pair();
        let (second, second_remote) = connection_pair();
        let connector = Scripted::new(vec![first, second]);
        let (handle, mut events) = TransportSession::spawn(connector, fast_policy(3), 10);

        next_matching(&mut events, |e| matches!(e, TransportEvent::Open)).await;
        first_remote
            .outgoing
            .unbounded_send(Ok(Frame::Text("hello".to_string())))
            .unwrap();
        let message =
            next_matching(&mut events, |e| matches!(e, TransportEvent::Message(_))).await;
        assert!(matches!(message, TransportEvent::Message(Frame::Text(ref t)) if t == "hello"));

        drop(first_remote);
        next_matching(&mut events, |e| matches!(e, TransportEvent::Closed)).await;
        next_matching(&mut events, |e| matches!(e, TransportEvent::Open)).await;
        assert_eq!(handle.state(), ConnectionState::Open);

        handle.close();
        next_matching(&mut events, |e| matches!(e, TransportEvent::Closed)).await;
        drop(second_remote);
    }

    #[tokio::test]
    async fn test_message_sink_encodes_for_the_wire() {
        let (connection, mut remote) = connection_pair();
        let (handle, mut events) =
            TransportSession::spawn(Scripted::new(vec![connection]), fast_policy(1), 10);
        next_matching(&mut events, |e| matches!(e, TransportEvent::Open)).await;

        handle
            .send_message(ClientMessage::ready(worker_bridge_core::WorkerId::new("w1")))
            .unwrap();
        let Some(Frame::Text(json)) = remote.received.next().await else {
            panic!("expected text frame");
        };
        assert!(json.contains("READY_FOR_TASKS"));
    }
}
