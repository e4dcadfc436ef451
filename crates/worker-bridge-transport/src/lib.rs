//! Transport layer for the worker bridge session.
//!
//! Provides:
//! - Wire protocol (JSON envelopes, two disjoint message families)
//! - Codec and message router
//! - Reconnecting transport session with a bounded offline queue
//! - WebSocket connector (feature: websocket)

pub mod codec;
pub mod protocol;
pub mod router;
pub mod session;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use codec::{CodecError, Frame};
pub use protocol::{ClientMessage, ServerMessage, WorkerCommand, WorkerEvent};
pub use router::{MessageRouter, ServerMessageHandler};
pub use session::{
    ClientMessageSink, ConnectionState, Connector, ReconnectPolicy, TransportError,
    TransportEvent, TransportHandle, TransportSession,
};

#[cfg(feature = "websocket")]
pub use websocket::WsConnector;
