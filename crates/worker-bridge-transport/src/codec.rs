//! Encoding and validation of protocol frames.

use bytes::Bytes;
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Map, Value};

use crate::protocol::{
    ClientMessage, PROTOCOL_VERSION, ServerMessage, ServerReady, WorkerCommandMessage,
};

/// Raw unit exchanged with the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    /// Frame contents as UTF-8 text.
    ///
    /// # Errors
    /// Returns error if a binary frame is not valid UTF-8.
    pub fn as_text(&self) -> Result<&str, CodecError> {
        match self {
            Self::Text(text) => Ok(text),
            Self::Binary(data) => Ok(std::str::from_utf8(data)?),
        }
    }
}

impl From<String> for Frame {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

/// Codec error.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Frame is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("Malformed envelope: {0}")]
    Envelope(#[from] serde_json::Error),
    #[error("Invalid {kind} payload: {source}")]
    Payload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

/// Serialize an outbound message into a text frame.
///
/// # Errors
/// Returns error if the payload cannot be serialized.
pub fn encode(message: &ClientMessage) -> Result<Frame, CodecError> {
    let mut envelope = serde_json::to_value(message)?;
    if let Value::Object(fields) = &mut envelope {
        fields.insert("version".to_string(), Value::from(PROTOCOL_VERSION));
    }
    Ok(Frame::Text(serde_json::to_string(&envelope)?))
}

/// Validate and decode an inbound frame.
///
/// The envelope's `version` is not checked. A well-formed envelope with an
/// unrecognized tag decodes to [`ServerMessage::Unknown`]; a recognized tag
/// with a payload of the wrong shape is an error.
///
/// # Errors
/// Returns error if the frame is not a valid envelope or its payload does not
/// match the schema for its tag.
pub fn decode(frame: &Frame) -> Result<ServerMessage, CodecError> {
    let raw: RawEnvelope = serde_json::from_str(frame.as_text()?)?;

    let payload = if raw.payload.is_null() {
        Value::Object(Map::new())
    } else {
        raw.payload
    };

    match raw.kind.as_str() {
        "SERVER_READY" => {
            payload_as::<ServerReady>(&raw.kind, payload).map(ServerMessage::ServerReady)
        }
        "BACKGROUND_WORKER_MESSAGE" => payload_as::<WorkerCommandMessage>(&raw.kind, payload)
            .map(ServerMessage::BackgroundWorkerMessage),
        _ => Ok(ServerMessage::Unknown { kind: raw.kind }),
    }
}

fn payload_as<T: DeserializeOwned>(kind: &str, payload: Value) -> Result<T, CodecError> {
    serde_json::from_value(payload).map_err(|source| CodecError::Payload {
        kind: kind.to_string(),
        source,
    })
}
