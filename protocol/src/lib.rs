//! Kestrel wire protocol
//!
//! Every connection carries exactly one command. The client writes a [`Command`],
//! the server answers with zero or more [`Acknowledge`] frames and finishes with a
//! single [`Completion`]. All three share the command's correlation id.
//!
//! The same message shapes are used outbound when the instrument talks to its
//! peers (pointing, beam-steering, reduction pipeline), see [`peer`].

pub mod codec;
pub mod peer;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use codec::{framed, MessageStream, ProtocolError, MAX_FRAME_LEN};

/// A request sent to the instrument or to a peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Opaque correlation id, echoed in every reply
    pub id: String,
    /// Raw type name, resolved by the receiving dispatcher
    pub kind: String,
    /// Handler specific parameters
    #[serde(default)]
    pub params: Value,
}

impl Command {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, params: Value) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            params,
        }
    }
}

/// Progress reply carrying a revised deadline for the next message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledge {
    pub id: String,
    /// Milliseconds until the client should expect the next message
    pub time_to_complete_ms: u64,
}

/// Terminal reply to a command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub id: String,
    pub successful: bool,
    /// Zero on success, otherwise namespaced by the subsystem that failed
    pub error_number: i32,
    pub error_string: String,
    /// Command specific payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl Completion {
    pub fn success(id: impl Into<String>, result: Option<Value>) -> Self {
        Self {
            id: id.into(),
            successful: true,
            error_number: 0,
            error_string: String::new(),
            result,
        }
    }

    pub fn failure(id: impl Into<String>, error_number: i32, error_string: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            successful: false,
            error_number,
            error_string: error_string.into(),
            result: None,
        }
    }

    /// Decode the result payload into a typed reply.
    ///
    /// A missing payload decodes as JSON `null`, so unit-like replies work.
    pub fn decode_result<T: serde::de::DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        let value = self.result.clone().unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(|e| ProtocolError::Payload(e.to_string()))
    }
}

/// One frame on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message", rename_all = "snake_case")]
pub enum Message {
    Command(Command),
    Acknowledge(Acknowledge),
    Completion(Completion),
}

impl Message {
    /// Correlation id of whichever message this is
    pub fn id(&self) -> &str {
        match self {
            Message::Command(c) => &c.id,
            Message::Acknowledge(a) => &a.id,
            Message::Completion(c) => &c.id,
        }
    }
}
