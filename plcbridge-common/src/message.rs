//! Wire protocol between subscribers and the bridge.
//!
//! Every frame is a JSON text message. Clients send commands keyed by
//! `cmd`; the bridge answers with acknowledgments, errors and pushes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Command sent from a subscriber to the bridge.
///
/// Request fields are kept as raw JSON so that validation (and its error
/// messages) happens in one place, in the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Join the broadcast channel for a tag.
    Subscribe {
        #[serde(default)]
        tag: Value,
    },
    /// Write a value to a controller variable.
    Write(WriteRequest),
    /// Run a named write sequence on a controller.
    Sequence(SequenceRequest),
    /// Ask for the controller health snapshot.
    Health,
}

impl ClientCommand {
    /// The subscribe tag, if it is a non-empty string.
    pub fn subscribe_tag(tag: &Value) -> Option<&str> {
        tag.as_str().map(str::trim).filter(|t| !t.is_empty())
    }
}

/// Raw write request: `{"cmd":"write","ip":..,"var":..,"value":..}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteRequest {
    /// Controller id (string or number).
    #[serde(default, rename = "ip")]
    pub controller: Value,
    /// Variable name.
    #[serde(default)]
    pub var: Value,
    /// Value to write.
    #[serde(default)]
    pub value: Value,
}

/// Raw sequence request: `{"cmd":"sequence","ip":..,"name":..}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SequenceRequest {
    /// Controller id (string or number).
    #[serde(default, rename = "ip")]
    pub controller: Value,
    /// Sequence name as configured for the controller.
    #[serde(default)]
    pub name: Value,
}

/// Failure to decode an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid json")]
    InvalidJson,

    #[error("unknown command")]
    UnknownCommand,
}

/// Decode one inbound text frame.
pub fn parse_command(text: &str) -> Result<ClientCommand, ProtocolError> {
    let value: Value = serde_json::from_str(text).map_err(|_| ProtocolError::InvalidJson)?;
    serde_json::from_value(value).map_err(|_| ProtocolError::UnknownCommand)
}

/// Acknowledgment status marker, always `"ok"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Ok,
}

/// Message sent from the bridge to a subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    /// New value on a subscribed tag.
    Push { tag: String, value: i64 },
    /// A write succeeded.
    Ack {
        status: AckStatus,
        var: String,
        value: i64,
    },
    /// A sequence ran to completion.
    SequenceAck { status: AckStatus, sequence: String },
    /// A request failed.
    Error { error: String },
    /// Health snapshot, sent only to the requester.
    Health { health: Value, controllers: Value },
}

impl ServerMessage {
    pub fn push(tag: impl Into<String>, value: i64) -> Self {
        Self::Push {
            tag: tag.into(),
            value,
        }
    }

    pub fn ack(var: impl Into<String>, value: i64) -> Self {
        Self::Ack {
            status: AckStatus::Ok,
            var: var.into(),
            value,
        }
    }

    pub fn sequence_ack(sequence: impl Into<String>) -> Self {
        Self::SequenceAck {
            status: AckStatus::Ok,
            sequence: sequence.into(),
        }
    }

    pub fn error(error: impl std::fmt::Display) -> Self {
        Self::Error {
            error: error.to_string(),
        }
    }

    /// Encode as a JSON text frame.
    pub fn to_text(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
