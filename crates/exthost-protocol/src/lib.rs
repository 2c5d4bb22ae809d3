//! Shared protocol definitions for IDE host ↔ extension runtime communication.
//! Both processes' builds depend on this crate so the envelope layout and the
//! identifier namespace cannot drift apart without a compile-visible change.

pub mod identifiers;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// One RPC message, carried as the payload of a single regular frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Request(CallFrame),
    Reply(ReplyFrame),
    Cancel { id: u64 },
}

impl Envelope {
    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Call id the envelope refers to.
    pub fn id(&self) -> u64 {
        match self {
            Envelope::Request(call) => call.id,
            Envelope::Reply(reply) => reply.id,
            Envelope::Cancel { id } => *id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallFrame {
    pub id: u64,
    pub rpc_id: String,
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default = "default_expects_reply")]
    pub expects_reply: bool,
}

fn default_expects_reply() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyFrame {
    pub id: u64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
}

impl ReplyFrame {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            id,
            ok: true,
            result,
            error: None,
        }
    }

    pub fn failure(id: u64, error: RemoteError) -> Self {
        Self {
            id,
            ok: false,
            result: Value::Null,
            error: Some(error),
        }
    }
}

/// Why the remote side refused or failed a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    UnknownIdentifier,
    UnknownMethod,
    InvalidArguments,
    HandlerFailed,
    Cancelled,
}

impl RemoteErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteErrorKind::UnknownIdentifier => "unknown_identifier",
            RemoteErrorKind::UnknownMethod => "unknown_method",
            RemoteErrorKind::InvalidArguments => "invalid_arguments",
            RemoteErrorKind::HandlerFailed => "handler_failed",
            RemoteErrorKind::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{}: {message}", .kind.as_str())]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unknown_identifier(rpc_id: &str) -> Self {
        Self::new(
            RemoteErrorKind::UnknownIdentifier,
            format!("unknown identifier '{rpc_id}'"),
        )
    }

    pub fn unknown_method(rpc_id: &str, method: &str) -> Self {
        Self::new(
            RemoteErrorKind::UnknownMethod,
            format!("'{rpc_id}' has no method '{method}'"),
        )
    }
}
