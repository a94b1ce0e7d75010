//! QEMU Machine Protocol plumbing.
//!
//! The hypervisor exposes two interfaces over one socket:
//! - Commands: synchronous request → single response
//! - Events: asynchronous push notifications
//!
//! The orchestrator only ever sees them through [`Transport`] and an
//! [`EventStream`]; [`client::QmpClient`] is the concrete Unix socket
//! implementation.

pub mod client;
pub mod commands;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use tokio::sync::mpsc;

use crate::Result;

/// Event kind emitted when a block job hits an I/O error.
pub const BLOCK_JOB_ERROR: &str = "BLOCK_JOB_ERROR";

/// Event kind emitted when a block job finishes, successfully or not.
pub const BLOCK_JOB_COMPLETED: &str = "BLOCK_JOB_COMPLETED";

/// A QMP command descriptor: action name plus optional arguments object.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Command {
    pub execute: &'static str,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

impl Command {
    pub fn new(execute: &'static str) -> Self {
        Self {
            execute,
            arguments: None,
        }
    }

    pub fn with_arguments(execute: &'static str, arguments: Value) -> Self {
        Self {
            execute,
            arguments: Some(arguments),
        }
    }

    /// Look up an argument by JSON pointer, e.g. `/file/filename`.
    pub fn argument(&self, pointer: &str) -> Option<&Value> {
        self.arguments.as_ref().and_then(|args| args.pointer(pointer))
    }
}

/// Hypervisor timestamp attached to every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTimestamp {
    pub seconds: i64,
    pub microseconds: i64,
}

/// An asynchronous QMP event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "event")]
    pub kind: String,

    #[serde(default)]
    pub data: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<EventTimestamp>,
}

impl Event {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            timestamp: None,
        }
    }

    /// The `device` field of the payload, which block job events scope to.
    pub fn device(&self) -> Option<&str> {
        self.data.get("device").and_then(Value::as_str)
    }
}

/// Receiving side of the event feed. Exactly one consumer may own it.
pub type EventStream = mpsc::UnboundedReceiver<Event>;

/// Sending side of the event feed.
pub type EventSender = mpsc::UnboundedSender<Event>;

/// Synchronous command interface to the hypervisor.
///
/// Only one command may be outstanding at a time. A failed command resolves
/// to [`crate::BackupError::Qmp`]; its `desc` is all the detail there is.
pub trait Transport: Send + Sync {
    fn execute(&self, command: &Command) -> impl Future<Output = Result<Value>> + Send;
}

/// Domain meaning of a QMP error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainError {
    /// The image file behind a node does not exist
    MissingFile,
    /// A node with the requested node-name is already attached
    DuplicateNode,
    /// The dirty bitmap already exists on the device
    BitmapExists,
    /// The object being removed is already gone
    NotFound,
    Other,
}

// QMP has no structured error codes for these, the message text is the contract.
const MISSING_FILE_SUFFIX: &str = "No such file or directory";
const DUPLICATE_NODE_MARKERS: &[&str] = &["Duplicated nodes", "Duplicate node"];
const BITMAP_EXISTS_MARKER: &str = "already exists";
const NOT_FOUND_MARKERS: &[&str] = &[
    "not found",
    "No active block job",
    "Cannot find device",
    "Failed to find node",
];

/// Classify a QMP error description.
pub fn classify(message: &str) -> DomainError {
    let message = message.trim_end();

    if message.ends_with(MISSING_FILE_SUFFIX) {
        DomainError::MissingFile
    } else if DUPLICATE_NODE_MARKERS.iter().any(|m| message.contains(m)) {
        DomainError::DuplicateNode
    } else if message.contains(BITMAP_EXISTS_MARKER) {
        DomainError::BitmapExists
    } else if NOT_FOUND_MARKERS.iter().any(|m| message.contains(m)) {
        DomainError::NotFound
    } else {
        DomainError::Other
    }
}
