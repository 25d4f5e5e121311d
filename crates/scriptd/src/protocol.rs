//! Messages exchanged over the scriptd socket.
//!
//! After a `session` handshake the client sends [`SessionRequest`]s and
//! the daemon writes [`ServerFrame`]s: replies to requests interleaved with
//! execution events. After a `control` handshake each [`ControlRequest`]
//! gets exactly one [`ControlResponse`].

use kernel_exec::{ClientEvent, LineRange};
use serde::{Deserialize, Serialize};

use crate::registry::SessionSummary;
use crate::session::ExecutionRecord;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionRequest {
    /// Run a script. Events for it follow as `event` frames.
    Execute {
        /// Generated by the daemon when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        execution_id: Option<String>,
        script: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        line_range: Option<LineRange>,
        #[serde(default)]
        reset: bool,
    },
    Interrupt,
    /// Cancel the running script and restart the kernel.
    Reset,
    Cancel { execution_id: String },
    GetState { execution_id: String },
    Ping,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionReply {
    /// Sent once, right after the handshake.
    Ready { session_id: String },
    /// The script was handed to the session.
    Accepted { execution_id: String },
    Interrupted { running: bool },
    Ack,
    State { record: Option<ExecutionRecord> },
    Pong,
    Error { message: String },
}

/// Everything the daemon writes on a session connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "frame", content = "body", rename_all = "snake_case")]
pub enum ServerFrame {
    Event(ClientEvent),
    Reply(SessionReply),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    Ping,
    ListSessions,
    DeleteSession { session_id: String },
    /// Stop every session and exit.
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlResponse {
    Pong,
    Sessions { sessions: Vec<SessionSummary> },
    Deleted,
    ShuttingDown,
    Error { message: String },
}
