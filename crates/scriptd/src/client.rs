//! Client for the scriptd daemon.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;

use kernel_exec::ClientEvent;
use log::{debug, info};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

use crate::connection::{recv_json_frame, send_json_frame, Handshake};
use crate::default_socket_path;
use crate::protocol::{ControlRequest, ControlResponse, ServerFrame, SessionReply, SessionRequest};
use crate::registry::SessionSummary;
use crate::session::{ExecuteRequest, ExecutionRecord};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Failed to connect to daemon: {0}")]
    ConnectionFailed(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Daemon returned error: {0}")]
    DaemonError(String),

    #[error("Connection timeout")]
    Timeout,

    #[error("Daemon closed the connection")]
    Disconnected,
}

fn unexpected(response: impl std::fmt::Debug) -> ClientError {
    ClientError::ProtocolError(format!("Unexpected response: {:?}", response))
}

pub struct ScriptdClient {
    socket_path: PathBuf,
    connect_timeout: Duration,
}

impl Default for ScriptdClient {
    fn default() -> Self {
        Self::new(default_socket_path())
    }
}

impl ScriptdClient {
    pub fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            connect_timeout: Duration::from_secs(2),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub async fn is_daemon_running(&self) -> bool {
        self.ping().await.is_ok()
    }

    pub async fn ping(&self) -> Result<(), ClientError> {
        match self.send_control(ControlRequest::Ping).await? {
            ControlResponse::Pong => Ok(()),
            ControlResponse::Error { message } => Err(ClientError::DaemonError(message)),
            other => Err(unexpected(other)),
        }
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>, ClientError> {
        match self.send_control(ControlRequest::ListSessions).await? {
            ControlResponse::Sessions { sessions } => Ok(sessions),
            ControlResponse::Error { message } => Err(ClientError::DaemonError(message)),
            other => Err(unexpected(other)),
        }
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<(), ClientError> {
        let request = ControlRequest::DeleteSession {
            session_id: session_id.to_string(),
        };
        match self.send_control(request).await? {
            ControlResponse::Deleted => Ok(()),
            ControlResponse::Error { message } => Err(ClientError::DaemonError(message)),
            other => Err(unexpected(other)),
        }
    }

    pub async fn shutdown(&self) -> Result<(), ClientError> {
        match self.send_control(ControlRequest::Shutdown).await? {
            ControlResponse::ShuttingDown => Ok(()),
            ControlResponse::Error { message } => Err(ClientError::DaemonError(message)),
            other => Err(unexpected(other)),
        }
    }

    /// Attach to a session, creating it on the daemon if needed.
    pub async fn open_session(&self, session_id: &str) -> Result<SessionConnection, ClientError> {
        let (mut reader, writer) = self
            .connect(Handshake::Session {
                session_id: session_id.to_string(),
            })
            .await?;

        match read_frame(&mut reader).await? {
            ServerFrame::Reply(SessionReply::Ready { session_id }) => {
                info!("[client] Attached to session {}", session_id);
                Ok(SessionConnection {
                    session_id,
                    reader,
                    writer,
                    pending_events: VecDeque::new(),
                })
            }
            ServerFrame::Reply(SessionReply::Error { message }) => {
                Err(ClientError::DaemonError(message))
            }
            other => Err(unexpected(other)),
        }
    }

    async fn connect(
        &self,
        handshake: Handshake,
    ) -> Result<(OwnedReadHalf, OwnedWriteHalf), ClientError> {
        let stream = match tokio::time::timeout(
            self.connect_timeout,
            UnixStream::connect(&self.socket_path),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(ClientError::ConnectionFailed(e)),
            Err(_) => return Err(ClientError::Timeout),
        };

        let (reader, mut writer) = stream.into_split();
        send_json_frame(&mut writer, &handshake)
            .await
            .map_err(|e| ClientError::ProtocolError(e.to_string()))?;
        Ok((reader, writer))
    }

    async fn send_control(&self, request: ControlRequest) -> Result<ControlResponse, ClientError> {
        let (mut reader, mut writer) = self.connect(Handshake::Control).await?;
        send_json_frame(&mut writer, &request)
            .await
            .map_err(|e| ClientError::ProtocolError(e.to_string()))?;
        recv_json_frame(&mut reader)
            .await
            .map_err(|e| ClientError::ProtocolError(format!("Failed to parse response: {}", e)))?
            .ok_or(ClientError::Disconnected)
    }
}

async fn read_frame(reader: &mut OwnedReadHalf) -> Result<ServerFrame, ClientError> {
    recv_json_frame(reader)
        .await
        .map_err(|e| ClientError::ProtocolError(e.to_string()))?
        .ok_or(ClientError::Disconnected)
}

/// A connection bound to one session.
///
/// Events that arrive while waiting for a reply are buffered and handed
/// out by [`next_event`](Self::next_event) in order.
pub struct SessionConnection {
    session_id: String,
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    pending_events: VecDeque<ClientEvent>,
}

impl SessionConnection {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Submit a script. Returns its execution id; events follow on
    /// [`next_event`](Self::next_event).
    pub async fn execute(&mut self, request: ExecuteRequest) -> Result<String, ClientError> {
        let request = SessionRequest::Execute {
            execution_id: Some(request.execution_id),
            script: request.script,
            line_range: request.line_range,
            reset: request.reset,
        };
        match self.request(request).await? {
            SessionReply::Accepted { execution_id } => Ok(execution_id),
            SessionReply::Error { message } => Err(ClientError::DaemonError(message)),
            other => Err(unexpected(other)),
        }
    }

    /// Submit a script and collect its events through the terminal one.
    pub async fn run(&mut self, request: ExecuteRequest) -> Result<Vec<ClientEvent>, ClientError> {
        let execution_id = self.execute(request).await?;
        let mut events = Vec::new();
        loop {
            let event = self.next_event().await?;
            if event.execution_id() != execution_id {
                debug!(
                    "[client] Skipping event for other execution {}",
                    event.execution_id()
                );
                continue;
            }
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                return Ok(events);
            }
        }
    }

    pub async fn next_event(&mut self) -> Result<ClientEvent, ClientError> {
        if let Some(event) = self.pending_events.pop_front() {
            return Ok(event);
        }
        loop {
            match read_frame(&mut self.reader).await? {
                ServerFrame::Event(event) => return Ok(event),
                ServerFrame::Reply(reply) => {
                    debug!("[client] Ignoring unsolicited reply: {:?}", reply);
                }
            }
        }
    }

    /// Returns whether a script was running.
    pub async fn interrupt(&mut self) -> Result<bool, ClientError> {
        match self.request(SessionRequest::Interrupt).await? {
            SessionReply::Interrupted { running } => Ok(running),
            SessionReply::Error { message } => Err(ClientError::DaemonError(message)),
            other => Err(unexpected(other)),
        }
    }

    pub async fn reset(&mut self) -> Result<(), ClientError> {
        self.expect_ack(SessionRequest::Reset).await
    }

    pub async fn cancel(&mut self, execution_id: &str) -> Result<(), ClientError> {
        self.expect_ack(SessionRequest::Cancel {
            execution_id: execution_id.to_string(),
        })
        .await
    }

    pub async fn get_state(
        &mut self,
        execution_id: &str,
    ) -> Result<Option<ExecutionRecord>, ClientError> {
        let request = SessionRequest::GetState {
            execution_id: execution_id.to_string(),
        };
        match self.request(request).await? {
            SessionReply::State { record } => Ok(record),
            SessionReply::Error { message } => Err(ClientError::DaemonError(message)),
            other => Err(unexpected(other)),
        }
    }

    pub async fn ping(&mut self) -> Result<(), ClientError> {
        match self.request(SessionRequest::Ping).await? {
            SessionReply::Pong => Ok(()),
            SessionReply::Error { message } => Err(ClientError::DaemonError(message)),
            other => Err(unexpected(other)),
        }
    }

    async fn expect_ack(&mut self, request: SessionRequest) -> Result<(), ClientError> {
        match self.request(request).await? {
            SessionReply::Ack => Ok(()),
            SessionReply::Error { message } => Err(ClientError::DaemonError(message)),
            other => Err(unexpected(other)),
        }
    }

    /// Send a request and wait for its reply, buffering events meanwhile.
    async fn request(&mut self, request: SessionRequest) -> Result<SessionReply, ClientError> {
        send_json_frame(&mut self.writer, &request)
            .await
            .map_err(|e| ClientError::ProtocolError(e.to_string()))?;
        loop {
            match read_frame(&mut self.reader).await? {
                ServerFrame::Event(event) => self.pending_events.push_back(event),
                ServerFrame::Reply(reply) => return Ok(reply),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_custom_path() {
        let client = ScriptdClient::new(PathBuf::from("/tmp/test.sock"));
        assert_eq!(client.socket_path, PathBuf::from("/tmp/test.sock"));
    }

    #[tokio::test]
    async fn test_missing_socket_fails_to_connect() {
        let dir = tempfile::tempdir().unwrap();
        let client = ScriptdClient::new(dir.path().join("absent.sock"));
        assert!(!client.is_daemon_running().await);
        assert!(matches!(
            client.ping().await,
            Err(ClientError::ConnectionFailed(_))
        ));
    }
}
