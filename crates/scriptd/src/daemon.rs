//! The scriptd server.
//!
//! Accepts connections on a Unix socket and routes each one by its
//! handshake: session connections are bound to a session from the
//! registry, control connections manage the daemon itself.

use std::path::PathBuf;
use std::sync::Arc;

use kernel_exec::PythonSplitter;
use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixListener;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::connection::{recv_control_frame, recv_json_control_frame, send_json_frame, Handshake};
use crate::default_socket_path;
use crate::jupyter_kernel::JupyterKernelFactory;
use crate::kernel::{KernelConfig, KernelFactory};
use crate::protocol::{ControlRequest, ControlResponse, ServerFrame, SessionReply, SessionRequest};
use crate::registry::{RegistryConfig, SessionRegistry};
use crate::session::{ExecuteRequest, Session};

/// Frames buffered per connection before event forwarding waits on the socket.
const FRAME_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,
    pub registry: RegistryConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            registry: RegistryConfig::default(),
        }
    }
}

pub struct Daemon<F: KernelFactory> {
    socket_path: PathBuf,
    registry: Arc<SessionRegistry<F>>,
    shutdown_notify: Arc<Notify>,
}

impl Daemon<JupyterKernelFactory> {
    /// A daemon that launches real Jupyter kernels.
    pub fn new(config: DaemonConfig, kernel: KernelConfig) -> Arc<Self> {
        Self::with_factory(config, JupyterKernelFactory::new(kernel))
    }
}

impl<F: KernelFactory> Daemon<F> {
    pub fn with_factory(config: DaemonConfig, factory: F) -> Arc<Self> {
        let registry = SessionRegistry::new(factory, Arc::new(PythonSplitter), config.registry);
        Arc::new(Self {
            socket_path: config.socket_path,
            registry: Arc::new(registry),
            shutdown_notify: Arc::new(Notify::new()),
        })
    }

    pub fn registry(&self) -> &Arc<SessionRegistry<F>> {
        &self.registry
    }

    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    /// Ask a running daemon to stop accepting connections and exit.
    pub fn trigger_shutdown(&self) {
        self.shutdown_notify.notify_one();
    }

    /// Serve until shut down, then stop every session.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        if let Some(parent) = self.socket_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if self.socket_path.exists() {
            tokio::fs::remove_file(&self.socket_path).await?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        info!("[scriptd] Listening on {:?}", self.socket_path);

        let sweeper = self.registry.spawn_sweeper();

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, _)) => {
                            let daemon = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = daemon.handle_connection(stream).await {
                                    error!("[scriptd] Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("[scriptd] Accept error: {}", e);
                        }
                    }
                }
                _ = self.shutdown_notify.notified() => {
                    info!("[scriptd] Shutting down");
                    break;
                }
            }
        }

        sweeper.abort();
        self.registry.shutdown_all().await;
        tokio::fs::remove_file(&self.socket_path).await.ok();
        info!("[scriptd] Stopped");
        Ok(())
    }

    async fn handle_connection<S>(self: Arc<Self>, stream: S) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut reader, writer) = tokio::io::split(stream);

        let handshake: Handshake = match recv_json_control_frame(&mut reader).await? {
            Some(handshake) => handshake,
            None => return Ok(()),
        };
        debug!("[scriptd] Handshake: {:?}", handshake);

        match handshake {
            Handshake::Control => self.handle_control(reader, writer).await,
            Handshake::Session { session_id } => {
                self.handle_session(session_id, reader, writer).await
            }
        }
    }

    async fn handle_control<R, W>(&self, mut reader: R, mut writer: W) -> anyhow::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        while let Some(data) = recv_control_frame(&mut reader).await? {
            let response = match serde_json::from_slice::<ControlRequest>(&data) {
                Ok(request) => self.handle_control_request(request).await,
                Err(e) => ControlResponse::Error {
                    message: format!("Invalid request: {}", e),
                },
            };
            send_json_frame(&mut writer, &response).await?;

            if response == ControlResponse::ShuttingDown {
                self.trigger_shutdown();
                break;
            }
        }
        Ok(())
    }

    async fn handle_control_request(&self, request: ControlRequest) -> ControlResponse {
        match request {
            ControlRequest::Ping => ControlResponse::Pong,
            ControlRequest::ListSessions => ControlResponse::Sessions {
                sessions: self.registry.list().await,
            },
            ControlRequest::DeleteSession { session_id } => {
                match self.registry.delete(&session_id).await {
                    Ok(()) => ControlResponse::Deleted,
                    Err(e) => ControlResponse::Error {
                        message: e.to_string(),
                    },
                }
            }
            ControlRequest::Shutdown => ControlResponse::ShuttingDown,
        }
    }

    /// Serve one client bound to one session.
    ///
    /// Replies and events share the socket through a single writer task.
    /// Each accepted script gets a forwarder task that copies its events
    /// until the terminal one. When the client goes away the forwarders are
    /// aborted, which the session sees as a dropped event receiver.
    async fn handle_session<R, W>(
        &self,
        session_id: String,
        mut reader: R,
        mut writer: W,
    ) -> anyhow::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        if session_id.trim().is_empty() {
            let frame = ServerFrame::Reply(SessionReply::Error {
                message: "session_id must not be empty".to_string(),
            });
            send_json_frame(&mut writer, &frame).await?;
            return Ok(());
        }

        let session = self.registry.get_or_create(&session_id).await;
        info!("[scriptd] Client attached to session {}", session_id);

        let (frames, mut frame_rx) = mpsc::channel::<ServerFrame>(FRAME_BUFFER);
        let writer_task = tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                if let Err(e) = send_json_frame(&mut writer, &frame).await {
                    debug!("[scriptd] Write to client failed: {}", e);
                    break;
                }
            }
        });

        let ready = ServerFrame::Reply(SessionReply::Ready {
            session_id: session_id.clone(),
        });
        let mut forwarders: Vec<JoinHandle<()>> = Vec::new();

        if frames.send(ready).await.is_ok() {
            loop {
                let data = match recv_control_frame(&mut reader).await {
                    Ok(Some(data)) => data,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("[scriptd] Session {} read error: {}", session_id, e);
                        break;
                    }
                };

                let reply = match serde_json::from_slice::<SessionRequest>(&data) {
                    Ok(SessionRequest::Execute {
                        execution_id,
                        script,
                        line_range,
                        reset,
                    }) => {
                        let mut request = ExecuteRequest::new(script);
                        if let Some(execution_id) = execution_id {
                            request = request.with_id(execution_id);
                        }
                        request.line_range = line_range;
                        request.reset = reset;

                        match start_forwarding(&session, request, &frames).await {
                            Ok(forwarder) => {
                                forwarders.retain(|f| !f.is_finished());
                                forwarders.push(forwarder);
                                continue;
                            }
                            Err(reply) => reply,
                        }
                    }
                    Ok(request) => handle_session_request(&session, request).await,
                    Err(e) => SessionReply::Error {
                        message: format!("Invalid request: {}", e),
                    },
                };

                if frames.send(ServerFrame::Reply(reply)).await.is_err() {
                    break;
                }
            }
        }

        info!("[scriptd] Client detached from session {}", session_id);
        for forwarder in forwarders {
            forwarder.abort();
        }
        drop(frames);
        writer_task.abort();
        Ok(())
    }
}

/// Submit a script and spawn the task that forwards its events.
/// The `Accepted` reply is queued before any event.
async fn start_forwarding(
    session: &Session,
    request: ExecuteRequest,
    frames: &mpsc::Sender<ServerFrame>,
) -> Result<JoinHandle<()>, SessionReply> {
    let execution_id = request.execution_id.clone();
    let mut events = session
        .execute_script(request)
        .await
        .map_err(|e| SessionReply::Error {
            message: e.to_string(),
        })?;

    frames
        .send(ServerFrame::Reply(SessionReply::Accepted { execution_id }))
        .await
        .map_err(|_| SessionReply::Error {
            message: "client disconnected".to_string(),
        })?;

    let frames = frames.clone();
    Ok(tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let terminal = event.is_terminal();
            if frames.send(ServerFrame::Event(event)).await.is_err() || terminal {
                break;
            }
        }
    }))
}

async fn handle_session_request(session: &Session, request: SessionRequest) -> SessionReply {
    let result = match request {
        SessionRequest::Interrupt => session
            .interrupt()
            .await
            .map(|running| SessionReply::Interrupted { running }),
        SessionRequest::Reset => session.reset().await.map(|()| SessionReply::Ack),
        SessionRequest::Cancel { execution_id } => {
            session.cancel(&execution_id).await.map(|()| SessionReply::Ack)
        }
        SessionRequest::GetState { execution_id } => session
            .get_state(&execution_id)
            .await
            .map(|record| SessionReply::State { record }),
        SessionRequest::Ping => Ok(SessionReply::Pong),
        SessionRequest::Execute { .. } => Ok(SessionReply::Error {
            message: "Unexpected execute request".to_string(),
        }),
    };
    result.unwrap_or_else(|e| SessionReply::Error {
        message: e.to_string(),
    })
}
