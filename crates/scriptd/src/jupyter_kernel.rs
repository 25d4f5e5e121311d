//! Jupyter kernel process owned by one session.
//!
//! The kernel is launched from a kernelspec (or directly from a Python
//! interpreter) with a freshly written connection file. Output is read
//! from iopub by a background task and routed to the stream of the one
//! execute request in flight; anything whose parent is not that request
//! is stale and dropped. A second task owns the child process and marks
//! the kernel dead when it exits.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use jupyter_protocol::{
    ConnectionInfo, ExecuteRequest, InterruptRequest, JupyterMessage, JupyterMessageContent,
    KernelInfoRequest, ShutdownRequest,
};
use kernel_exec::{KernelActivity, KernelMessage, MimeBundle};
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::kernel::{
    KernelConfig, KernelError, KernelFactory, KernelProcess, KernelStream, KernelStreamSender,
    STREAM_BUFFER,
};

/// The execute request whose output is currently being collected.
struct InFlight {
    msg_id: String,
    tx: KernelStreamSender,
}

type InFlightSlot = Arc<StdMutex<Option<InFlight>>>;

fn protocol_error(err: impl std::fmt::Display) -> KernelError {
    KernelError::Protocol(err.to_string())
}

fn launch_error(err: impl std::fmt::Display) -> KernelError {
    KernelError::Launch(err.to_string())
}

/// Convert iopub content into the subset sessions consume.
fn to_kernel_message(content: &JupyterMessageContent) -> Option<KernelMessage> {
    match content {
        JupyterMessageContent::StreamContent(stream) => {
            let name = match stream.name {
                jupyter_protocol::Stdio::Stdout => "stdout",
                jupyter_protocol::Stdio::Stderr => "stderr",
            };
            Some(KernelMessage::Stream {
                name: name.to_string(),
                text: stream.text.clone(),
            })
        }
        JupyterMessageContent::ExecuteResult(result) => Some(KernelMessage::Result {
            data: to_bundle(&result.data),
            metadata: to_bundle(&result.metadata),
        }),
        JupyterMessageContent::DisplayData(data) => Some(KernelMessage::Display {
            data: to_bundle(&data.data),
            metadata: to_bundle(&data.metadata),
        }),
        JupyterMessageContent::ErrorOutput(error) => Some(KernelMessage::Error {
            ename: error.ename.clone(),
            evalue: error.evalue.clone(),
            traceback: error.traceback.clone(),
        }),
        JupyterMessageContent::Status(status) => match status.execution_state {
            jupyter_protocol::ExecutionState::Busy => Some(KernelMessage::Status {
                state: KernelActivity::Busy,
            }),
            jupyter_protocol::ExecutionState::Idle => Some(KernelMessage::Status {
                state: KernelActivity::Idle,
            }),
            _ => None,
        },
        _ => None,
    }
}

/// Media and metadata both serialize to `{mime: value}` objects.
fn to_bundle<T: Serialize>(value: &T) -> MimeBundle {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_object().cloned())
        .unwrap_or_default()
}

pub struct JupyterKernel {
    config: KernelConfig,
    /// Owning session, for log lines.
    owner: String,
    kernel_id: String,
    session_id: String,
    connection_info: Option<ConnectionInfo>,
    connection_file: Option<PathBuf>,
    shell_writer: Option<runtimelib::DealerSendConnection>,
    iopub_task: Option<JoinHandle<()>>,
    shell_reader_task: Option<JoinHandle<()>>,
    monitor_task: Option<JoinHandle<()>>,
    kill_tx: Option<oneshot::Sender<()>>,
    #[cfg(unix)]
    process_group_id: Option<i32>,
    in_flight: InFlightSlot,
    alive: Arc<AtomicBool>,
}

impl JupyterKernel {
    pub fn new(config: KernelConfig, owner: &str) -> Self {
        Self {
            config,
            owner: owner.to_string(),
            kernel_id: String::new(),
            session_id: String::new(),
            connection_info: None,
            connection_file: None,
            shell_writer: None,
            iopub_task: None,
            shell_reader_task: None,
            monitor_task: None,
            kill_tx: None,
            #[cfg(unix)]
            process_group_id: None,
            in_flight: Arc::new(StdMutex::new(None)),
            alive: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn launch(&mut self) -> Result<(), KernelError> {
        // Reserve ports
        let ip = std::net::IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        let ports = runtimelib::peek_ports(ip, 5).await.map_err(launch_error)?;

        let connection_info = ConnectionInfo {
            transport: jupyter_protocol::connection_info::Transport::TCP,
            ip: ip.to_string(),
            stdin_port: ports[0],
            control_port: ports[1],
            hb_port: ports[2],
            shell_port: ports[3],
            iopub_port: ports[4],
            signature_scheme: "hmac-sha256".to_string(),
            key: Uuid::new_v4().to_string(),
            kernel_name: Some(self.config.kernel_name.clone()),
        };

        // Write connection file
        let runtime_dir = runtimelib::dirs::runtime_dir();
        tokio::fs::create_dir_all(&runtime_dir).await?;

        self.kernel_id = petname::petname(2, "-").unwrap_or_else(|| Uuid::new_v4().to_string());
        let connection_file_path =
            runtime_dir.join(format!("scriptd-kernel-{}.json", self.kernel_id));
        let contents = serde_json::to_string_pretty(&connection_info).map_err(launch_error)?;
        tokio::fs::write(&connection_file_path, contents).await?;
        self.connection_file = Some(connection_file_path.clone());

        let mut cmd = match &self.config.python {
            Some(python) => {
                info!(
                    "[kernel] Starting Python kernel for session {} from {:?}",
                    self.owner, python
                );
                let mut c = tokio::process::Command::new(python);
                c.args(["-Xfrozen_modules=off", "-m", "ipykernel_launcher", "-f"]);
                c.arg(&connection_file_path);
                c.stdout(Stdio::null());
                c.stderr(Stdio::null());
                c
            }
            None => {
                info!(
                    "[kernel] Starting {} kernel for session {} via kernelspec",
                    self.config.kernel_name, self.owner
                );
                let kernelspec = runtimelib::find_kernelspec(&self.config.kernel_name)
                    .await
                    .map_err(launch_error)?;
                kernelspec
                    .command(
                        &connection_file_path,
                        Some(Stdio::null()),
                        Some(Stdio::null()),
                    )
                    .map_err(launch_error)?
            }
        };
        let cwd = self
            .config
            .working_dir
            .clone()
            .or_else(dirs::home_dir)
            .unwrap_or_else(std::env::temp_dir);
        cmd.current_dir(&cwd);

        #[cfg(unix)]
        cmd.process_group(0);

        let mut process = cmd
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| KernelError::Launch(e.to_string()))?;

        #[cfg(unix)]
        {
            self.process_group_id = process.id().map(|pid| pid as i32);
        }

        self.alive.store(true, Ordering::SeqCst);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        self.kill_tx = Some(kill_tx);
        let alive = self.alive.clone();
        let in_flight = self.in_flight.clone();
        let kernel_id = self.kernel_id.clone();
        self.monitor_task = Some(tokio::spawn(async move {
            tokio::select! {
                status = process.wait() => match status {
                    Ok(status) => warn!("[kernel] Kernel {} exited: {}", kernel_id, status),
                    Err(e) => error!("[kernel] Failed waiting on kernel {}: {}", kernel_id, e),
                },
                _ = kill_rx => {
                    let _ = process.start_kill();
                    let _ = process.wait().await;
                }
            }
            alive.store(false, Ordering::SeqCst);
            let orphan = in_flight.lock().ok().and_then(|mut slot| slot.take());
            if let Some(orphan) = orphan {
                let _ = orphan.tx.send(Err(KernelError::Died)).await;
            }
        }));

        // Small delay to let the kernel start
        tokio::time::sleep(Duration::from_millis(500)).await;

        self.session_id = Uuid::new_v4().to_string();

        let mut iopub =
            runtimelib::create_client_iopub_connection(&connection_info, "", &self.session_id)
                .await
                .map_err(protocol_error)?;

        let in_flight = self.in_flight.clone();
        self.iopub_task = Some(tokio::spawn(async move {
            loop {
                let message = match iopub.read().await {
                    Ok(message) => message,
                    Err(e) => {
                        error!("[kernel] iopub read error: {}", e);
                        let orphan = in_flight.lock().ok().and_then(|mut slot| slot.take());
                        if let Some(orphan) = orphan {
                            let _ = orphan.tx.send(Err(protocol_error(e))).await;
                        }
                        break;
                    }
                };

                let Some(parent_id) = message.parent_header.as_ref().map(|h| h.msg_id.clone())
                else {
                    continue;
                };
                let tx = in_flight.lock().ok().and_then(|slot| {
                    slot.as_ref()
                        .filter(|f| f.msg_id == parent_id)
                        .map(|f| f.tx.clone())
                });
                let Some(tx) = tx else {
                    debug!(
                        "[kernel] Discarding stale {} (parent {})",
                        message.header.msg_type, parent_id
                    );
                    continue;
                };
                let Some(converted) = to_kernel_message(&message.content) else {
                    continue;
                };

                let idle = converted.is_idle();
                if tx.send(Ok(converted)).await.is_err() {
                    debug!("[kernel] Output receiver dropped for {}", parent_id);
                }
                if idle {
                    if let Ok(mut slot) = in_flight.lock() {
                        if slot.as_ref().is_some_and(|f| f.msg_id == parent_id) {
                            slot.take();
                        }
                    }
                }
            }
        }));

        let identity = runtimelib::peer_identity_for_session(&self.session_id)
            .map_err(protocol_error)?;
        let mut shell = runtimelib::create_client_shell_connection_with_identity(
            &connection_info,
            &self.session_id,
            identity,
        )
        .await
        .map_err(protocol_error)?;

        // Verify kernel is alive
        let request: JupyterMessage = KernelInfoRequest::default().into();
        shell.send(request).await.map_err(protocol_error)?;

        match tokio::time::timeout(self.config.startup_timeout, shell.read()).await {
            Ok(Ok(msg)) => {
                info!(
                    "[kernel] Kernel {} alive: got {} reply",
                    self.kernel_id, msg.header.msg_type
                );
            }
            Ok(Err(e)) => {
                error!("[kernel] Error reading kernel_info_reply: {}", e);
                return Err(protocol_error(e));
            }
            Err(_) => {
                error!(
                    "[kernel] Kernel {} did not answer within {:?}",
                    self.kernel_id, self.config.startup_timeout
                );
                return Err(KernelError::StartupTimeout(self.config.startup_timeout));
            }
        }

        let (shell_writer, mut shell_reader) = shell.split();
        let kernel_id = self.kernel_id.clone();
        self.shell_reader_task = Some(tokio::spawn(async move {
            loop {
                match shell_reader.read().await {
                    Ok(msg) => debug!(
                        "[kernel] shell: {} for {:?}",
                        msg.header.msg_type,
                        msg.parent_header.as_ref().map(|h| &h.msg_id)
                    ),
                    Err(e) => {
                        debug!("[kernel] Shell reader for {} stopped: {}", kernel_id, e);
                        break;
                    }
                }
            }
        }));

        self.shell_writer = Some(shell_writer);
        self.connection_info = Some(connection_info);
        info!("[kernel] Kernel started: {}", self.kernel_id);
        Ok(())
    }

    /// Run configured startup code and wait for it to finish.
    async fn run_startup_code(&mut self, code: &str) {
        let mut stream = match self.execute(code, true).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("[kernel] Failed to send startup code: {}", e);
                return;
            }
        };
        let drain = async {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(KernelMessage::Error { ename, evalue, .. }) => {
                        warn!("[kernel] Startup code failed: {}: {}", ename, evalue)
                    }
                    Ok(message) if message.is_idle() => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("[kernel] Kernel lost during startup code: {}", e);
                        break;
                    }
                }
            }
        };
        if tokio::time::timeout(self.config.startup_timeout, drain)
            .await
            .is_err()
        {
            warn!("[kernel] Startup code did not finish in time");
        }
    }

    #[cfg(unix)]
    fn signal_process_group(&self, signal: nix::sys::signal::Signal) {
        use nix::sys::signal::killpg;
        use nix::unistd::Pid;

        if let Some(pgid) = self.process_group_id {
            if let Err(e) = killpg(Pid::from_raw(pgid), signal) {
                if e != nix::errno::Errno::ESRCH {
                    error!(
                        "[kernel] Failed to signal process group {} with {:?}: {}",
                        pgid, signal, e
                    );
                }
            }
        }
    }

    fn remove_connection_file(&mut self) {
        if let Some(path) = self.connection_file.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[async_trait]
impl KernelProcess for JupyterKernel {
    async fn start(&mut self) -> Result<(), KernelError> {
        if self.is_alive() {
            return Ok(());
        }
        if let Err(e) = self.launch().await {
            error!("[kernel] Failed to start kernel for {}: {}", self.owner, e);
            self.shutdown().await;
            return Err(e);
        }
        if let Some(code) = self.config.startup_code.clone() {
            self.run_startup_code(&code).await;
        }
        Ok(())
    }

    async fn execute(&mut self, code: &str, silent: bool) -> Result<KernelStream, KernelError> {
        if !self.is_alive() {
            return Err(KernelError::NotStarted);
        }
        let shell = self.shell_writer.as_mut().ok_or(KernelError::NotStarted)?;

        let request = ExecuteRequest {
            code: code.to_string(),
            silent,
            store_history: !silent,
            user_expressions: None,
            allow_stdin: false,
            stop_on_error: true,
        };
        let message: JupyterMessage = request.into();
        let msg_id = message.header.msg_id.clone();

        // Register msg_id BEFORE sending so no output is missed.
        let (tx, stream) = KernelStream::channel(STREAM_BUFFER);
        if let Ok(mut slot) = self.in_flight.lock() {
            *slot = Some(InFlight {
                msg_id: msg_id.clone(),
                tx,
            });
        }

        if let Err(e) = shell.send(message).await {
            if let Ok(mut slot) = self.in_flight.lock() {
                slot.take();
            }
            return Err(protocol_error(e));
        }
        debug!("[kernel] Sent execute_request {}", msg_id);
        Ok(stream)
    }

    async fn interrupt(&mut self) -> Result<(), KernelError> {
        let connection_info = self
            .connection_info
            .as_ref()
            .ok_or(KernelError::NotStarted)?;

        let sent = async {
            let mut control =
                runtimelib::create_client_control_connection(connection_info, &self.session_id)
                    .await
                    .map_err(protocol_error)?;
            let request: JupyterMessage = InterruptRequest {}.into();
            control.send(request).await.map_err(protocol_error)?;
            Ok::<(), KernelError>(())
        }
        .await;

        match sent {
            Ok(()) => {
                info!("[kernel] Sent interrupt_request to {}", self.kernel_id);
                Ok(())
            }
            #[cfg(unix)]
            Err(e) => {
                warn!("[kernel] interrupt_request failed ({}), sending SIGINT", e);
                self.signal_process_group(nix::sys::signal::Signal::SIGINT);
                Ok(())
            }
            #[cfg(not(unix))]
            Err(e) => Err(e),
        }
    }

    async fn shutdown(&mut self) {
        let Some(mut monitor) = self.monitor_task.take() else {
            self.remove_connection_file();
            return;
        };
        info!("[kernel] Shutting down kernel {}", self.kernel_id);

        self.alive.store(false, Ordering::SeqCst);
        // Ends the stream of any in-flight request.
        if let Ok(mut slot) = self.in_flight.lock() {
            slot.take();
        }
        if let Some(task) = self.iopub_task.take() {
            task.abort();
        }
        if let Some(task) = self.shell_reader_task.take() {
            task.abort();
        }
        self.shell_writer = None;

        if let Some(connection_info) = self.connection_info.take() {
            let request = async {
                let mut control = runtimelib::create_client_control_connection(
                    &connection_info,
                    &self.session_id,
                )
                .await
                .map_err(protocol_error)?;
                let request: JupyterMessage = ShutdownRequest { restart: false }.into();
                control.send(request).await.map_err(protocol_error)?;
                Ok::<(), KernelError>(())
            };
            match tokio::time::timeout(self.config.shutdown_timeout, request).await {
                Ok(Ok(())) => debug!("[kernel] Sent shutdown_request"),
                Ok(Err(e)) => debug!("[kernel] shutdown_request failed: {}", e),
                Err(_) => debug!("[kernel] shutdown_request timed out"),
            }
        }

        if tokio::time::timeout(self.config.shutdown_timeout, &mut monitor)
            .await
            .is_err()
        {
            warn!(
                "[kernel] Kernel {} did not exit within {:?}, killing",
                self.kernel_id, self.config.shutdown_timeout
            );
            #[cfg(unix)]
            self.signal_process_group(nix::sys::signal::Signal::SIGKILL);
            if let Some(kill_tx) = self.kill_tx.take() {
                let _ = kill_tx.send(());
            }
            if tokio::time::timeout(Duration::from_secs(2), &mut monitor)
                .await
                .is_err()
            {
                monitor.abort();
            }
        }
        self.kill_tx = None;

        // Children the kernel spawned share its process group.
        #[cfg(unix)]
        {
            self.signal_process_group(nix::sys::signal::Signal::SIGKILL);
            self.process_group_id = None;
        }

        self.remove_connection_file();
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

impl Drop for JupyterKernel {
    fn drop(&mut self) {
        for task in [
            self.iopub_task.take(),
            self.shell_reader_task.take(),
            self.monitor_task.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }

        #[cfg(unix)]
        self.signal_process_group(nix::sys::signal::Signal::SIGKILL);

        self.remove_connection_file();
    }
}

/// Launches a [`JupyterKernel`] per session from one shared config.
#[derive(Debug, Clone, Default)]
pub struct JupyterKernelFactory {
    config: KernelConfig,
}

impl JupyterKernelFactory {
    pub fn new(config: KernelConfig) -> Self {
        Self { config }
    }
}

impl KernelFactory for JupyterKernelFactory {
    type Kernel = JupyterKernel;

    fn create(&self, session_id: &str) -> JupyterKernel {
        JupyterKernel::new(self.config.clone(), session_id)
    }
}
