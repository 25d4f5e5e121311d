//! The kernel process abstraction used by sessions.
//!
//! A session only needs a few things from a kernel: start it, send code,
//! read the output of that code until idle, interrupt it, and restart or
//! stop it. [`KernelProcess`] is that surface; [`crate::jupyter_kernel`]
//! implements it over the Jupyter wire protocol and
//! `fake_kernel` (feature `test-support`) implements it in memory for tests.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use kernel_exec::KernelMessage;
use tokio::sync::mpsc;

/// Output channel capacity for one execute request.
pub const STREAM_BUFFER: usize = 256;

#[derive(Debug, Clone, thiserror::Error)]
pub enum KernelError {
    #[error("Kernel is not running")]
    NotStarted,

    #[error("Kernel did not respond within {0:?}")]
    StartupTimeout(Duration),

    #[error("Kernel process died")]
    Died,

    #[error("Failed to launch kernel: {0}")]
    Launch(String),

    #[error("Kernel protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for KernelError {
    fn from(err: std::io::Error) -> Self {
        KernelError::Io(err.to_string())
    }
}

/// Messages produced by one execute request, in kernel order.
///
/// The stream ends after the idle status. An `Err` item, or the stream
/// ending before idle, means the kernel was lost mid-execution.
#[derive(Debug)]
pub struct KernelStream {
    rx: mpsc::Receiver<Result<KernelMessage, KernelError>>,
}

pub type KernelStreamSender = mpsc::Sender<Result<KernelMessage, KernelError>>;

impl KernelStream {
    pub fn channel(capacity: usize) -> (KernelStreamSender, KernelStream) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, KernelStream { rx })
    }

    pub async fn next(&mut self) -> Option<Result<KernelMessage, KernelError>> {
        self.rx.recv().await
    }
}

/// A long-lived interpreter that executes code one request at a time.
#[async_trait]
pub trait KernelProcess: Send + 'static {
    /// Launch the kernel and wait until it answers. Idempotent once running.
    async fn start(&mut self) -> Result<(), KernelError>;

    /// Send code for execution and return the stream of its output.
    ///
    /// Callers must not send another request until the previous stream
    /// has delivered idle.
    async fn execute(&mut self, code: &str, silent: bool) -> Result<KernelStream, KernelError>;

    /// Ask the kernel to abandon the running request.
    async fn interrupt(&mut self) -> Result<(), KernelError>;

    /// Shut down and start again, clearing all interpreter state.
    async fn restart(&mut self) -> Result<(), KernelError> {
        self.shutdown().await;
        self.start().await
    }

    /// Stop the kernel, forcibly if it does not exit in time. Idempotent.
    async fn shutdown(&mut self);

    fn is_alive(&self) -> bool;
}

/// Creates one kernel per session.
pub trait KernelFactory: Send + Sync + 'static {
    type Kernel: KernelProcess;

    fn create(&self, session_id: &str) -> Self::Kernel;
}

/// How kernels are launched.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Kernelspec to launch when no interpreter is given.
    pub kernel_name: String,
    /// Run `python -m ipykernel_launcher` from this interpreter instead of
    /// resolving a kernelspec.
    pub python: Option<PathBuf>,
    /// Working directory of the kernel process.
    pub working_dir: Option<PathBuf>,
    pub startup_timeout: Duration,
    pub shutdown_timeout: Duration,
    /// Code run silently after every start and restart.
    pub startup_code: Option<String>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            kernel_name: "python3".to_string(),
            python: None,
            working_dir: None,
            startup_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(5),
            startup_code: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_ends_when_sender_dropped() {
        let (tx, mut stream) = KernelStream::channel(4);
        tx.send(Ok(KernelMessage::busy())).await.unwrap();
        tx.send(Ok(KernelMessage::idle())).await.unwrap();
        drop(tx);

        assert!(matches!(stream.next().await, Some(Ok(m)) if !m.is_idle()));
        assert!(matches!(stream.next().await, Some(Ok(m)) if m.is_idle()));
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn test_kernel_config_defaults() {
        let config = KernelConfig::default();
        assert_eq!(config.kernel_name, "python3");
        assert_eq!(config.startup_timeout, Duration::from_secs(30));
        assert!(config.startup_code.is_none());
    }
}
