//! scriptd - run scripts unit by unit against long-lived Jupyter kernels.
//!
//! Clients connect over a Unix socket, attach to a named session, and send
//! whole scripts. Each session owns one kernel. Scripts are split into
//! top-level units that are executed one at a time, and every unit's
//! output is streamed back as soon as the kernel produces it.
//!
//! The pieces, bottom up:
//!
//! - [`kernel`]: the [`KernelProcess`](kernel::KernelProcess) trait, with a
//!   Jupyter implementation in [`jupyter_kernel`] and an in-memory one in
//!   `fake_kernel` (behind the `test-support` feature).
//! - [`session`]: an actor driving one kernel through the
//!   `kernel_exec` state machine.
//! - [`registry`]: sessions by id, with idle eviction.
//! - [`daemon`], [`connection`], [`protocol`]: the socket server and wire format.
//! - [`client`]: the other end of the socket.

use std::path::PathBuf;

pub mod client;
pub mod connection;
pub mod daemon;
#[cfg(any(test, feature = "test-support"))]
pub mod fake_kernel;
pub mod jupyter_kernel;
pub mod kernel;
pub mod protocol;
pub mod registry;
pub mod session;

/// Directory for the socket and kernel connection files.
pub fn daemon_base_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("scriptd")
}

/// Get the default socket path for the daemon.
///
/// `SCRIPTD_SOCKET` overrides it.
pub fn default_socket_path() -> PathBuf {
    if let Ok(path) = std::env::var("SCRIPTD_SOCKET") {
        return PathBuf::from(path);
    }
    daemon_base_dir().join("scriptd.sock")
}
