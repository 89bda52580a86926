//! Sluice IPC
//!
//! JSON-RPC 2.0 over a Unix socket, one request per line. The daemon
//! implements [`IpcHandler`]; operators and the approval workflow talk to it
//! through [`IpcClient`].

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{IpcClient, IpcError};
pub use protocol::{RpcError, RpcRequest, RpcResponse};
pub use server::{IpcHandler, IpcServer, MAX_REQUEST_BYTES};

use std::path::PathBuf;

/// Default socket path for a service.
///
/// - Linux: `$XDG_RUNTIME_DIR/{service}.sock` or `/tmp/{service}.sock`
/// - elsewhere: `/tmp/{service}.sock`
pub fn default_socket_path(service: &str) -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_RUNTIME_DIR")
            .map(|dir| PathBuf::from(dir).join(format!("{service}.sock")))
            .unwrap_or_else(|_| PathBuf::from(format!("/tmp/{service}.sock")))
    }
    #[cfg(not(target_os = "linux"))]
    {
        PathBuf::from(format!("/tmp/{service}.sock"))
    }
}
