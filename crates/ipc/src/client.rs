//! IPC client
//!
//! Connects to the daemon's Unix socket and sends one JSON-RPC 2.0 request
//! per connection.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::debug;

use crate::protocol::{RpcRequest, RpcResponse};

#[derive(Error, Debug)]
pub enum IpcError {
    #[error("daemon not running")]
    DaemonNotRunning,
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("daemon error: code={code}, message={message}")]
    Daemon {
        code: i32,
        message: String,
        data: Option<Value>,
    },
}

pub type Result<T> = std::result::Result<T, IpcError>;

pub struct IpcClient {
    socket_path: PathBuf,
    next_id: AtomicU64,
}

impl IpcClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Send a request and return its result.
    pub async fn send_request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|_| IpcError::DaemonNotRunning)?;
        let (reader, mut writer) = stream.into_split();

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest::new(method, params, id);
        let json = serde_json::to_string(&request)
            .map_err(|e| IpcError::ConnectionFailed(e.to_string()))?;
        debug!(method, id, "IPC request");

        writer
            .write_all(format!("{json}\n").as_bytes())
            .await
            .map_err(|e| IpcError::ConnectionFailed(e.to_string()))?;

        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        let read = reader
            .read_line(&mut line)
            .await
            .map_err(|e| IpcError::ConnectionFailed(e.to_string()))?;
        if read == 0 {
            return Err(IpcError::ConnectionFailed("daemon closed the connection".into()));
        }

        let response: RpcResponse = serde_json::from_str(line.trim())
            .map_err(|e| IpcError::InvalidResponse(e.to_string()))?;
        if response.id != id {
            return Err(IpcError::InvalidResponse(format!(
                "response id {} does not match request id {id}",
                response.id
            )));
        }
        if let Some(err) = response.error {
            return Err(IpcError::Daemon {
                code: err.code,
                message: err.message,
                data: err.data,
            });
        }
        response
            .result
            .ok_or_else(|| IpcError::InvalidResponse("no result in response".to_string()))
    }

    pub async fn is_daemon_running(&self) -> bool {
        UnixStream::connect(&self.socket_path).await.is_ok()
    }
}
