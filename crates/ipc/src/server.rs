//! IPC server
//!
//! Binds a Unix socket, accepts connections, and dispatches newline-delimited
//! JSON-RPC requests to an [`IpcHandler`]. Requests on one connection are
//! answered in order; clients that want concurrency open more connections.
//! A request line longer than the configured maximum is answered with
//! `INVALID_REQUEST` and the connection is closed.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, warn};

use crate::protocol::{RpcError, RpcRequest, RpcResponse, INVALID_REQUEST, PARSE_ERROR};

/// Implemented by the daemon to answer requests.
pub trait IpcHandler: Send + Sync + 'static {
    fn handle(&self, method: &str, params: Option<Value>) -> BoxFuture<'_, Result<Value, RpcError>>;
}

/// Default ceiling on one request line.
pub const MAX_REQUEST_BYTES: usize = 8 * 1024 * 1024;

pub struct IpcServer {
    socket_path: PathBuf,
    max_request_bytes: usize,
}

impl IpcServer {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            max_request_bytes: MAX_REQUEST_BYTES,
        }
    }

    pub fn with_max_request_bytes(mut self, max_request_bytes: usize) -> Self {
        self.max_request_bytes = max_request_bytes;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind the socket. A stale socket file left by a previous run is
    /// replaced.
    pub fn bind(&self) -> std::io::Result<UnixListener> {
        let _ = std::fs::remove_file(&self.socket_path);
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(&self.socket_path)?;
        info!(path = %self.socket_path.display(), "IPC server listening");
        Ok(listener)
    }

    /// Serve until `shutdown` resolves.
    pub async fn run_until<F>(&self, handler: Arc<dyn IpcHandler>, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()>,
    {
        let listener = self.bind()?;
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("IPC server shutting down");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        tokio::spawn(Self::handle_connection(
                            stream,
                            handler.clone(),
                            self.max_request_bytes,
                        ));
                    }
                    Err(e) => error!(error = %e, "failed to accept IPC connection"),
                },
            }
        }
        Ok(())
    }

    async fn handle_connection(
        stream: UnixStream,
        handler: Arc<dyn IpcHandler>,
        max_request_bytes: usize,
    ) {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();

        loop {
            line.clear();
            let read = (&mut reader)
                .take(max_request_bytes as u64 + 1)
                .read_until(b'\n', &mut line)
                .await;
            match read {
                Ok(0) => {
                    debug!("IPC client disconnected");
                    break;
                }
                Ok(_) if line.len() > max_request_bytes && line.last() != Some(&b'\n') => {
                    warn!(limit = max_request_bytes, "IPC request too large, closing connection");
                    let error = RpcError::new(
                        INVALID_REQUEST,
                        format!("request exceeds {max_request_bytes} bytes"),
                    );
                    let _ = Self::write_response(&mut writer, &RpcResponse::failure(0, error)).await;
                    break;
                }
                Ok(_) => {
                    let response = match std::str::from_utf8(&line) {
                        Ok(text) if text.trim().is_empty() => continue,
                        Ok(text) => Self::dispatch(text.trim(), handler.as_ref()).await,
                        Err(_) => RpcResponse::failure(
                            0,
                            RpcError::new(PARSE_ERROR, "request is not valid UTF-8"),
                        ),
                    };
                    if !Self::write_response(&mut writer, &response).await {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "IPC read error");
                    break;
                }
            }
        }
    }

    async fn write_response(writer: &mut OwnedWriteHalf, response: &RpcResponse) -> bool {
        let mut json = match serde_json::to_vec(response) {
            Ok(json) => json,
            Err(e) => {
                error!(error = %e, "failed to encode IPC response");
                return false;
            }
        };
        json.push(b'\n');
        writer.write_all(&json).await.is_ok()
    }

    async fn dispatch(line: &str, handler: &dyn IpcHandler) -> RpcResponse {
        let request = match serde_json::from_str::<RpcRequest>(line) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "invalid JSON-RPC request");
                return RpcResponse::failure(0, RpcError::new(PARSE_ERROR, format!("parse error: {e}")));
            }
        };
        if request.jsonrpc != "2.0" {
            return RpcResponse::failure(
                request.id,
                RpcError::new(INVALID_REQUEST, "jsonrpc must be \"2.0\""),
            );
        }
        debug!(method = %request.method, id = request.id, "IPC request");
        match handler.handle(&request.method, request.params).await {
            Ok(result) => RpcResponse::success(request.id, result),
            Err(err) => RpcResponse::failure(request.id, err),
        }
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::METHOD_NOT_FOUND;
    use serde_json::json;

    struct Echo;

    impl IpcHandler for Echo {
        fn handle(&self, method: &str, params: Option<Value>) -> BoxFuture<'_, Result<Value, RpcError>> {
            let method = method.to_string();
            Box::pin(async move {
                match method.as_str() {
                    "echo" => Ok(params.unwrap_or(Value::Null)),
                    other => Err(RpcError::method_not_found(other)),
                }
            })
        }
    }

    #[tokio::test]
    async fn test_dispatch_success() {
        let line = r#"{"jsonrpc":"2.0","method":"echo","params":{"a":1},"id":4}"#;
        let response = IpcServer::dispatch(line, &Echo).await;
        assert_eq!(response.id, 4);
        assert_eq!(response.result, Some(json!({"a": 1})));
    }

    #[tokio::test]
    async fn test_dispatch_parse_error_uses_id_zero() {
        let response = IpcServer::dispatch("{not json", &Echo).await;
        assert_eq!(response.id, 0);
        assert_eq!(response.error.unwrap().code, PARSE_ERROR);
    }

    #[tokio::test]
    async fn test_dispatch_unknown_method() {
        let line = r#"{"jsonrpc":"2.0","method":"nope","id":2}"#;
        let response = IpcServer::dispatch(line, &Echo).await;
        assert_eq!(response.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_dispatch_wrong_version() {
        let line = r#"{"jsonrpc":"1.0","method":"echo","id":3}"#;
        let response = IpcServer::dispatch(line, &Echo).await;
        assert_eq!(response.id, 3);
        assert_eq!(response.error.unwrap().code, INVALID_REQUEST);
    }

    #[test]
    fn test_server_creation() {
        let server = IpcServer::new("/tmp/test-sluice.sock");
        assert_eq!(server.socket_path(), Path::new("/tmp/test-sluice.sock"));
    }
}
