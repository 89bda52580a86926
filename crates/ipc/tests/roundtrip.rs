use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use sluice_ipc::protocol::{INVALID_REQUEST, OVERLOADED};
use sluice_ipc::{IpcClient, IpcError, IpcHandler, IpcServer, RpcError};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::oneshot;

struct Handler;

impl IpcHandler for Handler {
    fn handle(&self, method: &str, params: Option<Value>) -> BoxFuture<'_, Result<Value, RpcError>> {
        let method = method.to_string();
        Box::pin(async move {
            match method.as_str() {
                "echo" => Ok(params.unwrap_or(Value::Null)),
                "busy" => Err(RpcError::new(OVERLOADED, "OVERLOADED")),
                other => Err(RpcError::method_not_found(other)),
            }
        })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_client_server_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sluice.sock");
    let server = IpcServer::new(&path);
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        server
            .run_until(Arc::new(Handler), async {
                let _ = stop_rx.await;
            })
            .await
    });

    let client = IpcClient::new(&path);
    for _ in 0..100 {
        if client.is_daemon_running().await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let echoed = client
        .send_request("echo", Some(json!({"id": "exec-1"})))
        .await
        .unwrap();
    assert_eq!(echoed, json!({"id": "exec-1"}));

    match client.send_request("busy", None).await {
        Err(IpcError::Daemon { code, message, .. }) => {
            assert_eq!(code, OVERLOADED);
            assert_eq!(message, "OVERLOADED");
        }
        other => panic!("expected daemon error, got {other:?}"),
    }

    stop_tx.send(()).unwrap();
    task.await.unwrap().unwrap();
    assert!(!path.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_oversized_request_line_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sluice.sock");
    let server = IpcServer::new(&path).with_max_request_bytes(1024);
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        server
            .run_until(Arc::new(Handler), async {
                let _ = stop_rx.await;
            })
            .await
    });

    let client = IpcClient::new(&path);
    for _ in 0..100 {
        if client.is_daemon_running().await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let stream = UnixStream::connect(&path).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    let padding = "x".repeat(4096);
    let line = format!(
        "{{\"jsonrpc\":\"2.0\",\"method\":\"echo\",\"params\":\"{padding}\",\"id\":1}}\n"
    );
    writer.write_all(line.as_bytes()).await.unwrap();

    let mut reply = String::new();
    BufReader::new(reader).read_line(&mut reply).await.unwrap();
    let reply: Value = serde_json::from_str(reply.trim()).unwrap();
    assert_eq!(reply["error"]["code"], INVALID_REQUEST);

    // requests under the ceiling are still served on new connections
    let echoed = client
        .send_request("echo", Some(json!("short")))
        .await
        .unwrap();
    assert_eq!(echoed, json!("short"));

    stop_tx.send(()).unwrap();
    task.await.unwrap().unwrap();
}
