use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use sluice_app::{build_service, ExecutorHandler};
use sluice_executor::{ExecutorConfig, ExecutorService};
use sluice_ipc::protocol::{INVALID_PARAMS, METHOD_NOT_FOUND, NOT_FOUND, USER_LIMIT};
use sluice_ipc::{IpcClient, IpcError, IpcHandler, IpcServer};
use tokio::sync::oneshot;

const EMPTY_RESULT: &str = r#"(module
  (memory (export "memory") 1)
  (data (i32.const 0) "{\"count\":0,\"rows\":[]}")
  (func (export "run") (param i32) (result i64) (i64.const 21)))"#;

const BUSY: &str = r#"(module
  (memory (export "memory") 1)
  (func (export "run") (param i32) (result i64)
    (loop $spin (br $spin))
    (i64.const 0)))"#;

fn service(dir: &std::path::Path, config: ExecutorConfig) -> Arc<ExecutorService> {
    Arc::new(build_service(config, dir).unwrap())
}

fn request(id: &str, submitter: &str, source: &str) -> Value {
    json!({
        "id": id,
        "sourceText": source,
        "targetEngine": "document",
        "targetDatabase": "default",
        "submitterId": submitter,
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_execute_then_lookup_record() {
    let dir = tempfile::tempdir().unwrap();
    let handler = ExecutorHandler::new(service(dir.path(), ExecutorConfig::default()));

    let record = handler
        .handle("execute", Some(request("h-1", "alice", EMPTY_RESULT)))
        .await
        .unwrap();
    assert_eq!(record["status"]["state"], "SUCCESS");
    assert_eq!(record["result"], json!({"count": 0, "rows": []}));

    let fetched = handler
        .handle("record", Some(json!({"id": "h-1"})))
        .await
        .unwrap();
    assert_eq!(fetched, record);

    let missing = handler
        .handle("record", Some(json!({"id": "nope"})))
        .await
        .unwrap_err();
    assert_eq!(missing.code, NOT_FOUND);

    let metrics = handler.handle("metrics", None).await.unwrap();
    assert_eq!(metrics["completed"], 1);
    let text = handler
        .handle("metrics", Some(json!({"format": "prometheus"})))
        .await
        .unwrap();
    assert!(text["text"].as_str().unwrap().contains("sluice_"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_bad_calls() {
    let dir = tempfile::tempdir().unwrap();
    let handler = ExecutorHandler::new(service(dir.path(), ExecutorConfig::default()));

    let err = handler.handle("drop_tables", None).await.unwrap_err();
    assert_eq!(err.code, METHOD_NOT_FOUND);

    let err = handler
        .handle("execute", Some(json!({"id": "x"})))
        .await
        .unwrap_err();
    assert_eq!(err.code, INVALID_PARAMS);

    let report = handler.handle("reap", None).await.unwrap();
    assert_eq!(report["recordsFailed"], 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_user_limit_over_socket() {
    let dir = tempfile::tempdir().unwrap();
    let config = ExecutorConfig {
        per_submitter_max: 1,
        ..Default::default()
    };
    let service = service(dir.path(), config);
    let socket = dir.path().join("sluice.sock");
    let server = IpcServer::new(&socket);
    let handler = Arc::new(ExecutorHandler::new(service.clone()));
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server_task = tokio::spawn(async move {
        server
            .run_until(handler, async {
                let _ = stop_rx.await;
            })
            .await
    });

    let client = IpcClient::new(&socket);
    for _ in 0..100 {
        if client.is_daemon_running().await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let mut busy = request("s-1", "alice", BUSY);
    busy["timeBudgetMs"] = json!(300);
    let submitted = client.send_request("submit", Some(busy)).await.unwrap();
    assert_eq!(submitted["id"], "s-1");

    match client
        .send_request("execute", Some(request("s-2", "alice", EMPTY_RESULT)))
        .await
    {
        Err(IpcError::Daemon { code, data, .. }) => {
            assert_eq!(code, USER_LIMIT);
            assert_eq!(data.unwrap()["code"], "USER_LIMIT");
        }
        other => panic!("expected USER_LIMIT, got {other:?}"),
    }

    let status = client.send_request("status", None).await.unwrap();
    assert_eq!(status["active"], 1);

    // the busy script times out on its own budget
    let mut record = Value::Null;
    for _ in 0..200 {
        record = client
            .send_request("record", Some(json!({"id": "s-1"})))
            .await
            .unwrap();
        if record["status"]["state"] != "RUNNING" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(record["status"]["state"], "FAILED");
    assert_eq!(record["status"]["failure"]["kind"], "timeout");
    assert_eq!(record["status"]["failure"]["source"], "cooperative");

    stop_tx.send(()).unwrap();
    server_task.await.unwrap().unwrap();
    service.shutdown().await;
}
