use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use sluice_core::codec::CodecLimits;
use sluice_core::{ExecError, Operation, ResourceCall, TimeoutSource};
use sluice_sandbox::lifecycle::TERMINATED_BY_HOST;
use sluice_sandbox::*;
use tokio::sync::mpsc;

/// Guest that issues CALLS proxy calls and then returns an empty result.
const CALLS_WAT: &str = r#"
(module
  (import "sluice" "proxy_call" (func $call (param i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "{\"op\":\"query\",\"sql\":\"SELECT 1\"}")
  (data (i32.const 2048) "{\"count\":0,\"rows\":[]}")
  (func (export "run") (param $cap i32) (result i64)
    (local $i i32)
    (block $done
      (loop $again
        (br_if $done (i32.ge_u (local.get $i) (i32.const CALLS)))
        (drop (call $call (local.get $cap) (i32.const 0) (i32.const 31)))
        (local.set $i (i32.add (local.get $i) (i32.const 1)))
        (br $again)))
    (i64.or (i64.shl (i64.const 2048) (i64.const 32)) (i64.const 21)))
)
"#;

/// Guest that makes one call and returns whatever the host answered.
const ECHO_WAT: &str = r#"
(module
  (import "sluice" "proxy_call" (func $call (param i32 i32 i32) (result i32)))
  (import "sluice" "proxy_read" (func $read (param i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "{\"op\":\"query\",\"sql\":\"SELECT 1\"}")
  (func (export "run") (param $cap i32) (result i64)
    (local $n i32)
    (drop (call $call (local.get $cap) (i32.const 0) (i32.const 31)))
    (local.set $n (call $read (local.get $cap) (i32.const 1024)))
    (i64.or (i64.shl (i64.const 1024) (i64.const 32)) (i64.extend_i32_u (local.get $n))))
)
"#;

const BUSY_WAT: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "run") (param i32) (result i64)
    (loop $spin (br $spin))
    (i64.const 0))
)
"#;

/// Guest returning `json` verbatim from a data segment.
fn returning(json: &str) -> String {
    let escaped = json.replace('\\', "\\\\").replace('"', "\\\"");
    format!(
        r#"(module
  (memory (export "memory") 1)
  (data (i32.const 0) "{escaped}")
  (func (export "run") (param i32) (result i64) (i64.const {len})))"#,
        len = json.len()
    )
}

fn runtime() -> BoundaryRuntime {
    BoundaryRuntime::new(SandboxLimits::default()).unwrap()
}

/// Answer every request with `response`; report what was received.
fn responder(
    mut rx: mpsc::Receiver<ProxyRequest>,
    response: &'static str,
) -> JoinHandle<Vec<ResourceCall>> {
    std::thread::spawn(move || {
        let mut seen = Vec::new();
        while let Some(request) = rx.blocking_recv() {
            seen.push(request.call);
            let _ = request.reply.send(Ok(response.as_bytes().to_vec()));
        }
        seen
    })
}

fn run(
    runtime: &BoundaryRuntime,
    wat: &str,
    max_calls: u32,
    budget: Duration,
) -> (Result<Value, ExecError>, Vec<ResourceCall>) {
    let (tx, rx) = mpsc::channel(1);
    let host = responder(rx, r#"{"count":1,"rows":[{"x":1}]}"#);
    let proxy = ProxyClient::new(tx, max_calls, CodecLimits::default());
    let result = runtime.execute(wat.as_bytes(), proxy, budget, runtime.new_handle());
    (result, host.join().unwrap())
}

#[test]
fn test_returns_result() {
    let rt = runtime();
    let (result, calls) = run(
        &rt,
        &returning(r#"{"count":2,"rows":[{"a":[1,{"b":null}]},{"a":[]}]}"#),
        10,
        Duration::from_secs(5),
    );
    assert_eq!(
        result.unwrap(),
        json!({"count": 2, "rows": [{"a": [1, {"b": null}]}, {"a": []}]})
    );
    assert!(calls.is_empty());
}

#[test]
fn test_proxy_round_trip() {
    let rt = runtime();
    let (result, calls) = run(&rt, ECHO_WAT, 10, Duration::from_secs(5));
    assert_eq!(result.unwrap(), json!({"count": 1, "rows": [{"x": 1}]}));
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].call_id, 1);
    assert_eq!(
        calls[0].operation,
        Operation::Query {
            sql: "SELECT 1".into(),
            params: vec![]
        }
    );
}

#[test]
fn test_call_at_quota_succeeds() {
    let rt = runtime();
    let (result, calls) = run(
        &rt,
        &CALLS_WAT.replace("CALLS", "100"),
        100,
        Duration::from_secs(10),
    );
    assert!(result.is_ok(), "{result:?}");
    assert_eq!(calls.len(), 100);
}

#[test]
fn test_call_past_quota_never_reaches_host() {
    let rt = runtime();
    let (result, calls) = run(
        &rt,
        &CALLS_WAT.replace("CALLS", "101"),
        100,
        Duration::from_secs(10),
    );
    assert!(matches!(result, Err(ExecError::Quota(_))), "{result:?}");
    assert_eq!(calls.len(), 100);
}

#[test]
fn test_busy_loop_hits_deadline() {
    let rt = runtime();
    let started = Instant::now();
    let (result, _) = run(&rt, BUSY_WAT, 10, Duration::from_millis(100));
    assert_eq!(result, Err(ExecError::Timeout(TimeoutSource::Cooperative)));
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[test]
fn test_fuel_exhaustion() {
    let rt = BoundaryRuntime::new(SandboxLimits {
        fuel_limit: 10_000,
        ..Default::default()
    })
    .unwrap();
    let (result, _) = run(&rt, BUSY_WAT, 10, Duration::from_secs(30));
    assert_eq!(result, Err(ExecError::Timeout(TimeoutSource::Cooperative)));
}

#[test]
fn test_terminate_stops_running_guest() {
    let rt = runtime();
    let handle = rt.new_handle();
    let killer = {
        let handle = handle.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            handle.terminate();
        })
    };
    let (tx, _rx) = mpsc::channel(1);
    let proxy = ProxyClient::new(tx, 10, CodecLimits::default());
    let result = rt.execute(BUSY_WAT.as_bytes(), proxy, Duration::from_secs(30), handle.clone());
    killer.join().unwrap();
    assert_eq!(result, Err(ExecError::Crash(TERMINATED_BY_HOST.into())));
    assert!(handle.is_terminated());
}

#[test]
fn test_malformed_result_is_contract_violation() {
    let rt = runtime();
    for body in [r#"{"rows":[]}"#, r#"{"count":"3","rows":[]}"#, "not json"] {
        let (result, _) = run(&rt, &returning(body), 10, Duration::from_secs(5));
        assert!(matches!(result, Err(ExecError::Contract(_))), "{body}: {result:?}");
    }
}

#[test]
fn test_deep_result_is_serialization_fault() {
    let rt = runtime();
    let depth = 200;
    let body = format!(
        r#"{{"count":1,"rows":[{}{}]}}"#,
        "[".repeat(depth),
        "]".repeat(depth)
    );
    let (result, _) = run(&rt, &returning(&body), 10, Duration::from_secs(5));
    assert!(matches!(result, Err(ExecError::Serialization(_))), "{result:?}");
}

#[test]
fn test_out_of_bounds_result() {
    let rt = runtime();
    let wat = r#"
    (module
      (memory (export "memory") 1)
      (func (export "run") (param i32) (result i64)
        (i64.or (i64.shl (i64.const 65530) (i64.const 32)) (i64.const 100))))
    "#;
    let (result, _) = run(&rt, wat, 10, Duration::from_secs(5));
    assert!(matches!(result, Err(ExecError::Contract(_))));
}

#[test]
fn test_ambient_import_rejected() {
    let rt = runtime();
    let wat = r#"
    (module
      (import "wasi_snapshot_preview1" "fd_write" (func (param i32 i32 i32 i32) (result i32)))
      (memory (export "memory") 1)
      (func (export "run") (param i32) (result i64) (i64.const 0)))
    "#;
    let (result, _) = run(&rt, wat, 10, Duration::from_secs(5));
    assert!(matches!(result, Err(ExecError::Contract(_))));
}

#[test]
fn test_proxy_import_with_wrong_signature_rejected() {
    let rt = runtime();
    let wat = r#"
    (module
      (import "sluice" "proxy_call" (func (param i32)))
      (memory (export "memory") 1)
      (func (export "run") (param i32) (result i64) (i64.const 0)))
    "#;
    let (result, _) = run(&rt, wat, 10, Duration::from_secs(5));
    assert!(matches!(result, Err(ExecError::Contract(_))));
}

#[test]
fn test_forged_capability_rejected() {
    let rt = runtime();
    let wat = r#"
    (module
      (import "sluice" "proxy_call" (func $call (param i32 i32 i32) (result i32)))
      (memory (export "memory") 1)
      (func (export "run") (param $cap i32) (result i64)
        (drop (call $call (i32.add (local.get $cap) (i32.const 7)) (i32.const 0) (i32.const 2)))
        (i64.const 0)))
    "#;
    let (result, calls) = run(&rt, wat, 10, Duration::from_secs(5));
    assert!(matches!(result, Err(ExecError::Contract(_))));
    assert!(calls.is_empty());
}

#[test]
fn test_memory_limit() {
    let rt = BoundaryRuntime::new(SandboxLimits {
        max_heap_bytes: 1024 * 1024,
        ..Default::default()
    })
    .unwrap();
    // 32 pages = 2MB, above the 1MB ceiling
    let wat = r#"
    (module
      (memory (export "memory") 32)
      (func (export "run") (param i32) (result i64) (i64.const 0)))
    "#;
    let (result, _) = run(&rt, wat, 10, Duration::from_secs(5));
    assert!(matches!(result, Err(ExecError::Crash(_))), "{result:?}");
}

#[test]
fn test_unparseable_module() {
    let rt = runtime();
    let (result, _) = run(&rt, "(module (func", 10, Duration::from_secs(5));
    assert!(matches!(result, Err(ExecError::Contract(_))));
}

#[test]
fn test_oversized_module_rejected() {
    let rt = BoundaryRuntime::new(SandboxLimits {
        max_module_bytes: 16,
        ..Default::default()
    })
    .unwrap();
    let (result, _) = run(&rt, BUSY_WAT, 10, Duration::from_secs(5));
    assert!(matches!(result, Err(ExecError::Quota(_))));
}
