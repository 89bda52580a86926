//! JSON-RPC surface of the daemon.
//!
//! | method    | params                          | result                     |
//! |-----------|---------------------------------|----------------------------|
//! | `execute` | execution request               | terminal record            |
//! | `submit`  | execution request               | `{"id"}` once `RUNNING`    |
//! | `record`  | `{"id"}`                        | record                     |
//! | `spill`   | `{"pointer"}`                   | full spilled result        |
//! | `metrics` | `{"format"?: "prometheus"}`     | snapshot or `{"text"}`     |
//! | `status`  |                                 | gate and watchdog counters |
//! | `reap`    |                                 | report of one reaper sweep |

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use sluice_core::{AdmissionRejected, ExecutionRequest};
use sluice_executor::{ExecutorService, SupervisorError};
use sluice_ipc::protocol::{self, RpcError};
use sluice_ipc::IpcHandler;
use tracing::error;

#[derive(Deserialize)]
struct IdParams {
    id: String,
}

#[derive(Deserialize)]
struct SpillParams {
    pointer: String,
}

#[derive(Deserialize, Default)]
struct MetricsParams {
    #[serde(default)]
    format: Option<String>,
}

fn parse<T: DeserializeOwned>(params: Option<Value>) -> Result<T, RpcError> {
    serde_json::from_value(params.unwrap_or(Value::Null)).map_err(RpcError::invalid_params)
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|e| RpcError::server(e.to_string()))
}

fn rejected(err: &AdmissionRejected) -> RpcError {
    let code = match err {
        AdmissionRejected::Overloaded => protocol::OVERLOADED,
        AdmissionRejected::UserLimit { .. } => protocol::USER_LIMIT,
    };
    let error = RpcError::new(code, err.to_string());
    match serde_json::to_value(err) {
        Ok(data) => error.with_data(data),
        Err(_) => error,
    }
}

fn supervisor_error(err: SupervisorError) -> RpcError {
    match err {
        SupervisorError::Rejected(rejection) => rejected(&rejection),
        other => {
            error!(error = %other, "execution could not be recorded");
            RpcError::server(other.to_string())
        }
    }
}

pub struct ExecutorHandler {
    service: Arc<ExecutorService>,
}

impl ExecutorHandler {
    pub fn new(service: Arc<ExecutorService>) -> Self {
        Self { service }
    }

    async fn dispatch(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        match method {
            "execute" => {
                let request: ExecutionRequest = parse(params)?;
                let record = self
                    .service
                    .supervisor()
                    .run(request)
                    .await
                    .map_err(supervisor_error)?;
                to_value(&record)
            }
            "submit" => {
                let request: ExecutionRequest = parse(params)?;
                let id = self
                    .service
                    .supervisor()
                    .submit(request)
                    .await
                    .map_err(supervisor_error)?;
                Ok(json!({ "id": id }))
            }
            "record" => {
                let IdParams { id } = parse(params)?;
                match self.service.store().get(&id) {
                    Ok(Some(record)) => to_value(&record),
                    Ok(None) => Err(RpcError::new(protocol::NOT_FOUND, format!("no execution {id}"))),
                    Err(e) => Err(RpcError::server(e.to_string())),
                }
            }
            "spill" => {
                let SpillParams { pointer } = parse(params)?;
                match self.service.store().get_spill(&pointer) {
                    Ok(Some(value)) => Ok(value),
                    Ok(None) => Err(RpcError::new(protocol::NOT_FOUND, format!("no spill {pointer}"))),
                    Err(e) => Err(RpcError::server(e.to_string())),
                }
            }
            "metrics" => {
                let MetricsParams { format } = match params {
                    Some(params) => parse(Some(params))?,
                    None => MetricsParams::default(),
                };
                match format.as_deref() {
                    None | Some("json") => to_value(&self.service.metrics().snapshot()),
                    Some("prometheus") => Ok(json!({ "text": self.service.metrics().render_prometheus() })),
                    Some(other) => Err(RpcError::invalid_params(format!("unknown format {other}"))),
                }
            }
            "status" => to_value(&self.service.status()),
            "reap" => {
                let report = self
                    .service
                    .reaper()
                    .sweep_once()
                    .map_err(|e| RpcError::server(e.to_string()))?;
                to_value(&report)
            }
            other => Err(RpcError::method_not_found(other)),
        }
    }
}

impl IpcHandler for ExecutorHandler {
    fn handle(&self, method: &str, params: Option<Value>) -> BoxFuture<'_, Result<Value, RpcError>> {
        let method = method.to_string();
        Box::pin(async move { self.dispatch(&method, params).await })
    }
}
