//! Host side of the resource proxy: resolve one call against the live
//! session and encode the answer for the boundary.

use sluice_core::codec::{self, CodecLimits};
use sluice_core::{ExecError, ResourceCall};
use sluice_drivers::{DriverError, DriverSession};
use sluice_sandbox::proxy::ProxyReply;
use tracing::debug;

pub(crate) async fn resolve(
    session: &dyn DriverSession,
    call: ResourceCall,
    limits: &CodecLimits,
    execution_id: &str,
) -> ProxyReply {
    let op = call.operation.name();
    let value = session.execute(call.operation).await.map_err(|e| {
        // raw engine detail stays in the host log
        debug!(execution_id, call_id = call.call_id, op, error = %e, "resource call failed");
        match e {
            DriverError::ResultTooLarge { .. } => ExecError::Quota(e.to_string()),
            other => ExecError::Capability(other.sanitized()),
        }
    })?;
    codec::encode(&value, limits).map_err(ExecError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use sluice_core::Operation;
    use sluice_drivers::{DocumentDriver, ResourceDriver, SessionTag};

    async fn session() -> (DocumentDriver, Box<dyn DriverSession>) {
        let driver = DocumentDriver::new();
        driver.seed("app", "items", (0..50).map(|i| json!({"_id": i, "n": i})).collect());
        let session = driver
            .open("app", SessionTag::new("sluice", "exec"), CodecLimits::default())
            .await
            .unwrap();
        (driver, session)
    }

    fn materialize() -> ResourceCall {
        ResourceCall {
            call_id: 1,
            operation: Operation::Materialize {
                collection: "items".into(),
                filter: Value::Null,
                chain: vec![],
            },
        }
    }

    #[tokio::test]
    async fn test_resolved_value_is_encoded() {
        let (_driver, session) = session().await;
        let bytes = resolve(&*session, materialize(), &CodecLimits::default(), "exec")
            .await
            .unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value.as_array().unwrap().len(), 50);
    }

    #[tokio::test]
    async fn test_oversized_response_is_quota() {
        let (_driver, session) = session().await;
        let limits = CodecLimits {
            max_depth: 64,
            max_bytes: 64,
        };
        let err = resolve(&*session, materialize(), &limits, "exec")
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Quota(_)));
    }

    #[tokio::test]
    async fn test_session_ceiling_is_quota() {
        let driver = DocumentDriver::new();
        driver.seed("app", "items", (0..50).map(|i| json!({"_id": i, "n": i})).collect());
        let limits = CodecLimits {
            max_depth: 64,
            max_bytes: 128,
        };
        let session = driver
            .open("app", SessionTag::new("sluice", "exec"), limits)
            .await
            .unwrap();
        let err = resolve(&*session, materialize(), &limits, "exec")
            .await
            .unwrap_err();
        assert_eq!(err, ExecError::Quota("result exceeds 128 bytes".into()));
    }

    #[tokio::test]
    async fn test_wrong_engine_is_capability_fault() {
        let (_driver, session) = session().await;
        let call = ResourceCall {
            call_id: 1,
            operation: Operation::Query {
                sql: "SELECT * FROM secrets".into(),
                params: vec![],
            },
        };
        let err = resolve(&*session, call, &CodecLimits::default(), "exec")
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Capability(_)));
    }
}
