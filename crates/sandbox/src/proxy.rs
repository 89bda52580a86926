//! Boundary side of the resource proxy.
//!
//! Calls leave the boundary thread as [`ProxyRequest`] messages on a bounded
//! channel and block until the supervisor answers on the per-call oneshot.
//! One call is in flight at a time by construction.

use sluice_core::codec::{self, CodecLimits};
use sluice_core::{ExecError, Operation, ResourceCall};
use tokio::sync::{mpsc, oneshot};

/// Encoded response bytes, or the fault that ends the execution.
pub type ProxyReply = Result<Vec<u8>, ExecError>;

#[derive(Debug)]
pub struct ProxyRequest {
    pub call: ResourceCall,
    pub reply: oneshot::Sender<ProxyReply>,
}

/// Per-execution proxy client. Owns the call counter.
pub struct ProxyClient {
    sender: mpsc::Sender<ProxyRequest>,
    max_calls: u32,
    issued: u32,
    codec: CodecLimits,
}

impl ProxyClient {
    pub fn new(sender: mpsc::Sender<ProxyRequest>, max_calls: u32, codec: CodecLimits) -> Self {
        Self {
            sender,
            max_calls,
            issued: 0,
            codec,
        }
    }

    /// Calls issued so far.
    pub fn issued(&self) -> u32 {
        self.issued
    }

    pub fn codec(&self) -> &CodecLimits {
        &self.codec
    }

    /// Decode one request from guest bytes, forward it, and wait for the
    /// answer. Blocking.
    pub fn call(&mut self, request: &[u8]) -> ProxyReply {
        if self.issued >= self.max_calls {
            return Err(ExecError::Quota(format!(
                "resource call limit of {} exceeded",
                self.max_calls
            )));
        }
        self.issued += 1;

        let operation: Operation = codec::decode_as(request, &self.codec)?;
        let call = ResourceCall {
            call_id: self.issued,
            operation,
        };
        tracing::trace!(call_id = call.call_id, op = call.operation.name(), "proxy call");

        let (reply, response) = oneshot::channel();
        self.sender
            .blocking_send(ProxyRequest { call, reply })
            .map_err(|_| ExecError::Crash("resource proxy closed".into()))?;
        response
            .blocking_recv()
            .map_err(|_| ExecError::Crash("resource proxy abandoned the call".into()))?
    }
}
