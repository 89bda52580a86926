use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use serde_json::Value;
use sluice_core::{codec, ExecError, TimeoutSource};
use tokio::sync::watch;
use wasmtime::*;

use crate::contract;
use crate::host_fns::HostState;
use crate::proxy::ProxyClient;
use crate::sandbox::BoundaryRuntime;
use crate::ENTRY_POINT;

/// Message recorded when the host force-terminates a boundary.
pub const TERMINATED_BY_HOST: &str = "terminated by host";

/// Force-termination handle for one boundary. Cheap to clone; `terminate`
/// is idempotent.
#[derive(Clone)]
pub struct BoundaryHandle {
    signal: Arc<watch::Sender<bool>>,
    engine: Engine,
}

impl BoundaryHandle {
    pub(crate) fn new(engine: Engine) -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            signal: Arc::new(signal),
            engine,
        }
    }

    /// Flag the boundary as killed and bump the epoch so running guest code
    /// traps at its next epoch check. Also wakes anyone watching.
    pub fn terminate(&self) {
        self.signal.send_replace(true);
        self.engine.increment_epoch();
    }

    pub fn is_terminated(&self) -> bool {
        *self.signal.borrow()
    }

    /// Resolves when `terminate` is called.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.signal.subscribe()
    }
}

impl std::fmt::Debug for BoundaryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundaryHandle")
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

/// Compile, check, instantiate and run one guest. Every failure comes back as
/// the `ExecError` the terminal record should carry.
pub(crate) fn execute(
    runtime: &BoundaryRuntime,
    source: &[u8],
    proxy: ProxyClient,
    budget: Duration,
    handle: BoundaryHandle,
) -> Result<Value, ExecError> {
    let limits = runtime.limits();
    if source.len() > limits.max_module_bytes {
        return Err(ExecError::Quota(format!(
            "module exceeds {} bytes",
            limits.max_module_bytes
        )));
    }
    if handle.is_terminated() {
        return Err(ExecError::Crash(TERMINATED_BY_HOST.into()));
    }

    let binary = wat::parse_bytes(source)
        .map_err(|e| ExecError::Contract(format!("module failed to parse: {e}")))?;
    let module = Module::from_binary(runtime.engine(), &binary)
        .map_err(|e| ExecError::Contract(format!("module failed to compile: {e}")))?;
    contract::check_module(&module)?;
    let pre = runtime
        .linker()
        .instantiate_pre(&module)
        .map_err(|e| ExecError::Contract(format!("imports do not match: {}", e.root_cause())))?;

    let codec_limits = *proxy.codec();
    let capability = runtime.issue_capability();
    let state = HostState {
        capability,
        proxy,
        staged: None,
        fault: None,
        limits: StoreLimitsBuilder::new()
            .memory_size(limits.max_heap_bytes)
            .memories(1)
            .tables(1)
            .instances(1)
            .trap_on_grow_failure(true)
            .build(),
        handle,
        deadline: Instant::now() + budget,
        deadline_hit: false,
    };

    let mut store = Store::new(runtime.engine(), state);
    store.limiter(|state| &mut state.limits);
    store
        .set_fuel(limits.fuel_limit)
        .map_err(|e| ExecError::Crash(e.to_string()))?;
    store.set_epoch_deadline(1);
    store.epoch_deadline_callback(|mut ctx| {
        let state = ctx.data_mut();
        if state.handle.is_terminated() {
            return Err(anyhow!(TERMINATED_BY_HOST));
        }
        if Instant::now() >= state.deadline {
            state.deadline_hit = true;
            return Err(anyhow!("time budget exhausted"));
        }
        Ok(UpdateDeadline::Continue(1))
    });

    let instance = match pre.instantiate(&mut store) {
        Ok(instance) => instance,
        Err(e) => return Err(classify(&mut store, e, "instantiation failed")),
    };
    let run = instance
        .get_typed_func::<i32, i64>(&mut store, ENTRY_POINT)
        .map_err(|e| ExecError::Contract(format!("run is not callable: {e}")))?;

    let packed = match run.call(&mut store, capability) {
        Ok(packed) => packed as u64,
        Err(e) => return Err(classify(&mut store, e, "trap")),
    };
    // a kill that landed right as the guest returned still wins
    if store.data().handle.is_terminated() {
        return Err(ExecError::Crash(TERMINATED_BY_HOST.into()));
    }

    let ptr = (packed >> 32) as usize;
    let len = (packed & 0xffff_ffff) as usize;
    if len > codec_limits.max_bytes {
        return Err(codec::CodecError::PayloadTooLarge {
            limit: codec_limits.max_bytes,
        }
        .into());
    }
    let memory = instance
        .get_memory(&mut store, "memory")
        .ok_or_else(|| ExecError::Contract("module exports no memory".into()))?;
    let bytes = ptr
        .checked_add(len)
        .and_then(|end| memory.data(&store).get(ptr..end))
        .ok_or_else(|| ExecError::Contract("result out of bounds".into()))?;

    let value = codec::decode(bytes, &codec_limits)?;
    contract::check_result(&value)?;
    Ok(value)
}

/// Map a wasmtime error to the fault that caused it. A fault recorded by a
/// host function wins, then a host kill, then the engine's own limits.
fn classify(store: &mut Store<HostState>, err: anyhow::Error, context: &str) -> ExecError {
    let state = store.data_mut();
    if let Some(fault) = state.fault.take() {
        return fault;
    }
    if state.handle.is_terminated() {
        return ExecError::Crash(TERMINATED_BY_HOST.into());
    }
    if state.deadline_hit {
        return ExecError::Timeout(TimeoutSource::Cooperative);
    }
    match err.downcast_ref::<Trap>() {
        Some(Trap::OutOfFuel) => ExecError::Timeout(TimeoutSource::Cooperative),
        Some(Trap::StackOverflow) => ExecError::Crash("stack limit exceeded".into()),
        Some(trap) => ExecError::Crash(format!("{context}: {trap}")),
        None => {
            tracing::debug!(error = %err, "boundary failed");
            ExecError::Crash(format!("{context}: {}", err.root_cause()))
        }
    }
}
