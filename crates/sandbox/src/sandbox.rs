use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sluice_core::ExecError;
use wasmtime::*;

use crate::host_fns::{register_proxy_fns, HostState};
use crate::lifecycle::{self, BoundaryHandle};
use crate::proxy::ProxyClient;

/// Resource limits applied to every boundary instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxLimits {
    /// Linear memory ceiling in bytes (default: 64MB).
    pub max_heap_bytes: usize,
    /// Wasm stack ceiling in bytes (default: 512KB).
    pub max_stack_bytes: usize,
    /// Fuel granted per execution; roughly one unit per instruction.
    pub fuel_limit: u64,
    /// How often the engine epoch advances, which bounds how quickly a
    /// deadline or kill is noticed inside guest code.
    pub epoch_tick_ms: u64,
    /// Largest accepted module source, text or binary.
    pub max_module_bytes: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            max_heap_bytes: 64 * 1024 * 1024,
            max_stack_bytes: 512 * 1024,
            fuel_limit: 1_000_000_000,
            epoch_tick_ms: 10,
            max_module_bytes: 1024 * 1024,
        }
    }
}

impl SandboxLimits {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_heap_bytes < 64 * 1024 {
            return Err("sandbox.max_heap_bytes must allow at least one wasm page".into());
        }
        if self.max_stack_bytes == 0 {
            return Err("sandbox.max_stack_bytes must be positive".into());
        }
        if self.fuel_limit == 0 {
            return Err("sandbox.fuel_limit must be positive".into());
        }
        if self.epoch_tick_ms == 0 {
            return Err("sandbox.epoch_tick_ms must be positive".into());
        }
        if self.max_module_bytes == 0 {
            return Err("sandbox.max_module_bytes must be positive".into());
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("wasm error: {0}")]
    Wasm(#[from] anyhow::Error),
    #[error("invalid limits: {0}")]
    Limits(String),
    #[error("failed to start epoch ticker: {0}")]
    Ticker(#[from] std::io::Error),
}

/// Advances the engine epoch on a fixed tick so guest code periodically
/// yields to the deadline callback.
struct EpochTicker {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl EpochTicker {
    fn start(engine: Engine, tick: Duration) -> Result<Self, std::io::Error> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let thread = std::thread::Builder::new()
            .name("sluice-epoch".into())
            .spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    std::thread::sleep(tick);
                    engine.increment_epoch();
                }
            })?;
        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Engine, linker, and epoch ticker shared by every execution. The host
/// function table is built once here and never changes afterwards.
pub struct BoundaryRuntime {
    engine: Engine,
    linker: Arc<Linker<HostState>>,
    limits: SandboxLimits,
    next_capability: AtomicI32,
    _ticker: EpochTicker,
}

impl BoundaryRuntime {
    pub fn new(limits: SandboxLimits) -> Result<Self, SandboxError> {
        limits.validate().map_err(SandboxError::Limits)?;

        let mut engine_config = Config::new();
        engine_config.consume_fuel(true);
        engine_config.epoch_interruption(true);
        engine_config.max_wasm_stack(limits.max_stack_bytes);
        let engine = Engine::new(&engine_config)?;

        let mut linker = Linker::new(&engine);
        register_proxy_fns(&mut linker)?;

        let ticker = EpochTicker::start(engine.clone(), Duration::from_millis(limits.epoch_tick_ms))?;
        tracing::debug!(
            heap = limits.max_heap_bytes,
            stack = limits.max_stack_bytes,
            fuel = limits.fuel_limit,
            "boundary runtime ready"
        );

        Ok(Self {
            engine,
            linker: Arc::new(linker),
            limits,
            next_capability: AtomicI32::new(0),
            _ticker: ticker,
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    pub(crate) fn linker(&self) -> &Linker<HostState> {
        &self.linker
    }

    /// A fresh kill handle for one execution.
    pub fn new_handle(&self) -> BoundaryHandle {
        BoundaryHandle::new(self.engine.clone())
    }

    /// Opaque capability value handed to one execution's entry point.
    pub(crate) fn issue_capability(&self) -> i32 {
        // keep it positive and non-zero so a zeroed argument never matches
        (self.next_capability.fetch_add(1, Ordering::Relaxed) & 0x3fff_ffff) + 1
    }

    /// Run `source` to completion on the calling thread. Blocks; call from a
    /// blocking-pool thread.
    pub fn execute(
        &self,
        source: &[u8],
        proxy: ProxyClient,
        budget: Duration,
        handle: BoundaryHandle,
    ) -> Result<Value, ExecError> {
        lifecycle::execute(self, source, proxy, budget, handle)
    }
}
