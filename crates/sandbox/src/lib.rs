//! Sluice Sandbox
//!
//! The isolation boundary: untrusted WebAssembly runs in a wasmtime instance
//! with no imports other than the two resource-proxy functions, bounded
//! memory and stack, fuel metering, and an in-engine deadline. The host can
//! force-terminate a running instance through its [`BoundaryHandle`].
//!
//! - `sandbox`: engine configuration, limits, the shared runtime.
//! - `contract`: module and result shape checks.
//! - `host_fns`: per-execution host state and the proxy imports.
//! - `proxy`: the boundary side of the resource proxy channel.
//! - `lifecycle`: compile, instantiate, run, classify the outcome.

pub mod contract;
pub mod host_fns;
pub mod lifecycle;
pub mod proxy;
pub mod sandbox;

pub use lifecycle::BoundaryHandle;
pub use proxy::{ProxyClient, ProxyRequest};
pub use sandbox::{BoundaryRuntime, SandboxError, SandboxLimits};

/// Import module name guest code must link against.
pub const IMPORT_MODULE: &str = "sluice";

/// Name of the single exported entry point.
pub const ENTRY_POINT: &str = "run";
