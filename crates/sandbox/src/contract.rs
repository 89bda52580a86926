//! What a guest module must look like, and what it must return.

use serde_json::Value;
use sluice_core::ExecError;
use wasmtime::{ExternType, Module, ValType};

use crate::{ENTRY_POINT, IMPORT_MODULE};

const PROXY_IMPORTS: [&str; 2] = ["proxy_call", "proxy_read"];

fn violation(msg: impl Into<String>) -> ExecError {
    ExecError::Contract(msg.into())
}

/// Check imports and exports before anything is instantiated.
///
/// Imports must be functions from the proxy module. Exports must be exactly
/// one function, `run: (i32) -> i64`, plus a memory named `memory`.
pub fn check_module(module: &Module) -> Result<(), ExecError> {
    for import in module.imports() {
        let allowed = import.module() == IMPORT_MODULE && PROXY_IMPORTS.contains(&import.name());
        match import.ty() {
            ExternType::Func(_) if allowed => {}
            ExternType::Func(_) => {
                return Err(violation(format!(
                    "import {}.{} is not available",
                    import.module(),
                    import.name()
                )))
            }
            _ => {
                return Err(violation(format!(
                    "import {}.{} must be a function",
                    import.module(),
                    import.name()
                )))
            }
        }
    }

    let mut entry = None;
    let mut has_memory = false;
    for export in module.exports() {
        match export.ty() {
            ExternType::Func(func) if export.name() == ENTRY_POINT => entry = Some(func),
            ExternType::Func(_) => {
                return Err(violation(format!(
                    "exactly one entry point allowed, found extra export {}",
                    export.name()
                )))
            }
            ExternType::Memory(_) if export.name() == "memory" => has_memory = true,
            _ if export.name() == ENTRY_POINT => {
                return Err(violation("export run is not callable"));
            }
            _ => {}
        }
    }

    let entry = entry.ok_or_else(|| violation("module exports no run function"))?;
    let params: Vec<ValType> = entry.params().collect();
    let results: Vec<ValType> = entry.results().collect();
    let signature_ok = matches!(params.as_slice(), [ValType::I32])
        && matches!(results.as_slice(), [ValType::I64]);
    if !signature_ok {
        return Err(violation("run must have signature (i32) -> i64"));
    }
    if !has_memory {
        return Err(violation("module exports no memory"));
    }
    Ok(())
}

/// The result must be `{count: non-negative integer, rows: array}`.
pub fn check_result(value: &Value) -> Result<(), ExecError> {
    let object = value
        .as_object()
        .ok_or_else(|| violation("result must be an object with count and rows"))?;
    match object.get("count") {
        Some(count) if count.is_u64() => {}
        _ => return Err(violation("result.count must be a non-negative integer")),
    }
    match object.get("rows") {
        Some(Value::Array(_)) => Ok(()),
        _ => Err(violation("result.rows must be an array")),
    }
}
