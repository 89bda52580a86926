use std::time::Instant;

use anyhow::anyhow;
use sluice_core::ExecError;
use wasmtime::*;

use crate::lifecycle::BoundaryHandle;
use crate::proxy::ProxyClient;
use crate::IMPORT_MODULE;

/// State owned by one boundary instance's store.
pub struct HostState {
    pub(crate) capability: i32,
    pub(crate) proxy: ProxyClient,
    /// Response staged by `proxy_call`, drained by `proxy_read`.
    pub(crate) staged: Option<Vec<u8>>,
    /// First fault raised by a host function. Takes precedence over the
    /// trap wasmtime reports for it.
    pub(crate) fault: Option<ExecError>,
    pub(crate) limits: StoreLimits,
    pub(crate) handle: BoundaryHandle,
    pub(crate) deadline: Instant,
    pub(crate) deadline_hit: bool,
}

impl HostState {
    /// Record `fault` and produce the trap that unwinds the guest.
    fn fail(&mut self, fault: ExecError) -> anyhow::Error {
        let trap = anyhow!(fault.to_string());
        if self.fault.is_none() {
            self.fault = Some(fault);
        }
        trap
    }
}

fn guest_memory(caller: &mut Caller<'_, HostState>) -> anyhow::Result<Memory> {
    match caller.get_export("memory").and_then(|e| e.into_memory()) {
        Some(memory) => Ok(memory),
        None => Err(caller
            .data_mut()
            .fail(ExecError::Contract("module exports no memory".into()))),
    }
}

fn check_capability(caller: &mut Caller<'_, HostState>, cap: i32) -> anyhow::Result<()> {
    if cap == caller.data().capability {
        Ok(())
    } else {
        Err(caller
            .data_mut()
            .fail(ExecError::Contract("invalid capability handle".into())))
    }
}

/// Register the proxy imports. Nothing else is ever linked.
pub fn register_proxy_fns(linker: &mut Linker<HostState>) -> Result<(), anyhow::Error> {
    // proxy_call(cap, req_ptr, req_len) -> i32 (staged response length)
    linker.func_wrap(
        IMPORT_MODULE,
        "proxy_call",
        |mut caller: Caller<'_, HostState>, cap: i32, req_ptr: i32, req_len: i32| -> anyhow::Result<i32> {
            check_capability(&mut caller, cap)?;
            let memory = guest_memory(&mut caller)?;

            let start = req_ptr as u32 as usize;
            let end = start.checked_add(req_len as u32 as usize);
            let request = end.and_then(|end| memory.data(&caller).get(start..end).map(<[u8]>::to_vec));
            let request = match request {
                Some(bytes) => bytes,
                None => {
                    return Err(caller
                        .data_mut()
                        .fail(ExecError::Contract("request out of bounds".into())))
                }
            };

            let state = caller.data_mut();
            let response = match state.proxy.call(&request) {
                Ok(response) => response,
                Err(fault) => return Err(state.fail(fault)),
            };
            let len = match i32::try_from(response.len()) {
                Ok(len) => len,
                Err(_) => {
                    return Err(state.fail(ExecError::Quota("response exceeds guest address space".into())))
                }
            };
            state.staged = Some(response);
            Ok(len)
        },
    )?;

    // proxy_read(cap, dst_ptr) -> i32 (bytes copied, 0 if nothing staged)
    linker.func_wrap(
        IMPORT_MODULE,
        "proxy_read",
        |mut caller: Caller<'_, HostState>, cap: i32, dst_ptr: i32| -> anyhow::Result<i32> {
            check_capability(&mut caller, cap)?;
            let memory = guest_memory(&mut caller)?;
            let staged = match caller.data_mut().staged.take() {
                Some(bytes) => bytes,
                None => return Ok(0),
            };
            if memory
                .write(&mut caller, dst_ptr as u32 as usize, &staged)
                .is_err()
            {
                return Err(caller
                    .data_mut()
                    .fail(ExecError::Contract("response buffer out of bounds".into())));
            }
            Ok(staged.len() as i32)
        },
    )?;

    Ok(())
}
