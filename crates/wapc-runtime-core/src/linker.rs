//! waPC host import registration for Wasmtime linkers.
//!
//! Guests compiled against a waPC guest SDK import the following functions
//! from the `wapc` module:
//!
//! | Import                 | Direction    | Purpose                                  |
//! |------------------------|--------------|------------------------------------------|
//! | `__guest_request`      | host → guest | copy operation name and payload in       |
//! | `__guest_response`     | guest → host | hand back the call result                |
//! | `__guest_error`        | guest → host | hand back an error message               |
//! | `__host_call`          | guest → host | invoke a host capability                 |
//! | `__host_response_len`  | host → guest | size of the last host call result        |
//! | `__host_response`      | host → guest | copy the last host call result in        |
//! | `__host_error_len`     | host → guest | size of the last host call error         |
//! | `__host_error`         | host → guest | copy the last host call error in         |
//! | `__console_log`        | guest → host | emit a log line                          |
//!
//! WASI preview1 is linked as well so guests built for `wasm32-wasi` start.

use tracing::{debug, info, warn};
use wasmtime::{Caller, Extern, Linker, Memory};

use wapc_runtime_common::RuntimeError;

use crate::store::GuestContext;

/// Module name of all waPC host imports.
pub const WAPC_MODULE: &str = "wapc";

/// Register every host import a waPC guest may need.
///
/// # Errors
///
/// Returns an error if function registration fails.
pub fn register_all(linker: &mut Linker<GuestContext>) -> Result<(), RuntimeError> {
    wasmtime_wasi::preview1::add_to_linker_async(linker, GuestContext::wasi).map_err(|e| {
        RuntimeError::invalid_config(format!("Failed to register WASI imports: {e}"))
    })?;

    register_guest_io(linker)?;
    register_host_call(linker)?;
    register_console_log(linker)?;
    Ok(())
}

/// Register the imports moving the invocation request and result across the boundary.
pub fn register_guest_io(linker: &mut Linker<GuestContext>) -> Result<(), RuntimeError> {
    linker
        .func_wrap(
            WAPC_MODULE,
            "__guest_request",
            |mut caller: Caller<'_, GuestContext>, op_ptr: i32, ptr: i32| -> wasmtime::Result<()> {
                let Some(request) = caller.data().request.clone() else {
                    return Err(wasmtime::Error::msg(
                        "__guest_request called outside of an invocation",
                    ));
                };
                write_bytes(&mut caller, op_ptr, request.operation.as_bytes())?;
                write_bytes(&mut caller, ptr, &request.payload)
            },
        )
        .map_err(|e| registration_failed("__guest_request", &e))?;

    linker
        .func_wrap(
            WAPC_MODULE,
            "__guest_response",
            |mut caller: Caller<'_, GuestContext>, ptr: i32, len: i32| -> wasmtime::Result<()> {
                let response = read_bytes(&mut caller, ptr, len)?;
                caller.data_mut().guest_response = Some(response);
                Ok(())
            },
        )
        .map_err(|e| registration_failed("__guest_response", &e))?;

    linker
        .func_wrap(
            WAPC_MODULE,
            "__guest_error",
            |mut caller: Caller<'_, GuestContext>, ptr: i32, len: i32| -> wasmtime::Result<()> {
                let message = read_string(&mut caller, ptr, len)?;
                caller.data_mut().guest_error = Some(message);
                Ok(())
            },
        )
        .map_err(|e| registration_failed("__guest_error", &e))?;

    Ok(())
}

/// Register `__host_call` and the imports reading its result back.
///
/// The waPC (binding, namespace, operation) triple is forwarded as the
/// (namespace, capability, operation) key of the host-callback handler.
pub fn register_host_call(linker: &mut Linker<GuestContext>) -> Result<(), RuntimeError> {
    linker
        .func_wrap(
            WAPC_MODULE,
            "__host_call",
            |mut caller: Caller<'_, GuestContext>,
             bd_ptr: i32,
             bd_len: i32,
             ns_ptr: i32,
             ns_len: i32,
             op_ptr: i32,
             op_len: i32,
             ptr: i32,
             len: i32|
             -> wasmtime::Result<i32> {
                let namespace = read_string(&mut caller, bd_ptr, bd_len)?;
                let capability = read_string(&mut caller, ns_ptr, ns_len)?;
                let operation = read_string(&mut caller, op_ptr, op_len)?;
                let payload = read_bytes(&mut caller, ptr, len)?;

                let (handler, scope) = caller.data().host_call_target();
                let result =
                    handler.host_call(&scope, &namespace, &capability, &operation, &payload);

                let ctx = caller.data_mut();
                ctx.metrics.host_calls += 1;
                ctx.host_response = None;
                ctx.host_error = None;

                match result {
                    Ok(response) => {
                        ctx.host_response = Some(response);
                        Ok(1)
                    }
                    Err(e) => {
                        debug!(
                            module = %ctx.module_name,
                            namespace = %namespace,
                            capability = %capability,
                            operation = %operation,
                            error = %e,
                            "Host call failed"
                        );
                        ctx.host_error = Some(e.to_string());
                        Ok(0)
                    }
                }
            },
        )
        .map_err(|e| registration_failed("__host_call", &e))?;

    linker
        .func_wrap(
            WAPC_MODULE,
            "__host_response_len",
            |caller: Caller<'_, GuestContext>| -> wasmtime::Result<i32> {
                to_guest_len(caller.data().host_response.as_ref().map_or(0, Vec::len))
            },
        )
        .map_err(|e| registration_failed("__host_response_len", &e))?;

    linker
        .func_wrap(
            WAPC_MODULE,
            "__host_response",
            |mut caller: Caller<'_, GuestContext>, ptr: i32| -> wasmtime::Result<()> {
                if let Some(response) = caller.data().host_response.clone() {
                    write_bytes(&mut caller, ptr, &response)?;
                }
                Ok(())
            },
        )
        .map_err(|e| registration_failed("__host_response", &e))?;

    linker
        .func_wrap(
            WAPC_MODULE,
            "__host_error_len",
            |caller: Caller<'_, GuestContext>| -> wasmtime::Result<i32> {
                to_guest_len(caller.data().host_error.as_ref().map_or(0, String::len))
            },
        )
        .map_err(|e| registration_failed("__host_error_len", &e))?;

    linker
        .func_wrap(
            WAPC_MODULE,
            "__host_error",
            |mut caller: Caller<'_, GuestContext>, ptr: i32| -> wasmtime::Result<()> {
                if let Some(message) = caller.data().host_error.clone() {
                    write_bytes(&mut caller, ptr, message.as_bytes())?;
                }
                Ok(())
            },
        )
        .map_err(|e| registration_failed("__host_error", &e))?;

    Ok(())
}

/// Register the `__console_log` import, emitting guest output via `tracing`.
pub fn register_console_log(linker: &mut Linker<GuestContext>) -> Result<(), RuntimeError> {
    linker
        .func_wrap(
            WAPC_MODULE,
            "__console_log",
            |mut caller: Caller<'_, GuestContext>, ptr: i32, len: i32| {
                match read_string(&mut caller, ptr, len) {
                    Ok(message) => {
                        let ctx = caller.data();
                        info!(
                            module = %ctx.module_name,
                            instance_id = %ctx.instance_id,
                            guest_log = true,
                            "{}",
                            message
                        );
                    }
                    Err(e) => warn!(error = %e, "Unreadable guest log message"),
                }
            },
        )
        .map_err(|e| registration_failed("__console_log", &e))?;

    Ok(())
}

fn registration_failed(name: &str, error: &wasmtime::Error) -> RuntimeError {
    RuntimeError::invalid_config(format!("Failed to register {name} function: {error}"))
}

/// Reinterpret a guest `i32` as an unsigned wasm32 offset.
#[allow(clippy::cast_sign_loss)]
fn guest_offset(value: i32) -> usize {
    value as u32 as usize
}

fn to_guest_len(len: usize) -> wasmtime::Result<i32> {
    i32::try_from(len).map_err(|_| wasmtime::Error::msg("buffer too large for guest"))
}

fn guest_memory(caller: &mut Caller<'_, GuestContext>) -> wasmtime::Result<Memory> {
    caller
        .get_export("memory")
        .and_then(Extern::into_memory)
        .ok_or_else(|| wasmtime::Error::msg("guest module does not export memory"))
}

fn read_bytes(caller: &mut Caller<'_, GuestContext>, ptr: i32, len: i32) -> wasmtime::Result<Vec<u8>> {
    let memory = guest_memory(caller)?;
    let mut buffer = vec![0u8; guest_offset(len)];
    memory
        .read(&*caller, guest_offset(ptr), &mut buffer)
        .map_err(|e| wasmtime::Error::msg(format!("guest memory read out of bounds: {e}")))?;
    Ok(buffer)
}

fn read_string(caller: &mut Caller<'_, GuestContext>, ptr: i32, len: i32) -> wasmtime::Result<String> {
    let bytes = read_bytes(caller, ptr, len)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn write_bytes(caller: &mut Caller<'_, GuestContext>, ptr: i32, bytes: &[u8]) -> wasmtime::Result<()> {
    let memory = guest_memory(caller)?;
    memory
        .write(&mut *caller, guest_offset(ptr), bytes)
        .map_err(|e| wasmtime::Error::msg(format!("guest memory write out of bounds: {e}")))
}
