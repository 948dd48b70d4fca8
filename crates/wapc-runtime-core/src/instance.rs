//! waPC instance lifecycle management.
//!
//! This module provides [`WapcInstance`], one pooled execution context of a
//! waPC guest:
//!
//! 1. Instantiate the module with a fresh store and the shared linker
//! 2. Run the guest initializers (`_initialize`, `_start`, `wapc_init`)
//! 3. Serve any number of `__guest_call` invocations
//! 4. Report itself unusable after a trap so the pool discards it

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use wasmtime::{Instance, Store, Trap, TypedFunc};

use wapc_runtime_common::{ExecutionConfig, RuntimeError};

use crate::module::CompiledModule;
use crate::runtime::{GuestInstance, HostCallHandler};
use crate::store::{GuestContext, calculate_fuel_consumed, create_store, get_remaining_fuel, refuel};
use crate::WasmEngine;

/// Export every waPC guest must provide.
pub const GUEST_CALL: &str = "__guest_call";

/// Initializers run, in order, when present.
const INITIALIZERS: [&str; 3] = ["_initialize", "_start", "wapc_init"];

/// A live, initialized waPC guest instance.
pub struct WapcInstance {
    store: Store<GuestContext>,
    guest_call: TypedFunc<(i32, i32), i32>,
    execution: ExecutionConfig,
    poisoned: bool,
    closed: bool,
}

impl WapcInstance {
    /// Instantiate `module` and run its initializers.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Instantiation fails (missing imports, start trap)
    /// - An initializer traps
    /// - The guest does not export `__guest_call`
    #[instrument(skip_all, fields(module = %module_name))]
    pub async fn new(
        engine: &WasmEngine,
        module: &CompiledModule,
        module_name: &str,
        handler: Arc<dyn HostCallHandler>,
    ) -> Result<Self, RuntimeError> {
        let execution = engine.execution().clone();
        let context = GuestContext::new(module_name, handler, &execution);
        let mut store = create_store(engine.inner(), &execution, context)?;

        let instance = engine
            .linker()
            .instantiate_async(&mut store, module.inner())
            .await
            .map_err(|e| RuntimeError::instantiation(format!("Instantiation failed: {e}")))?;

        for name in INITIALIZERS {
            if module.exports_function(name) {
                run_initializer(&mut store, &instance, name).await?;
            }
        }

        let guest_call = instance
            .get_typed_func::<(i32, i32), i32>(&mut store, GUEST_CALL)
            .map_err(|_| {
                RuntimeError::instantiation(format!(
                    "Guest does not export '{GUEST_CALL}(i32, i32) -> i32'"
                ))
            })?;

        debug!(instance_id = %store.data().instance_id, "Instance ready");

        Ok(Self {
            store,
            guest_call,
            execution,
            poisoned: false,
            closed: false,
        })
    }

    /// Get the instance context.
    pub fn context(&self) -> &GuestContext {
        self.store.data()
    }

    /// Returns `true` if a previous invocation trapped.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }
}

#[async_trait]
impl GuestInstance for WapcInstance {
    #[instrument(
        skip(self, scope, payload),
        fields(module = %self.store.data().module_name, payload_len = payload.len())
    )]
    async fn invoke(
        &mut self,
        scope: &CancellationToken,
        operation: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, RuntimeError> {
        if scope.is_cancelled() {
            return Err(RuntimeError::Canceled);
        }
        if self.closed || self.poisoned {
            return Err(RuntimeError::instantiation("instance is no longer usable"));
        }

        let op_len = i32::try_from(operation.len())
            .map_err(|_| RuntimeError::invalid_config("operation name too long"))?;
        let payload_len = i32::try_from(payload.len())
            .map_err(|_| RuntimeError::invalid_config("payload too large"))?;

        refuel(&mut self.store, &self.execution)?;
        let initial_fuel = get_remaining_fuel(&self.store).unwrap_or(0);
        let start = Instant::now();

        self.store
            .data_mut()
            .begin_invocation(scope.clone(), operation, payload);

        let result = self
            .guest_call
            .call_async(&mut self.store, (op_len, payload_len))
            .await;

        let fuel_consumed = calculate_fuel_consumed(initial_fuel, &self.store);
        let ctx = self.store.data_mut();
        ctx.metrics.fuel_consumed = fuel_consumed;
        let host_calls = ctx.metrics.host_calls;
        let outcome = ctx.finish_invocation();
        let duration = start.elapsed();

        match result {
            Ok(1) => {
                debug!(
                    duration_us = duration.as_micros(),
                    fuel_consumed, host_calls, "Guest call succeeded"
                );
                Ok(outcome.response.unwrap_or_default())
            }
            Ok(_) => {
                let message = outcome
                    .error
                    .unwrap_or_else(|| format!("call to {operation:?} was unsuccessful"));
                debug!(
                    duration_us = duration.as_micros(),
                    error = %message,
                    "Guest call returned an error"
                );
                Err(RuntimeError::guest_call(operation, message))
            }
            Err(trap) => {
                // Linear memory may be half-written; never hand this instance out again
                self.poisoned = true;

                if is_out_of_fuel(&trap) {
                    warn!(
                        duration_ms = duration.as_millis(),
                        fuel_consumed, "Guest call terminated: fuel exhausted"
                    );
                    return Err(RuntimeError::FuelExhausted);
                }

                let (message, code) = extract_trap_info(&trap);
                error!(
                    duration_ms = duration.as_millis(),
                    trap_message = %message,
                    trap_code = ?code,
                    "Guest call trapped"
                );
                Err(RuntimeError::trap(message))
            }
        }
    }

    fn is_reusable(&self) -> bool {
        !self.poisoned && !self.closed
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            debug!(instance_id = %self.store.data().instance_id, "Instance closed");
        }
    }
}

impl std::fmt::Debug for WapcInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ctx = self.store.data();
        f.debug_struct("WapcInstance")
            .field("module", &ctx.module_name)
            .field("instance_id", &ctx.instance_id)
            .field("poisoned", &self.poisoned)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

/// Call a `() -> ()` initializer export. A WASI `proc_exit(0)` counts as success.
async fn run_initializer(
    store: &mut Store<GuestContext>,
    instance: &Instance,
    name: &str,
) -> Result<(), RuntimeError> {
    let func = instance
        .get_typed_func::<(), ()>(&mut *store, name)
        .map_err(|e| RuntimeError::instantiation(format!("Initializer '{name}' has wrong type: {e}")))?;

    match func.call_async(&mut *store, ()).await {
        Ok(()) => {
            info!(initializer = name, "Guest initializer completed");
            Ok(())
        }
        Err(e) if is_clean_exit(&e) => Ok(()),
        Err(e) => Err(RuntimeError::instantiation(format!(
            "Initializer '{name}' failed: {e}"
        ))),
    }
}

/// Extract human-readable trap information.
fn extract_trap_info(error: &wasmtime::Error) -> (String, Option<String>) {
    let message = error.to_string();

    let code = error.downcast_ref::<Trap>().map(|trap| format!("{trap:?}"));

    (message, code)
}

/// Check if an error is due to fuel exhaustion.
fn is_out_of_fuel(error: &wasmtime::Error) -> bool {
    error
        .downcast_ref::<Trap>()
        .is_some_and(|trap| *trap == Trap::OutOfFuel)
}

/// Check if an error is a WASI exit with status zero.
fn is_clean_exit(error: &wasmtime::Error) -> bool {
    error
        .downcast_ref::<wasmtime_wasi::I32Exit>()
        .is_some_and(|exit| exit.0 == 0)
}
