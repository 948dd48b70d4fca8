//! Per-instance execution context and store management.
//!
//! This module provides:
//! - [`GuestContext`]: State of one pooled instance, reachable from host imports
//! - [`InvocationMetrics`]: Performance metrics for the most recent guest call
//! - [`create_store`]: Store construction with fuel and WASI configured

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use wasmtime::Store;
use wasmtime_wasi::WasiCtxBuilder;
use wasmtime_wasi::preview1::WasiP1Ctx;

use wapc_runtime_common::{ExecutionConfig, RuntimeError};

use crate::runtime::HostCallHandler;

/// Execution context of one instance.
///
/// Unlike a per-request context, a `GuestContext` lives as long as the
/// pooled instance that owns it. The waPC buffers are reset at the start
/// of every invocation.
pub struct GuestContext {
    /// WASI preview1 context.
    wasi: WasiP1Ctx,

    /// Name of the module this instance belongs to.
    pub module_name: String,

    /// Unique instance identifier for tracing.
    pub instance_id: String,

    /// Handler receiving every `__host_call`.
    handler: Arc<dyn HostCallHandler>,

    /// Lifecycle scope of the running invocation.
    scope: CancellationToken,

    /// Operation and payload handed to the guest by `__guest_request`.
    pub(crate) request: Option<GuestRequest>,

    /// Response set by the guest through `__guest_response`.
    pub(crate) guest_response: Option<Vec<u8>>,

    /// Error set by the guest through `__guest_error`.
    pub(crate) guest_error: Option<String>,

    /// Result of the last successful host call.
    pub(crate) host_response: Option<Vec<u8>>,

    /// Error of the last failed host call.
    pub(crate) host_error: Option<String>,

    /// Metrics of the most recent invocation.
    pub metrics: InvocationMetrics,

    start_time: Instant,
}

/// The operation and payload of the running invocation.
#[derive(Debug, Clone)]
pub(crate) struct GuestRequest {
    pub operation: String,
    pub payload: Vec<u8>,
}

/// What the guest left behind after `__guest_call` returned.
#[derive(Debug, Default)]
pub(crate) struct GuestOutcome {
    pub response: Option<Vec<u8>>,
    pub error: Option<String>,
}

/// Invocation performance metrics.
#[derive(Debug, Clone, Default)]
pub struct InvocationMetrics {
    /// Fuel consumed during the invocation.
    pub fuel_consumed: u64,

    /// Host calls issued by the guest.
    pub host_calls: u64,

    /// Total invocation duration.
    pub duration: Option<Duration>,

    /// Invocations served by this instance.
    pub invocations: u64,
}

impl GuestContext {
    /// Create a new context for an instance of `module_name`.
    pub fn new(
        module_name: impl Into<String>,
        handler: Arc<dyn HostCallHandler>,
        config: &ExecutionConfig,
    ) -> Self {
        let mut builder = WasiCtxBuilder::new();
        if config.inherit_stdio {
            builder.inherit_stdout().inherit_stderr();
        }

        Self {
            wasi: builder.build_p1(),
            module_name: module_name.into(),
            instance_id: uuid::Uuid::new_v4().to_string(),
            handler,
            scope: CancellationToken::new(),
            request: None,
            guest_response: None,
            guest_error: None,
            host_response: None,
            host_error: None,
            metrics: InvocationMetrics::default(),
            start_time: Instant::now(),
        }
    }

    /// WASI context accessor used by the preview1 imports.
    pub fn wasi(&mut self) -> &mut WasiP1Ctx {
        &mut self.wasi
    }

    /// The host-callback handler and the running invocation's scope.
    pub(crate) fn host_call_target(&self) -> (Arc<dyn HostCallHandler>, CancellationToken) {
        (Arc::clone(&self.handler), self.scope.clone())
    }

    /// Reset the waPC buffers for a new invocation.
    pub(crate) fn begin_invocation(
        &mut self,
        scope: CancellationToken,
        operation: &str,
        payload: &[u8],
    ) {
        self.scope = scope;
        self.request = Some(GuestRequest {
            operation: operation.to_string(),
            payload: payload.to_vec(),
        });
        self.guest_response = None;
        self.guest_error = None;
        self.host_response = None;
        self.host_error = None;
        self.metrics.host_calls = 0;
        self.metrics.fuel_consumed = 0;
        self.start_time = Instant::now();
    }

    /// Collect the guest's answer and clear the invocation state.
    pub(crate) fn finish_invocation(&mut self) -> GuestOutcome {
        self.request = None;
        self.host_response = None;
        self.host_error = None;
        self.metrics.duration = Some(self.start_time.elapsed());
        self.metrics.invocations += 1;

        GuestOutcome {
            response: self.guest_response.take(),
            error: self.guest_error.take(),
        }
    }

    /// Get elapsed time since the current invocation started.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

/// Create a new Wasmtime store with the given configuration.
///
/// # Errors
///
/// Returns an error if fuel cannot be set on the store.
pub fn create_store(
    engine: &wasmtime::Engine,
    config: &ExecutionConfig,
    context: GuestContext,
) -> Result<Store<GuestContext>, RuntimeError> {
    let mut store = Store::new(engine, context);
    refuel(&mut store, config)?;
    Ok(store)
}

/// Reset the fuel tank of `store` to the configured limit.
///
/// # Errors
///
/// Returns an error if fuel metering is enabled but the engine does not support it.
pub fn refuel(store: &mut Store<GuestContext>, config: &ExecutionConfig) -> Result<(), RuntimeError> {
    if config.fuel_metering {
        store
            .set_fuel(config.max_fuel)
            .map_err(|e| RuntimeError::invalid_config(format!("Failed to set fuel: {e}")))?;
    }
    Ok(())
}

/// Get remaining fuel from a store.
pub fn get_remaining_fuel(store: &Store<GuestContext>) -> Option<u64> {
    store.get_fuel().ok()
}

/// Calculate fuel consumed.
pub fn calculate_fuel_consumed(initial_fuel: u64, store: &Store<GuestContext>) -> u64 {
    let remaining = get_remaining_fuel(store).unwrap_or(0);
    initial_fuel.saturating_sub(remaining)
}
