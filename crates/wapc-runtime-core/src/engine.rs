//! Wasmtime engine configuration and creation.
//!
//! The [`WasmEngine`] is the foundation of the runtime. It is:
//! - Thread-safe and shared across all loaded modules
//! - Configured with an optional pooling allocator for fast instantiation
//! - Set up with fuel metering for per-invocation CPU limits
//! - Holding the shared [`Linker`] with the waPC and WASI imports

use std::sync::Arc;

use tracing::{info, instrument};
use wasmtime::{Config, Engine, InstanceAllocationStrategy, Linker, PoolingAllocationConfig};

use wapc_runtime_common::{EngineConfig, ExecutionConfig, RuntimeError};

use crate::linker;
use crate::module::{CompiledModule, WapcModule};
use crate::runtime::{GuestEngine, GuestModule, HostCallHandler};
use crate::store::GuestContext;

/// Thread-safe WebAssembly engine wrapper.
///
/// This struct wraps a Wasmtime [`Engine`] configured for pooled waPC
/// guests. The engine and its linker contain no per-module state and are
/// shared by every module it loads.
///
/// # Configuration
///
/// The engine is configured with:
/// - **Pooling Allocator**: Pre-allocates memory for instance slots
/// - **Fuel Metering**: Enables deterministic CPU limiting
/// - **Async Support**: Guest calls run as futures on the tokio runtime
///
/// # Example
///
/// ```ignore
/// use wapc_runtime_common::{EngineConfig, ExecutionConfig};
/// use wapc_runtime_core::WasmEngine;
///
/// let engine = WasmEngine::new(&EngineConfig::default(), &ExecutionConfig::default())?;
/// ```
#[derive(Clone)]
pub struct WasmEngine {
    engine: Arc<Engine>,
    linker: Arc<Linker<GuestContext>>,
    config: EngineConfig,
    execution: ExecutionConfig,
}

impl WasmEngine {
    /// Create a new WebAssembly engine with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The Wasmtime configuration is invalid
    /// - The pooling allocator cannot be initialized
    /// - The host imports cannot be registered
    pub fn new(config: &EngineConfig, execution: &ExecutionConfig) -> Result<Self, RuntimeError> {
        let mut wasmtime_config = Config::new();

        // Guest calls are awaited so pooled invocations do not block the executor
        wasmtime_config.async_support(true);

        // Enable fuel metering for deterministic CPU limiting
        wasmtime_config.consume_fuel(execution.fuel_metering);

        wasmtime_config.cranelift_opt_level(wasmtime::OptLevel::Speed);

        if config.pooling_allocator {
            let pooling_config = Self::create_pooling_config(config);

            wasmtime_config
                .allocation_strategy(InstanceAllocationStrategy::Pooling(pooling_config));

            info!(
                max_instances = config.max_instances,
                instance_memory_mb = config.instance_memory_mb,
                "Pooling allocator enabled"
            );
        }

        let engine = Engine::new(&wasmtime_config).map_err(|e| {
            RuntimeError::invalid_config(format!("Failed to create Wasmtime engine: {e}"))
        })?;

        let mut linker = Linker::new(&engine);
        linker::register_all(&mut linker)?;

        info!("Wasmtime engine initialized");

        Ok(Self {
            engine: Arc::new(engine),
            linker: Arc::new(linker),
            config: config.clone(),
            execution: execution.clone(),
        })
    }

    /// Create pooling allocation configuration.
    fn create_pooling_config(config: &EngineConfig) -> PoolingAllocationConfig {
        let mut pooling = PoolingAllocationConfig::default();

        pooling.total_core_instances(config.max_instances);
        pooling.total_memories(config.max_instances);
        pooling.total_tables(config.max_instances);
        pooling.total_stacks(config.max_instances);

        // Maximum size of a single memory in bytes
        let max_memory_bytes = (config.instance_memory_mb as usize) * 1024 * 1024;
        pooling.max_memory_size(max_memory_bytes);

        pooling
    }

    /// Get a reference to the inner Wasmtime engine.
    pub fn inner(&self) -> &Engine {
        &self.engine
    }

    /// Get the shared linker with all host imports registered.
    pub fn linker(&self) -> &Arc<Linker<GuestContext>> {
        &self.linker
    }

    /// Get the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Get the execution configuration applied to every instance.
    pub fn execution(&self) -> &ExecutionConfig {
        &self.execution
    }

    /// Check if the pooling allocator is enabled.
    pub fn is_pooling_enabled(&self) -> bool {
        self.config.pooling_allocator
    }

    /// Compile module bytes, accepting either binary Wasm or WAT text.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are neither valid Wasm nor valid WAT.
    pub fn compile(&self, bytes: &[u8]) -> Result<CompiledModule, RuntimeError> {
        if bytes.starts_with(b"\0asm") {
            return CompiledModule::from_bytes(&self.engine, bytes);
        }

        let wat = std::str::from_utf8(bytes).map_err(|_| {
            RuntimeError::compilation_failed("Invalid Wasm: bad magic number and not UTF-8 text")
        })?;
        CompiledModule::from_wat(&self.engine, wat)
    }
}

impl GuestEngine for WasmEngine {
    #[instrument(skip(self, bytes, handler), fields(bytes_len = bytes.len()))]
    fn load(
        &self,
        name: &str,
        bytes: &[u8],
        handler: Arc<dyn HostCallHandler>,
    ) -> Result<Arc<dyn GuestModule>, RuntimeError> {
        let compiled = self.compile(bytes)?;
        let module = WapcModule::new(name, compiled, self.clone(), handler);

        info!(module = %name, "Module loaded");
        Ok(Arc::new(module))
    }
}

impl std::fmt::Debug for WasmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmEngine")
            .field("pooling_allocator", &self.config.pooling_allocator)
            .field("max_instances", &self.config.max_instances)
            .field("fuel_metering", &self.execution.fuel_metering)
            .finish_non_exhaustive()
    }
}
