//! WebAssembly module compilation and the waPC module wrapper.
//!
//! - [`CompiledModule`]: A validated, compiled Wasmtime [`Module`]
//! - [`WapcModule`]: A compiled module bound to its host-callback handler,
//!   able to create initialized [`WapcInstance`]s for the instance pool

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, info, instrument};
use wasmtime::{Engine, Module};

use wapc_runtime_common::RuntimeError;

use crate::WasmEngine;
use crate::instance::WapcInstance;
use crate::runtime::{GuestInstance, GuestModule, HostCallHandler};

/// A compiled WebAssembly module.
///
/// # Thread Safety
///
/// `CompiledModule` is cheap to clone and can be shared across instances.
#[derive(Clone)]
pub struct CompiledModule {
    /// The compiled Wasmtime module.
    inner: Module,

    /// Hash of the original module bytes.
    content_hash: String,

    /// When this module was compiled.
    compiled_at: Instant,
}

impl CompiledModule {
    /// Compile a core module from WebAssembly bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the header is invalid or compilation fails.
    #[instrument(skip(engine, bytes), fields(bytes_len = bytes.len()))]
    pub fn from_bytes(engine: &Engine, bytes: &[u8]) -> Result<Self, RuntimeError> {
        let start = Instant::now();

        Self::validate_wasm_header(bytes)?;

        let module = Module::new(engine, bytes).map_err(|e| {
            RuntimeError::compilation_failed(format!("Core module compilation failed: {e}"))
        })?;

        let content_hash = compute_hash(bytes);

        info!(
            content_hash = %content_hash,
            duration_ms = start.elapsed().as_millis(),
            "Core module compiled"
        );

        Ok(Self {
            inner: module,
            content_hash,
            compiled_at: Instant::now(),
        })
    }

    /// Compile a core module from WAT (WebAssembly Text Format).
    ///
    /// # Errors
    ///
    /// Returns an error if compilation fails.
    #[instrument(skip(engine, wat))]
    pub fn from_wat(engine: &Engine, wat: &str) -> Result<Self, RuntimeError> {
        let start = Instant::now();

        let module = Module::new(engine, wat).map_err(|e| {
            RuntimeError::compilation_failed(format!("WAT compilation failed: {e}"))
        })?;

        let content_hash = compute_hash(wat.as_bytes());

        info!(
            content_hash = %content_hash,
            duration_ms = start.elapsed().as_millis(),
            "WAT module compiled"
        );

        Ok(Self {
            inner: module,
            content_hash,
            compiled_at: Instant::now(),
        })
    }

    /// Get the inner Wasmtime module.
    pub fn inner(&self) -> &Module {
        &self.inner
    }

    /// Get the content hash of the original module bytes.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// Get when this module was compiled.
    pub fn compiled_at(&self) -> Instant {
        self.compiled_at
    }

    /// Returns `true` if the module exports a function named `name`.
    pub fn exports_function(&self, name: &str) -> bool {
        self.inner
            .get_export(name)
            .is_some_and(|ty| ty.func().is_some())
    }

    /// Validate WebAssembly header (magic number).
    fn validate_wasm_header(bytes: &[u8]) -> Result<(), RuntimeError> {
        if bytes.len() < 8 {
            return Err(RuntimeError::compilation_failed(
                "Invalid Wasm: file too small",
            ));
        }

        // Check magic number: \0asm
        if &bytes[0..4] != b"\0asm" {
            return Err(RuntimeError::compilation_failed(
                "Invalid Wasm: bad magic number",
            ));
        }

        Ok(())
    }
}

impl std::fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledModule")
            .field("content_hash", &self.content_hash)
            .finish_non_exhaustive()
    }
}

/// A compiled waPC guest bound to its host-callback handler.
///
/// Every instance created from this module shares the handler, so all
/// `__host_call`s from every pooled instance reach the same router.
pub struct WapcModule {
    name: String,
    compiled: CompiledModule,
    engine: WasmEngine,
    handler: Arc<dyn HostCallHandler>,
    closed: AtomicBool,
}

impl WapcModule {
    /// Bind a compiled module to `handler`.
    pub fn new(
        name: impl Into<String>,
        compiled: CompiledModule,
        engine: WasmEngine,
        handler: Arc<dyn HostCallHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            compiled,
            engine,
            handler,
            closed: AtomicBool::new(false),
        }
    }

    /// Get the compiled module.
    pub fn compiled(&self) -> &CompiledModule {
        &self.compiled
    }

    /// Returns `true` once [`GuestModule::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl GuestModule for WapcModule {
    fn name(&self) -> &str {
        &self.name
    }

    async fn instantiate(&self) -> Result<Box<dyn GuestInstance>, RuntimeError> {
        if self.is_closed() {
            return Err(RuntimeError::instantiation(format!(
                "module '{}' is closed",
                self.name
            )));
        }

        let instance = WapcInstance::new(
            &self.engine,
            &self.compiled,
            &self.name,
            Arc::clone(&self.handler),
        )
        .await?;

        Ok(Box::new(instance))
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(module = %self.name, "Module closed");
        }
    }
}

impl std::fmt::Debug for WapcModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WapcModule")
            .field("name", &self.name)
            .field("compiled", &self.compiled)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Compute a hash of the given bytes.
fn compute_hash(bytes: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
