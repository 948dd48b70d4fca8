//! Named registry of loaded guest modules.
//!
//! This module provides [`ModuleRegistry`], which maps a logical module
//! name to a [`LoadedModule`] and wires every module's host calls into one
//! shared [`HostCallHandler`].
//!
//! # Lifecycle scopes
//!
//! The registry owns a root [`CancellationToken`]. Every loaded module gets
//! a child token, so closing one module never affects its siblings while
//! [`ModuleRegistry::close_all`] cancels them all at once.
//!
//! # Re-loading a name
//!
//! Loading a name that is already present replaces the entry. The new
//! module is fully loaded before the swap and the old one is retired right
//! after it: new invocations through old handles fail with `Canceled`,
//! while invocations already running finish with a live scope and their
//! instances are discarded on release. The old scope is canceled once the
//! last running invocation lets go of the module.
//!
//! After [`ModuleRegistry::close_all`] the registry refuses further loads.

use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use wapc_runtime_common::{ModuleLoadSpec, PoolConfig, RuntimeConfig, RuntimeError};
use wapc_runtime_core::{GuestEngine, HostCallHandler, InstancePool, WasmEngine};

use crate::module::LoadedModule;

/// Registry of loaded guest modules.
///
/// # Limitations
///
/// [`ModuleRegistry::close_all`] is meant to run once at shutdown; it is
/// not guarded against [`ModuleRegistry::load_module`] calls racing with it.
pub struct ModuleRegistry {
    engine: Arc<dyn GuestEngine>,
    handler: Arc<dyn HostCallHandler>,
    pool_config: PoolConfig,
    modules: DashMap<String, Arc<LoadedModule>>,
    root: CancellationToken,
}

impl ModuleRegistry {
    /// Create an empty registry over `engine`, routing host calls to `handler`.
    pub fn new(
        engine: Arc<dyn GuestEngine>,
        handler: Arc<dyn HostCallHandler>,
        pool_config: PoolConfig,
    ) -> Self {
        Self {
            engine,
            handler,
            pool_config,
            modules: DashMap::new(),
            root: CancellationToken::new(),
        }
    }

    /// Create a registry backed by a Wasmtime engine built from `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot be created.
    pub fn from_config(
        config: &RuntimeConfig,
        handler: Arc<dyn HostCallHandler>,
    ) -> Result<Self, RuntimeError> {
        let engine = WasmEngine::new(&config.engine, &config.execution)?;
        Ok(Self::new(Arc::new(engine), handler, config.pool.clone()))
    }

    /// Load a module from disk and make it invocable under `spec.name`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InvalidModuleConfig`] for an empty name or
    /// path and [`RuntimeError::RegistryClosed`] after
    /// [`ModuleRegistry::close_all`]. Read, compile and instantiation failures
    /// are returned as [`RuntimeError::ModuleLoad`] naming the module and its
    /// path; the registry is left unchanged.
    #[instrument(skip(self, spec), fields(module = %spec.name, path = %spec.path))]
    pub async fn load_module(
        &self,
        spec: ModuleLoadSpec,
    ) -> Result<Arc<LoadedModule>, RuntimeError> {
        if spec.name.is_empty() {
            return Err(RuntimeError::invalid_module_config("module name cannot be empty"));
        }
        if spec.path.is_empty() {
            return Err(RuntimeError::invalid_module_config("module path cannot be empty"));
        }
        if self.is_closed() {
            return Err(RuntimeError::RegistryClosed);
        }

        let pool_size = spec.resolved_pool_size(self.pool_config.default_pool_size);
        let loaded = self
            .build(&spec.name, Path::new(&spec.path), pool_size)
            .await
            .map_err(|e| RuntimeError::module_load(&spec.name, &spec.path, e))?;
        if self.is_closed() {
            loaded.close();
            return Err(RuntimeError::RegistryClosed);
        }
        let loaded = Arc::new(loaded);

        if let Some(previous) = self.modules.insert(spec.name.clone(), Arc::clone(&loaded)) {
            previous.retire();
            info!(pool_size, "Module replaced");
        } else {
            info!(pool_size, "Module loaded");
        }

        Ok(loaded)
    }

    async fn build(
        &self,
        name: &str,
        path: &Path,
        pool_size: usize,
    ) -> Result<LoadedModule, RuntimeError> {
        let bytes = tokio::fs::read(path).await?;
        let module = self.engine.load(name, &bytes, Arc::clone(&self.handler))?;

        let pool = match InstancePool::new(
            module.as_ref(),
            pool_size,
            self.pool_config.acquire_timeout(),
        )
        .await
        {
            Ok(pool) => pool,
            Err(e) => {
                module.close();
                return Err(e);
            }
        };

        Ok(LoadedModule::new(
            name,
            path,
            module,
            pool,
            self.root.child_token(),
        ))
    }

    /// Get a loaded module.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::ModuleNotFound`] if no module has that name.
    pub fn get_module(&self, name: &str) -> Result<Arc<LoadedModule>, RuntimeError> {
        self.modules
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| RuntimeError::module_not_found(name))
    }

    /// Invoke `function` of the module registered as `name`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::ModuleNotFound`] for an unknown module,
    /// otherwise the result of [`LoadedModule::run`].
    pub async fn invoke(
        &self,
        name: &str,
        function: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, RuntimeError> {
        let module = self.get_module(name)?;
        module.run(function, payload).await
    }

    /// Remove and close one module.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::ModuleNotFound`] if no module has that name.
    pub fn unload_module(&self, name: &str) -> Result<(), RuntimeError> {
        let (_, module) = self
            .modules
            .remove(name)
            .ok_or_else(|| RuntimeError::module_not_found(name))?;
        module.close();
        Ok(())
    }

    /// Names of all loaded modules, sorted.
    pub fn list_modules(&self) -> Vec<String> {
        let mut names: Vec<String> = self.modules.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    /// Number of loaded modules.
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Returns `true` if no module is loaded.
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Pool settings applied to modules without an explicit pool size.
    pub fn pool_config(&self) -> &PoolConfig {
        &self.pool_config
    }

    /// The handler every module's host calls are routed to.
    pub fn handler(&self) -> &Arc<dyn HostCallHandler> {
        &self.handler
    }

    /// Returns `true` once [`ModuleRegistry::close_all`] has been called.
    pub fn is_closed(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Cancel every module scope and close every pool and module.
    ///
    /// Later calls to [`ModuleRegistry::load_module`] fail with
    /// [`RuntimeError::RegistryClosed`].
    pub fn close_all(&self) {
        self.root.cancel();

        let names: Vec<String> = self.modules.iter().map(|entry| entry.key().clone()).collect();
        let mut closed = 0usize;
        for name in names {
            if let Some((_, module)) = self.modules.remove(&name) {
                module.close();
                closed += 1;
            }
        }

        if self.modules.is_empty() {
            info!(closed, "Module registry closed");
        } else {
            warn!(
                closed,
                remaining = self.modules.len(),
                "Modules were loaded while the registry was closing"
            );
        }
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules_count", &self.modules.len())
            .field("pool_config", &self.pool_config)
            .finish_non_exhaustive()
    }
}
