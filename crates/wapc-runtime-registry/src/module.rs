//! A guest module loaded into the registry.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use wapc_runtime_common::RuntimeError;
use wapc_runtime_core::{GuestModule, InstancePool};

/// A loaded guest module together with its instance pool.
///
/// Each loaded module owns a lifecycle scope that host calls made by its
/// instances observe. There are two ways to shut a module down:
///
/// - [`LoadedModule::close`] cancels the scope immediately, so running
///   invocations see their host calls fail with `Canceled`.
/// - [`LoadedModule::retire`] refuses new invocations but lets running ones
///   finish; the scope is canceled once the last handle is dropped.
pub struct LoadedModule {
    name: String,
    source_path: PathBuf,
    module: Arc<dyn GuestModule>,
    pool: InstancePool,
    scope: CancellationToken,
    closed: AtomicBool,
    loaded_at: Instant,
}

impl LoadedModule {
    /// Bundle a loaded module with its pool and lifecycle scope.
    pub fn new(
        name: impl Into<String>,
        source_path: impl Into<PathBuf>,
        module: Arc<dyn GuestModule>,
        pool: InstancePool,
        scope: CancellationToken,
    ) -> Self {
        Self {
            name: name.into(),
            source_path: source_path.into(),
            module,
            pool,
            scope,
            closed: AtomicBool::new(false),
            loaded_at: Instant::now(),
        }
    }

    /// Invoke `function` on a pooled instance.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Canceled`] once the module has been closed or
    /// retired, a pool error if no instance is free within the acquire
    /// timeout, or the guest's own error.
    pub async fn run(&self, function: &str, payload: &[u8]) -> Result<Vec<u8>, RuntimeError> {
        if self.is_closed() {
            return Err(RuntimeError::Canceled);
        }

        let start = Instant::now();
        let result = self.pool.run(&self.scope, function, payload).await;
        debug!(
            module = %self.name,
            function,
            duration_us = start.elapsed().as_micros(),
            success = result.is_ok(),
            "Module invocation finished"
        );
        result
    }

    /// Cancel the lifecycle scope and close the pool and the module.
    pub fn close(&self) {
        self.scope.cancel();
        if self.shut_down() {
            info!(module = %self.name, "Module closed");
        }
    }

    /// Close the pool and the module without canceling running invocations.
    ///
    /// Borrowed instances are discarded when they come back. The lifecycle
    /// scope stays live until the module is dropped.
    pub fn retire(&self) {
        if self.shut_down() {
            info!(
                module = %self.name,
                in_flight = self.pool.capacity(),
                "Module retired"
            );
        }
    }

    fn shut_down(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.pool.close();
        self.module.close();
        true
    }

    /// Name the module is registered under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path the module bytes were read from.
    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    /// The engine-level module.
    pub fn module(&self) -> &Arc<dyn GuestModule> {
        &self.module
    }

    /// The module's instance pool.
    pub fn pool(&self) -> &InstancePool {
        &self.pool
    }

    /// The module's lifecycle scope.
    pub fn scope(&self) -> &CancellationToken {
        &self.scope
    }

    /// Time since the module was loaded.
    pub fn uptime(&self) -> Duration {
        self.loaded_at.elapsed()
    }

    /// When the module was loaded.
    pub fn loaded_at(&self) -> Instant {
        self.loaded_at
    }

    /// Returns `true` once the module has been closed or retired, or its
    /// scope has been canceled.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.scope.is_cancelled()
    }
}

impl Drop for LoadedModule {
    fn drop(&mut self) {
        self.scope.cancel();
    }
}

impl std::fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModule")
            .field("name", &self.name)
            .field("source_path", &self.source_path)
            .field("pool", &self.pool)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
