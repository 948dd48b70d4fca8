//! Configuration structures for the wapc-runtime.
//!
//! This module defines configuration options for various components:
//! - [`RuntimeConfig`]: Top-level configuration containing all settings
//! - [`EngineConfig`]: Wasmtime engine settings (pooling allocator)
//! - [`ExecutionConfig`]: Per-invocation limits (fuel) and guest stdio
//! - [`PoolConfig`]: Instance pool sizing and acquire timeout
//! - [`ModuleLoadSpec`]: A single guest module to load

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default number of instances kept per loaded module.
pub const DEFAULT_POOL_SIZE: usize = 100;

/// Default time to wait for a pooled instance, in milliseconds.
pub const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 5_000;

/// Top-level runtime configuration.
///
/// This structure contains all configuration options for the wapc-runtime.
/// It can be loaded from files (TOML, JSON).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Wasmtime engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Per-invocation execution configuration.
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Instance pool configuration.
    #[serde(default)]
    pub pool: PoolConfig,
}

/// Wasmtime engine configuration.
///
/// These settings affect the global Wasmtime engine behavior,
/// including the memory allocation strategy for instances.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Enable pooling allocator for high-performance instance creation.
    ///
    /// When enabled, memory is pre-allocated for a pool of instance slots.
    /// The slot count must cover the sum of all module pool sizes.
    #[serde(default = "defaults::pooling_allocator")]
    pub pooling_allocator: bool,

    /// Maximum concurrent instances across all modules.
    ///
    /// Only effective when `pooling_allocator` is enabled.
    #[serde(default = "defaults::max_instances")]
    pub max_instances: u32,

    /// Memory per instance slot in megabytes.
    #[serde(default = "defaults::instance_memory_mb")]
    pub instance_memory_mb: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pooling_allocator: defaults::pooling_allocator(),
            max_instances: defaults::max_instances(),
            instance_memory_mb: defaults::instance_memory_mb(),
        }
    }
}

/// Per-invocation execution configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionConfig {
    /// Maximum fuel (CPU instructions) per guest call.
    ///
    /// Pooled instances are refuelled before every invocation, so the
    /// limit applies to each call rather than to the instance lifetime.
    #[serde(default = "defaults::max_fuel")]
    pub max_fuel: u64,

    /// Enable fuel metering.
    #[serde(default = "defaults::fuel_metering")]
    pub fuel_metering: bool,

    /// Forward guest stdout/stderr to the host process.
    #[serde(default = "defaults::inherit_stdio")]
    pub inherit_stdio: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_fuel: defaults::max_fuel(),
            fuel_metering: defaults::fuel_metering(),
            inherit_stdio: defaults::inherit_stdio(),
        }
    }
}

/// Instance pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Pool size used when a module load does not specify one.
    #[serde(default = "defaults::pool_size")]
    pub default_pool_size: usize,

    /// How long an invocation waits for a free instance, in milliseconds.
    #[serde(default = "defaults::acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            default_pool_size: defaults::pool_size(),
            acquire_timeout_ms: defaults::acquire_timeout_ms(),
        }
    }
}

impl PoolConfig {
    /// Get the acquire timeout as a `Duration`.
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// A guest module to load.
///
/// `name` is the lookup key used for invocations; `path` points at the
/// `.wasm` (or `.wat`) file. A `pool_size` of zero selects the default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ModuleLoadSpec {
    /// Name the module is registered under.
    pub name: String,

    /// Path to the module file.
    pub path: String,

    /// Number of pooled instances for this module.
    #[serde(default)]
    pub pool_size: usize,
}

impl ModuleLoadSpec {
    /// Create a load spec using the default pool size.
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            pool_size: 0,
        }
    }

    /// Set an explicit pool size.
    #[must_use]
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Resolve the effective pool size, falling back to `default` when unset.
    pub fn resolved_pool_size(&self, default: usize) -> usize {
        if self.pool_size > 0 {
            self.pool_size
        } else {
            default
        }
    }
}

/// Default value functions for serde.
mod defaults {
    pub const fn pooling_allocator() -> bool {
        true
    }

    pub const fn max_instances() -> u32 {
        1000
    }

    pub const fn instance_memory_mb() -> u32 {
        64
    }

    pub const fn max_fuel() -> u64 {
        10_000_000
    }

    pub const fn fuel_metering() -> bool {
        true
    }

    pub const fn inherit_stdio() -> bool {
        true
    }

    pub const fn pool_size() -> usize {
        super::DEFAULT_POOL_SIZE
    }

    pub const fn acquire_timeout_ms() -> u64 {
        super::DEFAULT_ACQUIRE_TIMEOUT_MS
    }
}
