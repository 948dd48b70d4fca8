//! Common types, errors, and configuration for wapc-runtime.
//!
//! This crate provides shared functionality used across the wapc-runtime workspace:
//! - Error types using `thiserror` for the router, the instance pool and the runtime
//! - Configuration structures for engine, execution and pool settings
//! - The TOML configuration file format used by the CLI

pub mod config;
pub mod config_file;
pub mod error;

pub use config::{EngineConfig, ExecutionConfig, ModuleLoadSpec, PoolConfig, RuntimeConfig};
pub use config_file::{ConfigFile, ConfigFileError, PolicyConfig};
pub use error::{CallbackError, HandlerError, HookRejection, PoolError, RuntimeError};
