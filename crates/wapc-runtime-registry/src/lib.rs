//! Module registry for wapc-runtime.
//!
//! This crate ties the pieces together:
//! - [`ModuleRegistry`]: Loads guest modules by name, owns their pools and
//!   routes their host calls into one shared handler
//! - [`LoadedModule`]: A loaded module, its instance pool and lifecycle scope
//!
//! # Example
//!
//! ```ignore
//! let router = Arc::new(CallbackRouter::new(RouterConfig::new()));
//! let registry = ModuleRegistry::from_config(&RuntimeConfig::default(), router)?;
//!
//! registry.load_module(ModuleLoadSpec::new("greeter", "greeter.wasm")).await?;
//! let output = registry.invoke("greeter", "greet", b"world").await?;
//!
//! registry.close_all();
//! ```

pub mod module;
pub mod registry;

pub use module::LoadedModule;
pub use registry::ModuleRegistry;
