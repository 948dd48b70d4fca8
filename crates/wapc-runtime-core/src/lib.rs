//! Core Wasmtime runtime for wapc-runtime.
//!
//! This crate provides the execution side of the waPC host:
//! - [`runtime`]: Engine seam traits ([`GuestEngine`], [`GuestModule`],
//!   [`GuestInstance`], [`HostCallHandler`])
//! - [`WasmEngine`]: Wasmtime engine with fuel metering and pooling allocator
//! - [`CompiledModule`] / [`WapcModule`]: Compiled guest modules
//! - [`WapcInstance`]: One initialized guest speaking the waPC protocol
//! - [`InstancePool`]: Bounded pool of reusable instances
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     WasmEngine                          │
//! │  (Shared across all modules, thread-safe)               │
//! │  - Pooling Allocator                                    │
//! │  - Linker with waPC + WASI imports                      │
//! └─────────────────────────────────────────────────────────┘
//!                            │ load(name, bytes, handler)
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                     WapcModule                          │
//! │  (Compiled once, bound to the host-callback handler)    │
//! └─────────────────────────────────────────────────────────┘
//!                            │ instantiate()
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │        InstancePool of WapcInstance (Store + Instance)  │
//! │  - acquire with timeout / release or discard            │
//! │  - fuel refilled per invocation                         │
//! │  - __host_call ──► HostCallHandler                      │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod engine;
pub mod instance;
pub mod linker;
pub mod module;
pub mod pool;
pub mod runtime;
pub mod store;

pub use engine::WasmEngine;
pub use instance::WapcInstance;
pub use module::{CompiledModule, WapcModule};
pub use pool::{InstancePool, PooledInstance};
pub use runtime::{GuestEngine, GuestInstance, GuestModule, HostCallHandler};
pub use store::{GuestContext, InvocationMetrics};

pub use tokio_util::sync::CancellationToken;
