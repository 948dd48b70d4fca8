//! Host callback implementation for wapc-runtime.
//!
//! This crate provides the host side of guest-issued `__host_call`s.
//! Every loaded module forwards its host calls into one
//! [`CallbackRouter`], which maps `(namespace, capability, operation)` keys
//! to host-registered functions.
//!
//! # Components
//!
//! - [`router`]: Callback registration, lookup and dispatch with pre/post hooks
//! - [`hooks`]: Tracing hooks and pre-hook composition
//! - [`policy`]: Capability allowlist enforced as a pre-hook
//!
//! # Security Model
//!
//! Routes are only reachable once registered. On top of that, a
//! [`CapabilityPolicy`] installed as a pre-hook rejects any route outside
//! its allowlist before the handler runs.

pub mod hooks;
pub mod policy;
pub mod router;

pub use hooks::LoggingHooks;
pub use policy::{CapabilityPolicy, RoutePattern};
pub use router::{
    Callback, CallbackFn, CallbackRegistration, CallbackRequest, CallbackResult, CallbackRouter,
    PostHook, PreHook, RouteKey, RouterConfig,
};
