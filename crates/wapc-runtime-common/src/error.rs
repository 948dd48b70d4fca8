//! Error types for the wapc-runtime.
//!
//! This module defines a hierarchy of error types using `thiserror`:
//! - [`CallbackError`]: Errors from registering and dispatching host callbacks
//! - [`PoolError`]: Errors from borrowing and returning pooled instances
//! - [`RuntimeError`]: Top-level errors for loading and invoking guest modules
//!
//! [`HandlerError`] and [`HookRejection`] carry failures produced by
//! user-supplied callback handlers and pre-hooks.

use std::fmt;
use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::config_file::ConfigFileError;

/// Error produced by a registered callback handler or a router hook.
///
/// The wrapped error is shared, so the same failure can be handed to the
/// post-hook and returned to the dispatch caller without copying or
/// re-formatting it.
#[derive(Clone)]
pub struct HandlerError(Arc<dyn std::error::Error + Send + Sync + 'static>);

impl HandlerError {
    /// Wrap an arbitrary error.
    pub fn new<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self(Arc::new(error))
    }

    /// Create an error from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self(Arc::new(MessageError(message.into())))
    }

    /// Wrap an already boxed error.
    pub fn from_boxed(error: Box<dyn std::error::Error + Send + Sync + 'static>) -> Self {
        Self(Arc::from(error))
    }

    /// Attempt to downcast the wrapped error to a concrete type.
    pub fn downcast_ref<E: std::error::Error + 'static>(&self) -> Option<&E> {
        self.0.downcast_ref::<E>()
    }

    /// Returns `true` if both values wrap the very same error instance.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl std::error::Error for HandlerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::msg(message)
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::msg(message)
    }
}

impl From<io::Error> for HandlerError {
    fn from(error: io::Error) -> Self {
        Self::new(error)
    }
}

#[derive(Debug)]
struct MessageError(String);

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for MessageError {}

/// A pre-hook's refusal to let a callback run.
///
/// The payload is handed back to the dispatch caller together with the
/// error, so middleware can answer the guest with its own response body.
///
/// Displays as the rejection reason. [`std::error::Error::source`] skips the
/// reason itself and yields its cause, so error-chain reporters print the
/// reason once.
#[derive(Debug, Clone)]
pub struct HookRejection {
    /// Response payload produced by the pre-hook.
    pub payload: Vec<u8>,

    /// The rejection reason.
    pub error: HandlerError,
}

impl fmt::Display for HookRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.error, f)
    }
}

impl std::error::Error for HookRejection {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        std::error::Error::source(&self.error)
    }
}

impl HookRejection {
    /// Create a rejection with an empty payload.
    pub fn new(error: impl Into<HandlerError>) -> Self {
        Self {
            payload: Vec::new(),
            error: error.into(),
        }
    }

    /// Attach a response payload to the rejection.
    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }
}

/// Errors from the capability callback router.
#[derive(Error, Debug, Clone)]
pub enum CallbackError {
    /// The namespace of a callback key was empty.
    #[error("Invalid namespace: namespace cannot be empty")]
    InvalidNamespace,

    /// The capability of a callback key was empty.
    #[error("Invalid capability: capability cannot be empty")]
    InvalidCapability,

    /// The operation of a callback key was empty.
    #[error("Invalid operation: operation cannot be empty")]
    InvalidOperation,

    /// A registration was submitted without a handler function.
    #[error("Invalid handler: handler cannot be empty")]
    InvalidHandler,

    /// A callback is already registered under the same key.
    #[error("Callback already exists: {namespace}:{capability}:{operation}")]
    CallbackExists {
        /// Namespace of the conflicting key.
        namespace: String,
        /// Capability of the conflicting key.
        capability: String,
        /// Operation of the conflicting key.
        operation: String,
    },

    /// No callback is registered under the requested key.
    #[error("Callback not found: {namespace}:{capability}:{operation}")]
    NotFound {
        /// Requested namespace.
        namespace: String,
        /// Requested capability.
        capability: String,
        /// Requested operation.
        operation: String,
    },

    /// The dispatch context was canceled before the callback ran.
    #[error("Context canceled or expired")]
    Canceled,

    /// The pre-hook refused the callback.
    #[error(transparent)]
    Rejected(HookRejection),

    /// The registered handler returned an error.
    #[error(transparent)]
    Handler(HandlerError),
}

impl CallbackError {
    /// Create a new `NotFound` error.
    pub fn not_found(namespace: &str, capability: &str, operation: &str) -> Self {
        Self::NotFound {
            namespace: namespace.to_string(),
            capability: capability.to_string(),
            operation: operation.to_string(),
        }
    }

    /// Create a new `CallbackExists` error.
    pub fn exists(namespace: &str, capability: &str, operation: &str) -> Self {
        Self::CallbackExists {
            namespace: namespace.to_string(),
            capability: capability.to_string(),
            operation: operation.to_string(),
        }
    }

    /// Returns `true` if the callback key was not registered.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns `true` if the dispatch was canceled.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    /// Returns `true` if this error rejected malformed input.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidNamespace
                | Self::InvalidCapability
                | Self::InvalidOperation
                | Self::InvalidHandler
        )
    }
}

/// Errors from the bounded instance pool.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// No instance became available before the deadline.
    #[error("Timed out after {timeout_ms}ms waiting for an available instance")]
    Timeout {
        /// The acquire timeout in milliseconds.
        timeout_ms: u64,
    },

    /// The pool has been closed.
    #[error("Instance pool is closed")]
    Closed,

    /// A returned instance was broken and has been discarded.
    #[error("Instance is unusable and was discarded")]
    InstanceUnusable,
}

/// Top-level runtime errors.
///
/// These errors represent failures that can occur during the lifecycle of
/// guest modules, from loading and compilation to pooled invocation.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The requested module is not loaded.
    #[error("Module not found: {module_id}")]
    ModuleNotFound {
        /// The identifier of the module that was not found.
        module_id: String,
    },

    /// A module load request was missing required fields.
    #[error("Invalid module config: {reason}")]
    InvalidModuleConfig {
        /// Description of what was missing.
        reason: String,
    },

    /// Loading a module failed while reading, compiling or pooling it.
    #[error("Unable to load module '{name}' from {path}: {source}")]
    ModuleLoad {
        /// Name the module was being loaded under.
        name: String,
        /// Source path of the module bytes.
        path: String,
        /// The underlying failure.
        #[source]
        source: Box<RuntimeError>,
    },

    /// WebAssembly compilation failed.
    #[error("Compilation failed: {reason}")]
    CompilationFailed {
        /// Description of the compilation failure.
        reason: String,
    },

    /// Creating a module instance failed.
    #[error("Instantiation failed: {reason}")]
    Instantiation {
        /// Description of the instantiation failure.
        reason: String,
    },

    /// The guest reported a failure for the invoked operation.
    #[error("Guest call to '{operation}' failed: {message}")]
    GuestCall {
        /// The invoked guest operation.
        operation: String,
        /// Error message reported by the guest.
        message: String,
    },

    /// A WebAssembly trap occurred during execution.
    #[error("Wasm trap: {message}")]
    Trap {
        /// Description of the trap.
        message: String,
    },

    /// Execution exhausted the configured fuel limit.
    #[error("Fuel exhausted: CPU limit exceeded")]
    FuelExhausted,

    /// The module's lifecycle scope was canceled.
    #[error("Invocation canceled: module scope is closed")]
    Canceled,

    /// The module registry was closed and accepts no more modules.
    #[error("Module registry is closed")]
    RegistryClosed,

    /// Borrowing an instance from the pool failed.
    #[error("Could not fetch instance from pool: {0}")]
    Pool(#[from] PoolError),

    /// A host callback failed outside of guest execution.
    #[error("Host call failed: {0}")]
    HostCall(#[from] CallbackError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The configuration file could not be loaded.
    #[error(transparent)]
    ConfigFile(#[from] ConfigFileError),

    /// Invalid configuration was provided.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },
}

impl RuntimeError {
    /// Create a new `ModuleNotFound` error.
    pub fn module_not_found(module_id: impl Into<String>) -> Self {
        Self::ModuleNotFound {
            module_id: module_id.into(),
        }
    }

    /// Create a new `InvalidModuleConfig` error.
    pub fn invalid_module_config(reason: impl Into<String>) -> Self {
        Self::InvalidModuleConfig {
            reason: reason.into(),
        }
    }

    /// Wrap a failure with the module name and source path it occurred for.
    pub fn module_load(name: impl Into<String>, path: impl Into<String>, source: Self) -> Self {
        Self::ModuleLoad {
            name: name.into(),
            path: path.into(),
            source: Box::new(source),
        }
    }

    /// Create a new `CompilationFailed` error.
    pub fn compilation_failed(reason: impl Into<String>) -> Self {
        Self::CompilationFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `Instantiation` error.
    pub fn instantiation(reason: impl Into<String>) -> Self {
        Self::Instantiation {
            reason: reason.into(),
        }
    }

    /// Create a new `GuestCall` error.
    pub fn guest_call(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::GuestCall {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a new `Trap` error.
    pub fn trap(message: impl Into<String>) -> Self {
        Self::Trap {
            message: message.into(),
        }
    }

    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Returns `true` if this error indicates the module was not found.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ModuleNotFound { .. })
    }

    /// Returns `true` if the execution engine failed to load a module.
    pub fn is_engine_error(&self) -> bool {
        matches!(
            self,
            Self::ModuleLoad { .. } | Self::CompilationFailed { .. } | Self::Instantiation { .. }
        )
    }

    /// Returns `true` if this error indicates a resource limit was exceeded.
    pub fn is_resource_limit(&self) -> bool {
        matches!(
            self,
            Self::FuelExhausted | Self::Pool(PoolError::Timeout { .. })
        )
    }
}
