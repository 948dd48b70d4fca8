//! Execution engine seam.
//!
//! The dispatch and pool layers only talk to guest code through these
//! traits. [`crate::WasmEngine`] is the Wasmtime-backed implementation;
//! tests substitute in-memory engines.
//!
//! ```text
//! GuestEngine::load(bytes, handler) ──► GuestModule
//! GuestModule::instantiate()        ──► GuestInstance (pooled)
//! GuestInstance::invoke(op, bytes)  ──► guest ──__host_call──► HostCallHandler
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use wapc_runtime_common::{CallbackError, RuntimeError};

/// The single host-callback entry point wired into every loaded module.
///
/// Guests address host capabilities with a three-part key; the engine
/// forwards every host call here together with the lifecycle scope of the
/// invocation that issued it.
pub trait HostCallHandler: Send + Sync {
    /// Handle one host call issued by guest code.
    fn host_call(
        &self,
        scope: &CancellationToken,
        namespace: &str,
        capability: &str,
        operation: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, CallbackError>;
}

impl<F> HostCallHandler for F
where
    F: Fn(&CancellationToken, &str, &str, &str, &[u8]) -> Result<Vec<u8>, CallbackError>
        + Send
        + Sync,
{
    fn host_call(
        &self,
        scope: &CancellationToken,
        namespace: &str,
        capability: &str,
        operation: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, CallbackError> {
        self(scope, namespace, capability, operation, payload)
    }
}

/// An execution engine able to turn module bytes into a [`GuestModule`].
pub trait GuestEngine: Send + Sync {
    /// Compile `bytes` and bind `handler` as the module's host-callback entry point.
    fn load(
        &self,
        name: &str,
        bytes: &[u8],
        handler: Arc<dyn HostCallHandler>,
    ) -> Result<Arc<dyn GuestModule>, RuntimeError>;
}

/// A loaded guest module that can stamp out instances.
#[async_trait]
pub trait GuestModule: Send + Sync {
    /// Name the module was loaded under.
    fn name(&self) -> &str;

    /// Create and initialize a new instance.
    async fn instantiate(&self) -> Result<Box<dyn GuestInstance>, RuntimeError>;

    /// Release engine resources held by the module.
    ///
    /// Instances already created stay usable until they are closed.
    fn close(&self);
}

/// One live, stateful execution context of a guest module.
#[async_trait]
pub trait GuestInstance: Send {
    /// Call the exported guest `operation` with `payload`.
    ///
    /// `scope` is forwarded to every host call the guest makes while the
    /// operation runs.
    async fn invoke(
        &mut self,
        scope: &CancellationToken,
        operation: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, RuntimeError>;

    /// Returns `false` once the instance is in a state it cannot be reused from.
    fn is_reusable(&self) -> bool;

    /// Release the instance.
    fn close(&mut self);
}
