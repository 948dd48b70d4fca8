//! Capability callback routing.
//!
//! The [`CallbackRouter`] maps a guest-issued host call, addressed by a
//! `(namespace, capability, operation)` key, to a host-registered handler:
//!
//! ```text
//! dispatch ──► canceled? ──► lookup (read lock) ──► pre-hook ──► handler
//!                                                                  │
//!                                  caller ◄── output / error ◄─────┤
//!                                                                  ▼
//!                                                  post-hook (detached)
//! ```
//!
//! The routing table is behind a single-writer / many-reader lock. The
//! entry is copied out under the read lock, so handlers and hooks never run
//! while the lock is held.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use wapc_runtime_common::{CallbackError, HandlerError, HookRejection};
use wapc_runtime_core::HostCallHandler;

/// A host function serving one routing key.
pub type CallbackFn = Arc<dyn Fn(&[u8]) -> Result<Vec<u8>, HandlerError> + Send + Sync>;

/// Middleware run before the handler; an error aborts the dispatch.
pub type PreHook = Arc<dyn Fn(CallbackRequest) -> Result<(), HookRejection> + Send + Sync>;

/// Observer run after the handler, detached from the dispatch.
pub type PostHook = Arc<dyn Fn(CallbackResult) + Send + Sync>;

/// The `(namespace, capability, operation)` routing key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteKey {
    /// Callback namespace.
    pub namespace: String,
    /// Capability within the namespace.
    pub capability: String,
    /// Operation of the capability.
    pub operation: String,
}

impl RouteKey {
    /// Create a new routing key.
    pub fn new(
        namespace: impl Into<String>,
        capability: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            capability: capability.into(),
            operation: operation.into(),
        }
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.namespace, self.capability, self.operation)
    }
}

/// A request to add a route to the router.
#[derive(Clone, Default)]
pub struct CallbackRegistration {
    /// Callback namespace.
    pub namespace: String,
    /// Capability within the namespace.
    pub capability: String,
    /// Operation of the capability.
    pub operation: String,
    /// The host function. Registration fails without one.
    pub handler: Option<CallbackFn>,
}

impl CallbackRegistration {
    /// Start a registration for the given key, without a handler.
    pub fn new(
        namespace: impl Into<String>,
        capability: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            capability: capability.into(),
            operation: operation.into(),
            handler: None,
        }
    }

    /// Set the host function.
    #[must_use]
    pub fn handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&[u8]) -> Result<Vec<u8>, HandlerError> + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Check the required fields, in key order, then the handler.
    pub fn validate(&self) -> Result<(), CallbackError> {
        validate_key(&self.namespace, &self.capability, &self.operation)?;
        if self.handler.is_none() {
            return Err(CallbackError::InvalidHandler);
        }
        Ok(())
    }
}

impl fmt::Debug for CallbackRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRegistration")
            .field("namespace", &self.namespace)
            .field("capability", &self.capability)
            .field("operation", &self.operation)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

/// A registered route, as returned by [`CallbackRouter::lookup`].
///
/// This is a copy; changing it never changes what the router dispatches to.
#[derive(Clone)]
pub struct Callback {
    /// Callback namespace.
    pub namespace: String,
    /// Capability within the namespace.
    pub capability: String,
    /// Operation of the capability.
    pub operation: String,
    /// The host function.
    pub handler: CallbackFn,
}

impl Callback {
    /// Call the host function directly, bypassing hooks.
    pub fn call(&self, input: &[u8]) -> Result<Vec<u8>, HandlerError> {
        (self.handler)(input)
    }

    /// The routing key of this callback.
    pub fn key(&self) -> RouteKey {
        RouteKey::new(&self.namespace, &self.capability, &self.operation)
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("namespace", &self.namespace)
            .field("capability", &self.capability)
            .field("operation", &self.operation)
            .finish_non_exhaustive()
    }
}

/// What a pre-hook sees of a dispatch.
#[derive(Debug, Clone)]
pub struct CallbackRequest {
    /// Callback namespace.
    pub namespace: String,
    /// Capability within the namespace.
    pub capability: String,
    /// Operation of the capability.
    pub operation: String,
    /// Raw input sent by the guest.
    pub input: Vec<u8>,
    /// When the dispatch started.
    pub start_time: Instant,
}

impl CallbackRequest {
    /// The routing key of this request.
    pub fn key(&self) -> RouteKey {
        RouteKey::new(&self.namespace, &self.capability, &self.operation)
    }
}

/// What a post-hook sees of a completed dispatch.
#[derive(Debug, Clone)]
pub struct CallbackResult {
    /// Callback namespace.
    pub namespace: String,
    /// Capability within the namespace.
    pub capability: String,
    /// Operation of the capability.
    pub operation: String,
    /// Raw input sent by the guest.
    pub input: Vec<u8>,
    /// Handler output; empty when the handler failed.
    pub output: Vec<u8>,
    /// Handler error, shared with the dispatch caller.
    pub error: Option<HandlerError>,
    /// When the dispatch started.
    pub start_time: Instant,
    /// When the handler returned.
    pub end_time: Instant,
}

impl CallbackResult {
    /// Time spent between dispatch start and handler return.
    pub fn duration(&self) -> Duration {
        self.end_time.saturating_duration_since(self.start_time)
    }

    /// Returns `true` if the handler succeeded.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Router hooks. Immutable once the router is built.
#[derive(Clone, Default)]
pub struct RouterConfig {
    pre_hook: Option<PreHook>,
    post_hook: Option<PostHook>,
}

impl RouterConfig {
    /// Configuration without hooks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the pre-hook, replacing any previous one.
    #[must_use]
    pub fn with_pre_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(CallbackRequest) -> Result<(), HookRejection> + Send + Sync + 'static,
    {
        self.pre_hook = Some(Arc::new(hook));
        self
    }

    /// Set the post-hook, replacing any previous one.
    #[must_use]
    pub fn with_post_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(CallbackResult) + Send + Sync + 'static,
    {
        self.post_hook = Some(Arc::new(hook));
        self
    }

    /// Set an already shared pre-hook, such as one built by [`crate::hooks::chain`].
    #[must_use]
    pub fn with_shared_pre_hook(mut self, hook: PreHook) -> Self {
        self.pre_hook = Some(hook);
        self
    }

    /// Set an already shared post-hook.
    #[must_use]
    pub fn with_shared_post_hook(mut self, hook: PostHook) -> Self {
        self.post_hook = Some(hook);
        self
    }

    /// The configured pre-hook.
    pub fn pre_hook(&self) -> Option<&PreHook> {
        self.pre_hook.as_ref()
    }

    /// The configured post-hook.
    pub fn post_hook(&self) -> Option<&PostHook> {
        self.post_hook.as_ref()
    }
}

impl fmt::Debug for RouterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouterConfig")
            .field("pre_hook", &self.pre_hook.is_some())
            .field("post_hook", &self.post_hook.is_some())
            .finish()
    }
}

/// Routes host calls to registered handlers.
///
/// # Thread Safety
///
/// `CallbackRouter` is `Send + Sync`; share it behind an `Arc` between the
/// registering host code and every module that dispatches into it.
///
/// # Example
///
/// ```ignore
/// let router = CallbackRouter::new(RouterConfig::new());
/// router.register(
///     CallbackRegistration::new("default", "counter", "increment")
///         .handler(|input| Ok(input.to_vec())),
/// )?;
///
/// let output = router.dispatch(
///     &CancellationToken::new(),
///     "default",
///     "counter",
///     "increment",
///     b"Hello World",
/// )?;
/// ```
pub struct CallbackRouter {
    config: RouterConfig,
    routes: RwLock<HashMap<RouteKey, Callback>>,
}

impl CallbackRouter {
    /// Create an empty router.
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            routes: RwLock::new(HashMap::new()),
        }
    }

    /// Add a route.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a missing field and
    /// [`CallbackError::CallbackExists`] if the key is taken. An existing
    /// route is never overwritten.
    pub fn register(&self, registration: CallbackRegistration) -> Result<(), CallbackError> {
        registration.validate()?;
        let CallbackRegistration {
            namespace,
            capability,
            operation,
            handler,
        } = registration;
        let Some(handler) = handler else {
            return Err(CallbackError::InvalidHandler);
        };

        let key = RouteKey::new(&namespace, &capability, &operation);
        let mut routes = self.routes.write();
        if routes.contains_key(&key) {
            return Err(CallbackError::exists(&namespace, &capability, &operation));
        }

        debug!(route = %key, "Callback registered");
        routes.insert(
            key,
            Callback {
                namespace,
                capability,
                operation,
                handler,
            },
        );
        Ok(())
    }

    /// Remove a route. Removing an absent route succeeds.
    ///
    /// # Errors
    ///
    /// Returns a validation error if any key field is empty.
    pub fn unregister(
        &self,
        namespace: &str,
        capability: &str,
        operation: &str,
    ) -> Result<(), CallbackError> {
        validate_key(namespace, capability, operation)?;

        let key = RouteKey::new(namespace, capability, operation);
        if self.routes.write().remove(&key).is_some() {
            debug!(route = %key, "Callback unregistered");
        }
        Ok(())
    }

    /// Get a copy of the route registered under the key.
    ///
    /// # Errors
    ///
    /// Returns [`CallbackError::NotFound`] if nothing is registered.
    pub fn lookup(
        &self,
        namespace: &str,
        capability: &str,
        operation: &str,
    ) -> Result<Callback, CallbackError> {
        let key = RouteKey::new(namespace, capability, operation);
        self.routes
            .read()
            .get(&key)
            .cloned()
            .ok_or_else(|| CallbackError::not_found(namespace, capability, operation))
    }

    /// Route one host call.
    ///
    /// # Errors
    ///
    /// - [`CallbackError::Canceled`] if `scope` is already canceled
    /// - [`CallbackError::NotFound`] if the key is not registered
    /// - [`CallbackError::Rejected`] if the pre-hook refused the call
    /// - [`CallbackError::Handler`] with the handler's own error
    pub fn dispatch(
        &self,
        scope: &CancellationToken,
        namespace: &str,
        capability: &str,
        operation: &str,
        input: &[u8],
    ) -> Result<Vec<u8>, CallbackError> {
        if scope.is_cancelled() {
            return Err(CallbackError::Canceled);
        }

        let request = CallbackRequest {
            namespace: namespace.to_string(),
            capability: capability.to_string(),
            operation: operation.to_string(),
            input: input.to_vec(),
            start_time: Instant::now(),
        };

        let callback = self.routes.read().get(&request.key()).cloned();
        let Some(callback) = callback else {
            trace!(namespace, capability, operation, "No callback registered");
            return Err(CallbackError::not_found(namespace, capability, operation));
        };

        if let Some(pre_hook) = &self.config.pre_hook {
            pre_hook(request.clone()).map_err(CallbackError::Rejected)?;
        }

        let (output, error) = match callback.call(&request.input) {
            Ok(output) => (output, None),
            Err(e) => (Vec::new(), Some(e)),
        };

        if let Some(post_hook) = &self.config.post_hook {
            let CallbackRequest {
                namespace,
                capability,
                operation,
                input,
                start_time,
            } = request;
            spawn_post_hook(
                Arc::clone(post_hook),
                CallbackResult {
                    namespace,
                    capability,
                    operation,
                    input,
                    output: output.clone(),
                    error: error.clone(),
                    start_time,
                    end_time: Instant::now(),
                },
            );
        }

        match error {
            None => Ok(output),
            Some(e) => Err(CallbackError::Handler(e)),
        }
    }

    /// Remove every route. Dispatches already past lookup are unaffected.
    pub fn close(&self) {
        let mut routes = self.routes.write();
        let count = routes.len();
        routes.clear();
        info!(removed = count, "Callback router closed");
    }

    /// Number of registered routes.
    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    /// Returns `true` if no route is registered.
    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }

    /// All registered keys, sorted.
    pub fn routes(&self) -> Vec<RouteKey> {
        let mut keys: Vec<_> = self.routes.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// The hook configuration.
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }
}

impl HostCallHandler for CallbackRouter {
    fn host_call(
        &self,
        scope: &CancellationToken,
        namespace: &str,
        capability: &str,
        operation: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, CallbackError> {
        self.dispatch(scope, namespace, capability, operation, payload)
    }
}

impl fmt::Debug for CallbackRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRouter")
            .field("config", &self.config)
            .field("routes", &self.len())
            .finish()
    }
}

fn validate_key(namespace: &str, capability: &str, operation: &str) -> Result<(), CallbackError> {
    if namespace.is_empty() {
        return Err(CallbackError::InvalidNamespace);
    }
    if capability.is_empty() {
        return Err(CallbackError::InvalidCapability);
    }
    if operation.is_empty() {
        return Err(CallbackError::InvalidOperation);
    }
    Ok(())
}

/// Run the post-hook off the dispatch path.
fn spawn_post_hook(hook: PostHook, result: CallbackResult) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn_blocking(move || hook(result));
        return;
    }

    let spawned = std::thread::Builder::new()
        .name("wapc-post-hook".into())
        .spawn(move || hook(result));
    if let Err(e) = spawned {
        warn!(error = %e, "Failed to spawn post-hook thread");
    }
}
