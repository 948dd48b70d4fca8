//! Ready-made router hooks.
//!
//! [`LoggingHooks`] traces every routed callback through `tracing`, and
//! [`chain`] composes several pre-hooks into one.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::router::{CallbackRequest, CallbackResult, PreHook, PostHook, RouterConfig};

/// Callbacks slower than this are logged at `warn` level by default.
pub const DEFAULT_SLOW_THRESHOLD: Duration = Duration::from_millis(100);

/// A pre/post hook pair emitting one structured event per dispatch.
#[derive(Debug, Clone, Copy)]
pub struct LoggingHooks {
    slow_threshold: Duration,
}

impl Default for LoggingHooks {
    fn default() -> Self {
        Self {
            slow_threshold: DEFAULT_SLOW_THRESHOLD,
        }
    }
}

impl LoggingHooks {
    /// Create logging hooks with the default slow-callback threshold.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the duration above which a completed callback is logged as slow.
    #[must_use]
    pub fn with_slow_threshold(mut self, threshold: Duration) -> Self {
        self.slow_threshold = threshold;
        self
    }

    /// The slow-callback threshold.
    pub fn slow_threshold(&self) -> Duration {
        self.slow_threshold
    }

    /// A pre-hook that logs the request and never rejects it.
    pub fn pre_hook(&self) -> PreHook {
        Arc::new(|request: CallbackRequest| {
            log_request(&request);
            Ok(())
        })
    }

    /// A post-hook that logs the outcome and duration.
    pub fn post_hook(&self) -> PostHook {
        let threshold = self.slow_threshold;
        Arc::new(move |result: CallbackResult| log_result(&result, threshold))
    }

    /// Install both hooks into `config`, replacing existing ones.
    #[must_use]
    pub fn install(&self, config: RouterConfig) -> RouterConfig {
        config
            .with_shared_pre_hook(self.pre_hook())
            .with_shared_post_hook(self.post_hook())
    }

    /// Returns `true` if `result` took longer than the threshold.
    pub fn is_slow(&self, result: &CallbackResult) -> bool {
        result.duration() > self.slow_threshold
    }
}

fn log_request(request: &CallbackRequest) {
    debug!(
        namespace = %request.namespace,
        capability = %request.capability,
        operation = %request.operation,
        input_len = request.input.len(),
        "Host callback dispatched"
    );
}

fn log_result(result: &CallbackResult, slow_threshold: Duration) {
    let duration = result.duration();

    match &result.error {
        Some(error) => warn!(
            namespace = %result.namespace,
            capability = %result.capability,
            operation = %result.operation,
            duration_us = duration.as_micros(),
            error = %error,
            "Host callback failed"
        ),
        None if duration > slow_threshold => warn!(
            namespace = %result.namespace,
            capability = %result.capability,
            operation = %result.operation,
            duration_ms = duration.as_millis(),
            output_len = result.output.len(),
            "Slow host callback"
        ),
        None => debug!(
            namespace = %result.namespace,
            capability = %result.capability,
            operation = %result.operation,
            duration_us = duration.as_micros(),
            output_len = result.output.len(),
            "Host callback completed"
        ),
    }
}

/// Run `hooks` in order; the first rejection stops the chain and wins.
pub fn chain(hooks: impl IntoIterator<Item = PreHook>) -> PreHook {
    let hooks: Vec<PreHook> = hooks.into_iter().collect();
    Arc::new(move |request: CallbackRequest| {
        for hook in &hooks {
            hook(request.clone())?;
        }
        Ok(())
    })
}
