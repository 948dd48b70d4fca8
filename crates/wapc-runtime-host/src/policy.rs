//! Capability-based access control for host callbacks.
//!
//! This module provides the [`CapabilityPolicy`] allowlist, which decides
//! which `(namespace, capability, operation)` routes guests may reach.

use std::fmt;
use std::sync::Arc;

use tracing::warn;

use wapc_runtime_common::{HandlerError, HookRejection, PolicyConfig, RuntimeError};

use crate::router::{CallbackRequest, PreHook};

const WILDCARD: &str = "*";

/// One allowlist entry. Each segment is either a literal or `*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePattern {
    namespace: String,
    capability: String,
    operation: String,
}

impl RoutePattern {
    /// Create a pattern from its three segments.
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

    /// Parse `namespace:capability:operation`. A bare `*` matches every route.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InvalidConfig`] unless the pattern has exactly
    /// three non-empty segments.
    pub fn parse(pattern: &str) -> Result<Self, RuntimeError> {
        if pattern == WILDCARD {
            return Ok(Self::new(WILDCARD, WILDCARD, WILDCARD));
        }

        let segments: Vec<&str> = pattern.split(':').collect();
        match segments.as_slice() {
            [namespace, capability, operation]
                if !namespace.is_empty() && !capability.is_empty() && !operation.is_empty() =>
            {
                Ok(Self::new(*namespace, *capability, *operation))
            }
            _ => Err(RuntimeError::invalid_config(format!(
                "invalid capability pattern '{pattern}': expected namespace:capability:operation"
            ))),
        }
    }

    /// Check if a route matches this pattern.
    pub fn matches(&self, namespace: &str, capability: &str, operation: &str) -> bool {
        segment_matches(&self.namespace, namespace)
            && segment_matches(&self.capability, capability)
            && segment_matches(&self.operation, operation)
    }
}

impl fmt::Display for RoutePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.namespace, self.capability, self.operation)
    }
}

fn segment_matches(pattern: &str, value: &str) -> bool {
    pattern == WILDCARD || pattern == value
}

/// Allowlist of host callback routes.
///
/// # Security Philosophy
///
/// We follow the principle of least privilege:
/// - By default, nothing is allowed
/// - Each route (or route family) must be explicitly granted
/// - The policy is immutable once installed as a pre-hook
#[derive(Debug, Clone, Default)]
pub struct CapabilityPolicy {
    allowed: Vec<RoutePattern>,
}

impl CapabilityPolicy {
    /// A policy that rejects every callback.
    pub fn deny_all() -> Self {
        Self::default()
    }

    /// A policy that allows every callback.
    ///
    /// # Warning
    ///
    /// This is intended for development/testing only.
    pub fn allow_all() -> Self {
        Self {
            allowed: vec![RoutePattern::new(WILDCARD, WILDCARD, WILDCARD)],
        }
    }

    /// Create a builder for constructing a policy.
    pub fn builder() -> CapabilityPolicyBuilder {
        CapabilityPolicyBuilder::default()
    }

    /// Parse a policy from `namespace:capability:operation` patterns.
    ///
    /// # Errors
    ///
    /// Returns an error for the first malformed pattern.
    pub fn from_patterns<I, S>(patterns: I) -> Result<Self, RuntimeError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let allowed = patterns
            .into_iter()
            .map(|pattern| RoutePattern::parse(pattern.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { allowed })
    }

    /// Build the policy described by the `[policy]` config section.
    ///
    /// Returns `None` when the policy is disabled.
    ///
    /// # Errors
    ///
    /// Returns an error for a malformed pattern.
    pub fn from_config(config: &PolicyConfig) -> Result<Option<Self>, RuntimeError> {
        if !config.enabled {
            return Ok(None);
        }
        Self::from_patterns(&config.allow).map(Some)
    }

    /// Check if the route is allowed.
    pub fn is_allowed(&self, namespace: &str, capability: &str, operation: &str) -> bool {
        self.allowed
            .iter()
            .any(|pattern| pattern.matches(namespace, capability, operation))
    }

    /// The allowlist entries.
    pub fn patterns(&self) -> &[RoutePattern] {
        &self.allowed
    }

    /// Turn the policy into a router pre-hook rejecting disallowed routes.
    pub fn into_pre_hook(self) -> PreHook {
        Arc::new(move |request: CallbackRequest| {
            if self.is_allowed(&request.namespace, &request.capability, &request.operation) {
                return Ok(());
            }
            warn!(
                namespace = %request.namespace,
                capability = %request.capability,
                operation = %request.operation,
                "Host callback denied by capability policy"
            );
            Err(HookRejection::new(HandlerError::msg(format!(
                "permission denied: {}:{}:{}",
                request.namespace, request.capability, request.operation
            ))))
        })
    }
}

/// Builder for [`CapabilityPolicy`].
#[derive(Debug, Default)]
pub struct CapabilityPolicyBuilder {
    inner: CapabilityPolicy,
}

impl CapabilityPolicyBuilder {
    /// Allow one route. Any segment may be `*`.
    #[must_use]
    pub fn allow(
        mut self,
        namespace: impl Into<String>,
        capability: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        self.inner
            .allowed
            .push(RoutePattern::new(namespace, capability, operation));
        self
    }

    /// Allow every operation of a capability.
    #[must_use]
    pub fn allow_capability(
        self,
        namespace: impl Into<String>,
        capability: impl Into<String>,
    ) -> Self {
        self.allow(namespace, capability, WILDCARD)
    }

    /// Allow everything in a namespace.
    #[must_use]
    pub fn allow_namespace(self, namespace: impl Into<String>) -> Self {
        self.allow(namespace, WILDCARD, WILDCARD)
    }

    /// Build the policy.
    #[must_use]
    pub fn build(self) -> CapabilityPolicy {
        self.inner
    }
}
