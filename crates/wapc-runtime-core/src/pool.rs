//! Bounded pool of initialized guest instances.
//!
//! An [`InstancePool`] owns up to `size` instances of one guest module.
//! A counting [`Semaphore`] tracks how many instances are idle and the
//! instances themselves sit in a mutex-guarded list:
//!
//! ```text
//! acquire ──► semaphore permit (timeout) ──► pop idle ──► PooledInstance
//! release ──► reusable? push idle + add permit : close + shrink capacity
//! ```
//!
//! Instances that trapped (or were in use while a thread panicked) are
//! never handed out again. The pool does not replenish them, so its
//! capacity shrinks permanently.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use wapc_runtime_common::{PoolError, RuntimeError};

use crate::runtime::{GuestInstance, GuestModule};

/// A bounded set of reusable instances of one guest module.
pub struct InstancePool {
    module_name: String,
    size: usize,
    capacity: AtomicUsize,
    acquire_timeout: Duration,
    available: Semaphore,
    idle: Mutex<Vec<Box<dyn GuestInstance>>>,
    closed: AtomicBool,
}

impl InstancePool {
    /// Create a pool holding `size` freshly instantiated instances of `module`.
    ///
    /// # Errors
    ///
    /// Returns an error if `size` is zero or any instantiation fails. Instances
    /// created before the failure are closed.
    #[instrument(skip(module), fields(module = %module.name()))]
    pub async fn new(
        module: &dyn GuestModule,
        size: usize,
        acquire_timeout: Duration,
    ) -> Result<Self, RuntimeError> {
        if size == 0 {
            return Err(RuntimeError::invalid_config("pool size must be positive"));
        }

        let mut instances: Vec<Box<dyn GuestInstance>> = Vec::with_capacity(size);
        for _ in 0..size {
            match module.instantiate().await {
                Ok(instance) => instances.push(instance),
                Err(e) => {
                    warn!(
                        created = instances.len(),
                        error = %e,
                        "Instantiation failed while filling pool"
                    );
                    for mut instance in instances {
                        instance.close();
                    }
                    return Err(e);
                }
            }
        }

        info!(size, "Instance pool ready");

        Ok(Self {
            module_name: module.name().to_string(),
            size,
            capacity: AtomicUsize::new(size),
            acquire_timeout,
            available: Semaphore::new(size),
            idle: Mutex::new(instances),
            closed: AtomicBool::new(false),
        })
    }

    /// Borrow an instance, waiting at most `timeout` for one to become idle.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Timeout`] if no instance became available in
    /// time and [`PoolError::Closed`] if the pool was closed.
    pub async fn acquire(&self, timeout: Duration) -> Result<PooledInstance<'_>, PoolError> {
        let permit = match tokio::time::timeout(timeout, self.available.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::Closed),
            Err(_) => {
                debug!(
                    module = %self.module_name,
                    timeout_ms = duration_ms(timeout),
                    "Timed out waiting for an instance"
                );
                return Err(PoolError::Timeout {
                    timeout_ms: duration_ms(timeout),
                });
            }
        };
        // The permit travels with the instance and is re-added on release
        permit.forget();

        match self.idle.lock().pop() {
            Some(instance) => Ok(PooledInstance {
                pool: self,
                instance: Some(instance),
            }),
            None => Err(PoolError::Closed),
        }
    }

    /// Return a borrowed instance to the pool.
    ///
    /// Never blocks. Dropping the [`PooledInstance`] has the same effect;
    /// this method only exposes the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InstanceUnusable`] if the instance was discarded
    /// and [`PoolError::Closed`] if the pool was closed meanwhile.
    pub fn release(&self, mut instance: PooledInstance<'_>) -> Result<(), PoolError> {
        match instance.instance.take() {
            Some(inner) => instance.pool.put_back(inner),
            None => Ok(()),
        }
    }

    /// Borrow an instance, invoke `function` with `payload` and return it.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Pool`] if no instance could be borrowed within
    /// the configured acquire timeout, otherwise the invocation result.
    pub async fn run(
        &self,
        scope: &CancellationToken,
        function: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, RuntimeError> {
        let mut instance = self.acquire(self.acquire_timeout).await?;
        let result = instance.invoke(scope, function, payload).await;

        if let Err(e) = self.release(instance) {
            debug!(module = %self.module_name, function, error = %e, "Instance not returned to pool");
        }
        result
    }

    /// Close the pool and every idle instance.
    ///
    /// Pending and future acquires fail with [`PoolError::Closed`]; borrowed
    /// instances are closed when they come back.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.available.close();

        let drained: Vec<_> = self.idle.lock().drain(..).collect();
        let count = drained.len();
        for mut instance in drained {
            instance.close();
        }
        self.capacity.fetch_sub(count, Ordering::AcqRel);

        info!(module = %self.module_name, closed_instances = count, "Instance pool closed");
    }

    /// Number of instances the pool was created with.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of live instances, idle or borrowed.
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    /// Number of idle instances.
    pub fn available(&self) -> usize {
        self.available.available_permits()
    }

    /// Returns `true` once [`InstancePool::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// The timeout used by [`InstancePool::run`].
    pub fn acquire_timeout(&self) -> Duration {
        self.acquire_timeout
    }

    fn put_back(&self, mut instance: Box<dyn GuestInstance>) -> Result<(), PoolError> {
        if !instance.is_reusable() || std::thread::panicking() {
            self.discard(instance);
            warn!(
                module = %self.module_name,
                capacity = self.capacity(),
                "Discarded unusable instance"
            );
            return Err(PoolError::InstanceUnusable);
        }

        {
            // Checked under the lock so a concurrent close() drains what we push
            let mut idle = self.idle.lock();
            if !self.is_closed() {
                idle.push(instance);
                drop(idle);
                self.available.add_permits(1);
                return Ok(());
            }
        }

        instance.close();
        self.capacity.fetch_sub(1, Ordering::AcqRel);
        Err(PoolError::Closed)
    }

    fn discard(&self, mut instance: Box<dyn GuestInstance>) {
        instance.close();
        self.capacity.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for InstancePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstancePool")
            .field("module", &self.module_name)
            .field("size", &self.size)
            .field("capacity", &self.capacity())
            .field("available", &self.available())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// An instance borrowed from an [`InstancePool`].
///
/// The instance goes back to its pool when the guard is dropped, including
/// on error paths and during unwinding.
pub struct PooledInstance<'a> {
    pool: &'a InstancePool,
    instance: Option<Box<dyn GuestInstance>>,
}

impl PooledInstance<'_> {
    /// Invoke `operation` on the borrowed instance.
    ///
    /// # Errors
    ///
    /// Returns the instance's invocation error.
    pub async fn invoke(
        &mut self,
        scope: &CancellationToken,
        operation: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, RuntimeError> {
        match self.instance.as_mut() {
            Some(instance) => instance.invoke(scope, operation, payload).await,
            None => Err(PoolError::Closed.into()),
        }
    }

    /// Returns `true` if the borrowed instance can go back into the pool.
    pub fn is_reusable(&self) -> bool {
        self.instance
            .as_ref()
            .is_some_and(|instance| instance.is_reusable())
    }
}

impl Drop for PooledInstance<'_> {
    fn drop(&mut self) {
        if let Some(instance) = self.instance.take() {
            if let Err(e) = self.pool.put_back(instance) {
                debug!(module = %self.pool.module_name, error = %e, "Instance dropped from pool");
            }
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
