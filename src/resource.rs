//! # Shared Execution Resource
//!
//! Every transport channel runs its reader and writer tasks on a
//! [`SharedResource`]: a handle to a multi-threaded Tokio runtime that is
//! shared by all channels created while it is live.
//!
//! The process-wide default lives in a [`ResourceAllocator`]. The allocator
//! is an explicit registry with a mutex-guarded slot; it only exposes
//! get-or-create and quiesce operations, never direct access to the held
//! runtime.
//!
//! ## Lifecycle
//!
//! 1. Created on first demand (`get_or_create`) or passed in explicitly
//! 2. Leased by each channel that depends on it
//! 3. Quiesced with `shutdown_gracefully`: it stops being live at once, and the
//!    runtime is drained on a background thread after the last lease is gone

use log::{debug, info, warn};
use once_cell::sync::Lazy;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::{Handle, Runtime};

use crate::error::{Error, Result};

/// How long a quiescing runtime waits for in-flight tasks before it is torn down
pub const QUIESCE_TIMEOUT: Duration = Duration::from_secs(5);

/// Thread name used for the worker threads of owned runtimes
pub const WORKER_THREAD_NAME: &str = "merklekv-io";

static NEXT_RESOURCE_ID: AtomicU64 = AtomicU64::new(1);

static GLOBAL_ALLOCATOR: Lazy<Arc<ResourceAllocator>> =
    Lazy::new(|| Arc::new(ResourceAllocator::new()));

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ResourceState {
    runtime: Option<Runtime>,
    live: bool,
    leases: usize,
}

struct ResourceInner {
    id: u64,
    handle: Handle,
    state: Mutex<ResourceState>,
}

impl ResourceInner {
    /// Hand the runtime to a background thread that drains it.
    fn release(&self, state: &mut ResourceState) {
        let Some(runtime) = state.runtime.take() else {
            return;
        };
        let id = self.id;
        let spawned = std::thread::Builder::new()
            .name(format!("merklekv-quiesce-{}", id))
            .spawn(move || {
                runtime.shutdown_timeout(QUIESCE_TIMEOUT);
                debug!("Shared resource {} drained", id);
            });
        if let Err(e) = spawned {
            warn!("Failed to spawn quiesce thread for resource {}: {}", id, e);
        }
    }
}

impl Drop for ResourceInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(runtime) = state.runtime.take() {
            // Dropping a runtime blocks, which is not allowed inside async contexts.
            runtime.shutdown_background();
        }
    }
}

/// Handle to an execution context shared by transport channels.
///
/// Cloning is cheap and yields the same resource; equality is identity.
#[derive(Clone)]
pub struct SharedResource {
    inner: Arc<ResourceInner>,
}

impl SharedResource {
    /// Create a resource that owns a multi-threaded runtime with
    /// `worker_threads` workers.
    pub fn new(worker_threads: usize) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name(WORKER_THREAD_NAME)
            .enable_all()
            .build()
            .map_err(|e| Error::resource_creation(format!("failed to build runtime: {}", e)))?;
        let handle = runtime.handle().clone();
        let resource = Self::from_parts(handle, Some(runtime));
        info!(
            "Created shared resource {} with {} worker threads",
            resource.id(),
            worker_threads.max(1)
        );
        Ok(resource)
    }

    /// Platform default: one worker per available CPU.
    pub fn with_default_workers() -> Result<Self> {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::new(workers)
    }

    /// Wrap a runtime owned by someone else.
    ///
    /// Quiescing such a resource only marks it as no longer live; the runtime
    /// itself stays with its owner.
    pub fn from_handle(handle: Handle) -> Self {
        Self::from_parts(handle, None)
    }

    fn from_parts(handle: Handle, runtime: Option<Runtime>) -> Self {
        Self {
            inner: Arc::new(ResourceInner {
                id: NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed),
                handle,
                state: Mutex::new(ResourceState {
                    runtime,
                    live: true,
                    leases: 0,
                }),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The runtime handle channels spawn their I/O tasks on
    pub fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    pub fn is_live(&self) -> bool {
        lock(&self.inner.state).live
    }

    /// Number of channels currently depending on this resource
    pub fn lease_count(&self) -> usize {
        lock(&self.inner.state).leases
    }

    /// Register a dependent channel. The resource is not torn down while
    /// the returned lease exists.
    pub fn lease(&self) -> Result<ResourceLease> {
        let mut state = lock(&self.inner.state);
        if !state.live {
            return Err(Error::invalid_state(format!(
                "shared resource {} is shutting down",
                self.inner.id
            )));
        }
        state.leases += 1;
        Ok(ResourceLease {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Stop handing out the resource and drain it once no lease remains.
    ///
    /// Returns immediately; calling it more than once is harmless.
    pub fn shutdown_gracefully(&self) {
        let mut state = lock(&self.inner.state);
        if !state.live {
            return;
        }
        state.live = false;
        if state.leases == 0 {
            info!("Quiescing shared resource {}", self.inner.id);
            self.inner.release(&mut state);
        } else {
            info!(
                "Shared resource {} will quiesce after {} dependent channel(s) close",
                self.inner.id, state.leases
            );
        }
    }
}

impl PartialEq for SharedResource {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for SharedResource {}

impl fmt::Debug for SharedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("SharedResource")
            .field("id", &self.inner.id)
            .field("live", &state.live)
            .field("owned", &state.runtime.is_some())
            .field("leases", &state.leases)
            .finish()
    }
}

/// A channel's claim on a [`SharedResource`].
pub struct ResourceLease {
    inner: Arc<ResourceInner>,
}

impl Drop for ResourceLease {
    fn drop(&mut self) {
        let mut state = lock(&self.inner.state);
        state.leases = state.leases.saturating_sub(1);
        if state.leases == 0 && !state.live {
            debug!("Last lease on resource {} released", self.inner.id);
            self.inner.release(&mut state);
        }
    }
}

impl fmt::Debug for ResourceLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceLease")
            .field("resource", &self.inner.id)
            .finish()
    }
}

/// Registry holding the default [`SharedResource`].
///
/// `get_or_create` runs under the registry lock, so callers racing to create
/// the default all observe the same instance.
#[derive(Debug, Default)]
pub struct ResourceAllocator {
    slot: Mutex<Option<SharedResource>>,
}

impl ResourceAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide allocator
    pub fn global() -> Arc<ResourceAllocator> {
        Arc::clone(&GLOBAL_ALLOCATOR)
    }

    /// Return the live default, or install whatever `factory` yields.
    ///
    /// `factory` is not called when a live default exists. If it yields
    /// `None` no default is installed and `None` is returned. Its errors are
    /// returned unchanged and leave the slot untouched.
    pub fn get_or_create<F>(&self, factory: F) -> Result<Option<SharedResource>>
    where
        F: FnOnce() -> Result<Option<SharedResource>>,
    {
        let mut slot = lock(&self.slot);
        if let Some(existing) = slot.as_ref().filter(|r| r.is_live()) {
            debug!("Reusing default shared resource {}", existing.id());
            return Ok(Some(existing.clone()));
        }
        let created = factory()?;
        match &created {
            Some(resource) => debug!("Installed default shared resource {}", resource.id()),
            None => debug!("Resource factory produced no default"),
        }
        *slot = created.clone();
        Ok(created)
    }

    /// The live default, if any
    pub fn current(&self) -> Option<SharedResource> {
        lock(&self.slot).as_ref().filter(|r| r.is_live()).cloned()
    }

    /// Quiesce and forget the current default so the next `get_or_create`
    /// builds a fresh one.
    pub fn shutdown_default(&self) {
        if let Some(resource) = lock(&self.slot).take() {
            resource.shutdown_gracefully();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn borrowed() -> SharedResource {
        SharedResource::from_handle(Handle::current())
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let allocator = ResourceAllocator::new();
        let first = borrowed();
        let expected = first.clone();
        let mut first = Some(first);

        let a = allocator
            .get_or_create(|| Ok(first.take()))
            .unwrap()
            .unwrap();
        let b = allocator
            .get_or_create(|| Ok(first.take()))
            .unwrap()
            .unwrap();

        assert_eq!(a, expected);
        assert_eq!(b, expected);
    }

    #[tokio::test]
    async fn test_existing_default_skips_factory() {
        let allocator = ResourceAllocator::new();
        let calls = AtomicUsize::new(0);
        let factory = || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Some(borrowed()))
        };
        allocator.get_or_create(factory).unwrap();
        allocator.get_or_create(factory).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_absent_factory_leaves_no_default() {
        let allocator = ResourceAllocator::new();
        let result = allocator.get_or_create(|| Ok(None)).unwrap();
        assert!(result.is_none());
        assert!(allocator.current().is_none());
    }

    #[test]
    fn test_factory_error_propagates() {
        let allocator = ResourceAllocator::new();
        let err = allocator
            .get_or_create(|| Err(Error::resource_creation("no threads")))
            .unwrap_err();
        assert!(matches!(err, Error::ResourceCreationFailed { ref message } if message == "no threads"));
        assert!(allocator.current().is_none());
    }

    #[tokio::test]
    async fn test_quiesced_default_is_replaced() {
        let allocator = ResourceAllocator::new();
        let old = allocator
            .get_or_create(|| Ok(Some(borrowed())))
            .unwrap()
            .unwrap();
        old.shutdown_gracefully();
        assert!(allocator.current().is_none());

        // Mirrors test isolation: probe with an empty factory to clear the slot
        assert!(allocator.get_or_create(|| Ok(None)).unwrap().is_none());

        let fresh = allocator
            .get_or_create(|| Ok(Some(borrowed())))
            .unwrap()
            .unwrap();
        assert_ne!(old, fresh);
        assert!(fresh.is_live());
    }

    #[tokio::test]
    async fn test_lease_rejected_after_shutdown() {
        let resource = borrowed();
        let lease = resource.lease().unwrap();
        assert_eq!(resource.lease_count(), 1);

        resource.shutdown_gracefully();
        assert!(!resource.is_live());
        assert!(matches!(resource.lease(), Err(Error::InvalidState { .. })));

        drop(lease);
        assert_eq!(resource.lease_count(), 0);
    }

    #[test]
    fn test_owned_runtime_quiesces_after_last_lease() {
        let resource = SharedResource::new(1).unwrap();
        let lease = resource.lease().unwrap();
        let spawned = resource.handle().spawn(async { 7 });
        assert_eq!(resource.handle().block_on(spawned).unwrap(), 7);

        resource.shutdown_gracefully();
        // Still leased: the runtime keeps running until the channel lets go
        let still_running = resource.handle().spawn(async { 11 });
        assert_eq!(resource.handle().block_on(still_running).unwrap(), 11);

        drop(lease);
        assert!(!resource.is_live());
    }

    #[test]
    fn test_shutdown_default_clears_slot() {
        let allocator = ResourceAllocator::new();
        let resource = allocator
            .get_or_create(|| SharedResource::new(1).map(Some))
            .unwrap()
            .unwrap();
        allocator.shutdown_default();
        assert!(!resource.is_live());
        assert!(allocator.current().is_none());
    }
}
