//! Process-wide offload pool shared by every pipeline.

use crate::async_types::Promise;
use crate::error::{ExecutionError, Failure};
use crate::handle::Handle;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::runtime::{Handle as RuntimeHandle, Runtime};
use tokio::task::JoinError;

struct OwnedRuntime(Option<Runtime>);

impl Drop for OwnedRuntime {
    fn drop(&mut self) {
        if let Some(runtime) = self.0.take() {
            runtime.shutdown_background();
        }
    }
}

/// Executes offloaded chain bodies, blocking helpers and handle-model calls.
#[derive(Clone)]
pub struct OffloadPool {
    handle: RuntimeHandle,
    _owned: Option<Arc<OwnedRuntime>>,
}

impl OffloadPool {
    /// Offload onto an existing tokio runtime.
    pub fn from_handle(handle: RuntimeHandle) -> Self {
        Self { handle, _owned: None }
    }

    /// Offload onto the runtime of the calling thread, if any.
    pub fn current() -> Option<Self> {
        RuntimeHandle::try_current().ok().map(Self::from_handle)
    }

    /// Offload onto a runtime owned by this pool.
    pub fn dedicated(worker_threads: usize) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name("faultline-offload")
            .enable_time()
            .build()?;
        let handle = runtime.handle().clone();
        Ok(Self { handle, _owned: Some(Arc::new(OwnedRuntime(Some(runtime)))) })
    }

    pub fn handle(&self) -> &RuntimeHandle {
        &self.handle
    }

    /// Drive `promise` on the pool; the returned promise resolves with its outcome.
    pub fn spawn<T: Send + 'static>(&self, promise: Promise<T>) -> Promise<T> {
        let task = self.handle.spawn(promise);
        Box::pin(async move { task.await.map_err(join_failure)? })
    }

    /// Run blocking `f` on the pool.
    pub fn spawn_blocking<T, F>(&self, f: F) -> Promise<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, Failure> + Send + 'static,
    {
        let task = self.handle.spawn_blocking(f);
        Box::pin(async move { task.await.map_err(join_failure)? })
    }

    /// Run blocking `f` on the pool, exposing its outcome as a [`Handle`]. A panic in `f`
    /// resolves the handle with [`ExecutionError::Panicked`].
    pub fn submit<T, F>(&self, f: F) -> Handle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, Failure> + Send + 'static,
    {
        let (completer, handle) = Handle::channel();
        self.execute(move || {
            let result = std::panic::catch_unwind(AssertUnwindSafe(f));
            completer.complete(result.unwrap_or_else(|_| Err(ExecutionError::Panicked.into())));
        });
        handle
    }

    /// Fire-and-forget blocking work.
    pub(crate) fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        drop(self.handle.spawn_blocking(f));
    }
}

impl fmt::Debug for OffloadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OffloadPool").field("dedicated", &self._owned.is_some()).finish()
    }
}

pub(crate) fn join_failure(error: JoinError) -> Failure {
    if error.is_panic() {
        ExecutionError::Panicked.into()
    } else {
        ExecutionError::Cancelled.into()
    }
}
