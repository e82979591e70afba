//! Bulkheads: bound the number of concurrent executions of a call-site.
//!
//! - [`SemaphoreBulkheadLayer`]: blocking model. A permit is taken or the call is rejected at once.
//! - [`QueueingBulkheadLayer`]: promise and handle models. Up to `max_concurrent` executions run,
//!   up to `queue_size` more wait for a slot, anything beyond is rejected. A queued waiter that
//!   observes cancellation gives its queue slot back.

use crate::async_types::Promise;
use crate::error::{BulkheadRejectedError, ExecutionError, Failure};
use crate::strategy::{AsyncChain, AsyncContext, AsyncStrategy, Strategy, SyncChain, SyncContext};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tower_layer::Layer;
use tracing::debug;

/// Permit-style bulkhead for blocking call-sites.
#[derive(Debug, Clone)]
pub struct SemaphoreBulkheadLayer {
    name: Arc<str>,
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl SemaphoreBulkheadLayer {
    pub fn new(name: impl Into<Arc<str>>, max_concurrent: usize) -> Self {
        Self {
            name: name.into(),
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }
}

impl<T: Send + 'static> Layer<SyncChain<T>> for SemaphoreBulkheadLayer {
    type Service = SemaphoreBulkhead<T>;

    fn layer(&self, inner: SyncChain<T>) -> Self::Service {
        SemaphoreBulkhead { inner, config: self.clone() }
    }
}

pub struct SemaphoreBulkhead<T> {
    inner: SyncChain<T>,
    config: SemaphoreBulkheadLayer,
}

impl<T: Send + 'static> Strategy<T> for SemaphoreBulkhead<T> {
    fn apply(&self, ctx: &SyncContext<T>) -> Result<T, Failure> {
        let permit = self.config.semaphore.try_acquire().map_err(|_| {
            debug!(bulkhead = %self.config.name, max = self.config.max_concurrent, "bulkhead full");
            Failure::new(BulkheadRejectedError {
                name: self.config.name.to_string(),
                max_concurrent: self.config.max_concurrent,
                queue_size: 0,
            })
        })?;
        let result = self.inner.apply(ctx);
        drop(permit);
        result
    }
}

struct Permits {
    _capacity: OwnedSemaphorePermit,
    _worker: OwnedSemaphorePermit,
}

/// Execution slots plus a bounded wait queue.
#[derive(Debug, Clone)]
pub struct QueueingBulkheadLayer {
    name: Arc<str>,
    capacity: Arc<Semaphore>,
    workers: Arc<Semaphore>,
    max_concurrent: usize,
    queue_size: usize,
}

impl QueueingBulkheadLayer {
    pub fn new(name: impl Into<Arc<str>>, max_concurrent: usize, queue_size: usize) -> Self {
        Self {
            name: name.into(),
            capacity: Arc::new(Semaphore::new(max_concurrent.saturating_add(queue_size))),
            workers: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            queue_size,
        }
    }

    fn rejected(&self) -> Failure {
        debug!(
            bulkhead = %self.name,
            max = self.max_concurrent,
            queue = self.queue_size,
            "bulkhead and queue full"
        );
        Failure::new(BulkheadRejectedError {
            name: self.name.to_string(),
            max_concurrent: self.max_concurrent,
            queue_size: self.queue_size,
        })
    }

    async fn admit(&self, cancellation: CancellationToken) -> Result<Permits, Failure> {
        let capacity = self.capacity.clone().try_acquire_owned().map_err(|_| self.rejected())?;
        let worker = match self.workers.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                debug!(bulkhead = %self.name, "queued for an execution slot");
                tokio::select! {
                    permit = self.workers.clone().acquire_owned() => {
                        permit.map_err(|_| Failure::new(ExecutionError::Cancelled))?
                    }
                    _ = cancellation.cancelled() => {
                        debug!(bulkhead = %self.name, "queued invocation cancelled");
                        return Err(ExecutionError::Cancelled.into());
                    }
                }
            }
        };
        Ok(Permits { _capacity: capacity, _worker: worker })
    }
}

impl<T: Send + 'static> Layer<AsyncChain<T>> for QueueingBulkheadLayer {
    type Service = QueueingBulkhead<AsyncChain<T>>;

    fn layer(&self, inner: AsyncChain<T>) -> Self::Service {
        QueueingBulkhead { inner, config: self.clone() }
    }
}

impl<T: Send + 'static> Layer<SyncChain<T>> for QueueingBulkheadLayer {
    type Service = QueueingBulkhead<SyncChain<T>>;

    fn layer(&self, inner: SyncChain<T>) -> Self::Service {
        QueueingBulkhead { inner, config: self.clone() }
    }
}

pub struct QueueingBulkhead<S> {
    inner: S,
    config: QueueingBulkheadLayer,
}

impl<T: Send + 'static> AsyncStrategy<T> for QueueingBulkhead<AsyncChain<T>> {
    fn apply(&self, ctx: &AsyncContext<T>) -> Promise<T> {
        let inner = self.inner.clone();
        let config = self.config.clone();
        let ctx = ctx.clone();
        Box::pin(async move {
            let _permits = config.admit(ctx.cancellation().clone()).await?;
            inner.apply(&ctx).await
        })
    }
}

/// Handle model: the wait for a slot happens on the offload thread running the chain.
impl<T: Send + 'static> Strategy<T> for QueueingBulkhead<SyncChain<T>> {
    fn apply(&self, ctx: &SyncContext<T>) -> Result<T, Failure> {
        let _permits = futures::executor::block_on(self.config.admit(ctx.cancellation().clone()))?;
        self.inner.apply(ctx)
    }
}
