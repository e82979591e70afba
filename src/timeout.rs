//! Timeouts: bound the wall-clock time of one attempt.
//!
//! The promise variant races the promise against a tokio timer. The blocking variant (also used
//! by the handle pipeline) runs the attempt on a helper thread of the offload pool and waits for
//! it with a deadline, so the waiting thread is never held past the bound. Either way the attempt
//! that lost the race has its cancellation flag set and is abandoned, never awaited.

use crate::async_types::Promise;
use crate::error::{Failure, TimeoutError};
use crate::executor::OffloadPool;
use crate::strategy::{AsyncChain, AsyncContext, AsyncStrategy, Strategy, SyncChain, SyncContext};
use std::sync::Arc;
use std::time::Duration;
use tower_layer::Layer;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct TimeoutLayer {
    name: Arc<str>,
    timeout: Duration,
    offload: OffloadPool,
}

impl TimeoutLayer {
    pub fn new(name: impl Into<Arc<str>>, timeout: Duration, offload: OffloadPool) -> Self {
        Self { name: name.into(), timeout, offload }
    }

    /// Inspect the configured timeout duration.
    pub fn duration(&self) -> Duration {
        self.timeout
    }

    fn timed_out(&self) -> Failure {
        warn!(timeout = %self.name, timeout_ms = self.timeout.as_millis() as u64, "attempt timed out");
        Failure::new(TimeoutError { name: self.name.to_string(), timeout: self.timeout })
    }
}

impl<T: Send + 'static> Layer<SyncChain<T>> for TimeoutLayer {
    type Service = BlockingTimeout<T>;

    fn layer(&self, inner: SyncChain<T>) -> Self::Service {
        BlockingTimeout { inner, config: self.clone() }
    }
}

impl<T: Send + 'static> Layer<AsyncChain<T>> for TimeoutLayer {
    type Service = AsyncTimeout<T>;

    fn layer(&self, inner: AsyncChain<T>) -> Self::Service {
        AsyncTimeout { inner, config: self.clone() }
    }
}

pub struct BlockingTimeout<T> {
    inner: SyncChain<T>,
    config: TimeoutLayer,
}

impl<T: Send + 'static> Strategy<T> for BlockingTimeout<T> {
    fn apply(&self, ctx: &SyncContext<T>) -> Result<T, Failure> {
        let attempt = ctx.attempt();
        let inner = self.inner.clone();
        let helper_ctx = attempt.clone();
        let helper = self.config.offload.submit(move || inner.apply(&helper_ctx));

        if helper.wait_timeout(self.config.timeout) {
            helper.wait()
        } else {
            attempt.cancellation().cancel();
            Err(self.config.timed_out())
        }
    }
}

pub struct AsyncTimeout<T> {
    inner: AsyncChain<T>,
    config: TimeoutLayer,
}

impl<T: Send + 'static> AsyncStrategy<T> for AsyncTimeout<T> {
    fn apply(&self, ctx: &AsyncContext<T>) -> Promise<T> {
        let attempt = ctx.attempt();
        let inner = self.inner.clone();
        let config = self.config.clone();
        Box::pin(async move {
            match tokio::time::timeout(config.timeout, inner.apply(&attempt)).await {
                Ok(result) => result,
                Err(_) => {
                    attempt.cancellation().cancel();
                    Err(config.timed_out())
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::InvocationContext;
    use crate::strategy::Invoke;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct SlowAttempt {
        sleep: Duration,
        saw_cancellation: Arc<AtomicBool>,
    }

    impl Strategy<u32> for SlowAttempt {
        fn apply(&self, ctx: &SyncContext<u32>) -> Result<u32, Failure> {
            std::thread::sleep(self.sleep);
            self.saw_cancellation.store(ctx.is_cancelled(), Ordering::SeqCst);
            Ok(42)
        }
    }

    fn pool() -> OffloadPool {
        OffloadPool::dedicated(1).expect("runtime")
    }

    #[test]
    fn blocking_completes_before_timeout() {
        let layer = TimeoutLayer::new("Timeout[t]", Duration::from_millis(500), pool());
        let seen = Arc::new(AtomicBool::new(false));
        let chain = layer.layer(Arc::new(SlowAttempt {
            sleep: Duration::from_millis(5),
            saw_cancellation: seen.clone(),
        }) as SyncChain<u32>);
        let ctx: SyncContext<u32> = InvocationContext::new(Arc::new(|| Ok(0)));
        assert_eq!(chain.apply(&ctx).unwrap(), 42);
        assert!(!seen.load(Ordering::SeqCst));
    }

    #[test]
    fn blocking_times_out_and_cancels_the_attempt() {
        let layer = TimeoutLayer::new("Timeout[t]", Duration::from_millis(30), pool());
        let seen = Arc::new(AtomicBool::new(false));
        let chain = layer.layer(Arc::new(SlowAttempt {
            sleep: Duration::from_millis(150),
            saw_cancellation: seen.clone(),
        }) as SyncChain<u32>);
        let ctx: SyncContext<u32> = InvocationContext::new(Arc::new(|| Ok(0)));

        let started = std::time::Instant::now();
        let err = chain.apply(&ctx).unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_millis(140), "caller is released at the bound");
        assert!(!ctx.is_cancelled(), "only the attempt is cancelled");

        std::thread::sleep(Duration::from_millis(200));
        assert!(seen.load(Ordering::SeqCst), "abandoned attempt observes cancellation");
    }

    #[tokio::test]
    async fn async_times_out_long_operation() {
        let layer = TimeoutLayer::new("Timeout[t]", Duration::from_millis(50), OffloadPool::current().unwrap());
        let counter = Arc::new(AtomicUsize::new(0));
        let work = {
            let counter = counter.clone();
            Arc::new(move || -> Promise<u32> {
                counter.fetch_add(1, Ordering::SeqCst);
                Box::pin(async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(42)
                })
            })
        };
        let ctx: AsyncContext<u32> = InvocationContext::new(work);
        let chain = layer.layer(Arc::new(Invoke) as AsyncChain<u32>);

        let err = chain.apply(&ctx).await.unwrap_err();
        let timeout = err.downcast_ref::<TimeoutError>().expect("timeout failure");
        assert_eq!(timeout.timeout, Duration::from_millis(50));
        assert_eq!(timeout.name, "Timeout[t]");
        assert_eq!(counter.load(Ordering::SeqCst), 1, "should have started execution");
    }

    #[tokio::test]
    async fn async_propagates_operation_errors() {
        let layer = TimeoutLayer::new("Timeout[t]", Duration::from_secs(1), OffloadPool::current().unwrap());
        let ctx: AsyncContext<u32> = InvocationContext::new(Arc::new(|| -> Promise<u32> {
            Box::pin(async { Err(Failure::msg("operation failed")) })
        }));
        let chain = layer.layer(Arc::new(Invoke) as AsyncChain<u32>);
        let err = chain.apply(&ctx).await.unwrap_err();
        assert!(!err.is_timeout());
        assert_eq!(err.to_string(), "operation failed");
    }
}
