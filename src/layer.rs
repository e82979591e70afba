//! Tower middleware that runs a [`Service`] through the promise pipeline of one call-site.
//!
//! ```rust,no_run
//! use faultline::prelude::*;
//! use faultline::layer::FaultToleranceLayer;
//! use tower::{service_fn, Layer, ServiceExt};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let ft = FaultTolerance::builder().build()?;
//! let descriptor = PolicyDescriptor::non_blocking().with_retry(RetryConfig::default().max_retries(2));
//! let layer = FaultToleranceLayer::new(ft, CallSite::new("Inventory", "lookup"), descriptor);
//!
//! let svc = layer.layer(service_fn(|sku: String| async move { Ok::<_, std::io::Error>(sku.len()) }));
//! let len = svc.oneshot("sku-42".to_string()).await.map_err(|f| f.to_string())?;
//! assert_eq!(len, 6);
//! # Ok(())
//! # }
//! ```

use crate::async_types::Promise;
use crate::call_site::CallSite;
use crate::config::PolicyDescriptor;
use crate::dispatch::FaultTolerance;
use crate::error::Failure;
use futures::future::poll_fn;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// Applies the pipeline of a fixed call-site to every request.
#[derive(Clone, Debug)]
pub struct FaultToleranceLayer {
    tolerance: FaultTolerance,
    site: CallSite,
    descriptor: Arc<PolicyDescriptor>,
}

impl FaultToleranceLayer {
    /// `descriptor` must declare the promise model.
    pub fn new(tolerance: FaultTolerance, site: CallSite, descriptor: PolicyDescriptor) -> Self {
        Self { tolerance, site, descriptor: Arc::new(descriptor) }
    }
}

impl<S> Layer<S> for FaultToleranceLayer {
    type Service = FaultToleranceService<S>;

    fn layer(&self, service: S) -> Self::Service {
        FaultToleranceService {
            inner: service,
            tolerance: self.tolerance.clone(),
            site: self.site.clone(),
            descriptor: self.descriptor.clone(),
        }
    }
}

/// Middleware service produced by [`FaultToleranceLayer`].
#[derive(Clone, Debug)]
pub struct FaultToleranceService<S> {
    inner: S,
    tolerance: FaultTolerance,
    site: CallSite,
    descriptor: Arc<PolicyDescriptor>,
}

impl<S, Req> Service<Req> for FaultToleranceService<S>
where
    S: Service<Req> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    S::Error: Into<Failure>,
    Req: Clone + Send + Sync + 'static,
{
    type Response = S::Response;
    type Error = Failure;
    type Future = Promise<S::Response>;

    // Every attempt waits for readiness of its own clone of the inner service.
    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let inner = self.inner.clone();
        let attempt = move || -> Promise<S::Response> {
            let mut svc = inner.clone();
            let req = req.clone();
            Box::pin(async move {
                poll_fn(|cx| svc.poll_ready(cx)).await.map_err(Into::into)?;
                svc.call(req).await.map_err(Into::into)
            })
        };
        self.tolerance.call_async(&self.site, &self.descriptor, attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::executor::OffloadPool;
    use crate::sleeper::InstantSleeper;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::{service_fn, ServiceExt};

    #[derive(Debug, thiserror::Error)]
    #[error("flaky")]
    struct Flaky;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn retries_the_inner_service() {
        let ft = FaultTolerance::builder()
            .offload(OffloadPool::dedicated(1).unwrap())
            .sleeper(InstantSleeper)
            .build()
            .unwrap();
        let descriptor = PolicyDescriptor::promise().with_retry(RetryConfig::default().max_retries(3));
        let layer = FaultToleranceLayer::new(ft, CallSite::new("Echo", "call"), descriptor);

        let calls = Arc::new(AtomicUsize::new(0));
        let svc = {
            let calls = calls.clone();
            layer.layer(service_fn(move |req: u32| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(Flaky)
                    } else {
                        Ok(req * 2)
                    }
                }
            }))
        };

        assert_eq!(svc.oneshot(21).await.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn handle_descriptors_are_rejected() {
        let ft = FaultTolerance::builder().build().unwrap();
        let layer = FaultToleranceLayer::new(ft, CallSite::new("Echo", "call"), PolicyDescriptor::handle());
        let svc = layer.layer(service_fn(|req: u32| async move { Ok::<_, Flaky>(req) }));
        let failure = svc.oneshot(1).await.unwrap_err();
        assert_eq!(failure.kind(), crate::error::FailureKind::Configuration);
    }
}
