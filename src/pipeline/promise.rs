//! Promise chains, plus the scheduling steps that only exist around asynchronous work.

use super::{assemble_policies, fallback_layer, Environment, ModelSteps};
use crate::async_types::{AsyncType, Promise};
use crate::bulkhead::QueueingBulkheadLayer;
use crate::call_site::CallSite;
use crate::circuit_breaker::CircuitBreakerLayer;
use crate::config::{BulkheadConfig, FallbackConfig, PolicyDescriptor};
use crate::context::{EventLoop, RequestContextController, RequestScope};
use crate::error::{ConfigError, Failure};
use crate::executor::{join_failure, OffloadPool};
use crate::metrics::MetricsLayer;
use crate::retry::RetryLayer;
use crate::strategy::{AsyncChain, AsyncContext, AsyncStrategy, Invoke, Strategy, SyncChain, SyncContext};
use crate::timeout::TimeoutLayer;
use std::marker::PhantomData;
use std::sync::Arc;
use tower_layer::Layer;

/// Keeps the ambient request scope active while the wrapped chain runs.
#[derive(Debug, Clone)]
pub(crate) struct RequestScopeLayer {
    controller: Arc<dyn RequestContextController>,
}

impl RequestScopeLayer {
    pub(crate) fn new(controller: Arc<dyn RequestContextController>) -> Self {
        Self { controller }
    }
}

impl<T: Send + 'static> Layer<AsyncChain<T>> for RequestScopeLayer {
    type Service = AsyncRequestScope<T>;

    fn layer(&self, inner: AsyncChain<T>) -> Self::Service {
        AsyncRequestScope { inner, controller: self.controller.clone() }
    }
}

impl<T: Send + 'static> Layer<SyncChain<T>> for RequestScopeLayer {
    type Service = BlockingRequestScope<T>;

    fn layer(&self, inner: SyncChain<T>) -> Self::Service {
        BlockingRequestScope { inner, controller: self.controller.clone() }
    }
}

pub(crate) struct AsyncRequestScope<T> {
    inner: AsyncChain<T>,
    controller: Arc<dyn RequestContextController>,
}

impl<T: Send + 'static> AsyncStrategy<T> for AsyncRequestScope<T> {
    fn apply(&self, ctx: &AsyncContext<T>) -> Promise<T> {
        let scope = RequestScope::enter(self.controller.clone());
        let promise = self.inner.apply(ctx);
        Box::pin(async move {
            let _scope = scope;
            promise.await
        })
    }
}

pub(crate) struct BlockingRequestScope<T> {
    inner: SyncChain<T>,
    controller: Arc<dyn RequestContextController>,
}

impl<T: Send + 'static> Strategy<T> for BlockingRequestScope<T> {
    fn apply(&self, ctx: &SyncContext<T>) -> Result<T, Failure> {
        let _scope = RequestScope::enter(self.controller.clone());
        self.inner.apply(ctx)
    }
}

/// Runs the wrapped chain on the offload pool, or directly when no pool is given.
#[derive(Debug, Clone)]
pub(crate) struct OffloadLayer {
    pool: Option<OffloadPool>,
}

impl OffloadLayer {
    pub(crate) fn new(pool: Option<OffloadPool>) -> Self {
        Self { pool }
    }
}

impl<T: Send + 'static> Layer<AsyncChain<T>> for OffloadLayer {
    type Service = Offloaded<T>;

    fn layer(&self, inner: AsyncChain<T>) -> Self::Service {
        Offloaded { inner, pool: self.pool.clone() }
    }
}

pub(crate) struct Offloaded<T> {
    inner: AsyncChain<T>,
    pool: Option<OffloadPool>,
}

impl<T: Send + 'static> AsyncStrategy<T> for Offloaded<T> {
    fn apply(&self, ctx: &AsyncContext<T>) -> Promise<T> {
        match &self.pool {
            Some(pool) => {
                let inner = self.inner.clone();
                let ctx = ctx.clone();
                pool.spawn(Box::pin(async move { inner.apply(&ctx).await }))
            }
            None => self.inner.apply(ctx),
        }
    }
}

/// Drives the wrapped chain on the caller's event loop, if the caller runs one.
#[derive(Debug, Clone)]
pub(crate) struct EventLoopLayer {
    event_loop: Arc<dyn EventLoop>,
}

impl EventLoopLayer {
    pub(crate) fn new(event_loop: Arc<dyn EventLoop>) -> Self {
        Self { event_loop }
    }
}

impl<T: Send + 'static> Layer<AsyncChain<T>> for EventLoopLayer {
    type Service = OnEventLoop<T>;

    fn layer(&self, inner: AsyncChain<T>) -> Self::Service {
        OnEventLoop { inner, event_loop: self.event_loop.clone() }
    }
}

pub(crate) struct OnEventLoop<T> {
    inner: AsyncChain<T>,
    event_loop: Arc<dyn EventLoop>,
}

impl<T: Send + 'static> AsyncStrategy<T> for OnEventLoop<T> {
    fn apply(&self, ctx: &AsyncContext<T>) -> Promise<T> {
        match self.event_loop.current() {
            Some(handle) => {
                let task = handle.spawn(self.inner.apply(ctx));
                Box::pin(async move { task.await.map_err(join_failure)? })
            }
            None => self.inner.apply(ctx),
        }
    }
}

/// Asynchronous decorators; the recovery path produces the declared container `A`.
pub(crate) struct PromiseSteps<A> {
    offload: Option<OffloadPool>,
    _container: PhantomData<fn() -> A>,
}

impl<T, A> ModelSteps<T> for PromiseSteps<A>
where
    T: Send + 'static,
    A: AsyncType<T>,
{
    type Chain = AsyncChain<T>;

    fn bulkhead(&self, chain: AsyncChain<T>, name: String, config: &BulkheadConfig) -> AsyncChain<T> {
        Arc::new(QueueingBulkheadLayer::new(name, config.value, config.waiting_task_queue).layer(chain))
    }

    fn timeout(&self, chain: AsyncChain<T>, layer: TimeoutLayer) -> AsyncChain<T> {
        Arc::new(layer.layer(chain))
    }

    fn circuit_breaker(&self, chain: AsyncChain<T>, layer: CircuitBreakerLayer) -> AsyncChain<T> {
        Arc::new(layer.layer(chain))
    }

    fn retry(&self, chain: AsyncChain<T>, layer: RetryLayer) -> AsyncChain<T> {
        Arc::new(layer.layer(chain))
    }

    fn fallback(
        &self,
        chain: AsyncChain<T>,
        env: &Environment,
        site: &CallSite,
        config: &FallbackConfig,
    ) -> Result<AsyncChain<T>, ConfigError> {
        let mut layer = fallback_layer::<A>(env, site, config)?.map(A::into_promise);
        if let Some(pool) = &self.offload {
            layer = layer.offloaded(pool.clone());
        }
        Ok(Arc::new(layer.layer(chain)))
    }

    fn metrics(&self, chain: AsyncChain<T>, layer: MetricsLayer) -> AsyncChain<T> {
        Arc::new(layer.layer(chain))
    }
}

/// Promise chain of `site`, for work whose declared container is `A`.
///
/// Offloaded call-sites run everything from the request scope inwards on the offload pool;
/// the others stay on the caller's event loop.
pub(crate) fn build<T, A>(
    env: &Environment,
    site: &CallSite,
    descriptor: &PolicyDescriptor,
) -> Result<AsyncChain<T>, ConfigError>
where
    T: Send + 'static,
    A: AsyncType<T>,
{
    let offload = descriptor.thread_offload.then(|| env.offload.clone());

    let mut chain: AsyncChain<T> = Arc::new(Invoke);
    chain = Arc::new(RequestScopeLayer::new(env.request_context.clone()).layer(chain));
    chain = Arc::new(OffloadLayer::new(offload.clone()).layer(chain));

    let steps = PromiseSteps::<A> { offload: offload.clone(), _container: PhantomData };
    chain = assemble_policies(&steps, env, site, descriptor, chain)?;

    if offload.is_none() {
        chain = Arc::new(EventLoopLayer::new(env.event_loop.clone()).layer(chain));
    }
    Ok(chain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BulkheadConfig, FallbackConfig, RetryConfig};
    use crate::context::{InvocationContext, TokioEventLoop};
    use crate::fallback::FallbackRegistry;
    use crate::pipeline::test_support::environment;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn thread_name() -> String {
        std::thread::current().name().unwrap_or_default().to_string()
    }

    #[derive(Debug, Default)]
    struct Flagged {
        active: AtomicBool,
        activations: AtomicUsize,
    }

    impl RequestContextController for Flagged {
        fn activate(&self) -> bool {
            self.activations.fetch_add(1, Ordering::SeqCst);
            !self.active.swap(true, Ordering::SeqCst)
        }

        fn deactivate(&self) {
            self.active.store(false, Ordering::SeqCst);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn offloaded_chains_run_on_the_pool_inside_the_request_scope() {
        let scope = Arc::new(Flagged::default());
        let mut env = environment(OffloadPool::dedicated(1).unwrap());
        env.request_context = scope.clone();
        let chain = build::<_, Promise<(String, bool)>>(&env, &CallSite::new("Svc", "op"), &PolicyDescriptor::promise()).unwrap();

        let observed = scope.clone();
        let ctx: AsyncContext<(String, bool)> = InvocationContext::promise(move || {
            let active = observed.active.load(Ordering::SeqCst);
            Box::pin(async move { Ok((thread_name(), active)) })
        });
        let (thread, active) = chain.apply(&ctx).await.unwrap();

        assert_eq!(thread, "faultline-offload");
        assert!(active);
        assert!(!scope.active.load(Ordering::SeqCst));
        assert_eq!(scope.activations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_blocking_chains_run_on_the_calling_thread() {
        let env = environment(OffloadPool::dedicated(1).unwrap());
        let descriptor = PolicyDescriptor::non_blocking();
        let chain = build::<_, Promise<bool>>(&env, &CallSite::new("Svc", "op"), &descriptor).unwrap();
        let caller = std::thread::current().id();

        let ctx: AsyncContext<bool> =
            InvocationContext::promise(move || Box::pin(async move { Ok(std::thread::current().id() == caller) }));
        assert!(chain.apply(&ctx).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn event_loop_step_spawns_on_the_callers_runtime() {
        let mut env = environment(OffloadPool::dedicated(1).unwrap());
        env.event_loop = Arc::new(TokioEventLoop);
        let chain =
            build::<_, Promise<String>>(&env, &CallSite::new("Svc", "op"), &PolicyDescriptor::non_blocking()).unwrap();

        let ctx: AsyncContext<String> = InvocationContext::promise(|| Box::pin(async { Ok(thread_name()) }));
        assert_ne!(chain.apply(&ctx).await.unwrap(), "faultline-offload");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bulkhead_queues_then_rejects() {
        let env = environment(OffloadPool::dedicated(2).unwrap());
        let descriptor = PolicyDescriptor::non_blocking()
            .with_bulkhead(BulkheadConfig::default().value(1).waiting_task_queue(1));
        let chain = build::<_, Promise<u8>>(&env, &CallSite::new("Svc", "op"), &descriptor).unwrap();

        let gate = Arc::new(tokio::sync::Notify::new());
        let ctx: AsyncContext<u8> = {
            let gate = gate.clone();
            InvocationContext::promise(move || {
                let gate = gate.clone();
                Box::pin(async move {
                    gate.notified().await;
                    Ok(1)
                })
            })
        };

        let running = tokio::spawn(chain.apply(&ctx));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let queued = tokio::spawn(chain.apply(&ctx));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert!(chain.apply(&ctx).await.unwrap_err().is_bulkhead());

        gate.notify_one();
        assert_eq!(running.await.unwrap().unwrap(), 1);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        gate.notify_one();
        assert_eq!(queued.await.unwrap().unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fallback_result_is_not_retried() {
        let mut env = environment(OffloadPool::dedicated(1).unwrap());
        let fallbacks = FallbackRegistry::new();
        let recoveries = Arc::new(AtomicUsize::new(0));
        {
            let recoveries = recoveries.clone();
            fallbacks.register_handler(
                "recover",
                move |_ctx: &crate::context::ExecutionContext| -> Result<Promise<u8>, Failure> {
                    recoveries.fetch_add(1, Ordering::SeqCst);
                    Ok(Box::pin(async { Err(Failure::msg("recovery failed")) }) as Promise<u8>)
                },
            );
        }
        env.fallbacks = fallbacks;
        let descriptor = PolicyDescriptor::promise()
            .with_retry(RetryConfig::default().max_retries(2))
            .with_fallback(FallbackConfig::handler("recover"));
        let chain = build::<u8, Promise<u8>>(&env, &CallSite::new("Svc", "op"), &descriptor).unwrap();

        let attempts = Arc::new(AtomicUsize::new(0));
        let ctx: AsyncContext<u8> = {
            let attempts = attempts.clone();
            InvocationContext::promise(move || {
                attempts.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Err(Failure::msg("down")) })
            })
        };

        assert_eq!(chain.apply(&ctx).await.unwrap_err().to_string(), "recovery failed");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(recoveries.load(Ordering::SeqCst), 1);
    }
}
