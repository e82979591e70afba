//! Entry point: routes each governed call to the pipeline of its execution model.

use crate::async_types::{failed, AsyncType, Promise};
use crate::cache::StrategyCache;
use crate::call_site::CallSite;
use crate::circuit_breaker_registry::CircuitBreakerMaintenance;
use crate::clock::{Clock, MonotonicClock};
use crate::config::{ExecutionModel, PolicyDescriptor, ReturnType};
use crate::context::{EventLoop, Invocation, InvocationContext, NoEventLoop, NoRequestContext, RequestContextController};
use crate::error::{ConfigError, Failure};
use crate::executor::OffloadPool;
use crate::fallback::FallbackRegistry;
use crate::handle::Handle;
use crate::metrics::{MetricsProvider, NoopMetrics};
use crate::pipeline::{self, Environment};
use crate::sleeper::{BlockingSleeper, Sleeper, ThreadSleeper, TokioSleeper};
use crate::strategy::{AsyncChain, AsyncWork, HandleWork, SyncChain, SyncWork};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// A unit of work in one of the three caller-visible shapes.
pub enum UnitOfWork<T> {
    Blocking(Arc<SyncWork<T>>),
    Promise(Arc<AsyncWork<T>>),
    Handle(Arc<HandleWork<T>>),
}

impl<T> fmt::Debug for UnitOfWork<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shape = match self {
            UnitOfWork::Blocking(_) => "Blocking",
            UnitOfWork::Promise(_) => "Promise",
            UnitOfWork::Handle(_) => "Handle",
        };
        f.debug_tuple("UnitOfWork").field(&shape).finish()
    }
}

impl<T> UnitOfWork<T> {
    fn model(&self) -> ExecutionModel {
        match self {
            UnitOfWork::Blocking(_) => ExecutionModel::Blocking,
            UnitOfWork::Promise(_) => ExecutionModel::Promise,
            UnitOfWork::Handle(_) => ExecutionModel::Handle,
        }
    }
}

/// The result of [`FaultTolerance::dispatch`], in the shape of the unit of work.
pub enum Outcome<T> {
    Value(Result<T, Failure>),
    Promise(Promise<T>),
    Handle(Handle<T>),
}

impl<T> fmt::Debug for Outcome<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Value(Ok(_)) => f.write_str("Outcome::Value(Ok(..))"),
            Outcome::Value(Err(failure)) => write!(f, "Outcome::Value(Err({failure}))"),
            Outcome::Promise(_) => f.write_str("Outcome::Promise(..)"),
            Outcome::Handle(handle) => write!(f, "Outcome::{handle:?}"),
        }
    }
}

impl<T: Send + 'static> Outcome<T> {
    /// Wait for the outcome, whatever its shape.
    pub async fn resolve(self) -> Result<T, Failure> {
        match self {
            Outcome::Value(result) => result,
            Outcome::Promise(promise) => promise.await,
            Outcome::Handle(handle) => {
                tokio::task::spawn_blocking(move || handle.wait()).await.map_err(crate::executor::join_failure)?
            }
        }
    }
}

/// Applies fault-tolerance pipelines to governed calls.
///
/// Cloning is cheap; clones share the pipeline cache, the circuit breaker registry and every
/// other collaborator.
#[derive(Clone)]
pub struct FaultTolerance {
    env: Arc<Environment>,
}

impl fmt::Debug for FaultTolerance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultTolerance")
            .field("offload", &self.env.offload)
            .field("pipelines", &self.env.cache.len())
            .field("circuit_breakers", &self.env.breakers.names())
            .finish()
    }
}

impl FaultTolerance {
    pub fn builder() -> FaultToleranceBuilder {
        FaultToleranceBuilder::new()
    }

    /// Registry of every circuit breaker built so far.
    pub fn circuit_breakers(&self) -> &CircuitBreakerMaintenance {
        &self.env.breakers
    }

    pub fn fallbacks(&self) -> &FallbackRegistry {
        &self.env.fallbacks
    }

    pub fn offload(&self) -> &OffloadPool {
        &self.env.offload
    }

    pub fn cache(&self) -> &StrategyCache {
        &self.env.cache
    }

    fn expect_model(
        site: &CallSite,
        descriptor: &PolicyDescriptor,
        invoked: ExecutionModel,
    ) -> Result<(), ConfigError> {
        let declared = descriptor.model();
        if declared == invoked {
            return Ok(());
        }
        Err(ConfigError::ExecutionModelMismatch {
            call_site: site.to_string(),
            declared: declared.name(),
            invoked: invoked.name(),
        })
    }

    /// The cached blocking chain of `site`.
    pub fn blocking_chain<T: Send + 'static>(
        &self,
        site: &CallSite,
        descriptor: &PolicyDescriptor,
    ) -> Result<SyncChain<T>, ConfigError> {
        Self::expect_model(site, descriptor, ExecutionModel::Blocking)?;
        self.env.cache.get_or_build(site, || pipeline::blocking::build::<T>(&self.env, site, descriptor))
    }

    /// The cached promise chain of `site`, whose declared container must be `A`.
    pub fn promise_chain<T, A>(&self, site: &CallSite, descriptor: &PolicyDescriptor) -> Result<AsyncChain<T>, ConfigError>
    where
        T: Send + 'static,
        A: AsyncType<T>,
    {
        Self::expect_model(site, descriptor, ExecutionModel::Promise)?;
        if let ReturnType::Promise(declared) = descriptor.return_type {
            if declared != A::NAME {
                return Err(ConfigError::ExecutionModelMismatch {
                    call_site: site.to_string(),
                    declared,
                    invoked: A::NAME,
                });
            }
        }
        self.env.cache.get_or_build(site, || pipeline::promise::build::<T, A>(&self.env, site, descriptor))
    }

    /// The cached handle chain of `site`.
    pub fn handle_chain<T: Send + 'static>(
        &self,
        site: &CallSite,
        descriptor: &PolicyDescriptor,
    ) -> Result<SyncChain<T>, ConfigError> {
        Self::expect_model(site, descriptor, ExecutionModel::Handle)?;
        self.env.cache.get_or_build(site, || pipeline::handle::build::<T>(&self.env, site, descriptor))
    }

    /// Run `work` through the pipeline of `site`, in the shape of the unit of work.
    ///
    /// Configuration errors, including a unit of work whose shape does not match the declared
    /// execution model, are reported through the returned outcome.
    pub fn dispatch<T: Send + 'static>(
        &self,
        site: &CallSite,
        descriptor: &PolicyDescriptor,
        invocation: Option<Invocation>,
        work: UnitOfWork<T>,
    ) -> Outcome<T> {
        debug!(call_site = %site, declared = %descriptor.model(), invoked = %work.model(), "dispatching");
        match work {
            UnitOfWork::Blocking(work) => Outcome::Value(self.run_blocking(site, descriptor, invocation, work)),
            UnitOfWork::Promise(work) => {
                Outcome::Promise(self.run_promise::<T, Promise<T>, _>(site, descriptor, invocation, move || work()))
            }
            UnitOfWork::Handle(work) => Outcome::Handle(self.run_handle(site, descriptor, invocation, work)),
        }
    }

    /// Governed blocking call.
    pub fn call<T, F>(&self, site: &CallSite, descriptor: &PolicyDescriptor, work: F) -> Result<T, Failure>
    where
        T: Send + 'static,
        F: Fn() -> Result<T, Failure> + Send + Sync + 'static,
    {
        self.run_blocking(site, descriptor, None, Arc::new(work))
    }

    /// Governed call returning the canonical [`Promise`].
    pub fn call_async<T, F>(&self, site: &CallSite, descriptor: &PolicyDescriptor, work: F) -> Promise<T>
    where
        T: Send + 'static,
        F: Fn() -> Promise<T> + Send + Sync + 'static,
    {
        self.run_promise::<T, Promise<T>, F>(site, descriptor, None, work)
    }

    /// Governed call returning the promise container `A`.
    pub fn call_async_as<T, A, F>(&self, site: &CallSite, descriptor: &PolicyDescriptor, work: F) -> A
    where
        T: Send + 'static,
        A: AsyncType<T>,
        F: Fn() -> A + Send + Sync + 'static,
    {
        self.run_promise::<T, A, F>(site, descriptor, None, work)
    }

    /// Governed call returning a [`Handle`]. Returns immediately; the chain runs on the offload
    /// pool, and cancelling the handle cancels the chain.
    pub fn call_handle<T, F>(&self, site: &CallSite, descriptor: &PolicyDescriptor, work: F) -> Handle<T>
    where
        T: Send + 'static,
        F: Fn() -> Result<Handle<T>, Failure> + Send + Sync + 'static,
    {
        self.run_handle(site, descriptor, None, Arc::new(work))
    }

    fn run_blocking<T: Send + 'static>(
        &self,
        site: &CallSite,
        descriptor: &PolicyDescriptor,
        invocation: Option<Invocation>,
        work: Arc<SyncWork<T>>,
    ) -> Result<T, Failure> {
        let chain = self.blocking_chain::<T>(site, descriptor)?;
        let ctx = InvocationContext::new(work);
        if let Some(invocation) = invocation {
            ctx.extensions().insert(invocation);
        }
        chain.apply(&ctx)
    }

    fn run_promise<T, A, F>(
        &self,
        site: &CallSite,
        descriptor: &PolicyDescriptor,
        invocation: Option<Invocation>,
        work: F,
    ) -> A
    where
        T: Send + 'static,
        A: AsyncType<T>,
        F: Fn() -> A + Send + Sync + 'static,
    {
        let chain = match self.promise_chain::<T, A>(site, descriptor) {
            Ok(chain) => chain,
            Err(error) => return A::from_promise(failed(error.into()), &self.env.offload),
        };
        let work: Arc<AsyncWork<T>> = Arc::new(move || work().into_promise());
        let ctx = InvocationContext::new(work);
        if let Some(invocation) = invocation {
            ctx.extensions().insert(invocation);
        }
        A::from_promise(chain.apply(&ctx), &self.env.offload)
    }

    fn run_handle<T: Send + 'static>(
        &self,
        site: &CallSite,
        descriptor: &PolicyDescriptor,
        invocation: Option<Invocation>,
        work: Arc<HandleWork<T>>,
    ) -> Handle<T> {
        let chain = match self.handle_chain::<T>(site, descriptor) {
            Ok(chain) => chain,
            Err(error) => return Handle::failed(error.into()),
        };
        let work: Arc<SyncWork<T>> = Arc::new(move || work()?.wait());
        let ctx = InvocationContext::new(work);
        if let Some(invocation) = invocation {
            ctx.extensions().insert(invocation);
        }
        let cancellation = ctx.cancellation().clone();
        self.env.offload.submit(move || chain.apply(&ctx)).with_cancellation(cancellation)
    }
}

/// Configures the collaborators of a [`FaultTolerance`].
pub struct FaultToleranceBuilder {
    offload: Option<OffloadPool>,
    metrics: Arc<dyn MetricsProvider>,
    request_context: Arc<dyn RequestContextController>,
    event_loop: Arc<dyn EventLoop>,
    fallbacks: FallbackRegistry,
    sleeper: Arc<dyn Sleeper>,
    blocking_sleeper: Arc<dyn BlockingSleeper>,
    clock: Arc<dyn Clock>,
    breakers: CircuitBreakerMaintenance,
}

impl FaultToleranceBuilder {
    pub fn new() -> Self {
        Self {
            offload: None,
            metrics: Arc::new(NoopMetrics),
            request_context: Arc::new(NoRequestContext),
            event_loop: Arc::new(NoEventLoop),
            fallbacks: FallbackRegistry::new(),
            sleeper: Arc::new(TokioSleeper),
            blocking_sleeper: Arc::new(ThreadSleeper),
            clock: Arc::new(MonotonicClock::default()),
            breakers: CircuitBreakerMaintenance::new(),
        }
    }

    /// Pool for offloaded chains, blocking helpers and handle-model calls.
    ///
    /// Defaults to the runtime of the thread calling [`build`](Self::build), or a dedicated
    /// runtime when there is none.
    pub fn offload(mut self, pool: OffloadPool) -> Self {
        self.offload = Some(pool);
        self
    }

    pub fn metrics(mut self, provider: impl MetricsProvider + 'static) -> Self {
        self.metrics = Arc::new(provider);
        self
    }

    pub fn request_context(mut self, controller: impl RequestContextController + 'static) -> Self {
        self.request_context = Arc::new(controller);
        self
    }

    pub fn event_loop(mut self, event_loop: impl EventLoop + 'static) -> Self {
        self.event_loop = Arc::new(event_loop);
        self
    }

    pub fn fallbacks(mut self, registry: FallbackRegistry) -> Self {
        self.fallbacks = registry;
        self
    }

    /// Timer used between retries of promise and handle chains.
    pub fn sleeper(mut self, sleeper: impl Sleeper + 'static) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Timer used between retries of blocking chains.
    pub fn blocking_sleeper(mut self, sleeper: impl BlockingSleeper + 'static) -> Self {
        self.blocking_sleeper = Arc::new(sleeper);
        self
    }

    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn circuit_breakers(mut self, registry: CircuitBreakerMaintenance) -> Self {
        self.breakers = registry;
        self
    }

    pub fn build(self) -> std::io::Result<FaultTolerance> {
        let offload = match self.offload.or_else(OffloadPool::current) {
            Some(pool) => pool,
            None => OffloadPool::dedicated(std::thread::available_parallelism().map_or(2, |n| n.get()))?,
        };
        Ok(FaultTolerance {
            env: Arc::new(Environment {
                offload,
                metrics: self.metrics,
                request_context: self.request_context,
                event_loop: self.event_loop,
                fallbacks: self.fallbacks,
                sleeper: self.sleeper,
                blocking_sleeper: self.blocking_sleeper,
                clock: self.clock,
                breakers: self.breakers,
                cache: StrategyCache::new(),
            }),
        })
    }
}

impl Default for FaultToleranceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FaultToleranceBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultToleranceBuilder")
            .field("offload", &self.offload)
            .field("metrics", &self.metrics)
            .field("event_loop", &self.event_loop)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tolerance() -> FaultTolerance {
        FaultTolerance::builder().offload(OffloadPool::dedicated(2).unwrap()).build().unwrap()
    }

    #[test]
    fn mismatched_work_shape_is_a_configuration_error() {
        let ft = tolerance();
        let site = CallSite::new("Svc", "op");
        let outcome = ft.dispatch(&site, &PolicyDescriptor::handle(), None, UnitOfWork::Blocking(Arc::new(|| Ok(1u8))));
        let failure = match outcome {
            Outcome::Value(Err(failure)) => failure,
            other => panic!("expected a failed value, got {other:?}"),
        };
        assert!(matches!(
            failure.downcast_ref::<ConfigError>(),
            Some(ConfigError::ExecutionModelMismatch { declared: "handle", invoked: "blocking", .. })
        ));
    }

    #[tokio::test]
    async fn promise_container_must_match_the_declaration() {
        let ft = tolerance();
        let site = CallSite::new("Svc", "op");
        let descriptor = PolicyDescriptor::non_blocking().with_promise_type("JoinHandle");
        let failure = ft
            .call_async(&site, &descriptor, || Box::pin(async { Ok(1u8) }) as Promise<u8>)
            .await
            .unwrap_err();
        assert!(matches!(
            failure.downcast_ref::<ConfigError>(),
            Some(ConfigError::ExecutionModelMismatch { declared: "JoinHandle", invoked: "Promise", .. })
        ));
    }

    #[test]
    fn cancelling_the_handle_releases_a_pending_retry() {
        let ft = tolerance();
        let site = CallSite::new("Svc", "op");
        let descriptor = PolicyDescriptor::handle().with_retry(
            crate::config::RetryConfig::default()
                .delay(crate::time::DurationSpec::seconds(30))
                .jitter(crate::time::DurationSpec::ZERO),
        );
        let started = std::time::Instant::now();
        let handle = ft.call_handle(&site, &descriptor, || -> Result<Handle<u8>, Failure> { Err(Failure::msg("down")) });
        std::thread::sleep(std::time::Duration::from_millis(50));

        assert!(handle.cancel());
        assert_eq!(handle.wait().unwrap_err().to_string(), "down");
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }
}
