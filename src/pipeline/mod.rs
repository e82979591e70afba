//! Pipeline assembly: one decorated chain per call-site, built once from its
//! [`PolicyDescriptor`].
//!
//! Policies are applied innermost first in a fixed order:
//!
//! ```text
//! metrics( fallback( retry( circuit_breaker( timeout( bulkhead( invoke ))))))
//! ```
//!
//! so a retry re-enters the circuit breaker on every attempt, the timeout bounds a single
//! attempt, and the fallback only sees the final failure. Each execution model contributes the
//! decorator variants of its own shape through [`ModelSteps`] and adds the model-specific steps
//! (offloading, request scope, event loop) around the shared policy sequence.

pub(crate) mod blocking;
pub(crate) mod handle;
pub(crate) mod promise;

use crate::cache::StrategyCache;
use crate::call_site::CallSite;
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerLayer};
use crate::circuit_breaker_registry::{CircuitBreakerMaintenance, PendingRegistration};
use crate::clock::Clock;
use crate::config::{BulkheadConfig, FallbackConfig, PolicyDescriptor};
use crate::context::{EventLoop, RequestContextController};
use crate::error::ConfigError;
use crate::executor::OffloadPool;
use crate::fallback::{resolve, FallbackLayer, FallbackRegistry};
use crate::metrics::{MetricsLayer, MetricsProvider};
use crate::retry::RetryLayer;
use crate::sleeper::{BlockingSleeper, Sleeper};
use crate::timeout::TimeoutLayer;
use std::any::Any;
use std::sync::Arc;
use tracing::debug;

/// Collaborators shared by every pipeline of one [`FaultTolerance`](crate::FaultTolerance).
#[derive(Debug)]
pub(crate) struct Environment {
    pub(crate) offload: OffloadPool,
    pub(crate) metrics: Arc<dyn MetricsProvider>,
    pub(crate) request_context: Arc<dyn RequestContextController>,
    pub(crate) event_loop: Arc<dyn EventLoop>,
    pub(crate) fallbacks: FallbackRegistry,
    pub(crate) sleeper: Arc<dyn Sleeper>,
    pub(crate) blocking_sleeper: Arc<dyn BlockingSleeper>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) breakers: CircuitBreakerMaintenance,
    pub(crate) cache: StrategyCache,
}

/// Decorator variants of one execution model.
pub(crate) trait ModelSteps<T> {
    type Chain;

    fn bulkhead(&self, chain: Self::Chain, name: String, config: &BulkheadConfig) -> Self::Chain;

    fn timeout(&self, chain: Self::Chain, layer: TimeoutLayer) -> Self::Chain;

    fn circuit_breaker(&self, chain: Self::Chain, layer: CircuitBreakerLayer) -> Self::Chain;

    fn retry(&self, chain: Self::Chain, layer: RetryLayer) -> Self::Chain;

    fn fallback(
        &self,
        chain: Self::Chain,
        env: &Environment,
        site: &CallSite,
        config: &FallbackConfig,
    ) -> Result<Self::Chain, ConfigError>;

    fn metrics(&self, chain: Self::Chain, layer: MetricsLayer) -> Self::Chain;
}

/// Wrap `chain` with every policy the descriptor declares.
///
/// A declared circuit breaker is registered with the maintenance registry only after the whole
/// chain was built, so a call-site whose construction fails leaves no trace behind.
pub(crate) fn assemble_policies<T, M>(
    steps: &M,
    env: &Environment,
    site: &CallSite,
    descriptor: &PolicyDescriptor,
    mut chain: M::Chain,
) -> Result<M::Chain, ConfigError>
where
    M: ModelSteps<T>,
{
    descriptor.validate(site)?;

    if let Some(config) = &descriptor.bulkhead {
        chain = steps.bulkhead(chain, site.label("Bulkhead"), config);
    }

    if let Some(config) = &descriptor.timeout {
        let layer = TimeoutLayer::new(site.label("Timeout"), config.value.to_duration()?, env.offload.clone());
        chain = steps.timeout(chain, layer);
    }

    let mut registration = None;
    if let Some(config) = &descriptor.circuit_breaker {
        let name = env.breakers.prepare(config.name.as_deref())?;
        let breaker = Arc::new(CircuitBreaker::new(site.label("CircuitBreaker"), config, env.clock.clone())?);
        registration = Some(PendingRegistration::new(env.breakers.clone(), name, breaker.clone()));
        chain = steps.circuit_breaker(chain, CircuitBreakerLayer::new(breaker));
    }

    if let Some(config) = &descriptor.retry {
        let layer = RetryLayer::new(site.label("Retry"), config, env.clock.clone())?
            .with_sleeper(env.sleeper.clone())
            .with_blocking_sleeper(env.blocking_sleeper.clone());
        chain = steps.retry(chain, layer);
    }

    if let Some(config) = &descriptor.fallback {
        chain = steps.fallback(chain, env, site, config)?;
    }

    if descriptor.metrics && env.metrics.is_enabled() {
        let recorder = env.cache.recorder(site, || env.metrics.recorder(site));
        chain = steps.metrics(chain, MetricsLayer::new(recorder));
    }

    if let Some(registration) = registration {
        registration.commit()?;
    }
    debug!(call_site = %site, model = %descriptor.model(), "pipeline built");
    Ok(chain)
}

/// Resolve the recovery path of `site` and wrap it in a layer producing `R`.
pub(crate) fn fallback_layer<R: Any + Send + 'static>(
    env: &Environment,
    site: &CallSite,
    config: &FallbackConfig,
) -> Result<FallbackLayer<R>, ConfigError> {
    let function = resolve::resolve::<R>(&env.fallbacks, site, config)?;
    Ok(FallbackLayer::new(site.clone(), function, config.apply_on.clone(), config.skip_on.clone()))
}
