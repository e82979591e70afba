use super::{assemble_policies, fallback_layer, Environment, ModelSteps};
use crate::bulkhead::SemaphoreBulkheadLayer;
use crate::call_site::CallSite;
use crate::circuit_breaker::CircuitBreakerLayer;
use crate::config::{BulkheadConfig, FallbackConfig, PolicyDescriptor};
use crate::error::ConfigError;
use crate::metrics::MetricsLayer;
use crate::retry::RetryLayer;
use crate::strategy::{Invoke, SyncChain};
use crate::timeout::TimeoutLayer;
use std::sync::Arc;
use tower_layer::Layer;

/// The caller's thread runs the whole chain; the bulkhead rejects instead of queueing.
pub(crate) struct BlockingSteps;

impl<T: Send + 'static> ModelSteps<T> for BlockingSteps {
    type Chain = SyncChain<T>;

    fn bulkhead(&self, chain: SyncChain<T>, name: String, config: &BulkheadConfig) -> SyncChain<T> {
        Arc::new(SemaphoreBulkheadLayer::new(name, config.value).layer(chain))
    }

    fn timeout(&self, chain: SyncChain<T>, layer: TimeoutLayer) -> SyncChain<T> {
        Arc::new(layer.layer(chain))
    }

    fn circuit_breaker(&self, chain: SyncChain<T>, layer: CircuitBreakerLayer) -> SyncChain<T> {
        Arc::new(layer.layer(chain))
    }

    fn retry(&self, chain: SyncChain<T>, layer: RetryLayer) -> SyncChain<T> {
        Arc::new(layer.layer(chain))
    }

    fn fallback(
        &self,
        chain: SyncChain<T>,
        env: &Environment,
        site: &CallSite,
        config: &FallbackConfig,
    ) -> Result<SyncChain<T>, ConfigError> {
        Ok(Arc::new(fallback_layer::<T>(env, site, config)?.layer(chain)))
    }

    fn metrics(&self, chain: SyncChain<T>, layer: MetricsLayer) -> SyncChain<T> {
        Arc::new(layer.layer(chain))
    }
}

pub(crate) fn build<T: Send + 'static>(
    env: &Environment,
    site: &CallSite,
    descriptor: &PolicyDescriptor,
) -> Result<SyncChain<T>, ConfigError> {
    assemble_policies(&BlockingSteps, env, site, descriptor, Arc::new(Invoke) as SyncChain<T>)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CircuitBreakerConfig, RetryConfig};
    use crate::context::InvocationContext;
    use crate::error::Failure;
    use crate::executor::OffloadPool;
    use crate::pipeline::test_support::environment;
    use crate::strategy::SyncContext;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn zero_policy_chain_returns_the_work_result() {
        let env = environment(OffloadPool::dedicated(1).unwrap());
        let chain = build::<u32>(&env, &CallSite::new("Svc", "op"), &PolicyDescriptor::blocking()).unwrap();
        let ctx: SyncContext<u32> = InvocationContext::blocking(|| Ok(5));
        assert_eq!(chain.apply(&ctx).unwrap(), 5);
    }

    #[test]
    fn retry_reenters_the_circuit_breaker() {
        let env = environment(OffloadPool::dedicated(1).unwrap());
        let descriptor = PolicyDescriptor::blocking()
            .with_circuit_breaker(CircuitBreakerConfig::default().request_volume_threshold(2).failure_ratio(1.0))
            .with_retry(RetryConfig::default().max_retries(5));
        let chain = build::<u32>(&env, &CallSite::new("Svc", "op"), &descriptor).unwrap();

        let attempts = Arc::new(AtomicUsize::new(0));
        let ctx: SyncContext<u32> = {
            let attempts = attempts.clone();
            InvocationContext::blocking(move || {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(Failure::msg("down"))
            })
        };

        assert!(chain.apply(&ctx).unwrap_err().is_circuit_open());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(env.breakers.names().len(), 1);
    }

    #[test]
    fn failed_construction_registers_nothing() {
        let env = environment(OffloadPool::dedicated(1).unwrap());
        let descriptor = PolicyDescriptor::blocking()
            .with_circuit_breaker(CircuitBreakerConfig::default())
            .with_fallback(crate::config::FallbackConfig::method("missing"));
        let err = build::<u32>(&env, &CallSite::new("Svc", "op"), &descriptor).err().unwrap();
        assert!(matches!(err, ConfigError::FallbackMethodNotFound { .. }));
        assert!(env.breakers.names().is_empty());
    }
}
