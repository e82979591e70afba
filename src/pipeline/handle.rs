//! Handle chains run on an offload thread; waiting for a handle is just blocking there.

use super::promise::RequestScopeLayer;
use super::{assemble_policies, fallback_layer, Environment, ModelSteps};
use crate::bulkhead::QueueingBulkheadLayer;
use crate::call_site::CallSite;
use crate::circuit_breaker::CircuitBreakerLayer;
use crate::config::{BulkheadConfig, FallbackConfig, PolicyDescriptor};
use crate::error::ConfigError;
use crate::handle::Handle;
use crate::metrics::MetricsLayer;
use crate::retry::RetryLayer;
use crate::strategy::{Invoke, SyncChain};
use crate::timeout::TimeoutLayer;
use std::sync::Arc;
use tower_layer::Layer;

pub(crate) struct HandleSteps;

impl<T: Send + 'static> ModelSteps<T> for HandleSteps {
    type Chain = SyncChain<T>;

    fn bulkhead(&self, chain: SyncChain<T>, name: String, config: &BulkheadConfig) -> SyncChain<T> {
        Arc::new(QueueingBulkheadLayer::new(name, config.value, config.waiting_task_queue).layer(chain))
    }

    fn timeout(&self, chain: SyncChain<T>, layer: TimeoutLayer) -> SyncChain<T> {
        Arc::new(layer.layer(chain))
    }

    fn circuit_breaker(&self, chain: SyncChain<T>, layer: CircuitBreakerLayer) -> SyncChain<T> {
        Arc::new(layer.layer(chain))
    }

    fn retry(&self, chain: SyncChain<T>, layer: RetryLayer) -> SyncChain<T> {
        Arc::new(layer.for_handles().layer(chain))
    }

    fn fallback(
        &self,
        chain: SyncChain<T>,
        env: &Environment,
        site: &CallSite,
        config: &FallbackConfig,
    ) -> Result<SyncChain<T>, ConfigError> {
        Ok(Arc::new(fallback_layer::<Handle<T>>(env, site, config)?.for_handles().layer(chain)))
    }

    fn metrics(&self, chain: SyncChain<T>, layer: MetricsLayer) -> SyncChain<T> {
        Arc::new(layer.layer(chain))
    }
}

/// Handle chain of `site`. The unit of work it invokes already waits for the user's handle.
pub(crate) fn build<T: Send + 'static>(
    env: &Environment,
    site: &CallSite,
    descriptor: &PolicyDescriptor,
) -> Result<SyncChain<T>, ConfigError> {
    let chain = assemble_policies(&HandleSteps, env, site, descriptor, Arc::new(Invoke) as SyncChain<T>)?;
    Ok(Arc::new(RequestScopeLayer::new(env.request_context.clone()).layer(chain)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FallbackConfig, TimeoutConfig};
    use crate::context::{ExecutionContext, InvocationContext};
    use crate::error::Failure;
    use crate::executor::OffloadPool;
    use crate::pipeline::test_support::environment;
    use crate::strategy::SyncContext;
    use crate::time::DurationSpec;

    #[test]
    fn timeout_bounds_the_wait_for_the_handle() {
        let env = environment(OffloadPool::dedicated(2).unwrap());
        let descriptor =
            PolicyDescriptor::handle().with_timeout(TimeoutConfig::default().value(DurationSpec::millis(20)));
        let chain = build::<u8>(&env, &CallSite::new("Svc", "op"), &descriptor).unwrap();

        let ctx: SyncContext<u8> = InvocationContext::blocking(|| {
            let (completer, handle) = Handle::channel();
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(200));
                completer.complete(Ok(1));
            });
            handle.wait()
        });
        assert!(chain.apply(&ctx).unwrap_err().is_timeout());
    }

    #[test]
    fn fallback_handle_replaces_the_failure() {
        let env = environment(OffloadPool::dedicated(1).unwrap());
        env.fallbacks.register_handler("cached", |_ctx: &ExecutionContext| -> Result<Handle<u8>, Failure> {
            Ok(Handle::completed(3))
        });
        let descriptor = PolicyDescriptor::handle().with_fallback(FallbackConfig::handler("cached"));
        let chain = build::<u8>(&env, &CallSite::new("Svc", "op"), &descriptor).unwrap();

        let ctx: SyncContext<u8> = InvocationContext::blocking(|| Handle::failed(Failure::msg("down")).wait());
        assert_eq!(chain.apply(&ctx).unwrap(), 3);
    }
}
