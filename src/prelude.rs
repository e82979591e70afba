//! Convenient re-exports for common faultline types.
pub use crate::{
    async_types::{AsyncType, Promise},
    call_site::{CallSite, ParamType},
    circuit_breaker::CircuitState,
    config::{
        BulkheadConfig, CircuitBreakerConfig, FallbackConfig, PolicyDescriptor, RetryConfig, TimeoutConfig,
    },
    context::{Arguments, ExecutionContext, Invocation},
    dispatch::{FaultTolerance, Outcome, UnitOfWork},
    error::{ConfigError, Failure, FailureKind},
    fallback::{FallbackRegistry, MethodRef, TypeInfo},
    handle::Handle,
    throwables::{ErrorClass, ThrowableSet},
    time::{DurationSpec, TimeUnit},
};
