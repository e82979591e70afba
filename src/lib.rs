#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # faultline
//!
//! Fault-tolerance pipelines for governed calls: bulkheads, timeouts, circuit breakers,
//! retries, fallbacks and metrics, composed once per call-site and cached.
//!
//! ## Features
//!
//! - **Three execution models**: blocking calls, promises (futures) and pollable handles
//! - **Fixed composition order**: retry re-enters the circuit breaker, timeouts bound one attempt
//! - **Per-call-site caching**: one pipeline, one breaker and one metrics recorder per call-site
//! - **Fallbacks** resolved by method name and signature, or through named handlers
//! - **Circuit breaker maintenance**: inspect, reset or force breakers by name
//! - **Tower integration** through [`layer::FaultToleranceLayer`]
//!
//! ## Quick Start
//!
//! ```rust
//! use faultline::prelude::*;
//!
//! let ft = FaultTolerance::builder().build().unwrap();
//! let site = CallSite::new("Inventory", "lookup");
//! let descriptor = PolicyDescriptor::blocking()
//!     .with_retry(RetryConfig::default().max_retries(2).jitter(DurationSpec::ZERO))
//!     .with_circuit_breaker(CircuitBreakerConfig::default().name("inventory"));
//!
//! let stock = ft.call(&site, &descriptor, || Ok::<_, Failure>(42u32)).unwrap();
//! assert_eq!(stock, 42);
//! assert_eq!(ft.circuit_breakers().state("inventory").unwrap(), CircuitState::Closed);
//! ```

pub mod async_types;
pub mod backoff;
pub mod bulkhead;
pub mod cache;
pub mod call_site;
pub mod circuit_breaker;
pub mod circuit_breaker_registry;
pub mod clock;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod fallback;
pub mod handle;
pub mod jitter;
pub mod layer;
pub mod metrics;
mod pipeline;
pub mod prelude;
pub mod retry;
pub mod sleeper;
pub mod strategy;
pub mod throwables;
pub mod time;
pub mod timeout;

// Re-exports
pub use async_types::{AsyncType, Promise, CANONICAL_PROMISE};
pub use backoff::Backoff;
pub use cache::StrategyCache;
pub use call_site::{CallSite, ParamType};
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use circuit_breaker_registry::{CircuitBreakerMaintenance, CircuitBreakerRegistryError};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{
    BulkheadConfig, CircuitBreakerConfig, ExecutionModel, FallbackConfig, PolicyDescriptor, RetryConfig,
    ReturnType, TimeoutConfig,
};
pub use context::{
    Arguments, EventLoop, ExecutionContext, Invocation, InvocationContext, NoEventLoop,
    NoRequestContext, RequestContextController, TokioEventLoop,
};
pub use dispatch::{FaultTolerance, FaultToleranceBuilder, Outcome, UnitOfWork};
pub use error::{
    BulkheadRejectedError, CircuitBreakerOpenError, ConfigError, ExecutionError, Failure, FailureKind,
    FallbackInvocationError, InvocationTargetError, TimeoutError,
};
pub use executor::OffloadPool;
pub use fallback::{FallbackHandler, FallbackRegistry, MethodOrigin, MethodRef, TypeInfo};
pub use handle::{Completer, Handle};
pub use jitter::Jitter;
pub use metrics::{LogMetrics, MemoryMetrics, MemoryRecorder, MetricsProvider, MetricsRecorder, NoopMetrics};
pub use sleeper::{BlockingSleeper, InstantSleeper, Sleeper, ThreadSleeper, TokioSleeper, TrackingSleeper};
pub use throwables::{ErrorClass, ThrowableSet};
pub use time::{DurationSpec, TimeUnit};
