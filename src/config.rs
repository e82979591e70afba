//! Policy descriptors: which policies govern a call-site and with which parameters.
//!
//! A descriptor is plain data assembled with chained setters and checked by
//! [`PolicyDescriptor::validate`] when the call-site's pipeline is first built. Pipelines only
//! ever read descriptors.
//!
//! ```rust
//! use faultline::{CircuitBreakerConfig, DurationSpec, PolicyDescriptor, RetryConfig};
//!
//! let descriptor = PolicyDescriptor::blocking()
//!     .with_retry(RetryConfig::default().max_retries(2).delay(DurationSpec::millis(10)))
//!     .with_circuit_breaker(CircuitBreakerConfig::default().request_volume_threshold(4));
//! assert!(descriptor.validate(&faultline::CallSite::new("Svc", "op")).is_ok());
//! ```

use crate::async_types::CANONICAL_PROMISE;
use crate::call_site::CallSite;
use crate::error::ConfigError;
use crate::throwables::ThrowableSet;
use crate::time::DurationSpec;
use std::fmt;

/// Declared result shape of a call-site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReturnType {
    /// A plain value, produced by blocking the caller.
    Value,
    /// A non-blocking promise; the name identifies the promise container.
    Promise(&'static str),
    /// A pollable/blockable [`Handle`](crate::Handle).
    Handle,
}

/// The three caller-visible execution shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionModel {
    /// The caller blocks until completion.
    Blocking,
    /// The caller receives a promise and attaches continuations.
    Promise,
    /// The caller receives a handle and may block on it explicitly.
    Handle,
}

impl ExecutionModel {
    /// Classify a descriptor. Exactly one model applies.
    pub fn classify(descriptor: &PolicyDescriptor) -> Self {
        match descriptor.return_type {
            ReturnType::Promise(_) => ExecutionModel::Promise,
            ReturnType::Handle if descriptor.asynchronous => ExecutionModel::Handle,
            _ => ExecutionModel::Blocking,
        }
    }

    /// Human-readable model name.
    pub fn name(self) -> &'static str {
        match self {
            ExecutionModel::Blocking => "blocking",
            ExecutionModel::Promise => "promise",
            ExecutionModel::Handle => "handle",
        }
    }
}

impl fmt::Display for ExecutionModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Concurrency admission.
#[derive(Debug, Clone)]
pub struct BulkheadConfig {
    /// Maximum concurrent executions.
    pub value: usize,
    /// Maximum queued waiters (promise and handle models only).
    pub waiting_task_queue: usize,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self { value: 10, waiting_task_queue: 10 }
    }
}

impl BulkheadConfig {
    pub fn value(mut self, value: usize) -> Self {
        self.value = value;
        self
    }

    pub fn waiting_task_queue(mut self, size: usize) -> Self {
        self.waiting_task_queue = size;
        self
    }
}

/// Wall-clock bound on a single attempt.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// The bound.
    pub value: DurationSpec,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { value: DurationSpec::millis(1000) }
    }
}

impl TimeoutConfig {
    pub fn value(mut self, value: DurationSpec) -> Self {
        self.value = value;
        self
    }
}

/// Circuit breaker parameters.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Registration name; a unique one is generated when absent.
    pub name: Option<String>,
    /// Time spent open before probing.
    pub delay: DurationSpec,
    /// Size of the rolling window.
    pub request_volume_threshold: usize,
    /// Failure ratio in the full window that opens the breaker.
    pub failure_ratio: f64,
    /// Successful trials needed to close again.
    pub success_threshold: usize,
    /// Failures that count against the breaker.
    pub fail_on: ThrowableSet,
    /// Failures that are treated as successes.
    pub skip_on: ThrowableSet,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: None,
            delay: DurationSpec::millis(5000),
            request_volume_threshold: 20,
            failure_ratio: 0.5,
            success_threshold: 1,
            fail_on: ThrowableSet::all(),
            skip_on: ThrowableSet::empty(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn delay(mut self, delay: DurationSpec) -> Self {
        self.delay = delay;
        self
    }

    pub fn request_volume_threshold(mut self, volume: usize) -> Self {
        self.request_volume_threshold = volume;
        self
    }

    pub fn failure_ratio(mut self, ratio: f64) -> Self {
        self.failure_ratio = ratio;
        self
    }

    pub fn success_threshold(mut self, threshold: usize) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn fail_on(mut self, set: ThrowableSet) -> Self {
        self.fail_on = set;
        self
    }

    pub fn skip_on(mut self, set: ThrowableSet) -> Self {
        self.skip_on = set;
        self
    }

    /// Failures in a full window needed to open.
    pub(crate) fn failure_threshold(&self) -> usize {
        (self.failure_ratio * self.request_volume_threshold as f64).ceil() as usize
    }
}

/// Exponential growth of the retry delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoffConfig {
    /// Multiplier applied per retry.
    pub factor: u32,
    /// Upper bound on a single delay.
    pub max_delay: DurationSpec,
}

/// Retry parameters.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt; `-1` means unbounded.
    pub max_retries: i64,
    /// Delay before each retry.
    pub delay: DurationSpec,
    /// Total time budget across attempts; zero means unbounded.
    pub max_duration: DurationSpec,
    /// Bound of the symmetric random jitter; zero disables it.
    pub jitter: DurationSpec,
    /// Optional exponential growth of `delay`.
    pub exponential: Option<ExponentialBackoffConfig>,
    /// Failures that trigger a retry.
    pub retry_on: ThrowableSet,
    /// Failures that stop retrying immediately.
    pub abort_on: ThrowableSet,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: DurationSpec::ZERO,
            max_duration: DurationSpec::millis(180_000),
            jitter: DurationSpec::millis(200),
            exponential: None,
            retry_on: ThrowableSet::all(),
            abort_on: ThrowableSet::empty(),
        }
    }
}

impl RetryConfig {
    pub fn max_retries(mut self, retries: i64) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn delay(mut self, delay: DurationSpec) -> Self {
        self.delay = delay;
        self
    }

    pub fn max_duration(mut self, duration: DurationSpec) -> Self {
        self.max_duration = duration;
        self
    }

    pub fn jitter(mut self, jitter: DurationSpec) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn exponential(mut self, factor: u32, max_delay: DurationSpec) -> Self {
        self.exponential = Some(ExponentialBackoffConfig { factor, max_delay });
        self
    }

    pub fn retry_on(mut self, set: ThrowableSet) -> Self {
        self.retry_on = set;
        self
    }

    pub fn abort_on(mut self, set: ThrowableSet) -> Self {
        self.abort_on = set;
        self
    }
}

/// Fallback parameters. At most one of `method` and `handler` may be set; with neither, the
/// call-site has no resolvable fallback.
#[derive(Debug, Clone)]
pub struct FallbackConfig {
    /// Name of a method on the owning type with the call-site's signature.
    pub method: Option<String>,
    /// Name of a registered fallback handler.
    pub handler: Option<String>,
    /// Failures the fallback recovers from.
    pub apply_on: ThrowableSet,
    /// Failures the fallback never handles.
    pub skip_on: ThrowableSet,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            method: None,
            handler: None,
            apply_on: ThrowableSet::all(),
            skip_on: ThrowableSet::empty(),
        }
    }
}

impl FallbackConfig {
    /// Fallback resolved from a method on the owning type.
    pub fn method(name: impl Into<String>) -> Self {
        Self { method: Some(name.into()), ..Self::default() }
    }

    /// Fallback resolved from a registered handler.
    pub fn handler(name: impl Into<String>) -> Self {
        Self { handler: Some(name.into()), ..Self::default() }
    }

    pub fn apply_on(mut self, set: ThrowableSet) -> Self {
        self.apply_on = set;
        self
    }

    pub fn skip_on(mut self, set: ThrowableSet) -> Self {
        self.skip_on = set;
        self
    }
}

/// Everything the pipeline builders need to know about one call-site.
#[derive(Debug, Clone)]
pub struct PolicyDescriptor {
    /// Declared asynchronous.
    pub asynchronous: bool,
    /// Run the chain body on the offload pool (promise model).
    pub thread_offload: bool,
    /// Declared result shape.
    pub return_type: ReturnType,
    /// Collect metrics when the provider is enabled.
    pub metrics: bool,
    pub bulkhead: Option<BulkheadConfig>,
    pub timeout: Option<TimeoutConfig>,
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    pub retry: Option<RetryConfig>,
    pub fallback: Option<FallbackConfig>,
}

impl PolicyDescriptor {
    fn with_shape(asynchronous: bool, thread_offload: bool, return_type: ReturnType) -> Self {
        Self {
            asynchronous,
            thread_offload,
            return_type,
            metrics: true,
            bulkhead: None,
            timeout: None,
            circuit_breaker: None,
            retry: None,
            fallback: None,
        }
    }

    /// A synchronous call returning a plain value.
    pub fn blocking() -> Self {
        Self::with_shape(false, false, ReturnType::Value)
    }

    /// An asynchronous call returning the canonical promise, offloaded to the pool.
    pub fn promise() -> Self {
        Self::with_shape(true, true, ReturnType::Promise(CANONICAL_PROMISE))
    }

    /// A promise-returning call that stays on the calling thread.
    pub fn non_blocking() -> Self {
        Self::with_shape(false, false, ReturnType::Promise(CANONICAL_PROMISE))
    }

    /// An asynchronous call returning a [`Handle`](crate::Handle).
    pub fn handle() -> Self {
        Self::with_shape(true, true, ReturnType::Handle)
    }

    /// Override the declared promise container name.
    pub fn with_promise_type(mut self, name: &'static str) -> Self {
        self.return_type = ReturnType::Promise(name);
        self
    }

    pub fn with_thread_offload(mut self, offload: bool) -> Self {
        self.thread_offload = offload;
        self
    }

    pub fn with_metrics(mut self, enabled: bool) -> Self {
        self.metrics = enabled;
        self
    }

    pub fn with_bulkhead(mut self, config: BulkheadConfig) -> Self {
        self.bulkhead = Some(config);
        self
    }

    pub fn with_timeout(mut self, config: TimeoutConfig) -> Self {
        self.timeout = Some(config);
        self
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry = Some(config);
        self
    }

    pub fn with_fallback(mut self, config: FallbackConfig) -> Self {
        self.fallback = Some(config);
        self
    }

    /// Execution model of this descriptor.
    pub fn model(&self) -> ExecutionModel {
        ExecutionModel::classify(self)
    }

    /// Check every parameter block. Called once per call-site at pipeline construction.
    pub fn validate(&self, site: &CallSite) -> Result<(), ConfigError> {
        match self.return_type {
            ReturnType::Value if self.asynchronous => {
                return Err(ConfigError::invalid(
                    "execution",
                    "return_type",
                    "asynchronous call-sites must return a promise or a handle",
                ));
            }
            ReturnType::Handle if !self.asynchronous => {
                return Err(ConfigError::invalid(
                    "execution",
                    "asynchronous",
                    "handle-returning call-sites must be asynchronous",
                ));
            }
            _ => {}
        }

        if let Some(bulkhead) = &self.bulkhead {
            if bulkhead.value < 1 {
                return Err(ConfigError::invalid("bulkhead", "value", "must be >= 1"));
            }
            if bulkhead.waiting_task_queue < 1 {
                return Err(ConfigError::invalid("bulkhead", "waiting_task_queue", "must be >= 1"));
            }
        }

        if let Some(timeout) = &self.timeout {
            if timeout.value.to_millis()? == 0 {
                return Err(ConfigError::invalid("timeout", "value", "must be > 0"));
            }
        }

        if let Some(cb) = &self.circuit_breaker {
            cb.delay.to_millis()?;
            if !(0.0..=1.0).contains(&cb.failure_ratio) {
                return Err(ConfigError::invalid(
                    "circuit breaker",
                    "failure_ratio",
                    format!("{} is outside [0, 1]", cb.failure_ratio),
                ));
            }
            if cb.request_volume_threshold < 1 {
                return Err(ConfigError::invalid(
                    "circuit breaker",
                    "request_volume_threshold",
                    "must be >= 1",
                ));
            }
            if cb.success_threshold < 1 {
                return Err(ConfigError::invalid(
                    "circuit breaker",
                    "success_threshold",
                    "must be >= 1",
                ));
            }
            if cb.fail_on.is_empty() {
                return Err(ConfigError::invalid("circuit breaker", "fail_on", "must not be empty"));
            }
        }

        if let Some(retry) = &self.retry {
            if retry.max_retries < -1 {
                return Err(ConfigError::invalid("retry", "max_retries", "must be >= -1"));
            }
            let delay = retry.delay.to_millis()?;
            let max_duration = retry.max_duration.to_millis()?;
            retry.jitter.to_millis()?;
            if max_duration != 0 && max_duration <= delay {
                return Err(ConfigError::invalid(
                    "retry",
                    "max_duration",
                    format!("{max_duration}ms must be greater than the delay of {delay}ms"),
                ));
            }
            if let Some(exp) = &retry.exponential {
                if exp.factor < 1 {
                    return Err(ConfigError::invalid("retry", "factor", "must be >= 1"));
                }
                if exp.max_delay.to_millis()? < delay {
                    return Err(ConfigError::invalid(
                        "retry",
                        "max_delay",
                        "must not be shorter than the delay",
                    ));
                }
            }
            if retry.retry_on.is_empty() {
                return Err(ConfigError::invalid("retry", "retry_on", "must not be empty"));
            }
        }

        if let Some(fallback) = &self.fallback {
            if fallback.method.is_some() && fallback.handler.is_some() {
                return Err(ConfigError::ConflictingFallback { call_site: site.to_string() });
            }
            if fallback.apply_on.is_empty() {
                return Err(ConfigError::invalid("fallback", "apply_on", "must not be empty"));
            }
        }

        Ok(())
    }
}
