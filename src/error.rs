//! Failure types surfaced by fault-tolerance pipelines.
//!
//! Every layer of a pipeline speaks [`Failure`], a cheaply clonable wrapper around any
//! `std::error::Error`. The concrete error types in this module are the distinct categories a
//! caller can tell apart via [`Failure::kind`] or [`Failure::is`]:
//!
//! - [`TimeoutError`]: a timeout layer fired.
//! - [`CircuitBreakerOpenError`]: the circuit breaker short-circuited the call.
//! - [`BulkheadRejectedError`]: the bulkhead had no capacity left.
//! - [`ConfigError`]: the pipeline for a call-site could not be constructed.
//! - [`ExecutionError`]: offloaded work panicked, was cancelled, or abandoned its handle.
//!
//! Anything else is an application failure and flows through the pipeline untouched.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A failure travelling through a pipeline.
///
/// `Failure` deliberately does not implement `std::error::Error` itself so that any error type
/// converts into it with `?`.
#[derive(Clone)]
pub struct Failure {
    inner: Arc<dyn std::error::Error + Send + Sync + 'static>,
}

impl Failure {
    /// Wrap an error.
    pub fn new<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self { inner: Arc::new(error) }
    }

    /// Wrap an already shared error.
    pub fn from_arc(inner: Arc<dyn std::error::Error + Send + Sync + 'static>) -> Self {
        Self { inner }
    }

    /// Failure carrying only a message; classified as an application failure.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(MessageError(message.into()))
    }

    /// `true` if the wrapped error is an `E`.
    pub fn is<E: std::error::Error + 'static>(&self) -> bool {
        self.inner.is::<E>()
    }

    /// Borrow the wrapped error as an `E`.
    pub fn downcast_ref<E: std::error::Error + 'static>(&self) -> Option<&E> {
        self.inner.downcast_ref::<E>()
    }

    /// Borrow the wrapped error.
    pub fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        &*self.inner
    }

    /// Category of this failure.
    pub fn kind(&self) -> FailureKind {
        if self.is::<TimeoutError>() {
            FailureKind::Timeout
        } else if self.is::<CircuitBreakerOpenError>() {
            FailureKind::CircuitBreakerOpen
        } else if self.is::<BulkheadRejectedError>() {
            FailureKind::BulkheadRejected
        } else if self.is::<ConfigError>() {
            FailureKind::Configuration
        } else if self.is::<ExecutionError>() {
            FailureKind::Execution
        } else {
            FailureKind::Application
        }
    }

    /// Check if this failure was produced by a timeout layer.
    pub fn is_timeout(&self) -> bool {
        self.kind() == FailureKind::Timeout
    }

    /// Check if this failure was produced by an open circuit breaker.
    pub fn is_circuit_open(&self) -> bool {
        self.kind() == FailureKind::CircuitBreakerOpen
    }

    /// Check if this failure was produced by a full bulkhead.
    pub fn is_bulkhead(&self) -> bool {
        self.kind() == FailureKind::BulkheadRejected
    }

    /// `true` if both failures wrap the very same error instance.
    pub fn ptr_eq(&self, other: &Failure) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<E> From<E> for Failure
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        Self::new(error)
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.inner, f)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.inner, f)
    }
}

impl AsRef<dyn std::error::Error + Send + Sync + 'static> for Failure {
    fn as_ref(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        &*self.inner
    }
}

/// Distinct, identifiable failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// A timeout layer fired.
    Timeout,
    /// The circuit breaker rejected the call.
    CircuitBreakerOpen,
    /// The bulkhead rejected the call.
    BulkheadRejected,
    /// The pipeline could not be constructed.
    Configuration,
    /// Offloaded execution failed outside the unit of work.
    Execution,
    /// The unit of work (or a fallback) failed.
    Application,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
struct MessageError(String);

/// The operation exceeded its time bound.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{name} timed out after {timeout:?}")]
pub struct TimeoutError {
    /// Name of the timeout layer, e.g. `Timeout[svc#call]`.
    pub name: String,
    /// Configured bound.
    pub timeout: Duration,
}

/// The circuit breaker is open (or out of half-open trial slots).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{name} circuit breaker open")]
pub struct CircuitBreakerOpenError {
    /// Name of the breaker layer.
    pub name: String,
}

/// The bulkhead had no free execution slot and no free queue slot.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{name} rejected: {max_concurrent} executing, {queue_size} queued")]
pub struct BulkheadRejectedError {
    /// Name of the bulkhead layer.
    pub name: String,
    /// Maximum concurrent executions.
    pub max_concurrent: usize,
    /// Maximum queued waiters (0 for the permit-style bulkhead).
    pub queue_size: usize,
}

/// Failures raised while executing on the offload pool.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    /// The offloaded task panicked.
    #[error("offloaded task panicked")]
    Panicked,
    /// The offloaded task was cancelled before completion.
    #[error("offloaded task cancelled")]
    Cancelled,
    /// The producer of a handle went away without completing it.
    #[error("handle abandoned before completion")]
    Abandoned,
}

/// Errors raised while building a pipeline. Fatal for the call-site.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A policy parameter is out of its valid range.
    #[error("invalid {policy} parameter `{parameter}`: {reason}")]
    InvalidParameter {
        /// Policy owning the parameter.
        policy: &'static str,
        /// Parameter name.
        parameter: &'static str,
        /// What is wrong with it.
        reason: String,
    },
    /// Converting a declared duration to milliseconds overflowed.
    #[error("duration of {amount} {unit} does not fit in milliseconds")]
    DurationOverflow {
        /// Declared magnitude.
        amount: u64,
        /// Declared unit.
        unit: &'static str,
    },
    /// The declared fallback method does not exist with a matching signature.
    #[error("could not obtain fallback method `{method}` for {call_site}")]
    FallbackMethodNotFound {
        /// Declared method name.
        method: String,
        /// Call-site label.
        call_site: String,
    },
    /// Neither a fallback method nor a fallback handler could be resolved.
    #[error("could not obtain fallback handler for {call_site}")]
    FallbackHandlerNotFound {
        /// Call-site label.
        call_site: String,
    },
    /// Both a fallback method and a fallback handler were declared.
    #[error("fallback for {call_site} declares both a method and a handler")]
    ConflictingFallback {
        /// Call-site label.
        call_site: String,
    },
    /// The fallback produces a type the call-site cannot return.
    #[error("fallback `{fallback}` for {call_site} returns `{found}`, expected `{expected}`")]
    FallbackReturnType {
        /// Fallback method or handler name.
        fallback: String,
        /// Call-site label.
        call_site: String,
        /// Expected result type.
        expected: &'static str,
        /// Declared result type of the fallback.
        found: &'static str,
    },
    /// A circuit breaker with this name is already registered.
    #[error("circuit breaker name `{0}` is already registered")]
    DuplicateCircuitBreakerName(String),
    /// The unit of work does not match the execution model of the descriptor.
    #[error("{call_site} is declared as {declared} but was invoked as {invoked}")]
    ExecutionModelMismatch {
        /// Call-site label.
        call_site: String,
        /// Model derived from the descriptor.
        declared: &'static str,
        /// Shape of the supplied unit of work.
        invoked: &'static str,
    },
    /// A cached pipeline was requested with a different result type.
    #[error("pipeline cached for {0} has a different result type")]
    CachedTypeMismatch(String),
}

/// Error raised by the body of a resolved fallback method.
///
/// The fallback function unwraps exactly one level of this wrapper before propagating.
#[derive(Debug, Clone, thiserror::Error)]
#[error("fallback method `{method}` failed: {cause}")]
pub struct InvocationTargetError {
    /// Method that raised the error.
    pub method: String,
    /// The underlying failure.
    pub cause: Failure,
}

/// A resolved fallback method could not be invoked at all.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("error during fallback method `{method}` invocation: {reason}")]
pub struct FallbackInvocationError {
    /// Method that could not be invoked.
    pub method: String,
    /// Reason.
    pub reason: String,
}

impl ConfigError {
    pub(crate) fn invalid(
        policy: &'static str,
        parameter: &'static str,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidParameter { policy, parameter, reason: reason.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn kinds_are_distinct() {
        let timeout = Failure::new(TimeoutError {
            name: "Timeout[x]".into(),
            timeout: Duration::from_millis(5),
        });
        let open = Failure::new(CircuitBreakerOpenError { name: "CircuitBreaker[x]".into() });
        let full = Failure::new(BulkheadRejectedError {
            name: "Bulkhead[x]".into(),
            max_concurrent: 2,
            queue_size: 1,
        });
        let config = Failure::new(ConfigError::DuplicateCircuitBreakerName("cb".into()));
        let app = Failure::new(io::Error::new(io::ErrorKind::Other, "boom"));

        assert_eq!(timeout.kind(), FailureKind::Timeout);
        assert_eq!(open.kind(), FailureKind::CircuitBreakerOpen);
        assert_eq!(full.kind(), FailureKind::BulkheadRejected);
        assert_eq!(config.kind(), FailureKind::Configuration);
        assert_eq!(app.kind(), FailureKind::Application);
        assert!(timeout.is_timeout());
        assert!(open.is_circuit_open());
        assert!(full.is_bulkhead());
    }

    #[test]
    fn question_mark_converts_errors() {
        fn parse(s: &str) -> Result<u32, Failure> {
            Ok(s.parse::<u32>()?)
        }
        let err = parse("nope").unwrap_err();
        assert!(err.is::<std::num::ParseIntError>());
        assert_eq!(err.kind(), FailureKind::Application);
    }

    #[test]
    fn clones_share_the_error() {
        let f = Failure::msg("x");
        let g = f.clone();
        assert!(f.ptr_eq(&g));
        assert_eq!(g.to_string(), "x");
    }

    #[test]
    fn timeout_display_names_the_layer() {
        let err = TimeoutError { name: "Timeout[svc#op]".into(), timeout: Duration::from_millis(50) };
        let msg = err.to_string();
        assert!(msg.contains("Timeout[svc#op]"));
        assert!(msg.contains("50ms"));
    }
}
