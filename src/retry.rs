//! Retry policy implementation
//!
//! Semantics:
//! - `max_retries` counts retries after the initial attempt; `None` retries without bound.
//! - A failure in `abort_on` stops immediately; a failure outside `retry_on` is returned as is.
//! - `max_duration` bounds the total time spent across attempts and delays (zero disables it).
//! - The delay before retry `n` is `backoff.delay(n)` shifted by symmetric jitter.
//! - Sleeper controls how delays are applied: blocking chains park the thread through a
//!   [`BlockingSleeper`], promise and handle chains wait on a timer through a [`Sleeper`].
//!   Tests inject `InstantSleeper`/`TrackingSleeper`.
//!
//! Invariants:
//! - Attempts never exceed `max_retries + 1`.
//! - The last failure is returned unchanged once retrying stops.
//! - A cancelled invocation is not retried and its pending delay is abandoned.

use crate::async_types::Promise;
use crate::backoff::Backoff;
use crate::clock::{Clock, Stopwatch};
use crate::config::RetryConfig;
use crate::error::{ConfigError, Failure};
use crate::jitter::Jitter;
use crate::sleeper::{BlockingSleeper, Sleeper, ThreadSleeper, TokioSleeper};
use crate::strategy::{AsyncChain, AsyncContext, AsyncStrategy, Strategy, SyncChain, SyncContext};
use crate::throwables::ThrowableSet;
use std::sync::Arc;
use std::time::Duration;
use tower_layer::Layer;
use tracing::debug;

/// Retry decorator factory shared by the three execution models.
#[derive(Clone)]
pub struct RetryLayer {
    name: Arc<str>,
    max_retries: Option<usize>,
    max_duration_ms: u64,
    backoff: Backoff,
    jitter: Jitter,
    retry_on: ThrowableSet,
    abort_on: ThrowableSet,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    blocking_sleeper: Arc<dyn BlockingSleeper>,
}

impl std::fmt::Debug for RetryLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryLayer")
            .field("name", &self.name)
            .field("max_retries", &self.max_retries)
            .field("max_duration_ms", &self.max_duration_ms)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .field("retry_on", &self.retry_on)
            .field("abort_on", &self.abort_on)
            .finish()
    }
}

impl RetryLayer {
    /// Build from a validated parameter block.
    pub fn new(
        name: impl Into<Arc<str>>,
        config: &RetryConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        let delay = config.delay.to_duration()?;
        let backoff = match &config.exponential {
            Some(exp) => Backoff::exponential(delay, exp.factor, exp.max_delay.to_duration()?),
            None => Backoff::constant(delay),
        };
        backoff.validate()?;
        Ok(Self {
            name: name.into(),
            max_retries: usize::try_from(config.max_retries).ok(),
            max_duration_ms: config.max_duration.to_millis()?,
            backoff,
            jitter: Jitter::random(config.jitter.to_duration()?),
            retry_on: config.retry_on.clone(),
            abort_on: config.abort_on.clone(),
            clock,
            sleeper: Arc::new(TokioSleeper),
            blocking_sleeper: Arc::new(ThreadSleeper),
        })
    }

    /// Use a custom timer sleeper (promise and handle chains).
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Use a custom thread sleeper (blocking chains).
    pub fn with_blocking_sleeper(mut self, sleeper: Arc<dyn BlockingSleeper>) -> Self {
        self.blocking_sleeper = sleeper;
        self
    }

    /// Variant for handle chains: blocking strategies that wait on the timer sleeper.
    pub fn for_handles(self) -> HandleRetryLayer {
        HandleRetryLayer(self)
    }

    /// Delay before the next attempt, or `None` if `failure` must be returned.
    fn next_delay(&self, retries: usize, failure: &Failure, watch: &Stopwatch) -> Option<Duration> {
        if self.abort_on.includes(failure) {
            debug!(retry = %self.name, "failure is in abort_on; not retrying");
            return None;
        }
        if !self.retry_on.includes(failure) {
            return None;
        }
        if self.max_retries.map_or(false, |max| retries >= max) {
            debug!(retry = %self.name, retries, "retries exhausted");
            return None;
        }
        if self.out_of_time(watch) {
            debug!(retry = %self.name, max_duration_ms = self.max_duration_ms, "retry budget exhausted");
            return None;
        }
        let attempt = retries + 1;
        let delay = self.jitter.apply(self.backoff.delay(attempt));
        debug!(
            retry = %self.name,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %failure,
            "retrying after failure"
        );
        Some(delay)
    }

    fn out_of_time(&self, watch: &Stopwatch) -> bool {
        self.max_duration_ms > 0 && watch.elapsed_millis() >= self.max_duration_ms
    }
}

impl<T: Send + 'static> Layer<SyncChain<T>> for RetryLayer {
    type Service = BlockingRetry<T>;

    fn layer(&self, inner: SyncChain<T>) -> Self::Service {
        BlockingRetry { inner, config: self.clone() }
    }
}

impl<T: Send + 'static> Layer<AsyncChain<T>> for RetryLayer {
    type Service = AsyncRetry<T>;

    fn layer(&self, inner: AsyncChain<T>) -> Self::Service {
        AsyncRetry { inner, config: self.clone() }
    }
}

/// [`RetryLayer`] for handle chains.
#[derive(Debug, Clone)]
pub struct HandleRetryLayer(RetryLayer);

impl<T: Send + 'static> Layer<SyncChain<T>> for HandleRetryLayer {
    type Service = HandleRetry<T>;

    fn layer(&self, inner: SyncChain<T>) -> Self::Service {
        HandleRetry { inner, config: self.0.clone() }
    }
}

/// Retries with a real thread sleep between attempts.
pub struct BlockingRetry<T> {
    inner: SyncChain<T>,
    config: RetryLayer,
}

impl<T: Send + 'static> Strategy<T> for BlockingRetry<T> {
    fn apply(&self, ctx: &SyncContext<T>) -> Result<T, Failure> {
        let config = &self.config;
        let watch = Stopwatch::start(config.clock.clone());
        let mut retries = 0;
        loop {
            let failure = match self.inner.apply(ctx) {
                Ok(value) => return Ok(value),
                Err(failure) => failure,
            };
            let Some(delay) = config.next_delay(retries, &failure, &watch) else {
                return Err(failure);
            };
            config.blocking_sleeper.sleep_blocking(delay);
            if ctx.is_cancelled() || config.out_of_time(&watch) {
                return Err(failure);
            }
            retries += 1;
        }
    }
}

/// Retries with a timer-scheduled delay between attempts.
pub struct AsyncRetry<T> {
    inner: AsyncChain<T>,
    config: RetryLayer,
}

async fn retry_async<T, F>(config: RetryLayer, ctx: AsyncContext<T>, attempt: F) -> Result<T, Failure>
where
    F: Fn(&AsyncContext<T>) -> Promise<T>,
{
    let watch = Stopwatch::start(config.clock.clone());
    let mut retries = 0;
    loop {
        let failure = match attempt(&ctx).await {
            Ok(value) => return Ok(value),
            Err(failure) => failure,
        };
        let Some(delay) = config.next_delay(retries, &failure, &watch) else {
            return Err(failure);
        };
        tokio::select! {
            _ = config.sleeper.sleep(delay) => {}
            _ = ctx.cancellation().cancelled() => return Err(failure),
        }
        if config.out_of_time(&watch) {
            return Err(failure);
        }
        retries += 1;
    }
}

impl<T: Send + 'static> AsyncStrategy<T> for AsyncRetry<T> {
    fn apply(&self, ctx: &AsyncContext<T>) -> Promise<T> {
        let inner = self.inner.clone();
        Box::pin(retry_async(self.config.clone(), ctx.clone(), move |ctx| inner.apply(ctx)))
    }
}

/// Retries inside a handle chain: runs on an offload thread and waits for the timer there.
pub struct HandleRetry<T> {
    inner: SyncChain<T>,
    config: RetryLayer,
}

impl<T: Send + 'static> Strategy<T> for HandleRetry<T> {
    fn apply(&self, ctx: &SyncContext<T>) -> Result<T, Failure> {
        let config = &self.config;
        let watch = Stopwatch::start(config.clock.clone());
        let mut retries = 0;
        loop {
            let failure = match self.inner.apply(ctx) {
                Ok(value) => return Ok(value),
                Err(failure) => failure,
            };
            let Some(delay) = config.next_delay(retries, &failure, &watch) else {
                return Err(failure);
            };
            let cancelled = futures::executor::block_on(async {
                tokio::select! {
                    _ = config.sleeper.sleep(delay) => false,
                    _ = ctx.cancellation().cancelled() => true,
                }
            });
            if cancelled || config.out_of_time(&watch) {
                return Err(failure);
            }
            retries += 1;
        }
    }
}
