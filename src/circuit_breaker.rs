//! Circuit breaker: stop dispatching to a failing dependency for a cooldown period.
//!
//! State machine
//! - **Closed**: calls pass; every outcome lands in a rolling window of `request_volume_threshold`
//!   entries. Once the window is full and holds at least `ceil(failure_ratio * volume)` failures
//!   the breaker opens.
//! - **Open**: calls are rejected with [`CircuitBreakerOpenError`] until `delay` has elapsed since
//!   opening; the next call then moves the breaker to half-open.
//! - **HalfOpen**: up to `success_threshold` trial calls pass. That many successes close the
//!   breaker with a fresh window; any counted failure reopens it and restarts the delay.
//!
//! A failure counts only if it is in `fail_on` and not in `skip_on`; everything else is recorded
//! as a success. Outcomes of calls admitted before the most recent transition are ignored.
//!
//! Breakers can also be forced open or closed through the
//! [maintenance registry](crate::circuit_breaker_registry::CircuitBreakerMaintenance).

use crate::async_types::Promise;
use crate::clock::Clock;
use crate::config::CircuitBreakerConfig;
use crate::error::{CircuitBreakerOpenError, ConfigError, Failure};
use crate::strategy::{AsyncChain, AsyncContext, AsyncStrategy, Strategy, SyncChain, SyncContext};
use crate::throwables::ThrowableSet;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tower_layer::Layer;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Short-circuits calls until the delay elapses.
    Open,
    /// Trial mode allowing a limited number of calls to test recovery.
    HalfOpen,
    /// Held open by an operator until reset.
    ForcedOpen,
    /// Held closed by an operator until reset; outcomes are not recorded.
    ForcedClosed,
}

/// Callback invoked after every state transition.
pub type StateListener = Arc<dyn Fn(CircuitState) + Send + Sync>;

#[derive(Debug)]
struct RollingWindow {
    outcomes: VecDeque<bool>,
    failures: usize,
    size: usize,
}

impl RollingWindow {
    fn new(size: usize) -> Self {
        Self { outcomes: VecDeque::with_capacity(size), failures: 0, size }
    }

    /// Record one outcome; returns the failure count once the window is full.
    fn record(&mut self, failure: bool) -> Option<usize> {
        self.outcomes.push_back(failure);
        if failure {
            self.failures += 1;
        }
        if self.outcomes.len() > self.size && self.outcomes.pop_front() == Some(true) {
            self.failures -= 1;
        }
        (self.outcomes.len() == self.size).then_some(self.failures)
    }
}

#[derive(Debug)]
enum Machine {
    Closed(RollingWindow),
    Open { since: u64 },
    HalfOpen { trials: usize, successes: usize },
    ForcedOpen,
    ForcedClosed,
}

impl Machine {
    fn state(&self) -> CircuitState {
        match self {
            Machine::Closed(_) => CircuitState::Closed,
            Machine::Open { .. } => CircuitState::Open,
            Machine::HalfOpen { .. } => CircuitState::HalfOpen,
            Machine::ForcedOpen => CircuitState::ForcedOpen,
            Machine::ForcedClosed => CircuitState::ForcedClosed,
        }
    }
}

struct Inner {
    machine: Machine,
    generation: u64,
}

/// Admission of one call, tied to the state it was admitted under.
///
/// Dropped without [`record`](Permit::record) (the call was cancelled or panicked), a half-open
/// permit hands its trial slot back.
#[must_use]
pub(crate) struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    recorded: bool,
}

impl Permit<'_> {
    /// Record the outcome of the admitted call.
    pub(crate) fn record(mut self, failure: Option<&Failure>) {
        self.recorded = true;
        self.breaker.record(self.generation, failure);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.recorded {
            self.breaker.release(self.generation);
        }
    }
}

impl fmt::Debug for Permit<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Permit").field("breaker", &self.breaker.name).field("generation", &self.generation).finish()
    }
}

/// A circuit breaker instance. One per call-site, shared by every invocation of it.
pub struct CircuitBreaker {
    name: String,
    delay_ms: u64,
    volume: usize,
    failure_threshold: usize,
    success_threshold: usize,
    fail_on: ThrowableSet,
    skip_on: ThrowableSet,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
    listeners: Mutex<Vec<StateListener>>,
}

impl CircuitBreaker {
    /// Build a breaker from validated parameters.
    pub fn new(
        name: impl Into<String>,
        config: &CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        let volume = config.request_volume_threshold.max(1);
        Ok(Self {
            name: name.into(),
            delay_ms: config.delay.to_millis()?,
            volume,
            failure_threshold: config.failure_threshold(),
            success_threshold: config.success_threshold.max(1),
            fail_on: config.fail_on.clone(),
            skip_on: config.skip_on.clone(),
            clock,
            inner: Mutex::new(Inner { machine: Machine::Closed(RollingWindow::new(volume)), generation: 0 }),
            listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state. An open breaker whose delay has elapsed reports `Open` until the next call.
    pub fn state(&self) -> CircuitState {
        self.lock().machine.state()
    }

    /// Back to closed with an empty window.
    pub fn reset(&self) {
        self.transition_to(Machine::Closed(RollingWindow::new(self.volume)));
    }

    /// Reject every call until reset.
    pub fn force_open(&self) {
        self.transition_to(Machine::ForcedOpen);
    }

    /// Admit every call until reset.
    pub fn force_closed(&self) {
        self.transition_to(Machine::ForcedClosed);
    }

    /// Register a callback for state transitions.
    pub fn on_state_change<F>(&self, listener: F)
    where
        F: Fn(CircuitState) + Send + Sync + 'static,
    {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner()).push(Arc::new(listener));
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn rejected(&self) -> Failure {
        Failure::new(CircuitBreakerOpenError { name: self.name.clone() })
    }

    fn transition_to(&self, machine: Machine) {
        let state = machine.state();
        {
            let mut inner = self.lock();
            inner.machine = machine;
            inner.generation += 1;
        }
        match state {
            CircuitState::ForcedOpen => tracing::warn!(breaker = %self.name, "Circuit breaker forced open"),
            _ => tracing::info!(breaker = %self.name, ?state, "Circuit breaker state set by operator"),
        }
        self.notify(state);
    }

    fn notify(&self, state: CircuitState) {
        let listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner()).clone();
        for listener in listeners {
            listener(state);
        }
    }

    /// Admit a call or reject it.
    pub(crate) fn try_acquire(&self) -> Result<Permit<'_>, Failure> {
        let mut inner = self.lock();
        let now = self.clock.now_millis();
        let mut moved = None;
        match &mut inner.machine {
            Machine::Closed(_) | Machine::ForcedClosed => {}
            Machine::ForcedOpen => return Err(self.rejected()),
            Machine::Open { since } => {
                if now.saturating_sub(*since) < self.delay_ms {
                    return Err(self.rejected());
                }
                inner.machine = Machine::HalfOpen { trials: 1, successes: 0 };
                inner.generation += 1;
                moved = Some(CircuitState::HalfOpen);
            }
            Machine::HalfOpen { trials, .. } => {
                if *trials >= self.success_threshold {
                    return Err(self.rejected());
                }
                *trials += 1;
                tracing::debug!(breaker = %self.name, in_flight = *trials, "Circuit breaker: half-open trial");
            }
        }
        let permit = Permit { breaker: self, generation: inner.generation, recorded: false };
        drop(inner);
        if let Some(state) = moved {
            tracing::info!(breaker = %self.name, "Circuit breaker → half-open");
            self.notify(state);
        }
        Ok(permit)
    }

    /// Give back the trial slot of a call that ended without an outcome.
    fn release(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        if let Machine::HalfOpen { trials, .. } = &mut inner.machine {
            *trials = trials.saturating_sub(1);
            tracing::debug!(breaker = %self.name, in_flight = *trials, "Circuit breaker: trial abandoned");
        }
    }

    fn counts_as_failure(&self, failure: Option<&Failure>) -> bool {
        match failure {
            None => false,
            Some(f) => !self.skip_on.includes(f) && self.fail_on.includes(f),
        }
    }

    fn record(&self, generation: u64, failure: Option<&Failure>) {
        let failed = self.counts_as_failure(failure);
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        let now = self.clock.now_millis();
        let next = match &mut inner.machine {
            Machine::Closed(window) => match window.record(failed) {
                Some(failures) if failures >= self.failure_threshold => {
                    tracing::error!(
                        breaker = %self.name,
                        failures,
                        threshold = self.failure_threshold,
                        "Circuit breaker → open"
                    );
                    Some(Machine::Open { since: now })
                }
                _ => None,
            },
            Machine::HalfOpen { successes, .. } => {
                if failed {
                    tracing::warn!(breaker = %self.name, "Circuit breaker: trial failed → open");
                    Some(Machine::Open { since: now })
                } else {
                    *successes += 1;
                    if *successes >= self.success_threshold {
                        tracing::info!(breaker = %self.name, "Circuit breaker → closed");
                        Some(Machine::Closed(RollingWindow::new(self.volume)))
                    } else {
                        None
                    }
                }
            }
            Machine::Open { .. } | Machine::ForcedOpen | Machine::ForcedClosed => None,
        };
        if let Some(machine) = next {
            let state = machine.state();
            inner.machine = machine;
            inner.generation += 1;
            drop(inner);
            self.notify(state);
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("delay_ms", &self.delay_ms)
            .field("volume", &self.volume)
            .field("failure_threshold", &self.failure_threshold)
            .field("success_threshold", &self.success_threshold)
            .finish()
    }
}

/// Wraps a chain with a shared breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerLayer {
    breaker: Arc<CircuitBreaker>,
}

impl CircuitBreakerLayer {
    pub fn new(breaker: Arc<CircuitBreaker>) -> Self {
        Self { breaker }
    }
}

impl<T: Send + 'static> Layer<SyncChain<T>> for CircuitBreakerLayer {
    type Service = BlockingCircuitBreaker<T>;

    fn layer(&self, inner: SyncChain<T>) -> Self::Service {
        BlockingCircuitBreaker { inner, breaker: self.breaker.clone() }
    }
}

impl<T: Send + 'static> Layer<AsyncChain<T>> for CircuitBreakerLayer {
    type Service = AsyncCircuitBreaker<T>;

    fn layer(&self, inner: AsyncChain<T>) -> Self::Service {
        AsyncCircuitBreaker { inner, breaker: self.breaker.clone() }
    }
}

pub struct BlockingCircuitBreaker<T> {
    inner: SyncChain<T>,
    breaker: Arc<CircuitBreaker>,
}

impl<T: Send + 'static> Strategy<T> for BlockingCircuitBreaker<T> {
    fn apply(&self, ctx: &SyncContext<T>) -> Result<T, Failure> {
        let permit = self.breaker.try_acquire()?;
        let result = self.inner.apply(ctx);
        permit.record(result.as_ref().err());
        result
    }
}

pub struct AsyncCircuitBreaker<T> {
    inner: AsyncChain<T>,
    breaker: Arc<CircuitBreaker>,
}

impl<T: Send + 'static> AsyncStrategy<T> for AsyncCircuitBreaker<T> {
    fn apply(&self, ctx: &AsyncContext<T>) -> Promise<T> {
        let breaker = self.breaker.clone();
        let inner = self.inner.clone();
        let ctx = ctx.clone();
        Box::pin(async move {
            let permit = breaker.try_acquire()?;
            let result = inner.apply(&ctx).await;
            permit.record(result.as_ref().err());
            result
        })
    }
}
