//! Metrics collection for governed calls.
//!
//! The metrics layer is the outermost policy step: it observes the externally visible outcome
//! of everything below it and reports to a [`MetricsRecorder`]. Recorders come from a
//! [`MetricsProvider`], one per call-site; the step is left out entirely when the provider is
//! disabled.
//!
//! Built-in providers:
//! - [`NoopMetrics`]: disabled (default).
//! - [`MemoryMetrics`]: in-memory counters per call-site, for tests and inspection.
//! - [`LogMetrics`]: every record becomes a structured `tracing` event.

use crate::async_types::Promise;
use crate::call_site::CallSite;
use crate::error::{Failure, FailureKind};
use crate::strategy::{AsyncChain, AsyncContext, AsyncStrategy, Strategy, SyncChain, SyncContext};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tower_layer::Layer;

/// Which admission policy turned the call away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectionKind {
    Bulkhead,
    CircuitBreakerOpen,
}

/// Metrics sink for one call-site.
pub trait MetricsRecorder: Send + Sync + std::fmt::Debug {
    fn record_success(&self, duration: Duration);
    fn record_failure(&self, duration: Duration, cause: &Failure);
    fn record_rejection(&self, kind: RejectionKind);
}

/// Source of per-call-site recorders.
pub trait MetricsProvider: Send + Sync + std::fmt::Debug {
    /// `false` leaves the metrics step out of every pipeline.
    fn is_enabled(&self) -> bool;

    /// Recorder for `site`. Called once per call-site.
    fn recorder(&self, site: &CallSite) -> Arc<dyn MetricsRecorder>;
}

/// Provider that collects nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsRecorder for NoopMetrics {
    fn record_success(&self, _duration: Duration) {}
    fn record_failure(&self, _duration: Duration, _cause: &Failure) {}
    fn record_rejection(&self, _kind: RejectionKind) {}
}

impl MetricsProvider for NoopMetrics {
    fn is_enabled(&self) -> bool {
        false
    }

    fn recorder(&self, _site: &CallSite) -> Arc<dyn MetricsRecorder> {
        Arc::new(NoopMetrics)
    }
}

/// Counters of a [`MemoryRecorder`] at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub successes: u64,
    pub failures: u64,
    pub bulkhead_rejections: u64,
    pub circuit_breaker_rejections: u64,
    /// Summed duration of successful and failed calls.
    pub total_time: Duration,
}

/// Lock-free in-memory counters.
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    successes: AtomicU64,
    failures: AtomicU64,
    bulkhead_rejections: AtomicU64,
    circuit_breaker_rejections: AtomicU64,
    total_nanos: AtomicU64,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    fn add_time(&self, duration: Duration) {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.total_nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            bulkhead_rejections: self.bulkhead_rejections.load(Ordering::Relaxed),
            circuit_breaker_rejections: self.circuit_breaker_rejections.load(Ordering::Relaxed),
            total_time: Duration::from_nanos(self.total_nanos.load(Ordering::Relaxed)),
        }
    }
}

impl MetricsRecorder for MemoryRecorder {
    fn record_success(&self, duration: Duration) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.add_time(duration);
    }

    fn record_failure(&self, duration: Duration, _cause: &Failure) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.add_time(duration);
    }

    fn record_rejection(&self, kind: RejectionKind) {
        let counter = match kind {
            RejectionKind::Bulkhead => &self.bulkhead_rejections,
            RejectionKind::CircuitBreakerOpen => &self.circuit_breaker_rejections,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Provider handing out one [`MemoryRecorder`] per call-site. Clones share the recorders.
#[derive(Debug, Clone, Default)]
pub struct MemoryMetrics {
    recorders: Arc<Mutex<HashMap<CallSite, Arc<MemoryRecorder>>>>,
}

impl MemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorder created for `site`, if its pipeline was built.
    pub fn recorder_for(&self, site: &CallSite) -> Option<Arc<MemoryRecorder>> {
        self.recorders.lock().unwrap_or_else(|e| e.into_inner()).get(site).cloned()
    }

    /// Number of recorders handed out so far.
    pub fn len(&self) -> usize {
        self.recorders.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MetricsProvider for MemoryMetrics {
    fn is_enabled(&self) -> bool {
        true
    }

    fn recorder(&self, site: &CallSite) -> Arc<dyn MetricsRecorder> {
        self.recorders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(site.clone())
            .or_insert_with(|| Arc::new(MemoryRecorder::new()))
            .clone()
    }
}

/// Provider writing every record as a `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMetrics;

impl MetricsProvider for LogMetrics {
    fn is_enabled(&self) -> bool {
        true
    }

    fn recorder(&self, site: &CallSite) -> Arc<dyn MetricsRecorder> {
        Arc::new(LogRecorder { call_site: site.to_string() })
    }
}

#[derive(Debug, Clone)]
pub struct LogRecorder {
    call_site: String,
}

impl MetricsRecorder for LogRecorder {
    fn record_success(&self, duration: Duration) {
        tracing::info!(call_site = %self.call_site, duration_us = duration.as_micros() as u64, "call succeeded");
    }

    fn record_failure(&self, duration: Duration, cause: &Failure) {
        tracing::info!(
            call_site = %self.call_site,
            duration_us = duration.as_micros() as u64,
            kind = ?cause.kind(),
            error = %cause,
            "call failed"
        );
    }

    fn record_rejection(&self, kind: RejectionKind) {
        tracing::info!(call_site = %self.call_site, ?kind, "call rejected");
    }
}

/// Outermost policy step reporting to a recorder.
#[derive(Debug, Clone)]
pub struct MetricsLayer {
    recorder: Arc<dyn MetricsRecorder>,
}

impl MetricsLayer {
    pub fn new(recorder: Arc<dyn MetricsRecorder>) -> Self {
        Self { recorder }
    }

    fn observe<T>(&self, started: Instant, result: &Result<T, Failure>) {
        let elapsed = started.elapsed();
        match result {
            Ok(_) => self.recorder.record_success(elapsed),
            Err(failure) => match failure.kind() {
                FailureKind::BulkheadRejected => self.recorder.record_rejection(RejectionKind::Bulkhead),
                FailureKind::CircuitBreakerOpen => {
                    self.recorder.record_rejection(RejectionKind::CircuitBreakerOpen)
                }
                _ => self.recorder.record_failure(elapsed, failure),
            },
        }
    }
}

impl<T: Send + 'static> Layer<SyncChain<T>> for MetricsLayer {
    type Service = BlockingMetrics<T>;

    fn layer(&self, inner: SyncChain<T>) -> Self::Service {
        BlockingMetrics { inner, layer: self.clone() }
    }
}

impl<T: Send + 'static> Layer<AsyncChain<T>> for MetricsLayer {
    type Service = AsyncMetrics<T>;

    fn layer(&self, inner: AsyncChain<T>) -> Self::Service {
        AsyncMetrics { inner, layer: self.clone() }
    }
}

pub struct BlockingMetrics<T> {
    inner: SyncChain<T>,
    layer: MetricsLayer,
}

impl<T: Send + 'static> Strategy<T> for BlockingMetrics<T> {
    fn apply(&self, ctx: &SyncContext<T>) -> Result<T, Failure> {
        let started = Instant::now();
        let result = self.inner.apply(ctx);
        self.layer.observe(started, &result);
        result
    }
}

pub struct AsyncMetrics<T> {
    inner: AsyncChain<T>,
    layer: MetricsLayer,
}

impl<T: Send + 'static> AsyncStrategy<T> for AsyncMetrics<T> {
    fn apply(&self, ctx: &AsyncContext<T>) -> Promise<T> {
        let started = Instant::now();
        let promise = self.inner.apply(ctx);
        let layer = self.layer.clone();
        Box::pin(async move {
            let result = promise.await;
            layer.observe(started, &result);
            result
        })
    }
}
