//! Fallback: substitute a recovery result when a governed call fails in a matching way.
//!
//! The fallback applies to the final failure of everything below it (retries, circuit breaker,
//! timeout, bulkhead) if that failure is in `apply_on` and not in `skip_on`. Whatever the
//! recovery path returns or raises is propagated as is: it is never retried and never handed to
//! another fallback.
//!
//! The recovery path itself is resolved once per call-site by [`resolve`]: a fallback method
//! looked up by name and signature, or a named [`FallbackHandler`].

pub mod resolve;

use crate::async_types::Promise;
use crate::call_site::CallSite;
use crate::context::{ExecutionContext, Invocation};
use crate::error::Failure;
use crate::executor::OffloadPool;
use crate::handle::Handle;
use crate::strategy::{AsyncChain, AsyncContext, AsyncStrategy, Strategy, SyncChain, SyncContext};
use crate::throwables::ThrowableSet;
use std::sync::Arc;
use tower_layer::Layer;
use tracing::debug;

pub use resolve::{FallbackFn, FallbackHandler, FallbackRegistry, MethodOrigin, MethodRef, TypeInfo};

/// Wraps a chain with a recovery path producing `R`.
///
/// `R` is the call-site's result shape: the value itself for blocking chains, a [`Promise`] for
/// promise chains and a [`Handle`] for handle chains.
pub struct FallbackLayer<R> {
    name: Arc<str>,
    site: CallSite,
    function: FallbackFn<R>,
    apply_on: ThrowableSet,
    skip_on: ThrowableSet,
    offload: Option<OffloadPool>,
}

impl<R> Clone for FallbackLayer<R> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            site: self.site.clone(),
            function: self.function.clone(),
            apply_on: self.apply_on.clone(),
            skip_on: self.skip_on.clone(),
            offload: self.offload.clone(),
        }
    }
}

impl<R> std::fmt::Debug for FallbackLayer<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackLayer")
            .field("name", &self.name)
            .field("apply_on", &self.apply_on)
            .field("skip_on", &self.skip_on)
            .field("offloaded", &self.offload.is_some())
            .finish()
    }
}

impl<R: Send + 'static> FallbackLayer<R> {
    pub fn new(
        site: CallSite,
        function: FallbackFn<R>,
        apply_on: ThrowableSet,
        skip_on: ThrowableSet,
    ) -> Self {
        Self { name: site.label("Fallback").into(), site, function, apply_on, skip_on, offload: None }
    }

    /// Run the recovery path on `pool` instead of the thread that reported the failure.
    pub fn offloaded(mut self, pool: OffloadPool) -> Self {
        self.offload = Some(pool);
        self
    }

    /// Change the result shape of the recovery path.
    pub fn map<S, F>(self, convert: F) -> FallbackLayer<S>
    where
        S: 'static,
        F: Fn(R) -> S + Send + Sync + 'static,
    {
        let function = self.function;
        FallbackLayer {
            name: self.name,
            site: self.site,
            function: Arc::new(move |ctx: &ExecutionContext| function(ctx).map(&convert)),
            apply_on: self.apply_on,
            skip_on: self.skip_on,
            offload: self.offload,
        }
    }

    fn applies_to(&self, failure: &Failure) -> bool {
        self.apply_on.includes(failure) && !self.skip_on.includes(failure)
    }

    /// Execution context for the recovery path, or `None` if the failure must propagate.
    fn context_for(&self, failure: &Failure, invocation: Option<Arc<Invocation>>) -> Option<ExecutionContext> {
        if !self.applies_to(failure) {
            return None;
        }
        debug!(fallback = %self.name, error = %failure, "applying fallback");
        Some(ExecutionContext::new(self.site.clone(), failure.clone(), invocation))
    }
}

impl<T: Send + 'static> FallbackLayer<Handle<T>> {
    /// Variant for handle chains: waits for the recovery handle.
    pub fn for_handles(self) -> HandleFallbackLayer<T> {
        HandleFallbackLayer(self)
    }
}

impl<T: Send + 'static> Layer<SyncChain<T>> for FallbackLayer<T> {
    type Service = BlockingFallback<T>;

    fn layer(&self, inner: SyncChain<T>) -> Self::Service {
        BlockingFallback { inner, layer: self.clone() }
    }
}

impl<T: Send + 'static> Layer<AsyncChain<T>> for FallbackLayer<Promise<T>> {
    type Service = AsyncFallback<T>;

    fn layer(&self, inner: AsyncChain<T>) -> Self::Service {
        AsyncFallback { inner, layer: self.clone() }
    }
}

/// [`FallbackLayer`] for handle chains.
pub struct HandleFallbackLayer<T>(FallbackLayer<Handle<T>>);

impl<T: Send + 'static> Layer<SyncChain<T>> for HandleFallbackLayer<T> {
    type Service = HandleFallback<T>;

    fn layer(&self, inner: SyncChain<T>) -> Self::Service {
        HandleFallback { inner, layer: self.0.clone() }
    }
}

pub struct BlockingFallback<T> {
    inner: SyncChain<T>,
    layer: FallbackLayer<T>,
}

impl<T: Send + 'static> Strategy<T> for BlockingFallback<T> {
    fn apply(&self, ctx: &SyncContext<T>) -> Result<T, Failure> {
        match self.inner.apply(ctx) {
            Ok(value) => Ok(value),
            Err(failure) => match self.layer.context_for(&failure, ctx.extensions().get::<Invocation>()) {
                Some(fallback_ctx) => (self.layer.function)(&fallback_ctx),
                None => Err(failure),
            },
        }
    }
}

pub struct AsyncFallback<T> {
    inner: AsyncChain<T>,
    layer: FallbackLayer<Promise<T>>,
}

impl<T: Send + 'static> AsyncStrategy<T> for AsyncFallback<T> {
    fn apply(&self, ctx: &AsyncContext<T>) -> Promise<T> {
        let promise = self.inner.apply(ctx);
        let layer = self.layer.clone();
        let invocation = ctx.extensions().get::<Invocation>();
        Box::pin(async move {
            let failure = match promise.await {
                Ok(value) => return Ok(value),
                Err(failure) => failure,
            };
            let Some(fallback_ctx) = layer.context_for(&failure, invocation) else {
                return Err(failure);
            };
            let recovery = match &layer.offload {
                Some(pool) => {
                    let function = layer.function.clone();
                    pool.spawn_blocking(move || function(&fallback_ctx)).await?
                }
                None => (layer.function)(&fallback_ctx)?,
            };
            recovery.await
        })
    }
}

pub struct HandleFallback<T> {
    inner: SyncChain<T>,
    layer: FallbackLayer<Handle<T>>,
}

impl<T: Send + 'static> Strategy<T> for HandleFallback<T> {
    fn apply(&self, ctx: &SyncContext<T>) -> Result<T, Failure> {
        match self.inner.apply(ctx) {
            Ok(value) => Ok(value),
            Err(failure) => match self.layer.context_for(&failure, ctx.extensions().get::<Invocation>()) {
                Some(fallback_ctx) => (self.layer.function)(&fallback_ctx)?.wait(),
                None => Err(failure),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::InvocationContext;
    use crate::strategy::Invoke;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, thiserror::Error)]
    #[error("skipped")]
    struct Skipped;

    fn layer<R: Send + 'static>(function: FallbackFn<R>) -> FallbackLayer<R> {
        FallbackLayer::new(
            CallSite::new("Svc", "op"),
            function,
            ThrowableSet::all(),
            ThrowableSet::of::<Skipped>(),
        )
    }

    #[test]
    fn blocking_fallback_applies_to_matching_failures_only() {
        let calls = Arc::new(AtomicUsize::new(0));
        let function: FallbackFn<u32> = {
            let calls = calls.clone();
            Arc::new(move |ctx: &ExecutionContext| -> Result<u32, Failure> {
                calls.fetch_add(1, Ordering::SeqCst);
                assert_eq!(ctx.failure().to_string(), "boom");
                Ok(7)
            })
        };
        let chain = layer(function).layer(Arc::new(Invoke) as SyncChain<u32>);

        let boom: SyncContext<u32> = InvocationContext::blocking(|| Err(Failure::msg("boom")));
        assert_eq!(chain.apply(&boom).unwrap(), 7);

        let skipped: SyncContext<u32> = InvocationContext::blocking(|| Err(Failure::new(Skipped)));
        assert!(chain.apply(&skipped).unwrap_err().is::<Skipped>());

        let ok: SyncContext<u32> = InvocationContext::blocking(|| Ok(1));
        assert_eq!(chain.apply(&ok).unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fallback_failures_propagate_unchanged() {
        let function: FallbackFn<u32> = Arc::new(|_ctx: &ExecutionContext| -> Result<u32, Failure> {
            Err(Failure::msg("fallback down"))
        });
        let chain = layer(function).layer(Arc::new(Invoke) as SyncChain<u32>);
        let ctx: SyncContext<u32> = InvocationContext::blocking(|| Err(Failure::msg("boom")));
        assert_eq!(chain.apply(&ctx).unwrap_err().to_string(), "fallback down");
    }

    #[test]
    fn invocation_is_handed_to_the_recovery_path() {
        let function: FallbackFn<String> = Arc::new(|ctx: &ExecutionContext| -> Result<String, Failure> {
            let invocation = ctx.invocation().ok_or_else(|| Failure::msg("no invocation"))?;
            Ok(invocation.arguments().get::<String>(0).cloned().unwrap_or_default())
        });
        let chain = layer(function).layer(Arc::new(Invoke) as SyncChain<String>);
        let ctx: SyncContext<String> = InvocationContext::blocking(|| Err(Failure::msg("boom")));
        ctx.extensions().insert(Invocation::new(
            Arc::new(()),
            crate::context::Arguments::new().with(String::from("arg")),
        ));
        assert_eq!(chain.apply(&ctx).unwrap(), "arg");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn async_fallback_runs_on_the_offload_pool() {
        let function: FallbackFn<Promise<String>> = Arc::new(|_ctx: &ExecutionContext| -> Result<Promise<String>, Failure> {
            let thread = std::thread::current().name().unwrap_or_default().to_string();
            Ok(Box::pin(async move { Ok(thread) }) as Promise<String>)
        });
        let pool = OffloadPool::dedicated(1).expect("runtime");
        let chain = layer(function).offloaded(pool).layer(Arc::new(Invoke) as AsyncChain<String>);
        let ctx: AsyncContext<String> =
            InvocationContext::promise(|| Box::pin(async { Err(Failure::msg("boom")) }));
        assert_eq!(chain.apply(&ctx).await.unwrap(), "faultline-offload");
    }

    #[test]
    fn handle_fallback_waits_for_the_recovery_handle() {
        let function: FallbackFn<Handle<u8>> = Arc::new(|_ctx: &ExecutionContext| -> Result<Handle<u8>, Failure> {
            Ok(Handle::completed(9))
        });
        let chain = layer(function).for_handles().layer(Arc::new(Invoke) as SyncChain<u8>);
        let ctx: SyncContext<u8> = InvocationContext::blocking(|| Err(Failure::msg("boom")));
        assert_eq!(chain.apply(&ctx).unwrap(), 9);
    }
}
