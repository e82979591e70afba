//! Per-invocation state threaded through a pipeline, plus the ambient collaborators
//! (request scope, event loop) the promise and handle pipelines consult.

use crate::call_site::CallSite;
use crate::error::Failure;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Arguments of the original call, in declaration order.
#[derive(Clone, Default)]
pub struct Arguments {
    values: Vec<Arc<dyn Any + Send + Sync>>,
}

impl Arguments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an argument.
    pub fn with<A: Any + Send + Sync>(mut self, value: A) -> Self {
        self.values.push(Arc::new(value));
        self
    }

    /// Borrow argument `index` as an `A`.
    pub fn get<A: Any>(&self, index: usize) -> Option<&A> {
        self.values.get(index).and_then(|value| (**value).downcast_ref::<A>())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for Arguments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arguments").field("len", &self.values.len()).finish()
    }
}

/// The receiver and arguments of the governed call. Needed to invoke fallback methods.
#[derive(Clone)]
pub struct Invocation {
    target: Arc<dyn Any + Send + Sync>,
    arguments: Arguments,
}

impl Invocation {
    pub fn new<R: Any + Send + Sync>(target: Arc<R>, arguments: Arguments) -> Self {
        Self { target, arguments }
    }

    pub fn target(&self) -> &(dyn Any + Send + Sync) {
        &*self.target
    }

    pub fn arguments(&self) -> &Arguments {
        &self.arguments
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation").field("arguments", &self.arguments).finish()
    }
}

/// Type-keyed bag of values attached to one invocation.
#[derive(Default)]
pub struct Extensions {
    map: Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl Extensions {
    pub fn insert<X: Any + Send + Sync>(&self, value: X) {
        self.map.lock().unwrap_or_else(|e| e.into_inner()).insert(TypeId::of::<X>(), Arc::new(value));
    }

    pub fn get<X: Any + Send + Sync>(&self) -> Option<Arc<X>> {
        let value = self.map.lock().unwrap_or_else(|e| e.into_inner()).get(&TypeId::of::<X>())?.clone();
        value.downcast::<X>().ok()
    }
}

impl fmt::Debug for Extensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self.map.lock().map(|m| m.len()).unwrap_or(0);
        f.debug_struct("Extensions").field("len", &len).finish()
    }
}

/// State of one invocation as seen by every layer of a chain.
///
/// `W` is the unit-of-work shape: a blocking closure or a promise factory. Cloning is cheap and
/// shares the work and extensions.
pub struct InvocationContext<W: ?Sized> {
    work: Arc<W>,
    extensions: Arc<Extensions>,
    cancellation: CancellationToken,
}

impl<W: ?Sized> Clone for InvocationContext<W> {
    fn clone(&self) -> Self {
        Self {
            work: self.work.clone(),
            extensions: self.extensions.clone(),
            cancellation: self.cancellation.clone(),
        }
    }
}

impl<W: ?Sized> InvocationContext<W> {
    pub fn new(work: Arc<W>) -> Self {
        Self::with_cancellation(work, CancellationToken::new())
    }

    pub fn with_cancellation(work: Arc<W>, cancellation: CancellationToken) -> Self {
        Self { work, extensions: Arc::new(Extensions::default()), cancellation }
    }

    pub fn work(&self) -> &W {
        &self.work
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Same invocation, with a child token scoped to one attempt.
    pub fn attempt(&self) -> Self {
        Self {
            work: self.work.clone(),
            extensions: self.extensions.clone(),
            cancellation: self.cancellation.child_token(),
        }
    }
}

impl<T: 'static> InvocationContext<crate::strategy::SyncWork<T>> {
    /// Context for a blocking unit of work.
    pub fn blocking<F>(work: F) -> Self
    where
        F: Fn() -> Result<T, Failure> + Send + Sync + 'static,
    {
        Self::new(Arc::new(work))
    }
}

impl<T: 'static> InvocationContext<crate::strategy::AsyncWork<T>> {
    /// Context for a promise-producing unit of work.
    pub fn promise<F>(work: F) -> Self
    where
        F: Fn() -> crate::async_types::Promise<T> + Send + Sync + 'static,
    {
        Self::new(Arc::new(work))
    }
}

impl<W: ?Sized> fmt::Debug for InvocationContext<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationContext")
            .field("extensions", &self.extensions)
            .field("cancellation", &self.cancellation)
            .finish()
    }
}

/// What a fallback handler learns about the failed call.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    call_site: CallSite,
    failure: Failure,
    invocation: Option<Arc<Invocation>>,
}

impl ExecutionContext {
    pub(crate) fn new(
        call_site: CallSite,
        failure: Failure,
        invocation: Option<Arc<Invocation>>,
    ) -> Self {
        Self { call_site, failure, invocation }
    }

    pub fn call_site(&self) -> &CallSite {
        &self.call_site
    }

    /// The failure that triggered the fallback.
    pub fn failure(&self) -> &Failure {
        &self.failure
    }

    pub fn invocation(&self) -> Option<&Invocation> {
        self.invocation.as_deref()
    }
}

/// Activates the ambient request scope around promise and handle chains.
pub trait RequestContextController: Send + Sync + fmt::Debug {
    /// Activate the scope; `false` if it was already active and must not be deactivated here.
    fn activate(&self) -> bool;
    fn deactivate(&self);
}

/// Controller for environments without a request scope.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRequestContext;

impl RequestContextController for NoRequestContext {
    fn activate(&self) -> bool {
        false
    }

    fn deactivate(&self) {}
}

/// Deactivates the request scope on drop if this guard activated it.
pub(crate) struct RequestScope {
    controller: Arc<dyn RequestContextController>,
    activated: bool,
}

impl RequestScope {
    pub(crate) fn enter(controller: Arc<dyn RequestContextController>) -> Self {
        let activated = controller.activate();
        Self { controller, activated }
    }
}

impl Drop for RequestScope {
    fn drop(&mut self) {
        if self.activated {
            self.controller.deactivate();
        }
    }
}

/// Source of the caller's scheduler, so promise completions resume where they started.
pub trait EventLoop: Send + Sync + fmt::Debug {
    /// The scheduler of the calling thread, if it runs one.
    fn current(&self) -> Option<tokio::runtime::Handle>;
}

/// No event loop: completions resume wherever the chain finished.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEventLoop;

impl EventLoop for NoEventLoop {
    fn current(&self) -> Option<tokio::runtime::Handle> {
        None
    }
}

/// Treats the tokio runtime of the calling thread as its event loop.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioEventLoop;

impl EventLoop for TokioEventLoop {
    fn current(&self) -> Option<tokio::runtime::Handle> {
        tokio::runtime::Handle::try_current().ok()
    }
}
