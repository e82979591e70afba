//! The capability every policy decorator (and every composed chain) provides.
//!
//! A chain is built once per call-site and invoked concurrently by many callers; the unit of
//! work of each individual invocation travels in the [`InvocationContext`]. Decorators are
//! produced through `tower_layer::Layer::layer`, one layer type per policy step.

use crate::async_types::Promise;
use crate::context::InvocationContext;
use crate::error::Failure;
use crate::handle::Handle;
use std::sync::Arc;

/// A blocking unit of work.
pub type SyncWork<T> = dyn Fn() -> Result<T, Failure> + Send + Sync;
/// A promise-producing unit of work.
pub type AsyncWork<T> = dyn Fn() -> Promise<T> + Send + Sync;
/// A handle-producing unit of work.
pub type HandleWork<T> = dyn Fn() -> Result<Handle<T>, Failure> + Send + Sync;

pub type SyncContext<T> = InvocationContext<SyncWork<T>>;
pub type AsyncContext<T> = InvocationContext<AsyncWork<T>>;

/// Blocking strategy: used by the blocking and handle pipelines.
pub trait Strategy<T>: Send + Sync {
    fn apply(&self, ctx: &SyncContext<T>) -> Result<T, Failure>;
}

/// Promise strategy: used by the promise pipeline.
pub trait AsyncStrategy<T>: Send + Sync {
    fn apply(&self, ctx: &AsyncContext<T>) -> Promise<T>;
}

pub type SyncChain<T> = Arc<dyn Strategy<T>>;
pub type AsyncChain<T> = Arc<dyn AsyncStrategy<T>>;

/// Terminal step: run the unit of work carried by the context.
#[derive(Debug, Default, Clone, Copy)]
pub struct Invoke;

impl<T> Strategy<T> for Invoke {
    fn apply(&self, ctx: &SyncContext<T>) -> Result<T, Failure> {
        (ctx.work())()
    }
}

impl<T> AsyncStrategy<T> for Invoke {
    fn apply(&self, ctx: &AsyncContext<T>) -> Promise<T> {
        (ctx.work())()
    }
}
