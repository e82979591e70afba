//! Canonical promise type and conversion of foreign promise-like types into it.

use crate::error::Failure;
use crate::executor::{join_failure, OffloadPool};
use futures::future::BoxFuture;
use tokio::task::JoinHandle;

/// The promise shape every promise-model chain operates on.
pub type Promise<T> = BoxFuture<'static, Result<T, Failure>>;

/// Container name of [`Promise`].
pub const CANONICAL_PROMISE: &str = "Promise";

/// A promise-like result container that converts to and from [`Promise`].
pub trait AsyncType<T>: Sized + Send + 'static {
    /// Container name, matched against [`ReturnType::Promise`](crate::ReturnType::Promise).
    const NAME: &'static str;

    /// Convert into the canonical promise.
    fn into_promise(self) -> Promise<T>;

    /// Convert the canonical promise back into this container.
    fn from_promise(promise: Promise<T>, offload: &OffloadPool) -> Self;
}

impl<T: Send + 'static> AsyncType<T> for Promise<T> {
    const NAME: &'static str = CANONICAL_PROMISE;

    fn into_promise(self) -> Promise<T> {
        self
    }

    fn from_promise(promise: Promise<T>, _offload: &OffloadPool) -> Self {
        promise
    }
}

impl<T: Send + 'static> AsyncType<T> for JoinHandle<Result<T, Failure>> {
    const NAME: &'static str = "JoinHandle";

    fn into_promise(self) -> Promise<T> {
        Box::pin(async move { self.await.map_err(join_failure)? })
    }

    fn from_promise(promise: Promise<T>, offload: &OffloadPool) -> Self {
        offload.handle().spawn(promise)
    }
}

pub(crate) fn failed<T: Send + 'static>(failure: Failure) -> Promise<T> {
    Box::pin(futures::future::ready(Err(failure)))
}
