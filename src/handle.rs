//! Pollable, blockable result handle returned by handle-model call-sites.
//!
//! A [`Handle`] is completed exactly once through its [`Completer`], possibly from another
//! thread. Dropping the completer without completing resolves the handle with
//! [`ExecutionError::Abandoned`].

use crate::error::{ExecutionError, Failure};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio_util::sync::CancellationToken;

type Resolution<T> = Result<T, Failure>;

enum State<T> {
    Pending(oneshot::Receiver<Resolution<T>>),
    Ready(Resolution<T>),
}

/// Set once the completer is done with the handle, for timed waits.
#[derive(Default)]
struct Settled {
    done: Mutex<bool>,
    ready: Condvar,
}

impl Settled {
    fn lock(&self) -> MutexGuard<'_, bool> {
        self.done.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set(&self) {
        *self.lock() = true;
        self.ready.notify_all();
    }
}

/// Result of a deferred computation.
pub struct Handle<T> {
    state: Mutex<State<T>>,
    settled: Arc<Settled>,
    cancellation: Option<CancellationToken>,
}

/// Write side of a [`Handle`].
pub struct Completer<T> {
    tx: Option<oneshot::Sender<Resolution<T>>>,
    settled: Arc<Settled>,
}

impl<T> Handle<T> {
    /// A pending handle and the completer that resolves it.
    pub fn channel() -> (Completer<T>, Handle<T>) {
        let (tx, rx) = oneshot::channel();
        let settled = Arc::new(Settled::default());
        (
            Completer { tx: Some(tx), settled: settled.clone() },
            Handle { state: Mutex::new(State::Pending(rx)), settled, cancellation: None },
        )
    }

    /// An already successful handle.
    pub fn completed(value: T) -> Self {
        Self::resolved(Ok(value))
    }

    /// An already failed handle.
    pub fn failed(failure: Failure) -> Self {
        Self::resolved(Err(failure))
    }

    fn resolved(result: Resolution<T>) -> Self {
        let (completer, handle) = Self::channel();
        completer.complete(result);
        handle
    }

    pub(crate) fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = Some(cancellation);
        self
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// `true` once a result is available.
    pub fn is_done(&self) -> bool {
        let mut state = self.lock();
        let received = match &mut *state {
            State::Ready(_) => return true,
            State::Pending(rx) => match rx.try_recv() {
                Ok(result) => result,
                Err(TryRecvError::Empty) => return false,
                Err(TryRecvError::Closed) => Err(ExecutionError::Abandoned.into()),
            },
        };
        *state = State::Ready(received);
        true
    }

    /// Block until a result is available or `timeout` elapses; `true` if done.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.settled.lock();
        while !*done {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            done = match self.settled.ready.wait_timeout(done, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    /// Block until the result is available and take it.
    ///
    /// Blocking on a pending handle from inside an async task panics; use
    /// [`Outcome::resolve`](crate::Outcome::resolve) there.
    pub fn wait(self) -> Result<T, Failure> {
        match self.state.into_inner().unwrap_or_else(|e| e.into_inner()) {
            State::Ready(result) => result,
            State::Pending(mut rx) => match rx.try_recv() {
                Ok(result) => result,
                Err(TryRecvError::Empty) => {
                    rx.blocking_recv().unwrap_or_else(|_| Err(ExecutionError::Abandoned.into()))
                }
                Err(TryRecvError::Closed) => Err(ExecutionError::Abandoned.into()),
            },
        }
    }

    /// Ask the computation behind this handle to stop. Queued work gives up its slot; running
    /// work observes the request at its next cancellation point. `false` if there is nothing
    /// to cancel.
    pub fn cancel(&self) -> bool {
        match &self.cancellation {
            Some(cancellation) if !self.is_done() => {
                cancellation.cancel();
                true
            }
            _ => false,
        }
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle").field("done", &self.is_done()).finish()
    }
}

impl<T> Completer<T> {
    /// Resolve the handle.
    pub fn complete(mut self, result: Result<T, Failure>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(result);
        }
    }
}

impl<T> Drop for Completer<T> {
    // an unsent result reaches the handle as `Abandoned`
    fn drop(&mut self) {
        drop(self.tx.take());
        self.settled.set();
    }
}

impl<T> fmt::Debug for Completer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completer").field("completed", &self.tx.is_none()).finish()
    }
}
