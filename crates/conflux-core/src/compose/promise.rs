//! Single-value, resolve-once promise.
//!
//! The first `fulfill` or `reject` wins; later resolutions are ignored.
//! Callbacks registered after resolution fire immediately with a clone of
//! the held result, so attachment order does not race resolution. That
//! replay is what lets `map_many` flatten nested pipelines safely: the
//! nested pipeline may resolve before the outer stage gets around to
//! attaching its continuation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::dispatch::StageError;

type Callback<T> = Box<dyn FnOnce(Result<T, StageError>) + Send>;

enum State<T> {
    Pending(Vec<Callback<T>>),
    Resolved(Result<T, StageError>),
}

struct Inner<T> {
    state: Mutex<State<T>>,
    resolved: Condvar,
}

/// A value that will resolve exactly once.
///
/// Cheap to clone; clones observe the same resolution.
pub struct Promise<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    /// Creates an unresolved promise.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Pending(Vec::new())),
                resolved: Condvar::new(),
            }),
        }
    }

    /// Creates a promise already resolved with a value.
    #[must_use]
    pub fn fulfilled(value: T) -> Self {
        let promise = Self::new();
        promise.fulfill(value);
        promise
    }

    /// Creates a promise already resolved with an error.
    #[must_use]
    pub fn failed(error: StageError) -> Self {
        let promise = Self::new();
        promise.reject(error);
        promise
    }

    /// Resolves with a value. Returns false if already resolved.
    pub fn fulfill(&self, value: T) -> bool {
        self.resolve(Ok(value))
    }

    /// Resolves with an error. Returns false if already resolved.
    pub fn reject(&self, error: StageError) -> bool {
        self.resolve(Err(error))
    }

    fn resolve(&self, result: Result<T, StageError>) -> bool {
        let callbacks = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                State::Resolved(_) => return false,
                State::Pending(callbacks) => {
                    let callbacks = std::mem::take(callbacks);
                    *state = State::Resolved(result.clone());
                    callbacks
                }
            }
        };
        self.inner.resolved.notify_all();
        for callback in callbacks {
            callback(result.clone());
        }
        true
    }

    /// Registers a callback for the resolution.
    ///
    /// Runs on the resolving thread, or immediately on the calling thread
    /// if the promise is already resolved.
    pub fn on_resolve(&self, callback: impl FnOnce(Result<T, StageError>) + Send + 'static) {
        let replay = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                State::Pending(callbacks) => {
                    callbacks.push(Box::new(callback));
                    None
                }
                State::Resolved(result) => Some((callback, result.clone())),
            }
        };
        if let Some((callback, result)) = replay {
            callback(result);
        }
    }

    /// Returns the resolution if available, without blocking.
    #[must_use]
    pub fn poll(&self) -> Option<Result<T, StageError>> {
        match &*self.inner.state.lock() {
            State::Pending(_) => None,
            State::Resolved(result) => Some(result.clone()),
        }
    }

    /// Returns true once the promise is resolved.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        matches!(&*self.inner.state.lock(), State::Resolved(_))
    }

    /// Blocks until the promise resolves or `timeout` elapses.
    #[must_use]
    pub fn await_resolved(&self, timeout: Duration) -> Option<Result<T, StageError>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if let State::Resolved(result) = &*state {
                return Some(result.clone());
            }
            if self
                .inner
                .resolved
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return match &*state {
                    State::Resolved(result) => Some(result.clone()),
                    State::Pending(_) => None,
                };
            }
        }
    }
}

impl<T: Clone + Send + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let resolved = matches!(&*self.inner.state.lock(), State::Resolved(_));
        f.debug_struct("Promise").field("resolved", &resolved).finish()
    }
}
