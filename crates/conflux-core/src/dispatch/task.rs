//! The unit of work moved by dispatchers.
//!
//! A [`Task`] packages the closure a pipeline stage wants executed together
//! with an optional error sink and an optional routing key. Tasks are
//! immutable once enqueued and are consumed exactly once by the dispatcher
//! thread that executes them.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use super::error::StageError;

/// A dispatchable unit of work.
///
/// The primary closure carries both the payload and the stage callback (a
/// stage captures the value it wants transformed). If the closure panics,
/// the panic is caught and routed to the error sink; a task never unwinds
/// the worker thread that runs it.
pub struct Task {
    key: Option<u64>,
    run: Box<dyn FnOnce() + Send + 'static>,
    on_error: Option<Box<dyn FnOnce(StageError) + Send + 'static>>,
}

impl Task {
    /// Creates a task from the given closure.
    pub fn new(run: impl FnOnce() + Send + 'static) -> Self {
        Self {
            key: None,
            run: Box::new(run),
            on_error: None,
        }
    }

    /// Attaches an error sink invoked if the task's closure panics.
    #[must_use]
    pub fn with_error_sink(mut self, sink: impl FnOnce(StageError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(sink));
        self
    }

    /// Attaches a routing key used by the actor strategy to pick a shard.
    #[must_use]
    pub fn with_key(mut self, key: u64) -> Self {
        self.key = Some(key);
        self
    }

    /// Returns the routing key, if any.
    #[must_use]
    pub fn key(&self) -> Option<u64> {
        self.key
    }

    /// Runs the task to completion, capturing any panic.
    ///
    /// A captured panic is converted to a [`StageError`] and handed to the
    /// error sink. Without a sink it is surfaced through the global handler
    /// (`tracing::error!`) rather than lost.
    pub fn execute(self) {
        let Self { run, on_error, .. } = self;
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(run)) {
            let error = StageError::from_panic(payload.as_ref());
            match on_error {
                Some(sink) => sink(error),
                None => tracing::error!(%error, "task failed with no error sink registered"),
            }
        }
    }
}

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "stage panicked with a non-string payload".to_string()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("key", &self.key)
            .field("has_error_sink", &self.on_error.is_some())
            .finish_non_exhaustive()
    }
}
