//! Bounded stream with a construction-time value source.
//!
//! A [`Stream`] is the pull-triggers-push variant of a pipeline: the values
//! are fixed at build time (an eager collection or a fused supplier), and
//! nothing flows until a terminal consumer is attached. Attaching via
//! [`Stream::consume`] — or calling [`Stream::propagate`] on a pipeline
//! built from [`Stream::compose`] — replays the source into the pipeline
//! exactly once, followed by a completion signal.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::dispatch::Dispatcher;
use crate::environment::Environment;

use super::composable::{Composable, Signal};
use super::deferred::resolve_dispatcher;
use super::error::{AcceptError, ComposeError};

enum Source<T> {
    Values(Vec<T>),
    Generate(Box<dyn FnMut() -> Option<T> + Send>),
}

/// A bounded pipeline whose values are known at construction.
pub struct Stream<T> {
    root: Composable<T>,
    source: Arc<Mutex<Option<Source<T>>>>,
}

impl<T: Clone + Send + 'static> Stream<T> {
    /// Starts building a bounded stream.
    #[must_use]
    pub fn builder() -> StreamBuilder<T> {
        StreamBuilder::new()
    }

    /// Returns the read side of the pipeline for attaching stages.
    ///
    /// A pipeline built this way flows only once [`Stream::propagate`] is
    /// called.
    #[must_use]
    pub fn compose(&self) -> Composable<T> {
        self.root.clone()
    }

    /// Attaches a terminal consumer to the root stage and propagates the
    /// source.
    ///
    /// # Errors
    ///
    /// Returns [`AcceptError::Dispatch`] if the dispatcher refuses a task.
    pub fn consume<F>(&self, consumer: F) -> Result<(), AcceptError>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        self.root.consume(consumer);
        self.propagate()
    }

    /// Replays the source into the pipeline, then completes it.
    ///
    /// The replay happens exactly once; later calls are no-ops so a stream
    /// shared between consumers cannot double-feed its pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`AcceptError::Dispatch`] if the dispatcher refuses a task.
    pub fn propagate(&self) -> Result<(), AcceptError> {
        let Some(source) = self.source.lock().take() else {
            return Ok(());
        };
        match source {
            Source::Values(values) => {
                for value in values {
                    self.root.dispatch_signal(Signal::Value(value))?;
                }
            }
            Source::Generate(mut supplier) => {
                while let Some(value) = supplier() {
                    self.root.dispatch_signal(Signal::Value(value))?;
                }
            }
        }
        self.root.dispatch_signal(Signal::Complete)?;
        Ok(())
    }
}

impl<T> std::fmt::Debug for Stream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("propagated", &self.source.lock().is_none())
            .finish_non_exhaustive()
    }
}

/// Builder for bounded [`Stream`]s.
pub struct StreamBuilder<T> {
    env: Option<Environment>,
    dispatcher: Option<Arc<Dispatcher>>,
    dispatcher_name: Option<String>,
    batch_size: Option<usize>,
    source: Option<Source<T>>,
}

impl<T: Clone + Send + 'static> StreamBuilder<T> {
    #[must_use]
    fn new() -> Self {
        Self {
            env: None,
            dispatcher: None,
            dispatcher_name: None,
            batch_size: None,
            source: None,
        }
    }

    /// Sets the environment used for named and default dispatcher lookup.
    #[must_use]
    pub fn env(mut self, env: &Environment) -> Self {
        self.env = Some(env.clone());
        self
    }

    /// Binds the stream to an explicit dispatcher.
    #[must_use]
    pub fn dispatcher(mut self, dispatcher: Arc<Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Binds the stream to the named dispatcher from the environment.
    #[must_use]
    pub fn dispatcher_name(mut self, name: impl Into<String>) -> Self {
        self.dispatcher_name = Some(name.into());
        self
    }

    /// Sets the default aggregation window for `reduce` stages.
    #[must_use]
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    /// Sets an eager value source, collected now.
    #[must_use]
    pub fn values(mut self, values: impl IntoIterator<Item = T>) -> Self {
        self.source = Some(Source::Values(values.into_iter().collect()));
        self
    }

    /// Sets a supplier source, drawn until it returns `None` at
    /// propagation time.
    #[must_use]
    pub fn generate(mut self, supplier: impl FnMut() -> Option<T> + Send + 'static) -> Self {
        self.source = Some(Source::Generate(Box::new(supplier)));
        self
    }

    /// Builds the stream.
    ///
    /// # Errors
    ///
    /// Returns [`ComposeError::NoValueSource`] if neither `values` nor
    /// `generate` was given, [`ComposeError::NoDispatcher`] when no
    /// dispatcher can be resolved, or an environment error from a failed
    /// named lookup.
    pub fn build(self) -> Result<Stream<T>, ComposeError> {
        let source = self.source.ok_or(ComposeError::NoValueSource)?;
        let dispatcher = resolve_dispatcher(
            self.dispatcher,
            self.dispatcher_name.as_deref(),
            self.env.as_ref(),
        )?;
        Ok(Stream {
            root: Composable::new(dispatcher, self.batch_size),
            source: Arc::new(Mutex::new(Some(source))),
        })
    }
}
