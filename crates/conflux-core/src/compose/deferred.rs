//! Producer-side handle for an unbounded pipeline.
//!
//! A [`Deferred`] owns the root stage of a pipeline and is the only way to
//! push values into it. Consumers get the read side from
//! [`Deferred::compose`], build their stages on it, and only then does the
//! producer start accepting; the builder API makes that ordering the
//! natural one.

use std::sync::Arc;

use crate::dispatch::{Dispatcher, StageError};
use crate::environment::Environment;

use super::composable::{Composable, Phase, Signal};
use super::error::{AcceptError, ComposeError};

/// The producer handle of a pipeline.
#[derive(Debug, Clone)]
pub struct Deferred<T> {
    root: Composable<T>,
}

impl<T: Clone + Send + 'static> Deferred<T> {
    /// Starts building a pipeline.
    #[must_use]
    pub fn builder() -> DeferredBuilder<T> {
        DeferredBuilder::new()
    }

    pub(crate) fn from_root(root: Composable<T>) -> Self {
        Self { root }
    }

    /// Returns the read side of the pipeline for attaching stages.
    #[must_use]
    pub fn compose(&self) -> Composable<T> {
        self.root.clone()
    }

    /// Pushes a value into the pipeline.
    ///
    /// The value is routed through the root dispatcher; stages run on
    /// dispatcher threads, never on the caller.
    ///
    /// # Errors
    ///
    /// Returns [`AcceptError::Closed`] after `complete` or `fail`, and
    /// [`AcceptError::Dispatch`] if the dispatcher refuses the task.
    pub fn accept(&self, value: T) -> Result<(), AcceptError> {
        if self.root.phase() != Phase::Open {
            return Err(AcceptError::Closed);
        }
        self.root.dispatch_signal(Signal::Value(value))?;
        Ok(())
    }

    /// Signals end of input. Stages flush (e.g. a partial reduce window)
    /// and terminal consumers see no further values.
    ///
    /// # Errors
    ///
    /// Returns [`AcceptError::Closed`] if already terminal.
    pub fn complete(&self) -> Result<(), AcceptError> {
        if self.root.phase() != Phase::Open {
            return Err(AcceptError::Closed);
        }
        self.root.dispatch_signal(Signal::Complete)?;
        Ok(())
    }

    /// Fails the pipeline; the error propagates along every error channel.
    ///
    /// # Errors
    ///
    /// Returns [`AcceptError::Closed`] if already terminal.
    pub fn fail(&self, error: StageError) -> Result<(), AcceptError> {
        if self.root.phase() != Phase::Open {
            return Err(AcceptError::Closed);
        }
        self.root.dispatch_signal(Signal::Error(error))?;
        Ok(())
    }
}

/// Builder for [`Deferred`] pipelines.
///
/// The dispatcher is resolved in priority order: an explicit instance, then
/// a named lookup in the environment, then the environment's default.
pub struct DeferredBuilder<T> {
    env: Option<Environment>,
    dispatcher: Option<Arc<Dispatcher>>,
    dispatcher_name: Option<String>,
    batch_size: Option<usize>,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: Clone + Send + 'static> DeferredBuilder<T> {
    #[must_use]
    fn new() -> Self {
        Self {
            env: None,
            dispatcher: None,
            dispatcher_name: None,
            batch_size: None,
            _marker: std::marker::PhantomData,
        }
    }

    /// Sets the environment used for named and default dispatcher lookup.
    #[must_use]
    pub fn env(mut self, env: &Environment) -> Self {
        self.env = Some(env.clone());
        self
    }

    /// Binds the pipeline to an explicit dispatcher.
    #[must_use]
    pub fn dispatcher(mut self, dispatcher: Arc<Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Binds the pipeline to the named dispatcher from the environment.
    #[must_use]
    pub fn dispatcher_name(mut self, name: impl Into<String>) -> Self {
        self.dispatcher_name = Some(name.into());
        self
    }

    /// Sets the default aggregation window for `reduce` stages built
    /// without an explicit window.
    #[must_use]
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    /// Builds the producer handle.
    ///
    /// # Errors
    ///
    /// Returns [`ComposeError::NoDispatcher`] when no dispatcher can be
    /// resolved, or an environment error from a failed named lookup.
    pub fn build(self) -> Result<Deferred<T>, ComposeError> {
        let dispatcher = resolve_dispatcher(
            self.dispatcher,
            self.dispatcher_name.as_deref(),
            self.env.as_ref(),
        )?;
        Ok(Deferred::from_root(Composable::new(
            dispatcher,
            self.batch_size,
        )))
    }
}

/// Shared dispatcher resolution for the pipeline builders.
pub(crate) fn resolve_dispatcher(
    explicit: Option<Arc<Dispatcher>>,
    name: Option<&str>,
    env: Option<&Environment>,
) -> Result<Arc<Dispatcher>, ComposeError> {
    if let Some(dispatcher) = explicit {
        return Ok(dispatcher);
    }
    match (name, env) {
        (Some(name), Some(env)) => Ok(env.dispatcher(name)?),
        (None, Some(env)) => env.default_dispatcher().map_err(|_| ComposeError::NoDispatcher),
        _ => Err(ComposeError::NoDispatcher),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::RingConfig;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    fn wait_until(budget: Duration, condition: impl Fn() -> bool) {
        let deadline = Instant::now() + budget;
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met in time");
            thread::yield_now();
        }
    }

    #[test]
    fn test_accept_flows_to_consumer() {
        let dispatcher = Dispatcher::ring("def-ring", RingConfig::with_capacity(64)).unwrap();
        let deferred: Deferred<u64> = Deferred::builder()
            .dispatcher(Arc::clone(&dispatcher))
            .build()
            .unwrap();

        let sum = Arc::new(AtomicU64::new(0));
        let sink = Arc::clone(&sum);
        deferred.compose().consume(move |v| {
            sink.fetch_add(v, Ordering::AcqRel);
        });

        for v in 1..=100 {
            deferred.accept(v).unwrap();
        }

        wait_until(Duration::from_secs(5), || {
            sum.load(Ordering::Acquire) == 5_050
        });
        dispatcher.shutdown();
    }

    #[test]
    fn test_accept_after_complete_is_closed() {
        let dispatcher = Dispatcher::thread_pool("def-pool", 1).unwrap();
        let deferred: Deferred<u64> = Deferred::builder()
            .dispatcher(Arc::clone(&dispatcher))
            .build()
            .unwrap();

        deferred.complete().unwrap();
        wait_until(Duration::from_secs(5), || {
            deferred.compose().phase() == Phase::Completed
        });

        assert!(matches!(deferred.accept(1), Err(AcceptError::Closed)));
        assert!(matches!(deferred.complete(), Err(AcceptError::Closed)));
        dispatcher.shutdown();
    }

    #[test]
    fn test_fail_routes_to_error_consumer() {
        let dispatcher = Dispatcher::ring("def-fail", RingConfig::with_capacity(64)).unwrap();
        let deferred: Deferred<u64> = Deferred::builder()
            .dispatcher(Arc::clone(&dispatcher))
            .build()
            .unwrap();

        let messages = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&messages);
        deferred.compose().consume_error(move |error| {
            sink.lock().push(error.message().to_string());
        });

        deferred.fail(StageError::new("upstream broke")).unwrap();

        wait_until(Duration::from_secs(5), || !messages.lock().is_empty());
        assert_eq!(*messages.lock(), vec!["upstream broke".to_string()]);
        dispatcher.shutdown();
    }

    #[test]
    fn test_builder_resolves_from_environment() {
        let env = Environment::new();
        let pool = Dispatcher::thread_pool("builder-pool", 1).unwrap();
        env.register(pool).unwrap();
        env.set_default("builder-pool").unwrap();

        let by_name: Deferred<u64> = Deferred::builder()
            .env(&env)
            .dispatcher_name("builder-pool")
            .build()
            .unwrap();
        assert_eq!(by_name.compose().dispatcher().name(), "builder-pool");

        let by_default: Deferred<u64> = Deferred::builder().env(&env).build().unwrap();
        assert_eq!(by_default.compose().dispatcher().name(), "builder-pool");

        let missing: Result<Deferred<u64>, _> = Deferred::builder()
            .env(&env)
            .dispatcher_name("absent")
            .build();
        assert!(matches!(missing, Err(ComposeError::Environment(_))));

        let none: Result<Deferred<u64>, _> = Deferred::builder().build();
        assert!(matches!(none, Err(ComposeError::NoDispatcher)));

        env.shutdown();
    }

    #[test]
    fn test_batch_size_drives_reduce_window() {
        let dispatcher = Dispatcher::ring("def-batch", RingConfig::with_capacity(64)).unwrap();
        let deferred: Deferred<u64> = Deferred::builder()
            .dispatcher(Arc::clone(&dispatcher))
            .batch_size(5)
            .build()
            .unwrap();

        let emissions = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&emissions);
        deferred
            .compose()
            .reduce(|acc, v| acc + v, 0_u64, None)
            .consume(move |total| {
                sink.lock().push(total);
            });

        for v in 0..10 {
            deferred.accept(v).unwrap();
        }

        wait_until(Duration::from_secs(5), || emissions.lock().len() == 2);
        assert_eq!(*emissions.lock(), vec![10, 35]);
        dispatcher.shutdown();
    }
}
