//! Explicit registry of named dispatchers.
//!
//! An [`Environment`] owns the dispatchers an application builds its
//! pipelines on. There is deliberately no process-global registry: callers
//! construct an environment, register dispatchers under unique names, and
//! pass the environment (or a clone of its handle) to the pipelines that
//! need it. Dropping the last handle does not stop the dispatchers; call
//! [`Environment::shutdown`] for an orderly drain.

use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::RwLock;

use crate::dispatch::{DispatchError, Dispatcher, RingConfig, DEFAULT_SHUTDOWN_GRACE};

/// Errors from registry operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EnvError {
    /// A dispatcher is already registered under this name.
    #[error("dispatcher name `{0}` is already registered")]
    DuplicateName(String),

    /// No dispatcher is registered under this name.
    #[error("no dispatcher registered under `{0}`")]
    UnknownDispatcher(String),

    /// No default dispatcher has been designated.
    #[error("environment has no default dispatcher")]
    NoDefault,
}

#[derive(Default)]
struct Registry {
    dispatchers: FxHashMap<String, Arc<Dispatcher>>,
    default_name: Option<String>,
}

/// A shared, named-dispatcher registry.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone, Default)]
pub struct Environment {
    registry: Arc<RwLock<Registry>>,
}

impl Environment {
    /// Creates an empty environment.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an environment pre-populated with one dispatcher of each
    /// strategy under conventional names: `threadPoolExecutor`, `workQueue`,
    /// `ringBuffer`, and `eventLoop` (the actor strategy). The thread pool
    /// is the default.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::SpawnFailed` if any dispatcher's threads
    /// cannot be created.
    pub fn with_defaults() -> Result<Self, DispatchError> {
        let parallelism = std::thread::available_parallelism().map_or(4, usize::from);

        let env = Self::new();
        let pool = Dispatcher::thread_pool("threadPoolExecutor", parallelism)?;
        let work_queue = Dispatcher::work_queue("workQueue", parallelism.min(8), 2048)?;
        let ring = Dispatcher::ring("ringBuffer", RingConfig::default())?;
        let actor = Dispatcher::actor("eventLoop", parallelism, 1024)?;

        // Names are fresh in an empty registry; registration cannot collide.
        let mut registry = env.registry.write();
        registry.dispatchers.insert(pool.name().to_string(), pool);
        registry
            .dispatchers
            .insert(work_queue.name().to_string(), work_queue);
        registry.dispatchers.insert(ring.name().to_string(), ring);
        registry
            .dispatchers
            .insert(actor.name().to_string(), actor);
        registry.default_name = Some("threadPoolExecutor".to_string());
        drop(registry);

        Ok(env)
    }

    /// Registers a dispatcher under its own name.
    ///
    /// # Errors
    ///
    /// Returns [`EnvError::DuplicateName`] if the name is taken.
    pub fn register(&self, dispatcher: Arc<Dispatcher>) -> Result<(), EnvError> {
        let name = dispatcher.name().to_string();
        let mut registry = self.registry.write();
        if registry.dispatchers.contains_key(&name) {
            return Err(EnvError::DuplicateName(name));
        }
        tracing::debug!(%name, "dispatcher registered");
        registry.dispatchers.insert(name, dispatcher);
        Ok(())
    }

    /// Looks up a dispatcher by name.
    ///
    /// # Errors
    ///
    /// Returns [`EnvError::UnknownDispatcher`] if the name is not
    /// registered.
    pub fn dispatcher(&self, name: &str) -> Result<Arc<Dispatcher>, EnvError> {
        self.registry
            .read()
            .dispatchers
            .get(name)
            .cloned()
            .ok_or_else(|| EnvError::UnknownDispatcher(name.to_string()))
    }

    /// Designates the default dispatcher for pipelines built without an
    /// explicit one.
    ///
    /// # Errors
    ///
    /// Returns [`EnvError::UnknownDispatcher`] if the name is not
    /// registered.
    pub fn set_default(&self, name: &str) -> Result<(), EnvError> {
        let mut registry = self.registry.write();
        if !registry.dispatchers.contains_key(name) {
            return Err(EnvError::UnknownDispatcher(name.to_string()));
        }
        registry.default_name = Some(name.to_string());
        Ok(())
    }

    /// Returns the default dispatcher.
    ///
    /// # Errors
    ///
    /// Returns [`EnvError::NoDefault`] if none was designated.
    pub fn default_dispatcher(&self) -> Result<Arc<Dispatcher>, EnvError> {
        let registry = self.registry.read();
        let name = registry.default_name.as_ref().ok_or(EnvError::NoDefault)?;
        registry
            .dispatchers
            .get(name)
            .cloned()
            .ok_or_else(|| EnvError::UnknownDispatcher(name.clone()))
    }

    /// Returns the registered dispatcher names.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.registry.read().dispatchers.keys().cloned().collect()
    }

    /// Shuts down every registered dispatcher, draining each within the
    /// default grace period. Returns true only if all drained completely.
    pub fn shutdown(&self) -> bool {
        let dispatchers: Vec<Arc<Dispatcher>> = {
            let registry = self.registry.read();
            registry.dispatchers.values().cloned().collect()
        };

        let mut drained = true;
        for dispatcher in dispatchers {
            tracing::debug!(name = %dispatcher.name(), "shutting down dispatcher");
            drained &= dispatcher.shutdown_timeout(DEFAULT_SHUTDOWN_GRACE);
        }
        drained
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry.read();
        f.debug_struct("Environment")
            .field("dispatchers", &registry.dispatchers.keys())
            .field("default", &registry.default_name)
            .finish()
    }
}
