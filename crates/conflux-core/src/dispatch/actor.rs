//! Key-sharded dispatcher built from a fixed set of single-consumer shards.
//!
//! Tasks carrying the same routing key always land on the same shard, so
//! same-key tasks execute in dispatch order without any locking in user
//! code. Tasks with different keys run concurrently across shards. The
//! shard set is fixed at construction; the default selector hashes the key,
//! and a custom selector can pin keys to shards explicitly.

use std::time::Duration;

use super::config::{ProducerMode, RingConfig};
use super::error::DispatchError;
use super::ring::RingDispatcher;
use super::task::Task;
use super::DispatcherState;

/// Picks a shard index for a routing key. Must return a value in
/// `0..shard_count` for every key.
pub type ShardSelector = Box<dyn Fn(u64, usize) -> usize + Send + Sync>;

/// A dispatcher that routes tasks to shards by key.
pub struct ActorDispatcher {
    name: String,
    shards: Vec<RingDispatcher>,
    selector: ShardSelector,
}

impl ActorDispatcher {
    /// Builds `shards` single-consumer rings named `{name}-{index}`, each
    /// with `capacity` slots, routed by the default hash selector.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::SpawnFailed` if a shard's consumer thread
    /// cannot be created.
    pub fn new(
        name: impl Into<String>,
        shards: usize,
        capacity: usize,
    ) -> Result<Self, DispatchError> {
        Self::with_selector(
            name,
            shards,
            capacity,
            Box::new(|key, count| {
                #[allow(clippy::cast_possible_truncation)]
                let index = fxhash::hash64(&key) as usize;
                index % count
            }),
        )
    }

    /// Builds the shard set with a caller-provided selector.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::SpawnFailed` if a shard's consumer thread
    /// cannot be created.
    pub fn with_selector(
        name: impl Into<String>,
        shards: usize,
        capacity: usize,
        selector: ShardSelector,
    ) -> Result<Self, DispatchError> {
        let name = name.into();
        let shards = shards.max(1);

        // Each shard has exactly one queue feeding it, but any thread may
        // dispatch into it, so the shard rings stay in multi-producer mode.
        let mut rings = Vec::with_capacity(shards);
        for index in 0..shards {
            let config = RingConfig::with_capacity(capacity).producer_mode(ProducerMode::Multi);
            rings.push(RingDispatcher::new(format!("{name}-{index}"), config)?);
        }

        tracing::debug!(%name, shards, capacity, "actor dispatcher started");

        Ok(Self {
            name,
            shards: rings,
            selector,
        })
    }

    /// Returns the dispatcher name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the shard count.
    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Returns the aggregate lifecycle state: `Alive` only if every shard
    /// is alive, otherwise the first non-alive shard's state.
    #[must_use]
    pub fn state(&self) -> DispatcherState {
        self.shards
            .iter()
            .map(RingDispatcher::state)
            .find(|s| *s != DispatcherState::Alive)
            .unwrap_or(DispatcherState::Alive)
    }

    /// Returns true if the calling thread is any shard's consumer.
    #[must_use]
    pub fn in_context(&self) -> bool {
        self.shards.iter().any(RingDispatcher::in_context)
    }

    /// Returns the shard index the selector assigns to `key`.
    #[must_use]
    pub fn shard_for(&self, key: u64) -> usize {
        (self.selector)(key, self.shards.len())
    }

    /// Routes a task to the shard its key selects.
    ///
    /// A task without a key routes as key 0, so unkeyed tasks all share one
    /// shard and stay mutually ordered.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Rejected` if the selected shard is not alive.
    pub fn dispatch(&self, task: Task) -> Result<(), DispatchError> {
        let key = task.key().unwrap_or(0);
        let index = self.shard_for(key);
        self.shards[index].dispatch(task)
    }

    /// Shuts down every shard, draining each within the default grace
    /// period.
    pub fn shutdown(&self) {
        for shard in &self.shards {
            shard.shutdown();
        }
    }

    /// Shuts down every shard, giving each up to `grace` to drain.
    ///
    /// Returns true only if every shard drained completely.
    pub fn shutdown_timeout(&self, grace: Duration) -> bool {
        let mut drained = true;
        for shard in &self.shards {
            drained &= shard.shutdown_timeout(grace);
        }
        drained
    }

    /// Halts every shard, discarding undelivered tasks.
    pub fn halt(&self) {
        for shard in &self.shards {
            shard.halt();
        }
    }
}

impl std::fmt::Debug for ActorDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorDispatcher")
            .field("name", &self.name)
            .field("shards", &self.shards.len())
            .field("state", &self.state())
            .finish()
    }
}
