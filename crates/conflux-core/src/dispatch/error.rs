//! Dispatch error types.

use std::any::Any;
use std::sync::Arc;

use super::DispatcherState;

/// Errors surfaced synchronously at the `dispatch` call site.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    /// The dispatcher is no longer accepting tasks.
    #[error("dispatcher `{name}` rejected task: state is {state:?}")]
    Rejected {
        /// Dispatcher name.
        name: String,
        /// Lifecycle state observed at dispatch time.
        state: DispatcherState,
    },

    /// A bounded buffer is full and the overflow policy is `Reject`.
    #[error("dispatcher `{name}` buffer is full")]
    BufferFull {
        /// Dispatcher name.
        name: String,
    },

    /// A worker thread could not be spawned.
    #[error("dispatcher `{name}` failed to spawn worker: {message}")]
    SpawnFailed {
        /// Dispatcher name.
        name: String,
        /// OS error description.
        message: String,
    },
}

/// A stage transformation failure captured during task execution.
///
/// Carries the panic message of the failing stage closure. Cloneable so a
/// single failure can fan out along every downstream error channel.
#[derive(Debug, Clone, thiserror::Error)]
#[error("stage execution failed: {message}")]
pub struct StageError {
    message: Arc<str>,
}

impl StageError {
    /// Creates a stage error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Arc::from(message.into()),
        }
    }

    /// Converts a captured panic payload into a stage error.
    #[must_use]
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        Self::new(super::task::panic_message(payload))
    }

    /// Returns the failure message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_error_display() {
        let err = StageError::new("division by zero");
        assert_eq!(
            err.to_string(),
            "stage execution failed: division by zero"
        );
        assert_eq!(err.message(), "division by zero");
    }

    #[test]
    fn test_stage_error_clone_shares_message() {
        let err = StageError::new("shared");
        let clone = err.clone();
        assert_eq!(err.message(), clone.message());
    }

    #[test]
    fn test_dispatch_error_display() {
        let err = DispatchError::Rejected {
            name: "ringBuffer".to_string(),
            state: DispatcherState::Terminated,
        };
        assert!(err.to_string().contains("ringBuffer"));
        assert!(err.to_string().contains("Terminated"));

        let err = DispatchError::BufferFull {
            name: "ringBuffer".to_string(),
        };
        assert!(err.to_string().contains("full"));
    }
}
