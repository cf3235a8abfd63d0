//! Dispatcher error taxonomy.

use crate::bridge::protocol::RemoteError;

/// Failures surfaced to `dispatch` callers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatcherError {
    /// `dispatch` was called outside the Started state.
    #[error("dispatcher is not started")]
    NotStarted,

    /// The task does not reference a valid service.
    #[error("task does not reference a valid service")]
    InvalidService,

    /// The task's method name is empty or blank.
    #[error("method name must not be blank")]
    InvalidMethod,

    /// No service is registered under the requested name and scope.
    #[error("no service registered under name '{service}'")]
    ServiceNotRegistered { service: String },

    /// The payload could not be delivered, or the worker carrying it died.
    #[error("worker communication failed: {0}")]
    Communication(String),

    /// The worker-side method threw. Message and stack are preserved
    /// verbatim from the remote error.
    #[error("{message}")]
    Remote {
        message: String,
        stack: Option<String>,
    },

    /// The worker could not run its service initializer.
    #[error("service initializer failed: {0}")]
    Initializer(String),
}

impl DispatcherError {
    pub(crate) fn from_remote(error: RemoteError) -> Self {
        Self::Remote {
            message: error.message,
            stack: error.stack,
        }
    }

    /// The remote stack trace, when this is a remote invocation failure.
    pub fn remote_stack(&self) -> Option<&str> {
        match self {
            Self::Remote { stack, .. } => stack.as_deref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_error_displays_original_message() {
        let err = DispatcherError::from_remote(
            RemoteError::new("boom").with_stack("at service.rs:42"),
        );
        assert_eq!(err.to_string(), "boom");
        assert_eq!(err.remote_stack(), Some("at service.rs:42"));
    }

    #[test]
    fn non_remote_errors_have_no_stack() {
        assert!(DispatcherError::NotStarted.remote_stack().is_none());
        assert!(
            DispatcherError::Communication("pipe closed".to_string())
                .remote_stack()
                .is_none()
        );
    }
}
