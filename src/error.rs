use std::sync::Arc;
use thiserror::Error;

/// Outcome of a [`CancelableTask`](crate::CancelableTask).
pub type TaskResult = Result<serde_json::Value, ExecError>;

/// Coarse error classes callers can match on without caring which executor
/// produced the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    CommandNotFound,
    InvalidHandlerShape,
    InvalidRegistry,
    NotCancelable,
    Canceled,
    Config,
    HandlerFailure,
}

/// Every way dispatching a command can fail.
///
/// The type is `Clone` because a settled task hands the same error to every
/// consumer awaiting it. Handler failures keep the original [`anyhow::Error`]
/// behind an `Arc` and are forwarded verbatim.
#[derive(Debug, Clone, Error)]
pub enum ExecError {
    /// The name is absent from a leaf executor's registry.
    #[error("command not found: {0}")]
    CommandNotFound(String),

    /// No child of a composite executor declares the name.
    #[error("no executors found for command: {0}")]
    NoExecutors(String),

    #[error("invalid command \"{0}\"")]
    InvalidHandler(String),

    #[error("{0}")]
    InvalidRegistry(String),

    #[error("command cannot be stopped")]
    NotCancelable,

    #[error("command was canceled")]
    Canceled,

    #[error("{0}")]
    Config(String),

    #[error("{0:#}")]
    Handler(Arc<anyhow::Error>),
}

impl ExecError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecError::CommandNotFound(_) | ExecError::NoExecutors(_) => ErrorKind::CommandNotFound,
            ExecError::InvalidHandler(_) => ErrorKind::InvalidHandlerShape,
            ExecError::InvalidRegistry(_) => ErrorKind::InvalidRegistry,
            ExecError::NotCancelable => ErrorKind::NotCancelable,
            ExecError::Canceled => ErrorKind::Canceled,
            ExecError::Config(_) => ErrorKind::Config,
            ExecError::Handler(_) => ErrorKind::HandlerFailure,
        }
    }

    /// Wrap a failure reported by handler code.
    pub fn handler(err: anyhow::Error) -> Self {
        ExecError::Handler(Arc::new(err))
    }

    /// The underlying handler error, if this is a handler failure.
    pub fn as_handler_error(&self) -> Option<&anyhow::Error> {
        match self {
            ExecError::Handler(err) => Some(err),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for ExecError {
    fn from(err: anyhow::Error) -> Self {
        ExecError::handler(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_failures_share_a_kind() {
        let leaf = ExecError::CommandNotFound("build".into());
        let composite = ExecError::NoExecutors("build".into());

        assert_eq!(leaf.kind(), ErrorKind::CommandNotFound);
        assert_eq!(composite.kind(), ErrorKind::CommandNotFound);
        assert_ne!(leaf.to_string(), composite.to_string());
        assert_eq!(composite.to_string(), "no executors found for command: build");
    }

    #[test]
    fn test_handler_error_is_forwarded_verbatim() {
        let err = ExecError::from(anyhow::anyhow!("disk full"));
        assert_eq!(err.kind(), ErrorKind::HandlerFailure);
        assert_eq!(err.to_string(), "disk full");
        assert_eq!(err.as_handler_error().unwrap().to_string(), "disk full");
    }

    #[test]
    fn test_invalid_handler_message_quotes_the_name() {
        let err = ExecError::InvalidHandler("invalid".into());
        assert_eq!(err.to_string(), "invalid command \"invalid\"");
        assert_eq!(err.kind(), ErrorKind::InvalidHandlerShape);
    }
}
