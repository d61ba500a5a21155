use memquota_core::id::ThreadId;
use thiserror::Error;

/// Result type local to memquota-mem.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{what} should be a positive number but it was {value}")]
    InvalidArgument { what: &'static str, value: i64 },

    #[error("invalid thread id for memory quota check")]
    InvalidState,

    #[error("thread allocated memory not supported by this environment")]
    Unsupported,

    #[error("allocation counter cannot sample {0}")]
    Untracked(ThreadId),

    #[error("no handler method '{method}' on type '{handler_type}'")]
    NoSuchMethod {
        handler_type: String,
        method: String,
    },

    #[error("method '{method}' in type '{handler_type}' is not public")]
    AccessDenied {
        handler_type: String,
        method: String,
    },

    /// Whatever the infringement handler raised, unmodified.
    #[error(transparent)]
    Handler(#[from] HandlerError),
}

impl Error {
    /// Setup-time errors: the watchdog or planner was configured wrongly.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::InvalidArgument { .. }
                | Error::Unsupported
                | Error::NoSuchMethod { .. }
                | Error::AccessDenied { .. }
        )
    }
}

/// Failure raised by an infringement handler.
///
/// `Stop` is the intended enforcement signal; `Failed` is a handler that
/// broke on its own. The watchdog treats both the same way: it returns them
/// to the caller of `check()` untouched.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("memory quota exceeded: {message}")]
    Stop { message: String },

    #[error("infringement handler failed: {0}")]
    Failed(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl HandlerError {
    pub fn stop(message: impl Into<String>) -> Self {
        HandlerError::Stop {
            message: message.into(),
        }
    }

    pub fn failed<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    {
        HandlerError::Failed(err.into())
    }

    pub fn is_stop(&self) -> bool {
        matches!(self, HandlerError::Stop { .. })
    }
}
