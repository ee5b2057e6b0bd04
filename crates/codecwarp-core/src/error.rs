use thiserror::Error;

/// Session-level errors returned synchronously from the public API
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("queue exhausted: {depth} unresolved items, hard limit is {limit}")]
    ResourceExhausted { depth: usize, limit: usize },

    #[error("codec failure: {0}")]
    CodecFailure(String),

    #[error("codec handle is unusable: {0}")]
    CodecUnusable(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("operation aborted by reset or close")]
    Aborted,
}

impl SessionError {
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        SessionError::InvalidState(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        SessionError::Validation(msg.into())
    }
}

impl From<CodecError> for SessionError {
    fn from(err: CodecError) -> Self {
        if err.is_fatal() {
            SessionError::CodecUnusable(err.to_string())
        } else {
            SessionError::CodecFailure(err.to_string())
        }
    }
}

/// Errors reported by a codec handle or format converter
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("codec not found: {0}")]
    CodecNotFound(String),

    #[error("codec initialization failed: {0}")]
    InitFailed(String),

    #[error("submit failed: {0}")]
    SubmitFailed(String),

    #[error("receiving output failed: {0}")]
    ReceiveFailed(String),

    #[error("format conversion failed: {0}")]
    ConversionFailed(String),

    #[error("end of stream already signalled")]
    EndOfStream,

    #[error("codec handle is unusable: {0}")]
    Unusable(String),
}

impl CodecError {
    /// True when the handle can no longer accept work and must be recreated
    pub fn is_fatal(&self) -> bool {
        matches!(self, CodecError::Unusable(_))
    }
}

/// Kind of an asynchronous error delivered on the error channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A single item failed; the session stays usable
    CodecFailure,
    /// The codec handle is corrupted; only reset or close are accepted
    CodecUnusable,
}

impl ErrorKind {
    pub fn of(err: &CodecError) -> Self {
        if err.is_fatal() {
            ErrorKind::CodecUnusable
        } else {
            ErrorKind::CodecFailure
        }
    }
}
