use thiserror::Error;

/// Error taxonomy shared across the control plane.
#[derive(Debug, Error)]
pub enum LinkError {
    /// Malformed frame or command; the offending packet/line is dropped.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The radio backend session is down; mutations are rejected softly.
    #[error("radio backend disconnected")]
    BackendDisconnected,

    /// The backend command queue is saturated.
    #[error("radio backend command queue full")]
    QueueFull,

    /// A decoder-app child exited unexpectedly.
    #[error("decoder process for {0} exited")]
    ChildExited(String),

    /// QSO sequencer gave up waiting for the peer in one state.
    #[error("qso state timed out")]
    QsoTimeout,

    /// QSO sequencer exhausted its retry budget.
    #[error("qso max retries exhausted")]
    QsoMaxRetries,

    /// A QSO is already running for this instance.
    #[error("qso already in progress for {0}")]
    QsoBusy(String),

    /// Operator command referenced an instance that does not exist.
    #[error("no such instance: {0}")]
    UnknownInstance(String),

    /// Request would break a state invariant; rejected and logged.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<crate::wsjtx::qt::CodecError> for LinkError {
    fn from(e: crate::wsjtx::qt::CodecError) -> Self {
        LinkError::Protocol(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LinkError>;
