pub type StoryResult<T> = Result<T, StoryError>;

#[derive(thiserror::Error, Debug)]
pub enum StoryError {
    /// An upstream source failed validation before any work started.
    #[error("setup rejected: {0}")]
    SetupRejected(String),

    /// A buffer was released to a pool or queue that does not own it.
    #[error("invalid buffer: {0}")]
    InvalidBuffer(String),

    /// An operation was attempted on a stage that is already torn down.
    /// Callers treat this as "no more data" rather than a fatal fault.
    #[error("source closed: {0}")]
    SourceClosed(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("encode error: {0}")]
    Encode(String),

    /// The run was stopped through the cancellation interface.
    #[error("production run cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StoryError {
    pub fn setup_rejected(msg: impl Into<String>) -> Self {
        Self::SetupRejected(msg.into())
    }

    pub fn invalid_buffer(msg: impl Into<String>) -> Self {
        Self::InvalidBuffer(msg.into())
    }

    pub fn source_closed(msg: impl Into<String>) -> Self {
        Self::SourceClosed(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    pub fn encode(msg: impl Into<String>) -> Self {
        Self::Encode(msg.into())
    }

    /// True when the error means "the stage is gone", not "the run failed".
    pub fn is_source_closed(&self) -> bool {
        matches!(self, Self::SourceClosed(_))
    }
}
