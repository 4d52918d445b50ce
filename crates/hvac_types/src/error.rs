//! Error taxonomy
//!
//! Errors are `Clone` so they can travel inside [`Signal`](crate::Signal)s
//! across task boundaries.

/// Errors produced anywhere in the control pipeline
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unknown zone: {0}")]
    UnknownZone(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Partial failure: {0}")]
    PartialFailure(String),

    #[error("Total failure: {0}")]
    TotalFailure(String),

    #[error("Hardware I/O failure: {0}")]
    HardwareIo(String),

    #[error("No data received yet")]
    NoData,

    #[error("Device closed: {0}")]
    Closed(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Channel closed")]
    ChannelClosed,
}

/// Result type for control pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for [`Error::InvalidArgument`]
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Shorthand for [`Error::IllegalState`]
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState(message.into())
    }

    /// Retrying the same operation can't succeed
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::Closed(_) | Self::ChannelClosed | Self::InvalidArgument(_) | Self::Unsupported(_)
        )
    }
}
