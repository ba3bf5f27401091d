use thiserror::Error;

/// Result type for channel operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for channel operations
#[derive(Debug, Error)]
pub enum Error {
    /// Codec/format negotiation failed
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// A payload number outside the RTP range was requested
    #[error("Payload {0} out of range")]
    PayloadOutOfRange(i64),

    /// A network address could not be parsed or resolved
    #[error("Bad address: {0}")]
    BadAddress(String),

    /// The channel has been terminated
    #[error("Channel is no longer valid")]
    InvalidChannel,

    /// No channel matched the lookup
    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    /// SDP body could not be matched
    #[error("Unparsable SDP: {0}")]
    BadSdp(String),

    /// Error from the wire layer
    #[error("RTP error: {0}")]
    Rtp(#[from] rmedia_rtp_core::Error),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl From<&str> for Error {
    fn from(err: &str) -> Self {
        Error::Other(err.to_string())
    }
}
