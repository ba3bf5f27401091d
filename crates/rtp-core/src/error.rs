use std::io;
use thiserror::Error;

/// Error type for RTP/UDPTL operations
#[derive(Debug, Error, Clone)]
pub enum Error {
    /// Error when encoding a packet
    #[error("Failed to encode packet: {0}")]
    EncodeError(String),

    /// Error when decoding a packet
    #[error("Failed to decode packet: {0}")]
    DecodeError(String),

    /// Invalid packet format
    #[error("Invalid packet format: {0}")]
    InvalidPacket(String),

    /// Buffer too small
    #[error("Buffer too small: need {required} but have {available}")]
    BufferTooSmall { required: usize, available: usize },

    /// Invalid parameter for an operation
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// IO error when sending/receiving packets
    #[error("IO error: {0}")]
    IoError(String),

    /// No local port could be bound from the configured range
    #[error("No free port in range {min}..{max}")]
    PortExhausted { min: u16, max: u16 },

    /// Session error
    #[error("Session error: {0}")]
    SessionError(String),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// SRTP error
    #[error("SRTP error: {0}")]
    SrtpError(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err.to_string())
    }
}
