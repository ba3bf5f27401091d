//! RTP/UDPTL wire core for the RMEDIA relay
//!
//! This crate provides the wire-level half of the media relay: RTP packet
//! encoding/decoding, RFC 2833 telephone events, UDPTL fax framing, UDP
//! transport with paired RTP/RTCP sockets, SRTP protection and the
//! receive-side session state machines.
//!
//! The library is organized into several modules:
//!
//! - `packet`: RTP, telephone-event and UDPTL packet definitions
//! - `transport`: network transport and local port allocation
//! - `session`: receive-session state machines and the packet pump
//! - `srtp`: Secure RTP contexts and crypto-suite negotiation
//! - `stats`: transfer statistics
//! - `sync`: one-shot latches and the busy-flag handshake

mod error;

// Main modules
pub mod packet;
pub mod session;
pub mod srtp;
pub mod stats;
pub mod sync;
pub mod transport;

// Re-export core types
pub use error::Error;

pub use packet::{RtpHeader, RtpPacket, TelephoneEvent, UdptlPacket};
pub use session::{
    RtpReceiver, RtpSession, RtpSessionConfig, SessionEvents, SsrcPolicy, TimeoutConfig,
    UdptlEvents, UdptlReceiver, UdptlSession, UdptlSessionConfig, DEFAULT_EVENT_PAYLOAD,
};
pub use stats::TransferStats;
pub use sync::{BusyFlag, OnceLatch};
pub use transport::{PortRange, RtpTransportConfig, UdpTransport};

/// The default maximum size for RTP packets in bytes
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1500;

/// RTP payload type carrying comfort noise / silence indication (RFC 3389)
pub const SILENCE_PAYLOAD_TYPE: u8 = 13;

/// Telephone-event code signalling a CNG fax calling tone
pub const EVENT_CNG_FAX_TONE: u8 = 36;

/// Typedef for RTP timestamp values
pub type RtpTimestamp = u32;

/// Typedef for RTP sequence numbers
pub type RtpSequenceNumber = u16;

/// Typedef for RTP synchronization source identifier
pub type RtpSsrc = u32;

/// Result type for RTP operations
pub type Result<T> = std::result::Result<T, Error>;

/// Prelude module with commonly used types
pub mod prelude {
    pub use crate::{
        Error, Result, RtpHeader, RtpPacket, RtpSequenceNumber, RtpSession, RtpSessionConfig,
        RtpSsrc, RtpTimestamp, SessionEvents, TransferStats, UdptlPacket, UdptlSession,
    };
}
