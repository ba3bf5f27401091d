//! Bidirectional mapping between codec format names and RTP payload types
//!
//! Static RFC 3551 assignments plus the dynamic telephone-event payload.
//! Splitable formats have fixed-size samples, so oversized write buffers can
//! be fragmented on the preferred chunk boundary.

/// One entry of the payload table
#[derive(Debug, Clone, Copy)]
pub struct PayloadEntry {
    /// RTP payload type number
    pub payload: u8,

    /// Engine format name
    pub format: &'static str,

    /// RTP clock rate
    pub clock_rate: u32,

    /// Whether large buffers may be fragmented for this format
    pub splitable: bool,

    /// Preferred fragment size in bytes for splitable formats
    pub chunk: usize,
}

/// Static payload assignments (RFC 3551) with engine format names
pub const PAYLOAD_TABLE: &[PayloadEntry] = &[
    PayloadEntry { payload: 0, format: "mulaw", clock_rate: 8000, splitable: true, chunk: 160 },
    PayloadEntry { payload: 2, format: "g726", clock_rate: 8000, splitable: false, chunk: 0 },
    PayloadEntry { payload: 3, format: "gsm", clock_rate: 8000, splitable: false, chunk: 0 },
    PayloadEntry { payload: 4, format: "g723", clock_rate: 8000, splitable: false, chunk: 0 },
    PayloadEntry { payload: 7, format: "lpc10", clock_rate: 8000, splitable: false, chunk: 0 },
    PayloadEntry { payload: 8, format: "alaw", clock_rate: 8000, splitable: true, chunk: 160 },
    PayloadEntry { payload: 9, format: "g722/16000", clock_rate: 8000, splitable: false, chunk: 0 },
    PayloadEntry { payload: 11, format: "slin", clock_rate: 8000, splitable: true, chunk: 320 },
    PayloadEntry { payload: 15, format: "g728", clock_rate: 8000, splitable: false, chunk: 0 },
    PayloadEntry { payload: 18, format: "g729", clock_rate: 8000, splitable: false, chunk: 0 },
    PayloadEntry { payload: 31, format: "h261", clock_rate: 90000, splitable: false, chunk: 0 },
    PayloadEntry { payload: 34, format: "h263", clock_rate: 90000, splitable: false, chunk: 0 },
];

/// Look up the payload number for a format name
pub fn format_to_payload(format: &str) -> Option<u8> {
    PAYLOAD_TABLE.iter().find(|e| e.format == format).map(|e| e.payload)
}

/// Look up the format name for a payload number
pub fn payload_to_format(payload: u8) -> Option<&'static str> {
    PAYLOAD_TABLE.iter().find(|e| e.payload == payload).map(|e| e.format)
}

/// Full table entry for a format name
pub fn entry_for_format(format: &str) -> Option<&'static PayloadEntry> {
    PAYLOAD_TABLE.iter().find(|e| e.format == format)
}

/// Whether buffers of this format may be fragmented on send
pub fn is_splitable(format: &str) -> bool {
    entry_for_format(format).map(|e| e.splitable).unwrap_or(false)
}

/// Preferred fragment size for a splitable format; zero when not splitable
pub fn preferred_chunk(format: &str) -> usize {
    entry_for_format(format).map(|e| if e.splitable { e.chunk } else { 0 }).unwrap_or(0)
}
