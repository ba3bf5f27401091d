//! RFC 2833 / RFC 4733 telephone-event payload codec
//!
//! Telephone events travel in-band as a dedicated dynamic payload type. The
//! four-byte payload carries the event code, an end flag, volume and the
//! running duration in timestamp units.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::Error;
use crate::Result;

/// Serialized size of a telephone-event payload
pub const EVENT_PAYLOAD_SIZE: usize = 4;

/// Decoded telephone event (RFC 2833 payload)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelephoneEvent {
    /// Event code (0-15 are DTMF digits, 36 is CNG fax tone)
    pub event: u8,

    /// Set on the final packet of an event
    pub end: bool,

    /// Attenuation in dBm0 (0-63, larger is quieter)
    pub volume: u8,

    /// Event duration so far, in timestamp units
    pub duration: u16,
}

impl TelephoneEvent {
    pub fn new(event: u8, end: bool, volume: u8, duration: u16) -> Self {
        Self { event, end, volume: volume & 0x3f, duration }
    }

    /// Map a DTMF event code (0-15) to its character
    pub fn to_dtmf_char(&self) -> Option<char> {
        match self.event {
            0..=9 => Some((b'0' + self.event) as char),
            10 => Some('*'),
            11 => Some('#'),
            12..=15 => Some((b'A' + self.event - 12) as char),
            _ => None,
        }
    }

    /// Map a DTMF character to its event code
    pub fn code_for_char(c: char) -> Option<u8> {
        match c {
            '0'..='9' => Some(c as u8 - b'0'),
            '*' => Some(10),
            '#' => Some(11),
            'A'..='D' => Some(c as u8 - b'A' + 12),
            'a'..='d' => Some(c as u8 - b'a' + 12),
            _ => None,
        }
    }

    /// Parse an event payload
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < EVENT_PAYLOAD_SIZE {
            return Err(Error::BufferTooSmall {
                required: EVENT_PAYLOAD_SIZE,
                available: data.len(),
            });
        }
        let mut buf = data;
        let event = buf.get_u8();
        let b1 = buf.get_u8();
        let end = (b1 & 0x80) != 0;
        let volume = b1 & 0x3f;
        let duration = buf.get_u16();
        Ok(Self { event, end, volume, duration })
    }

    /// Serialize the event payload
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(EVENT_PAYLOAD_SIZE);
        buf.put_u8(self.event);
        let mut b1 = self.volume & 0x3f;
        if self.end {
            b1 |= 0x80;
        }
        buf.put_u8(b1);
        buf.put_u16(self.duration);
        buf.freeze()
    }
}
