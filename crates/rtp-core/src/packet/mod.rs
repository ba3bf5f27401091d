//! RTP, telephone-event and UDPTL packet definitions and processing

pub mod event;
pub mod udptl;

pub use event::TelephoneEvent;
pub use udptl::{UdptlPacket, MAX_DATAGRAM_DEFAULT, MAX_DATAGRAM_FLOOR, MAX_REDUNDANCY};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::Error;
use crate::Result;

/// Minimum size of an RTP header in bytes
pub const RTP_MIN_HEADER_SIZE: usize = 12;

/// RTP protocol version
pub const RTP_VERSION: u8 = 2;

/// RTP packet header (RFC 3550)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    /// Protocol version (always 2)
    pub version: u8,

    /// Padding flag
    pub padding: bool,

    /// Extension flag
    pub extension: bool,

    /// CSRC count
    pub cc: u8,

    /// Marker bit
    pub marker: bool,

    /// Payload type (7 bits)
    pub payload_type: u8,

    /// Sequence number
    pub sequence_number: u16,

    /// Timestamp
    pub timestamp: u32,

    /// Synchronization source
    pub ssrc: u32,

    /// Contributing sources
    pub csrc: Vec<u32>,

    /// Extension header id (present when `extension` is set)
    pub extension_id: Option<u16>,

    /// Extension data (word-aligned)
    pub extension_data: Option<Bytes>,
}

impl RtpHeader {
    /// Create a new header with the given payload type, sequence, timestamp and SSRC
    pub fn new(payload_type: u8, sequence_number: u16, timestamp: u32, ssrc: u32) -> Self {
        Self {
            version: RTP_VERSION,
            padding: false,
            extension: false,
            cc: 0,
            marker: false,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc: Vec::new(),
            extension_id: None,
            extension_data: None,
        }
    }

    /// Size of the serialized header in bytes
    pub fn size(&self) -> usize {
        let mut size = RTP_MIN_HEADER_SIZE + self.csrc.len() * 4;
        if self.extension {
            // extension header word + padded data
            let data_len = self.extension_data.as_ref().map(|d| d.len()).unwrap_or(0);
            size += 4 + (data_len + 3) / 4 * 4;
        }
        size
    }

    /// Parse an RTP header, advancing the reader past it
    pub fn parse(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < RTP_MIN_HEADER_SIZE {
            return Err(Error::BufferTooSmall {
                required: RTP_MIN_HEADER_SIZE,
                available: buf.remaining(),
            });
        }

        let b0 = buf.get_u8();
        let version = (b0 >> 6) & 0x03;
        if version != RTP_VERSION {
            return Err(Error::InvalidPacket(format!("RTP version {} not supported", version)));
        }
        let padding = ((b0 >> 5) & 0x01) == 1;
        let extension = ((b0 >> 4) & 0x01) == 1;
        let cc = b0 & 0x0f;

        let b1 = buf.get_u8();
        let marker = (b1 >> 7) == 1;
        let payload_type = b1 & 0x7f;

        let sequence_number = buf.get_u16();
        let timestamp = buf.get_u32();
        let ssrc = buf.get_u32();

        let mut csrc = Vec::with_capacity(cc as usize);
        if buf.remaining() < cc as usize * 4 {
            return Err(Error::InvalidPacket("truncated CSRC list".to_string()));
        }
        for _ in 0..cc {
            csrc.push(buf.get_u32());
        }

        let (extension_id, extension_data) = if extension {
            if buf.remaining() < 4 {
                return Err(Error::InvalidPacket("truncated extension header".to_string()));
            }
            let id = buf.get_u16();
            let words = buf.get_u16() as usize;
            let len = words * 4;
            if buf.remaining() < len {
                return Err(Error::InvalidPacket("truncated extension data".to_string()));
            }
            (Some(id), Some(buf.copy_to_bytes(len)))
        } else {
            (None, None)
        };

        Ok(Self {
            version,
            padding,
            extension,
            cc,
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc,
            extension_id,
            extension_data,
        })
    }

    /// Serialize the header into the given buffer
    pub fn serialize(&self, buf: &mut BytesMut) -> Result<()> {
        buf.reserve(self.size());

        let mut b0 = (self.version & 0x03) << 6;
        if self.padding {
            b0 |= 1 << 5;
        }
        if self.extension {
            b0 |= 1 << 4;
        }
        b0 |= self.cc & 0x0f;
        buf.put_u8(b0);

        let mut b1 = self.payload_type & 0x7f;
        if self.marker {
            b1 |= 1 << 7;
        }
        buf.put_u8(b1);

        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);

        for csrc in &self.csrc {
            buf.put_u32(*csrc);
        }

        if self.extension {
            let data = self.extension_data.as_deref().unwrap_or(&[]);
            let words = (data.len() + 3) / 4;
            buf.put_u16(self.extension_id.unwrap_or(0));
            buf.put_u16(words as u16);
            buf.put_slice(data);
            for _ in data.len()..words * 4 {
                buf.put_u8(0);
            }
        }

        Ok(())
    }
}

/// A full RTP packet (header + payload)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    /// Packet header
    pub header: RtpHeader,

    /// Payload data
    pub payload: Bytes,
}

impl RtpPacket {
    /// Create a packet from an existing header and payload
    pub fn new(header: RtpHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Create a packet with a fresh header
    pub fn new_with_payload(
        payload_type: u8,
        sequence_number: u16,
        timestamp: u32,
        ssrc: u32,
        payload: Bytes,
    ) -> Self {
        Self {
            header: RtpHeader::new(payload_type, sequence_number, timestamp, ssrc),
            payload,
        }
    }

    /// Total serialized size in bytes
    pub fn size(&self) -> usize {
        self.header.size() + self.payload.len()
    }

    /// Parse a packet from raw bytes
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut buf = Bytes::copy_from_slice(data);
        let header = RtpHeader::parse(&mut buf)?;

        // Strip padding if flagged: the last octet counts the pad bytes
        let payload = if header.padding && !buf.is_empty() {
            let pad = data[data.len() - 1] as usize;
            if pad == 0 || pad > buf.remaining() {
                return Err(Error::InvalidPacket("bad padding count".to_string()));
            }
            let len = buf.remaining() - pad;
            buf.copy_to_bytes(len)
        } else {
            buf
        };

        Ok(Self { header, payload })
    }

    /// Serialize the packet to bytes
    pub fn serialize(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.size());
        self.header.serialize(&mut buf)?;
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }
}

/// Format a byte slice as space-separated hex, for debug logging
pub fn hex_dump(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join(" ")
}
