//! UDPTL datagram framing for T.38 fax transport
//!
//! Each datagram carries a sequence number, a primary IFP packet and zero or
//! more redundancy copies of the preceding IFP packets so that single lost
//! datagrams can be recovered from a later one. Lengths use the PER-style
//! determinant: one byte below 128, two bytes with the high bit set otherwise.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::Error;
use crate::Result;

/// Default maximum datagram size when the negotiated value is unusable
pub const MAX_DATAGRAM_DEFAULT: u16 = 250;

/// Smallest maximum datagram size considered sane
pub const MAX_DATAGRAM_FLOOR: u16 = 96;

/// Upper bound on the negotiated redundancy count
pub const MAX_REDUNDANCY: u8 = 16;

/// Clamp a signalled max-datagram value.
///
/// Values below the floor are treated as unusable and replaced with the
/// default rather than the floor itself.
pub fn clamp_max_datagram(value: u16) -> u16 {
    if value < MAX_DATAGRAM_FLOOR {
        MAX_DATAGRAM_DEFAULT
    } else {
        value
    }
}

/// Clamp a signalled redundancy count to `[0, 16]`.
pub fn clamp_redundancy(value: u32) -> u8 {
    value.min(MAX_REDUNDANCY as u32) as u8
}

/// A UDPTL datagram: primary IFP packet plus redundancy entries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdptlPacket {
    /// Datagram sequence number
    pub seq: u16,

    /// Primary IFP packet
    pub primary: Bytes,

    /// Redundancy entries; entry `i` repeats the IFP packet for `seq - 1 - i`
    pub redundancy: Vec<Bytes>,
}

fn put_len(buf: &mut BytesMut, len: usize) -> Result<()> {
    if len < 0x80 {
        buf.put_u8(len as u8);
    } else if len < 0x4000 {
        buf.put_u8(0x80 | (len >> 8) as u8);
        buf.put_u8(len as u8);
    } else {
        return Err(Error::EncodeError(format!("IFP packet too large: {} bytes", len)));
    }
    Ok(())
}

fn get_len(buf: &mut impl Buf) -> Result<usize> {
    if buf.remaining() < 1 {
        return Err(Error::DecodeError("missing length determinant".to_string()));
    }
    let b0 = buf.get_u8();
    if b0 < 0x80 {
        Ok(b0 as usize)
    } else {
        if buf.remaining() < 1 {
            return Err(Error::DecodeError("truncated length determinant".to_string()));
        }
        Ok((((b0 & 0x3f) as usize) << 8) | buf.get_u8() as usize)
    }
}

impl UdptlPacket {
    pub fn new(seq: u16, primary: Bytes) -> Self {
        Self { seq, primary, redundancy: Vec::new() }
    }

    /// Parse a datagram from raw bytes
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut buf = Bytes::copy_from_slice(data);
        if buf.remaining() < 2 {
            return Err(Error::BufferTooSmall { required: 2, available: buf.remaining() });
        }
        let seq = buf.get_u16();

        let primary_len = get_len(&mut buf)?;
        if buf.remaining() < primary_len {
            return Err(Error::DecodeError("truncated primary IFP packet".to_string()));
        }
        let primary = buf.copy_to_bytes(primary_len);

        let mut redundancy = Vec::new();
        if buf.remaining() > 0 {
            let count = buf.get_u8() as usize;
            if count > MAX_REDUNDANCY as usize {
                return Err(Error::DecodeError(format!("redundancy count {} too large", count)));
            }
            for _ in 0..count {
                let len = get_len(&mut buf)?;
                if buf.remaining() < len {
                    return Err(Error::DecodeError("truncated redundancy entry".to_string()));
                }
                redundancy.push(buf.copy_to_bytes(len));
            }
        }

        Ok(Self { seq, primary, redundancy })
    }

    /// Serialize the datagram, enforcing the negotiated maximum length
    pub fn serialize(&self, max_len: u16) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.primary.len() + 16);
        buf.put_u16(self.seq);
        put_len(&mut buf, self.primary.len())?;
        buf.put_slice(&self.primary);

        // Redundancy is best effort: only the entries that fit are carried
        let mut budget = (max_len as usize).saturating_sub(buf.len() + 1);
        let mut carried = 0;
        for entry in &self.redundancy {
            if entry.len() + 2 > budget {
                break;
            }
            budget -= entry.len() + 2;
            carried += 1;
        }
        buf.put_u8(carried as u8);
        for entry in self.redundancy.iter().take(carried) {
            put_len(&mut buf, entry.len())?;
            buf.put_slice(entry);
        }

        if buf.len() > max_len as usize {
            return Err(Error::EncodeError(format!(
                "datagram {} bytes exceeds negotiated maximum {}",
                buf.len(),
                max_len
            )));
        }
        Ok(buf.freeze())
    }
}
