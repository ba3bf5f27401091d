//! Secure RTP (SRTP) implementation
//!
//! AES-CM encryption with HMAC-SHA1 authentication per RFC 3711, with the
//! two SDES crypto suites used in telephony deployments. A failed
//! negotiation is non-fatal for callers: sessions fall back to cleartext.

use aes::cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use aes::Aes128;
use bytes::{BufMut, Bytes, BytesMut};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;
use tracing::debug;

use crate::error::Error;
use crate::packet::{RtpHeader, RtpPacket};
use crate::Result;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type HmacSha1 = Hmac<Sha1>;

/// Master key length for the AES-CM-128 suites
pub const MASTER_KEY_LEN: usize = 16;

/// Master salt length
pub const MASTER_SALT_LEN: usize = 14;

/// Session authentication key length
const AUTH_KEY_LEN: usize = 20;

/// SRTP crypto suites negotiable over SDES
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoSuite {
    /// AES-CM-128 with an 80-bit HMAC-SHA1 tag
    AesCm128HmacSha1_80,

    /// AES-CM-128 with a 32-bit HMAC-SHA1 tag
    AesCm128HmacSha1_32,
}

impl CryptoSuite {
    /// Parse an SDES suite name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "AES_CM_128_HMAC_SHA1_80" => Some(Self::AesCm128HmacSha1_80),
            "AES_CM_128_HMAC_SHA1_32" => Some(Self::AesCm128HmacSha1_32),
            _ => None,
        }
    }

    /// The SDES suite name
    pub fn name(&self) -> &'static str {
        match self {
            Self::AesCm128HmacSha1_80 => "AES_CM_128_HMAC_SHA1_80",
            Self::AesCm128HmacSha1_32 => "AES_CM_128_HMAC_SHA1_32",
        }
    }

    /// Authentication tag length in bytes
    pub fn tag_len(&self) -> usize {
        match self {
            Self::AesCm128HmacSha1_80 => 10,
            Self::AesCm128HmacSha1_32 => 4,
        }
    }
}

/// An SRTP master key with its salt
#[derive(Clone)]
pub struct MasterKey {
    key: [u8; MASTER_KEY_LEN],
    salt: [u8; MASTER_SALT_LEN],
}

impl MasterKey {
    pub fn new(key: [u8; MASTER_KEY_LEN], salt: [u8; MASTER_SALT_LEN]) -> Self {
        Self { key, salt }
    }

    /// Generate a fresh random key + salt
    pub fn generate() -> Self {
        let mut key = [0u8; MASTER_KEY_LEN];
        let mut salt = [0u8; MASTER_SALT_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        rand::thread_rng().fill_bytes(&mut salt);
        Self { key, salt }
    }

    /// Decode the SDES base64 form (key || salt, 30 bytes)
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let raw = base64::decode(encoded)
            .map_err(|e| Error::SrtpError(format!("Bad master key encoding: {}", e)))?;
        if raw.len() != MASTER_KEY_LEN + MASTER_SALT_LEN {
            return Err(Error::SrtpError(format!(
                "Master key must be {} bytes, got {}",
                MASTER_KEY_LEN + MASTER_SALT_LEN,
                raw.len()
            )));
        }
        let mut key = [0u8; MASTER_KEY_LEN];
        let mut salt = [0u8; MASTER_SALT_LEN];
        key.copy_from_slice(&raw[..MASTER_KEY_LEN]);
        salt.copy_from_slice(&raw[MASTER_KEY_LEN..]);
        Ok(Self { key, salt })
    }

    /// Encode to the SDES base64 form
    pub fn to_base64(&self) -> String {
        let mut raw = Vec::with_capacity(MASTER_KEY_LEN + MASTER_SALT_LEN);
        raw.extend_from_slice(&self.key);
        raw.extend_from_slice(&self.salt);
        base64::encode(raw)
    }
}

/// RFC 3711 key derivation labels
#[derive(Debug, Clone, Copy)]
enum KdfLabel {
    RtpEncryption = 0x00,
    RtpAuthentication = 0x01,
    RtpSalt = 0x02,
}

/// AES-CM PRF: generate `out.len()` keystream bytes for the given label
fn kdf(master: &MasterKey, label: KdfLabel, out: &mut [u8]) {
    // x = master_salt XOR (label || index/kdr); kdr is 0 here so only the
    // label byte lands in the XOR, at offset 7 of the 14-byte salt.
    let mut iv = [0u8; 16];
    iv[..MASTER_SALT_LEN].copy_from_slice(&master.salt);
    iv[7] ^= label as u8;

    let cipher = Aes128::new(&master.key.into());
    let mut counter: u16 = 0;
    let mut offset = 0;
    while offset < out.len() {
        let mut block = iv;
        block[14..16].copy_from_slice(&counter.to_be_bytes());
        let mut ga = aes::cipher::generic_array::GenericArray::from(block);
        cipher.encrypt_block(&mut ga);
        let take = (out.len() - offset).min(16);
        out[offset..offset + take].copy_from_slice(&ga[..take]);
        offset += take;
        counter = counter.wrapping_add(1);
    }
}

/// One-directional SRTP context (encrypt for send, or verify+decrypt for
/// receive).
pub struct SrtpContext {
    suite: CryptoSuite,
    session_key: [u8; MASTER_KEY_LEN],
    session_salt: [u8; MASTER_SALT_LEN],
    auth_key: [u8; AUTH_KEY_LEN],

    /// Roll-over counter
    roc: u32,

    /// Highest sequence number seen, for ROC maintenance
    last_seq: Option<u16>,
}

impl SrtpContext {
    /// Derive session keys from a master key
    pub fn new(suite: CryptoSuite, master: &MasterKey) -> Self {
        let mut session_key = [0u8; MASTER_KEY_LEN];
        let mut session_salt = [0u8; MASTER_SALT_LEN];
        let mut auth_key = [0u8; AUTH_KEY_LEN];
        kdf(master, KdfLabel::RtpEncryption, &mut session_key);
        kdf(master, KdfLabel::RtpSalt, &mut session_salt);
        kdf(master, KdfLabel::RtpAuthentication, &mut auth_key);
        debug!("Derived SRTP session keys for suite {}", suite.name());

        Self { suite, session_key, session_salt, auth_key, roc: 0, last_seq: None }
    }

    /// Negotiate from SDES parameters. Returns `None` (cleartext fallback)
    /// when the suite is unknown or the key malformed.
    pub fn negotiate(suite_name: &str, key_base64: &str) -> Option<Self> {
        let suite = CryptoSuite::from_name(suite_name)?;
        let master = MasterKey::from_base64(key_base64).ok()?;
        Some(Self::new(suite, &master))
    }

    pub fn suite(&self) -> CryptoSuite {
        self.suite
    }

    fn advance_index(&mut self, seq: u16) -> u64 {
        if let Some(last) = self.last_seq {
            // Sequence wrapped forward: bump the roll-over counter
            if seq < 0x1000 && last > 0xf000 {
                self.roc = self.roc.wrapping_add(1);
            }
        }
        self.last_seq = Some(seq);
        ((self.roc as u64) << 16) | seq as u64
    }

    fn keystream_iv(&self, ssrc: u32, index: u64) -> [u8; 16] {
        // IV = (salt * 2^16) XOR (ssrc * 2^64) XOR (index * 2^16)
        let mut iv = [0u8; 16];
        iv[..MASTER_SALT_LEN].copy_from_slice(&self.session_salt);
        for (i, b) in ssrc.to_be_bytes().iter().enumerate() {
            iv[4 + i] ^= b;
        }
        for (i, b) in index.to_be_bytes().iter().skip(2).enumerate() {
            iv[8 + i] ^= b;
        }
        iv
    }

    fn apply_keystream(&self, ssrc: u32, index: u64, data: &mut [u8]) {
        let iv = self.keystream_iv(ssrc, index);
        let mut cipher = Aes128Ctr::new(&self.session_key.into(), &iv.into());
        cipher.apply_keystream(data);
    }

    fn auth_tag(&self, auth_portion: &[u8], roc: u32) -> Vec<u8> {
        let mut mac = <HmacSha1 as Mac>::new_from_slice(&self.auth_key).expect("HMAC accepts any key size");
        mac.update(auth_portion);
        mac.update(&roc.to_be_bytes());
        let full = mac.finalize().into_bytes();
        full[..self.suite.tag_len()].to_vec()
    }

    /// Encrypt and authenticate an outgoing packet
    pub fn protect(&mut self, packet: &RtpPacket) -> Result<Bytes> {
        let index = self.advance_index(packet.header.sequence_number);

        let mut payload = packet.payload.to_vec();
        self.apply_keystream(packet.header.ssrc, index, &mut payload);

        let mut buf = BytesMut::with_capacity(packet.size() + self.suite.tag_len());
        packet.header.serialize(&mut buf)?;
        buf.put_slice(&payload);

        let tag = self.auth_tag(&buf, self.roc);
        buf.put_slice(&tag);
        Ok(buf.freeze())
    }

    /// Verify and decrypt an incoming packet
    pub fn unprotect(&mut self, data: &[u8]) -> Result<RtpPacket> {
        let tag_len = self.suite.tag_len();
        if data.len() < tag_len {
            return Err(Error::SrtpError("Packet shorter than auth tag".to_string()));
        }
        let (auth_portion, tag) = data.split_at(data.len() - tag_len);

        // Parse the header first to learn seq/ssrc for the index
        let mut reader = Bytes::copy_from_slice(auth_portion);
        let header = RtpHeader::parse(&mut reader)?;
        let index = self.advance_index(header.sequence_number);

        let expected = self.auth_tag(auth_portion, self.roc);
        if expected != tag {
            return Err(Error::SrtpError("Authentication tag mismatch".to_string()));
        }

        let mut payload = reader.to_vec();
        self.apply_keystream(header.ssrc, index, &mut payload);

        // Strip RTP padding after decryption, as the cleartext parser does
        if header.padding && !payload.is_empty() {
            let pad = payload[payload.len() - 1] as usize;
            if pad == 0 || pad > payload.len() {
                return Err(Error::SrtpError("bad padding count".to_string()));
            }
            payload.truncate(payload.len() - pad);
        }
        Ok(RtpPacket::new(header, Bytes::from(payload)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suite_names_round_trip() {
        for suite in [CryptoSuite::AesCm128HmacSha1_80, CryptoSuite::AesCm128HmacSha1_32] {
            assert_eq!(CryptoSuite::from_name(suite.name()), Some(suite));
        }
        assert_eq!(CryptoSuite::from_name("F8_128_HMAC_SHA1_80"), None);
    }

    #[test]
    fn test_master_key_base64_round_trip() {
        let master = MasterKey::generate();
        let encoded = master.to_base64();
        let decoded = MasterKey::from_base64(&encoded).unwrap();
        assert_eq!(master.key, decoded.key);
        assert_eq!(master.salt, decoded.salt);
    }

    #[test]
    fn test_bad_master_key_rejected() {
        assert!(MasterKey::from_base64("not base64 ***").is_err());
        assert!(MasterKey::from_base64(&base64::encode([0u8; 10])).is_err());
    }

    #[test]
    fn test_protect_unprotect_round_trip() {
        let master = MasterKey::generate();
        let mut tx = SrtpContext::new(CryptoSuite::AesCm128HmacSha1_80, &master);
        let mut rx = SrtpContext::new(CryptoSuite::AesCm128HmacSha1_80, &master);

        let packet = RtpPacket::new_with_payload(
            8,
            100,
            1600,
            0x12345678,
            Bytes::from_static(b"encrypted audio frame"),
        );

        let wire = tx.protect(&packet).unwrap();
        assert_ne!(&wire[12..12 + packet.payload.len()], packet.payload.as_ref());

        let recovered = rx.unprotect(&wire).unwrap();
        assert_eq!(recovered.header.sequence_number, 100);
        assert_eq!(recovered.payload, packet.payload);
    }

    #[test]
    fn test_tampered_packet_rejected() {
        let master = MasterKey::generate();
        let mut tx = SrtpContext::new(CryptoSuite::AesCm128HmacSha1_32, &master);
        let mut rx = SrtpContext::new(CryptoSuite::AesCm128HmacSha1_32, &master);

        let packet =
            RtpPacket::new_with_payload(0, 7, 160, 0xabcd0001, Bytes::from_static(b"frame"));
        let wire = tx.protect(&packet).unwrap();

        let mut tampered = wire.to_vec();
        let len = tampered.len();
        tampered[len - 1] ^= 0xff;
        assert!(rx.unprotect(&tampered).is_err());
    }

    #[test]
    fn test_negotiate_unknown_suite_falls_back() {
        let master = MasterKey::generate();
        assert!(SrtpContext::negotiate("NOT_A_SUITE", &master.to_base64()).is_none());
        assert!(SrtpContext::negotiate("AES_CM_128_HMAC_SHA1_80", "bad!key").is_none());
        assert!(SrtpContext::negotiate("AES_CM_128_HMAC_SHA1_80", &master.to_base64()).is_some());
    }
}
