//! Minimal SDP matching and rewriting for the reflector
//!
//! The reflector does not implement SDP: it matches a raw body against
//! fixed expressions extracting the origin, connection and audio media
//! lines, and rewrites the address/port to point at itself. Anything it
//! cannot match drops the relay.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Error, Result};

static ORIGIN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^o=(\S+) +(\S+) +\S+ +IN +IP4 +(\S+)").unwrap());

static CONNECTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^c=IN +IP4 +([0-9A-Fa-f.:]+)").unwrap());

static MEDIA_AUDIO_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^m=audio +(\d+) +").unwrap());

/// Fields extracted from an SDP body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpInfo {
    /// Origin identity: username and session id from the `o=` line
    pub origin: String,

    /// Connection address from the `c=` line
    pub addr: String,

    /// Audio media port from the `m=audio` line
    pub port: u16,
}

/// Match an SDP body against the fixed expressions
pub fn parse_sdp(body: &str) -> Result<SdpInfo> {
    let origin = ORIGIN_RE
        .captures(body)
        .map(|c| format!("{} {}", &c[1], &c[2]))
        .ok_or_else(|| Error::BadSdp("no origin line".to_string()))?;
    let addr = CONNECTION_RE
        .captures(body)
        .map(|c| c[1].to_string())
        .ok_or_else(|| Error::BadSdp("no connection line".to_string()))?;
    let port = MEDIA_AUDIO_RE
        .captures(body)
        .and_then(|c| c[1].parse::<u16>().ok())
        .ok_or_else(|| Error::BadSdp("no audio media line".to_string()))?;

    Ok(SdpInfo { origin, addr, port })
}

/// Rewrite the connection address and audio port to the given values
pub fn rewrite_sdp(body: &str, addr: &str, port: u16) -> String {
    let body = CONNECTION_RE.replace_all(body, format!("c=IN IP4 {}", addr).as_str());
    MEDIA_AUDIO_RE.replace_all(&body, format!("m=audio {} ", port).as_str()).into_owned()
}
