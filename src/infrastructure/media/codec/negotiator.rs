//! Codec Negotiation
//!
//! Fixed codec table and payload-type based selection. Only G.711 is
//! negotiated; G.722 is recognised so its payload type can be named in logs
//! and rtpmap lines, but it is never picked.

use serde::Serialize;
use std::fmt;

/// Codec Information
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Codec {
    pub name: &'static str,
    pub payload_type: u8,
    pub clock_rate: u32,
    pub channels: u8,
}

pub const PCMU: Codec = Codec {
    name: "PCMU",
    payload_type: 0,
    clock_rate: 8000,
    channels: 1,
};

pub const PCMA: Codec = Codec {
    name: "PCMA",
    payload_type: 8,
    clock_rate: 8000,
    channels: 1,
};

/// RTP clock for G.722 is 8000 even though it samples at 16 kHz (RFC 3551)
pub const G722: Codec = Codec {
    name: "G722",
    payload_type: 9,
    clock_rate: 8000,
    channels: 1,
};

/// Negotiation preference order
pub const SUPPORTED_CODECS: [Codec; 2] = [PCMU, PCMA];

/// Every codec this engine can name
const KNOWN_CODECS: [Codec; 3] = [PCMU, PCMA, G722];

impl Codec {
    /// Get encoding name for rtpmap
    pub fn encoding(&self) -> String {
        format!("{}/{}", self.name, self.clock_rate)
    }

    /// Payload bytes in one packet of `ptime_ms` (one byte per sample for G.711)
    pub fn samples_per_packet(&self, ptime_ms: u32) -> usize {
        (self.clock_rate * ptime_ms / 1000) as usize
    }

    /// Encoded digital silence
    pub fn silence_byte(&self) -> u8 {
        match self.payload_type {
            0 => 0xFF,
            8 => 0xD5,
            _ => 0x00,
        }
    }

    pub fn is_supported(&self) -> bool {
        SUPPORTED_CODECS
            .iter()
            .any(|c| c.payload_type == self.payload_type)
    }
}

impl Default for Codec {
    fn default() -> Self {
        PCMU
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} (pt {})", self.name, self.clock_rate, self.payload_type)
    }
}

/// Pick the first supported codec that the remote side offered, PCMU otherwise
pub fn negotiate_codec(remote_payload_types: &[u8]) -> Codec {
    SUPPORTED_CODECS
        .iter()
        .find(|c| remote_payload_types.contains(&c.payload_type))
        .copied()
        .unwrap_or(PCMU)
}

/// Look up a known codec by payload type
pub fn codec_for_payload_type(payload_type: u8) -> Option<Codec> {
    KNOWN_CODECS
        .iter()
        .find(|c| c.payload_type == payload_type)
        .copied()
}

/// Look up a known codec by rtpmap encoding name (case-insensitive)
pub fn codec_for_name(name: &str) -> Option<Codec> {
    KNOWN_CODECS
        .iter()
        .find(|c| c.name.eq_ignore_ascii_case(name))
        .copied()
}
