//! SDP (Session Description Protocol) offer/answer handling
//!
//! Bodies are the minimal audio-only form:
//! `v/o/s/c/t/m/a=rtpmap/a=ptime/a=sendrecv`.

use super::message::SipError;
use crate::infrastructure::media::codec::{negotiate_codec, Codec, SUPPORTED_CODECS};
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;

pub const DEFAULT_PTIME: u32 = 20;

/// Inputs for generating a local SDP body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpConfig {
    pub local_ip: String,
    pub port: u16,
    pub codecs: Vec<Codec>,
    pub ptime: u32,
    pub session_id: u64,
}

impl SdpConfig {
    pub fn new(local_ip: impl Into<String>, port: u16, codecs: Vec<Codec>) -> Self {
        Self {
            local_ip: local_ip.into(),
            port,
            codecs,
            ptime: DEFAULT_PTIME,
            session_id: chrono::Utc::now().timestamp().max(0) as u64,
        }
    }
}

/// Offer advertising every supported codec
pub fn default_sdp_config(local_ip: &str, port: u16) -> SdpConfig {
    SdpConfig::new(local_ip, port, SUPPORTED_CODECS.to_vec())
}

/// Answer confirming a single negotiated codec
pub fn negotiated_sdp_config(local_ip: &str, port: u16, codec: Codec) -> SdpConfig {
    SdpConfig::new(local_ip, port, vec![codec])
}

fn address_type(ip: &str) -> &'static str {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V6(_)) => "IP6",
        _ => "IP4",
    }
}

pub fn generate_sdp(config: &SdpConfig) -> String {
    let addr_type = address_type(&config.local_ip);
    let payload_types: Vec<String> = config
        .codecs
        .iter()
        .map(|c| c.payload_type.to_string())
        .collect();

    let mut sdp = String::new();
    sdp.push_str("v=0\r\n");
    sdp.push_str(&format!(
        "o=voxsip {} {} IN {} {}\r\n",
        config.session_id, config.session_id, addr_type, config.local_ip
    ));
    sdp.push_str("s=voxsip\r\n");
    sdp.push_str(&format!("c=IN {} {}\r\n", addr_type, config.local_ip));
    sdp.push_str("t=0 0\r\n");
    sdp.push_str(&format!(
        "m=audio {} RTP/AVP {}\r\n",
        config.port,
        payload_types.join(" ")
    ));
    for codec in &config.codecs {
        sdp.push_str(&format!(
            "a=rtpmap:{} {}\r\n",
            codec.payload_type,
            codec.encoding()
        ));
    }
    sdp.push_str(&format!("a=ptime:{}\r\n", config.ptime));
    sdp.push_str("a=sendrecv\r\n");
    sdp
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpDirection {
    #[default]
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl SdpDirection {
    fn from_attribute(value: &str) -> Option<Self> {
        match value {
            "sendrecv" => Some(SdpDirection::SendRecv),
            "sendonly" => Some(SdpDirection::SendOnly),
            "recvonly" => Some(SdpDirection::RecvOnly),
            "inactive" => Some(SdpDirection::Inactive),
            _ => None,
        }
    }
}

impl fmt::Display for SdpDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SdpDirection::SendRecv => "sendrecv",
            SdpDirection::SendOnly => "sendonly",
            SdpDirection::RecvOnly => "recvonly",
            SdpDirection::Inactive => "inactive",
        };
        f.write_str(s)
    }
}

/// Audio description extracted from a remote SDP body
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SdpMediaInfo {
    pub connection_ip: String,
    pub audio_port: u16,
    pub payload_types: Vec<u8>,
    pub preferred_codec: Codec,
    pub direction: SdpDirection,
}

impl SdpMediaInfo {
    /// Null connection address or a direction that stops our inbound audio
    pub fn is_hold(&self) -> bool {
        self.connection_ip == "0.0.0.0"
            || matches!(
                self.direction,
                SdpDirection::SendOnly | SdpDirection::Inactive
            )
    }

    /// Usable RTP target
    pub fn has_media_target(&self) -> bool {
        !self.connection_ip.is_empty() && self.connection_ip != "0.0.0.0" && self.audio_port > 0
    }
}

pub fn is_hold(info: &SdpMediaInfo) -> bool {
    info.is_hold()
}

/// Parse the first audio stream of an SDP body
///
/// Only a structurally empty body is an error; missing fields fall back to
/// an empty address, port 0 and PCMU.
pub fn parse_sdp(body: &[u8]) -> Result<SdpMediaInfo, SipError> {
    let text = String::from_utf8_lossy(body);
    if text.trim().is_empty() {
        return Err(SipError::SdpParse("empty SDP body".to_string()));
    }

    let mut session_ip = String::new();
    let mut media_ip: Option<String> = None;
    let mut session_direction: Option<SdpDirection> = None;
    let mut media_direction: Option<SdpDirection> = None;
    let mut audio_port = 0u16;
    let mut payload_types = Vec::new();
    let mut in_audio = false;
    let mut seen_audio = false;

    for line in text.lines() {
        let line = line.trim();
        let Some((field_type, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();

        match field_type {
            "c" => {
                // c=IN IP4 10.0.0.5
                let Some(address) = value.split_whitespace().nth(2) else {
                    continue;
                };
                // strip a multicast TTL suffix
                let address = address.split('/').next().unwrap_or(address).to_string();
                if in_audio {
                    media_ip = Some(address);
                } else if !seen_audio {
                    session_ip = address;
                }
            }
            "m" => {
                in_audio = false;
                if seen_audio {
                    continue;
                }
                let parts: Vec<&str> = value.split_whitespace().collect();
                if parts.first() == Some(&"audio") && parts.len() >= 3 {
                    in_audio = true;
                    seen_audio = true;
                    audio_port = parts[1]
                        .split('/')
                        .next()
                        .and_then(|p| p.parse().ok())
                        .unwrap_or(0);
                    payload_types = parts[3..]
                        .iter()
                        .filter_map(|pt| pt.parse::<u8>().ok())
                        .collect();
                }
            }
            "a" => {
                if let Some(direction) = SdpDirection::from_attribute(value) {
                    if in_audio {
                        media_direction = Some(direction);
                    } else if !seen_audio {
                        session_direction = Some(direction);
                    }
                }
            }
            _ => {}
        }
    }

    Ok(SdpMediaInfo {
        connection_ip: media_ip.unwrap_or(session_ip),
        audio_port,
        preferred_codec: negotiate_codec(&payload_types),
        payload_types,
        direction: media_direction.or(session_direction).unwrap_or_default(),
    })
}
