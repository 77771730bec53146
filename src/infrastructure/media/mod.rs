//! Media processing implementations

pub mod codec;
pub mod rtp;

pub use codec::{negotiate_codec, Codec, PCMA, PCMU, SUPPORTED_CODECS};
pub use rtp::{RtpHandler, RtpHandlerConfig, RtpPacket, RtpStats};
