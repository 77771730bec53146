//! Audio codec table

pub mod negotiator;

pub use negotiator::{
    codec_for_name, codec_for_payload_type, negotiate_codec, Codec, G722, PCMA, PCMU,
    SUPPORTED_CODECS,
};
