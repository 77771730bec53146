//! Infrastructure layer - Technical implementations
//!
//! This layer contains:
//! - Media transport (codec table, RTP handler, port allocation)
//! - Protocol implementations (SIP user agent)

pub mod media;
pub mod protocols;
