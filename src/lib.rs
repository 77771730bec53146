//! voxsip - SIP dialog and RTP transport engine for voice-AI calls
//!
//! Layered the usual way:
//! - `config`: engine configuration loaded at startup
//! - `domain`: call state machine, directions and lifecycle events
//! - `infrastructure`: RTP media transport and the SIP user agent

pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use domain::shared::error::DomainError;
pub use domain::shared::result::Result;
pub use infrastructure::protocols::sip::{CallHandler, Server, Session, SipConfig, SipError};
