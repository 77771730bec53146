//! Shared kernel - types used across the call context and the SIP infrastructure

pub mod error;
pub mod result;

pub use error::DomainError;
pub use result::Result;
