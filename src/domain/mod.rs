//! Domain layer - call lifecycle rules shared by the SIP engine
//!
//! This layer contains:
//! - Value objects: call state and direction
//! - Domain events: lifecycle notifications emitted per call
//! - Shared errors

pub mod call;
pub mod shared;

// Re-export commonly used types
pub use shared::{DomainError, Result};
