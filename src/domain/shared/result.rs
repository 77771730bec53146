//! Result alias for validation and call state changes

use super::error::DomainError;

pub type Result<T> = std::result::Result<T, DomainError>;
