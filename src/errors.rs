//! Error handling for the access core
//!
//! Hook evaluation never surfaces errors: every decision path returns a
//! [`Verdict`](crate::types::Verdict) and transient failures default to
//! deny. The error type below covers construction-time problems only.

use std::error::Error;
use std::fmt;

/// Result type for access-core operations
pub type AccessResult<T> = Result<T, AccessError>;

/// Access-core error types
#[derive(Debug)]
pub enum AccessError {
    /// A policy index does not name an existing policy
    UnknownPolicy(u32),

    /// Invalid configuration
    InvalidConfiguration(String),
}

impl AccessError {
    /// Create an invalid configuration error
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration(message.into())
    }
}

impl fmt::Display for AccessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownPolicy(index) => write!(f, "Unknown policy: {}", index),
            Self::InvalidConfiguration(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl Error for AccessError {}
