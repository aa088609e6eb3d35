// src/error.rs
//! Error types for the ICE agent

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for ICE operations
pub type IceResult<T> = Result<T, IceError>;

/// Main ICE error type
#[derive(Error, Debug)]
pub enum IceError {
    /// STUN codec errors
    #[error("STUN error: {0}")]
    Stun(#[from] StunError),

    /// Network I/O errors
    #[error("Network error: {0}")]
    Io(#[from] io::Error),

    /// Configuration errors (invalid port range, mDNS hostname, NAT 1:1
    /// mapping, lite with non-host types, useless URLs)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Credential errors (empty remote ufrag/pwd, insufficient entropy,
    /// multiple start)
    #[error("Credential error: {0}")]
    Credentials(String),

    /// Operation on a closed agent
    #[error("The agent is closed")]
    Closed,

    /// Address parse failures
    #[error("Address error: {0}")]
    Address(String),

    /// Operation timed out
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
}

/// STUN codec error types
#[derive(Error, Debug)]
pub enum StunError {
    /// Message shorter than the fixed header
    #[error("Message too short: {0} bytes")]
    MessageTooShort(usize),

    /// Invalid magic cookie in the header
    #[error("Invalid magic cookie: 0x{0:08X}")]
    InvalidMagicCookie(u32),

    /// Unsupported or malformed message type
    #[error("Invalid message type: 0x{0:04X}")]
    InvalidMessageType(u16),

    /// Attribute parsing error
    #[error("Failed to parse attribute 0x{attr_type:04X}: {reason}")]
    AttributeParse { attr_type: u16, reason: String },

    /// Missing required attribute
    #[error("Missing required attribute: {0}")]
    MissingAttribute(&'static str),

    /// MESSAGE-INTEGRITY verification failed
    #[error("MESSAGE-INTEGRITY verification failed")]
    IntegrityCheckFailed,

    /// FINGERPRINT verification failed
    #[error("FINGERPRINT verification failed")]
    FingerprintCheckFailed,

    /// USERNAME did not match the expected value
    #[error("USERNAME mismatch: got {0:?}")]
    UsernameMismatch(String),

    /// Invalid address family in an address attribute
    #[error("Invalid address family: {0}")]
    InvalidAddressFamily(u8),
}

impl IceError {
    /// Helper to create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        IceError::Config(msg.into())
    }

    /// Helper to create a credentials error
    pub fn credentials(msg: impl Into<String>) -> Self {
        IceError::Credentials(msg.into())
    }

    /// Helper to create an address error
    pub fn address(msg: impl Into<String>) -> Self {
        IceError::Address(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion() {
        let stun_err = StunError::InvalidMagicCookie(0x12345678);
        let ice_err: IceError = stun_err.into();

        match ice_err {
            IceError::Stun(StunError::InvalidMagicCookie(cookie)) => {
                assert_eq!(cookie, 0x12345678);
            }
            _ => panic!("Wrong error type"),
        }
    }

    #[test]
    fn test_error_display() {
        let err = StunError::AttributeParse {
            attr_type: 0x0020,
            reason: "truncated".to_string(),
        };

        assert_eq!(
            err.to_string(),
            "Failed to parse attribute 0x0020: truncated"
        );
    }
}
