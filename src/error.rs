//! Error types for socks5d
//!
//! This module defines all custom error types used throughout the server.

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Main error type for server operations
#[derive(Error, Debug)]
pub enum ProxyError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// SOCKS5 protocol error
    #[error("SOCKS5 error: {0}")]
    Socks5(#[from] Socks5Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// SOCKS5 specific errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Socks5Error {
    /// Unsupported SOCKS version
    #[error("Unsupported SOCKS version: {0}")]
    UnsupportedVersion(u8),

    /// Wrong version byte in the username/password sub-negotiation
    #[error("Unsupported username/password auth version: {0}")]
    UnsupportedUserPassVersion(u8),

    /// Malformed frame: zero-length field, short packet or unknown ATYP
    #[error("Bad request")]
    BadRequest,

    /// No acceptable authentication method
    #[error("No acceptable authentication method")]
    NoAcceptableMethod,

    /// Authentication failed
    #[error("Invalid username or password")]
    AuthFailed,

    /// Command not supported
    #[error("Command not supported: {0:#04x}")]
    CommandNotSupported(u8),

    /// Invalid address
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// UDP source without a live TCP association
    #[error("Address {0} not associated")]
    NotAssociated(SocketAddr),

    /// The TCP side of a UDP association went away
    #[error("Association closed")]
    AssociationClosed,
}

impl ProxyError {
    /// True when the error is a protocol-level failure rather than an IO one.
    pub fn is_protocol(&self) -> bool {
        matches!(self, ProxyError::Socks5(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::Other, "io error");
        let err: ProxyError = io_err.into();
        assert!(matches!(err, ProxyError::Io(_)));
        assert!(!err.is_protocol());
    }

    #[test]
    fn test_proxy_error_from_socks5() {
        let err: ProxyError = Socks5Error::AuthFailed.into();
        assert!(matches!(err, ProxyError::Socks5(Socks5Error::AuthFailed)));
        assert!(err.is_protocol());
    }

    #[test]
    fn test_socks5_error_display() {
        assert_eq!(
            format!("{}", Socks5Error::UnsupportedVersion(4)),
            "Unsupported SOCKS version: 4"
        );
        assert_eq!(
            format!("{}", Socks5Error::UnsupportedUserPassVersion(5)),
            "Unsupported username/password auth version: 5"
        );
        assert_eq!(format!("{}", Socks5Error::BadRequest), "Bad request");
        assert_eq!(
            format!("{}", Socks5Error::AuthFailed),
            "Invalid username or password"
        );
        assert_eq!(
            format!("{}", Socks5Error::CommandNotSupported(0x02)),
            "Command not supported: 0x02"
        );
        assert_eq!(
            format!("{}", Socks5Error::NoAcceptableMethod),
            "No acceptable authentication method"
        );
    }

    #[test]
    fn test_config_error_display() {
        let err = ProxyError::Config("bad listen address".to_string());
        assert_eq!(format!("{}", err), "Configuration error: bad listen address");
    }
}
