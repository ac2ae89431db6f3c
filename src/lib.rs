//! # socks5d - SOCKS5 Proxy Server
//!
//! socks5d is a SOCKS5 proxy server implementing RFC 1928 and RFC 1929.
//! It accepts client connections, performs the method-negotiation and
//! request handshakes, and relays traffic: TCP streams for CONNECT and
//! encapsulated datagrams for UDP ASSOCIATE. BIND is rejected.
//!
//! ## Features
//!
//! - **CONNECT**: bidirectional TCP relay with pooled buffers and idle timeouts
//! - **UDP ASSOCIATE**: full datagram relay with a worker pool and flow table
//! - **Username/password authentication** per RFC 1929, constant-time compare
//! - **Client allow-list**: exact IPs and CIDR ranges
//! - **Graceful shutdown** across the TCP and UDP loops
//!
//! ## Usage
//!
//! ```rust,ignore
//! use socks5d::{Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> socks5d::Result<()> {
//!     let config = ServerConfig {
//!         listen_addr: "0.0.0.0:1080".to_string(),
//!         ..Default::default()
//!     };
//!     let server = Server::bind(config).await?;
//!     server.serve(None).await
//! }
//! ```
//!
//! ## Architecture
//!
//! One process, one port: a TCP listener for handshakes and stream relay,
//! and a UDP socket on the same port for associated datagrams.
//!
//! ```text
//! SOCKS5 Client -> socks5d -> Target
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod acl;
pub mod config;
pub mod dialer;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod server;

// Re-export commonly used items
pub use config::{load_config, parse_config, ServerConfig};
pub use error::{ProxyError, Result, Socks5Error};
pub use server::{DefaultHandler, Handler, Server, UdpExchange};

/// Version of the socks5d library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the application
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_name() {
        assert_eq!(NAME, "socks5d");
    }
}
