//! Server configuration
//!
//! Configuration comes from an optional TOML file plus command-line
//! overrides. Empty credentials mean no authentication; setting only one
//! of username/password is treated the same as setting neither.

use crate::error::{ProxyError, Result};
use crate::protocol::{METHOD_NONE, METHOD_USER_PASS};
use serde::Deserialize;
use std::net::IpAddr;
use std::path::Path;

/// Complete server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// `host:port` the TCP listener binds; UDP binds the same port.
    pub listen_addr: String,
    /// IP literal written into UDP ASSOCIATE replies. `0.0.0.0` tells
    /// clients to reuse the address they already reached the server on.
    pub advertised_ip: String,
    /// Username for RFC 1929 authentication; empty disables auth.
    pub username: String,
    /// Password for RFC 1929 authentication; empty disables auth.
    pub password: String,
    /// Idle timeout in seconds for each TCP relay direction; 0 disables.
    pub tcp_timeout: u64,
    /// Idle timeout in seconds for UDP upstream reads; 0 disables.
    pub udp_timeout: u64,
    /// Admitted client IPs and CIDR networks; empty admits everyone.
    pub allow_list: Vec<String>,
    /// Require a live TCP association before relaying UDP from a source.
    pub limit_udp: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen_addr: "0.0.0.0:1080".to_string(),
            advertised_ip: "0.0.0.0".to_string(),
            username: String::new(),
            password: String::new(),
            tcp_timeout: 0,
            udp_timeout: 60,
            allow_list: Vec::new(),
            limit_udp: false,
        }
    }
}

impl ServerConfig {
    /// The negotiation method this configuration requires.
    pub fn auth_method(&self) -> u8 {
        if !self.username.is_empty() && !self.password.is_empty() {
            METHOD_USER_PASS
        } else {
            METHOD_NONE
        }
    }

    /// Validate addresses before binding anything.
    pub fn validate(&self) -> Result<()> {
        let port = self
            .listen_addr
            .rsplit_once(':')
            .map(|(_, p)| p)
            .ok_or_else(|| {
                ProxyError::Config(format!("listen address missing port: {}", self.listen_addr))
            })?;
        port.parse::<u16>().map_err(|_| {
            ProxyError::Config(format!("invalid listen port: {}", self.listen_addr))
        })?;
        self.advertised_ip.parse::<IpAddr>().map_err(|_| {
            ProxyError::Config(format!("invalid advertised IP: {}", self.advertised_ip))
        })?;
        Ok(())
    }
}

/// Load configuration from a TOML file.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<ServerConfig> {
    let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
        ProxyError::Config(format!("failed to read {}: {}", path.as_ref().display(), e))
    })?;
    parse_config(&content)
}

/// Parse configuration from a TOML string.
pub fn parse_config(content: &str) -> Result<ServerConfig> {
    let config: ServerConfig =
        toml::from_str(content).map_err(|e| ProxyError::Config(e.to_string()))?;
    config.validate()?;
    Ok(config)
}
