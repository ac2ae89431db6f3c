//! socks5d - SOCKS5 proxy server
//!
//! This is the main entry point for the socks5d binary.

use anyhow::Result;
use clap::Parser;
use socks5d::{load_config, Server, ServerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// socks5d - SOCKS5 proxy server with UDP ASSOCIATE support
#[derive(Parser, Debug)]
#[command(name = "socks5d")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, host:port
    #[arg(short, long)]
    listen: Option<String>,

    /// IP written into UDP ASSOCIATE replies
    #[arg(long)]
    advertised_ip: Option<String>,

    /// Username for authentication (requires --pass)
    #[arg(short, long)]
    user: Option<String>,

    /// Password for authentication (requires --user)
    #[arg(short, long)]
    pass: Option<String>,

    /// Comma-separated allow list of IPs and CIDRs
    #[arg(short, long)]
    whitelist: Option<String>,

    /// TCP idle timeout in seconds, 0 disables
    #[arg(long)]
    tcp_timeout: Option<u64>,

    /// UDP idle timeout in seconds, 0 disables
    #[arg(long)]
    udp_timeout: Option<u64>,

    /// Only relay UDP from clients holding a TCP association
    #[arg(long)]
    limit_udp: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging format
    #[arg(long)]
    json_log: bool,
}

impl Args {
    fn into_config(self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => ServerConfig::default(),
        };
        if let Some(listen) = self.listen {
            config.listen_addr = listen;
        }
        if let Some(ip) = self.advertised_ip {
            config.advertised_ip = ip;
        }
        if let Some(user) = self.user {
            config.username = user;
        }
        if let Some(pass) = self.pass {
            config.password = pass;
        }
        if let Some(whitelist) = self.whitelist {
            config.allow_list = whitelist
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(secs) = self.tcp_timeout {
            config.tcp_timeout = secs;
        }
        if let Some(secs) = self.udp_timeout {
            config.udp_timeout = secs;
        }
        if self.limit_udp {
            config.limit_udp = true;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(&args.log_level, args.json_log)?;

    let config = args.into_config()?;

    info!("socks5d v{}", socks5d::VERSION);
    if config.allow_list.is_empty() {
        info!("allow list is empty, all client IPs are admitted");
    } else {
        info!(entries = config.allow_list.len(), "allow list configured");
    }

    let server = Server::bind(config).await?;
    info!(addr = %server.local_addr(), "listening");

    // Handle Ctrl+C and termination signals (cross-platform)
    let signal_server = Arc::clone(&server);
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm =
                signal(SignalKind::terminate()).expect("Failed to setup SIGTERM handler");

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C, shutting down...");
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                }
            }
        }

        #[cfg(not(unix))]
        {
            // On Windows, only handle Ctrl+C
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl+C, shutting down...");
        }

        signal_server.shutdown();
    });

    Arc::clone(&server).serve(None).await?;
    info!("server stopped gracefully");
    Ok(())
}

fn setup_logging(level: &str, json: bool) -> Result<()> {
    let level: Level = level
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid log level: {level}"))?;

    if json {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(())
}
