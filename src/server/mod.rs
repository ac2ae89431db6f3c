//! SOCKS5 server
//!
//! The [`Server`] owns one TCP listener and one UDP socket on the same
//! port. [`Server::bind`] creates it, [`Server::serve`] runs the accept
//! and relay loops until a fatal error or [`Server::shutdown`], and the
//! pluggable [`Handler`] decides what happens to each decoded request.

mod conn;
mod handler;
mod tcp_relay;
mod udp;

pub use handler::{DefaultHandler, Handler};
pub use udp::UdpExchange;

use crate::acl::AllowList;
use crate::config::ServerConfig;
use crate::dialer::{Dialer, SystemDialer};
use crate::error::{ProxyError, Result};
use crate::pool::{BufferPool, TCP_BUFFER_SIZE, UDP_BUFFER_SIZE};
use crate::protocol::{CMD_CONNECT, CMD_UDP_ASSOCIATE};
use dashmap::DashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tracing::{debug, info};

/// A SOCKS5 proxy server bound to its listen port.
pub struct Server {
    method: u8,
    username: String,
    password: String,
    supported_commands: Vec<u8>,
    tcp_timeout: u64,
    udp_timeout: u64,
    limit_udp: bool,
    allow_list: AllowList,
    dialer: Arc<dyn Dialer>,
    advertised_addr: SocketAddr,
    local_addr: SocketAddr,
    udp_local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    udp_socket: Arc<UdpSocket>,
    tcp_pool: Arc<BufferPool>,
    udp_pool: Arc<BufferPool>,
    udp_exchanges: DashMap<String, Arc<UdpExchange>>,
    udp_src: DashMap<String, SocketAddr>,
    associated_udp: DashMap<String, watch::Sender<()>>,
    shutdown: broadcast::Sender<()>,
}

impl Server {
    /// Bind the TCP listener and UDP socket and prepare the server.
    ///
    /// The UDP advertise address is resolved here, once, so UDP
    /// ASSOCIATE replies never pay for it.
    pub async fn bind(config: ServerConfig) -> Result<Arc<Self>> {
        Self::bind_with_dialer(config, Arc::new(SystemDialer)).await
    }

    /// Like [`Server::bind`] but with a caller-supplied dialer.
    pub async fn bind_with_dialer(
        config: ServerConfig,
        dialer: Arc<dyn Dialer>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let listener = TcpListener::bind(&config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let udp_socket = UdpSocket::bind((local_addr.ip(), local_addr.port())).await?;
        let udp_local_addr = udp_socket.local_addr()?;

        let advertised_ip = config
            .advertised_ip
            .parse()
            .map_err(|_| ProxyError::Config(format!("invalid advertised IP: {}", config.advertised_ip)))?;
        let advertised_addr = SocketAddr::new(advertised_ip, udp_local_addr.port());

        let (shutdown, _) = broadcast::channel(1);

        Ok(Arc::new(Server {
            method: config.auth_method(),
            username: config.username,
            password: config.password,
            supported_commands: vec![CMD_CONNECT, CMD_UDP_ASSOCIATE],
            tcp_timeout: config.tcp_timeout,
            udp_timeout: config.udp_timeout,
            limit_udp: config.limit_udp,
            allow_list: AllowList::parse(&config.allow_list),
            dialer,
            advertised_addr,
            local_addr,
            udp_local_addr,
            listener: Mutex::new(Some(listener)),
            udp_socket: Arc::new(udp_socket),
            tcp_pool: BufferPool::new(TCP_BUFFER_SIZE),
            udp_pool: BufferPool::new(UDP_BUFFER_SIZE),
            udp_exchanges: DashMap::new(),
            udp_src: DashMap::new(),
            associated_udp: DashMap::new(),
            shutdown,
        }))
    }

    /// Run the server until a fatal listener error or [`Server::shutdown`].
    ///
    /// Without an explicit handler the [`DefaultHandler`] performs direct
    /// relay. The TCP accept loop and the UDP relay loop each run on
    /// their own task; the first to exit stops the other, and its result
    /// becomes the overall result.
    pub async fn serve(self: Arc<Self>, handler: Option<Arc<dyn Handler>>) -> Result<()> {
        let handler = handler.unwrap_or_else(|| Arc::new(DefaultHandler));
        let listener = self
            .listener
            .lock()
            .expect("listener lock poisoned")
            .take()
            .ok_or_else(|| ProxyError::Config("server is already serving".to_string()))?;

        info!(tcp = %self.local_addr, udp = %self.udp_local_addr, "server listening");

        let mut group = RunnerGroup::new(self.shutdown.clone());

        let tcp_server = Arc::clone(&self);
        let tcp_handler = Arc::clone(&handler);
        let mut tcp_shutdown = self.shutdown.subscribe();
        group.spawn(async move {
            loop {
                tokio::select! {
                    _ = tcp_shutdown.recv() => return Ok(()),
                    accepted = listener.accept() => {
                        let (stream, peer) = accepted?;
                        let server = Arc::clone(&tcp_server);
                        let handler = Arc::clone(&tcp_handler);
                        tokio::spawn(async move {
                            conn::handle_connection(server, handler, stream, peer).await;
                        });
                    }
                }
            }
        });

        let udp_server = Arc::clone(&self);
        let udp_shutdown = self.shutdown.subscribe();
        group.spawn(udp::run(udp_server, handler, udp_shutdown));

        let result = group.wait().await;
        self.release_udp_state();
        debug!("server stopped");
        result
    }

    /// Signal both loops to stop. Safe to call from any task; returns
    /// immediately while [`Server::serve`] unwinds.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    fn release_udp_state(&self) {
        self.udp_exchanges.clear();
        self.udp_src.clear();
        self.associated_udp.clear();
    }

    /// Address the TCP listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address the UDP socket is bound to.
    pub fn udp_local_addr(&self) -> SocketAddr {
        self.udp_local_addr
    }

    /// UDP address written into ASSOCIATE replies.
    pub fn advertised_addr(&self) -> SocketAddr {
        self.advertised_addr
    }

    /// The admission policy for client IPs.
    pub fn allow_list(&self) -> &AllowList {
        &self.allow_list
    }

    /// The dialer used for outbound connections.
    pub fn dialer(&self) -> &Arc<dyn Dialer> {
        &self.dialer
    }

    /// Pool of 32 KiB buffers for TCP relays.
    pub fn tcp_pool(&self) -> &Arc<BufferPool> {
        &self.tcp_pool
    }

    /// Pool of datagram-sized buffers for UDP relays.
    pub fn udp_pool(&self) -> &Arc<BufferPool> {
        &self.udp_pool
    }

    /// Live UDP flows keyed by client source plus destination.
    pub fn udp_exchanges(&self) -> &DashMap<String, Arc<UdpExchange>> {
        &self.udp_exchanges
    }

    /// Remembered local bind addresses per flow, for NAT symmetry.
    pub fn udp_src(&self) -> &DashMap<String, SocketAddr> {
        &self.udp_src
    }

    /// Live TCP associations keyed by the client's UDP endpoint.
    pub fn associations(&self) -> &DashMap<String, watch::Sender<()>> {
        &self.associated_udp
    }

    /// The server's bound UDP socket.
    pub fn udp_socket(&self) -> &Arc<UdpSocket> {
        &self.udp_socket
    }

    /// Idle timeout in seconds for TCP relay reads; 0 means none.
    pub fn tcp_timeout(&self) -> u64 {
        self.tcp_timeout
    }

    /// Idle timeout in seconds for UDP upstream reads; 0 means none.
    pub fn udp_timeout(&self) -> u64 {
        self.udp_timeout
    }

    /// Whether UDP sources must hold a TCP association.
    pub fn limit_udp(&self) -> bool {
        self.limit_udp
    }

    pub(crate) fn method(&self) -> u8 {
        self.method
    }

    pub(crate) fn username(&self) -> &str {
        &self.username
    }

    pub(crate) fn password(&self) -> &str {
        &self.password
    }

    pub(crate) fn supported_commands(&self) -> &[u8] {
        &self.supported_commands
    }

    pub(crate) fn shutdown_rx(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr)
            .field("udp_local_addr", &self.udp_local_addr)
            .field("advertised_addr", &self.advertised_addr)
            .field("method", &self.method)
            .finish_non_exhaustive()
    }
}

/// Joins the TCP and UDP loops: every runner goes on its own task, the
/// group waits for the first to exit, signals the rest to stop, joins
/// them, and reports the first runner's result.
struct RunnerGroup {
    shutdown: broadcast::Sender<()>,
    set: JoinSet<Result<()>>,
}

impl RunnerGroup {
    fn new(shutdown: broadcast::Sender<()>) -> Self {
        RunnerGroup {
            shutdown,
            set: JoinSet::new(),
        }
    }

    fn spawn<F>(&mut self, runner: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.set.spawn(runner);
    }

    async fn wait(mut self) -> Result<()> {
        let first = match self.set.join_next().await {
            Some(Ok(result)) => result,
            Some(Err(join)) => Err(ProxyError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                join,
            ))),
            None => Ok(()),
        };
        let _ = self.shutdown.send(());
        while let Some(joined) = self.set.join_next().await {
            if let Ok(Err(e)) = joined {
                debug!(error = %e, "runner exited with error during shutdown");
            }
        }
        first
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_config() -> ServerConfig {
        ServerConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_bind_same_port_tcp_udp() {
        let server = Server::bind(loopback_config()).await.unwrap();
        assert_eq!(server.local_addr().port(), server.udp_local_addr().port());
        assert_eq!(server.advertised_addr().port(), server.udp_local_addr().port());
    }

    #[tokio::test]
    async fn test_advertised_ip_override() {
        let config = ServerConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            advertised_ip: "203.0.113.9".to_string(),
            ..Default::default()
        };
        let server = Server::bind(config).await.unwrap();
        assert_eq!(
            server.advertised_addr().ip().to_string(),
            "203.0.113.9"
        );
    }

    #[tokio::test]
    async fn test_serve_twice_fails() {
        let server = Server::bind(loopback_config()).await.unwrap();
        let serving = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.serve(None).await })
        };
        // Give the first serve a moment to take the listener.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let second = Arc::clone(&server).serve(None).await;
        assert!(matches!(second, Err(ProxyError::Config(_))));

        server.shutdown();
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_serve() {
        let server = Server::bind(loopback_config()).await.unwrap();
        let serving = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.serve(None).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        server.shutdown();
        let result = tokio::time::timeout(std::time::Duration::from_secs(2), serving)
            .await
            .expect("serve did not stop")
            .unwrap();
        assert!(result.is_ok());
    }
}
