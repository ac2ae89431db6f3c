//! Outbound connection dialer
//!
//! The [`Dialer`] trait is the seam between the relay logic and the
//! network: the server only ever dials origins through it, so tests can
//! substitute their own implementation.

use async_trait::async_trait;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{lookup_host, TcpSocket, TcpStream, UdpSocket};

/// Connect timeout applied to outbound TCP dials.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// TCP keepalive idle time on outbound connections.
pub const KEEPALIVE_TIME: Duration = Duration::from_secs(30);

/// TCP keepalive probe interval on outbound connections.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Dials origin servers on behalf of proxied clients.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Dial a TCP origin, optionally binding a local source address.
    async fn dial_tcp(&self, local: Option<SocketAddr>, remote: &str) -> io::Result<TcpStream>;

    /// Open a connected UDP socket to an origin, optionally binding a
    /// local source address first.
    async fn dial_udp(&self, local: Option<SocketAddr>, remote: &str) -> io::Result<UdpSocket>;
}

/// Default dialer backed by the platform resolver and socket stack.
#[derive(Debug, Clone, Default)]
pub struct SystemDialer;

#[async_trait]
impl Dialer for SystemDialer {
    async fn dial_tcp(&self, local: Option<SocketAddr>, remote: &str) -> io::Result<TcpStream> {
        let mut last_err = None;
        for addr in lookup_host(remote).await? {
            match connect_tcp(local, addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "no addresses resolved")
        }))
    }

    async fn dial_udp(&self, local: Option<SocketAddr>, remote: &str) -> io::Result<UdpSocket> {
        let addr = lookup_host(remote).await?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "no addresses resolved")
        })?;
        let local = local.unwrap_or_else(|| unspecified_for(addr));
        let socket = UdpSocket::bind(local).await?;
        socket.connect(addr).await?;
        Ok(socket)
    }
}

async fn connect_tcp(local: Option<SocketAddr>, addr: SocketAddr) -> io::Result<TcpStream> {
    let connect = async {
        match local {
            None => TcpStream::connect(addr).await,
            Some(local) => {
                let socket = if addr.is_ipv4() {
                    TcpSocket::new_v4()?
                } else {
                    TcpSocket::new_v6()?
                };
                socket.bind(local)?;
                socket.connect(addr).await
            }
        }
    };
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, connect)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timeout"))??;
    apply_keepalive(&stream)?;
    Ok(stream)
}

fn apply_keepalive(stream: &TcpStream) -> io::Result<()> {
    let socket = socket2::SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(KEEPALIVE_TIME)
        .with_interval(KEEPALIVE_INTERVAL);
    socket.set_tcp_keepalive(&keepalive)
}

fn unspecified_for(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_dial_tcp_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        });

        let dialer = SystemDialer;
        let mut stream = dialer.dial_tcp(None, &addr.to_string()).await.unwrap();
        stream.write_all(b"hi").await.unwrap();
        assert_eq!(&accept.await.unwrap(), b"hi");
    }

    #[tokio::test]
    async fn test_dial_tcp_refused() {
        let dialer = SystemDialer;
        // Bind then drop to get a port that is very likely closed.
        let closed = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };
        let result = dialer.dial_tcp(None, &closed.to_string()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_dial_udp_connected() {
        let origin = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin.local_addr().unwrap();

        let dialer = SystemDialer;
        let socket = dialer.dial_udp(None, &origin_addr.to_string()).await.unwrap();
        assert_eq!(socket.peer_addr().unwrap(), origin_addr);

        socket.send(b"ping").await.unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = origin.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from, socket.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_dial_udp_with_local_bind() {
        let origin = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin.local_addr().unwrap();

        // Reserve a concrete local address, then reuse it for the dial.
        let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let local = probe.local_addr().unwrap();
        drop(probe);

        let dialer = SystemDialer;
        let socket = dialer
            .dial_udp(Some(local), &origin_addr.to_string())
            .await
            .unwrap();
        assert_eq!(socket.local_addr().unwrap(), local);
    }
}
