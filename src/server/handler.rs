//! Pluggable request handler
//!
//! Once a request is decoded the server hands it to a [`Handler`]. The
//! default implementation dials out and relays; custom handlers get the
//! server reference and with it the pools, tables and dialer.

use crate::error::{Result, Socks5Error};
use crate::protocol::{Datagram, Reply, Request, CMD_CONNECT, CMD_UDP_ASSOCIATE, REP_HOST_UNREACHABLE};
use crate::server::{tcp_relay, udp, Server};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::debug;

/// Handles decoded SOCKS5 requests and admitted UDP datagrams.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Invoked after the request handshake; responsible for writing the
    /// reply and performing any relay.
    async fn tcp_handle(
        &self,
        server: &Arc<Server>,
        conn: TcpStream,
        request: Request,
    ) -> Result<()>;

    /// Invoked once per admitted, well-formed datagram.
    async fn udp_handle(
        &self,
        server: &Arc<Server>,
        src: SocketAddr,
        datagram: Datagram,
    ) -> Result<()>;
}

/// Direct-relay handler used when no custom handler is supplied.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHandler;

#[async_trait]
impl Handler for DefaultHandler {
    async fn tcp_handle(
        &self,
        server: &Arc<Server>,
        mut conn: TcpStream,
        request: Request,
    ) -> Result<()> {
        match request.cmd {
            CMD_CONNECT => {
                let origin = match server.dialer().dial_tcp(None, &request.address()).await {
                    Ok(origin) => origin,
                    Err(e) => {
                        debug!(target = %request.address(), error = %e, "dial failed");
                        Reply::zeroed(REP_HOST_UNREACHABLE, request.atyp)
                            .write_to(&mut conn)
                            .await?;
                        return Err(e.into());
                    }
                };
                // The reply names this server's egress endpoint.
                let local = origin.local_addr()?;
                Reply::success(local).write_to(&mut conn).await?;
                tcp_relay::relay(server, conn, origin).await
            }
            CMD_UDP_ASSOCIATE => udp::associate(server, conn, request).await,
            cmd => Err(Socks5Error::CommandNotSupported(cmd).into()),
        }
    }

    async fn udp_handle(
        &self,
        server: &Arc<Server>,
        src: SocketAddr,
        datagram: Datagram,
    ) -> Result<()> {
        udp::relay_datagram(server, src, datagram).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::error::ProxyError;
    use crate::protocol::{ATYP_IPV4, REP_SUCCESS};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn test_server() -> Arc<Server> {
        let config = ServerConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            ..Default::default()
        };
        Server::bind(config).await.unwrap()
    }

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_connect_relays_echo() {
        let server = test_server().await;

        // Echo origin.
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = echo.accept().await.unwrap();
            let mut buf = [0u8; 64];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                stream.write_all(&buf[..n]).await.unwrap();
            }
        });

        let (mut client, conn) = tcp_pair().await;
        let (atyp, addr, port) = crate::protocol::address_parts(echo_addr);
        let request = Request::new(CMD_CONNECT, atyp, &addr, port);

        let handle = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { DefaultHandler.tcp_handle(&server, conn, request).await })
        };

        let reply = Reply::read_from(&mut client).await.unwrap();
        assert_eq!(reply.rep, REP_SUCCESS);
        assert_eq!(reply.atyp, ATYP_IPV4);
        assert_ne!(reply.port(), 0);

        client.write_all(b"HELLO").await.unwrap();
        let mut echoed = [0u8; 5];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"HELLO");

        drop(client);
        handle.await.unwrap().unwrap();
        assert_eq!(server.tcp_pool().in_use(), 0);
    }

    #[tokio::test]
    async fn test_connect_dial_failure_replies_host_unreachable() {
        let server = test_server().await;

        // A port that was just released, so nothing is listening.
        let closed = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };

        let (mut client, conn) = tcp_pair().await;
        let (atyp, addr, port) = crate::protocol::address_parts(closed);
        let request = Request::new(CMD_CONNECT, atyp, &addr, port);

        let handle = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { DefaultHandler.tcp_handle(&server, conn, request).await })
        };

        let reply = Reply::read_from(&mut client).await.unwrap();
        assert_eq!(reply.rep, REP_HOST_UNREACHABLE);
        assert_eq!(reply.bnd_addr, vec![0, 0, 0, 0]);
        assert_eq!(reply.port(), 0);

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(ProxyError::Io(_))));
    }

    #[tokio::test]
    async fn test_associate_registers_and_unregisters() {
        let server = test_server().await;
        let (mut client, conn) = tcp_pair().await;
        let client_tcp_addr = client.local_addr().unwrap();

        // Port zero: associate under the TCP endpoint.
        let request = Request::new(CMD_UDP_ASSOCIATE, ATYP_IPV4, &[0, 0, 0, 0], [0, 0]);

        let handle = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { DefaultHandler.tcp_handle(&server, conn, request).await })
        };

        let reply = Reply::read_from(&mut client).await.unwrap();
        assert_eq!(reply.rep, REP_SUCCESS);
        assert_eq!(reply.port(), server.udp_local_addr().port());

        // The association appears keyed by our TCP endpoint...
        let key = client_tcp_addr.to_string();
        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while !server.associations().contains_key(&key) {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("association was not registered");

        // ...and dissolves when the TCP connection closes.
        drop(client);
        handle.await.unwrap().unwrap();
        assert!(!server.associations().contains_key(&key));
    }
}
