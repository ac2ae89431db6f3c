//! Test utilities for socks5d integration tests
//!
//! Provides echo origins and a harness that runs a server on an
//! ephemeral port.

use socks5d::{Server, ServerConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;

/// A server running on an ephemeral loopback port.
pub struct TestServer {
    /// The bound server.
    pub server: Arc<Server>,
    serve_handle: JoinHandle<socks5d::Result<()>>,
}

impl TestServer {
    /// Bind and serve the given configuration on 127.0.0.1:0.
    pub async fn start(mut config: ServerConfig) -> Self {
        config.listen_addr = "127.0.0.1:0".to_string();
        let server = Server::bind(config).await.expect("bind test server");
        let serve_handle = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.serve(None).await })
        };
        TestServer {
            server,
            serve_handle,
        }
    }

    /// Address of the TCP listener.
    pub fn addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// Stop the server and wait for the loops to unwind.
    pub async fn stop(self) {
        self.server.shutdown();
        let _ = self.serve_handle.await;
    }
}

/// Spawn a TCP origin that echoes everything it reads, one connection
/// at a time.
pub async fn spawn_tcp_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// Spawn a UDP origin that echoes every datagram back to its sender.
pub async fn spawn_udp_echo() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 65507];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((n, from)) => {
                    let _ = socket.send_to(&buf[..n], from).await;
                }
                Err(_) => return,
            }
        }
    });
    addr
}
