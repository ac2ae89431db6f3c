//! UDP relay subsystem
//!
//! One ingress task reads the server socket into pooled buffers and
//! pushes work onto a bounded channel; a fixed pool of workers drains
//! it. Each admitted datagram either reuses a live flow or dials the
//! origin and spawns an upstream reader that encapsulates replies back
//! to the client. Overload turns into packet drops at the channel, never
//! into memory growth.

use crate::error::{Result, Socks5Error};
use crate::pool::PooledBuf;
use crate::protocol::{address_parts, Datagram};
use crate::server::{Handler, Server};
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, trace};

/// Capacity of the ingress work queue; packets beyond it are dropped.
const WORK_QUEUE_CAPACITY: usize = 5000;

/// Number of worker tasks draining the ingress queue.
const WORKER_COUNT: usize = 128;

/// One live UDP flow: a client endpoint talking to one origin.
#[derive(Debug)]
pub struct UdpExchange {
    /// The client's UDP source address.
    pub client_addr: SocketAddr,
    /// Connected socket to the origin.
    pub socket: UdpSocket,
    /// When the flow was created.
    pub created_at: Instant,
}

struct UdpTask {
    src: SocketAddr,
    buf: PooledBuf,
    len: usize,
}

/// Run the UDP half of the server: ingress loop plus worker pool.
///
/// Returns when the socket fails or the shutdown signal fires; the work
/// channel closes on the way out so workers drain what is queued and
/// exit.
pub(crate) async fn run(
    server: Arc<Server>,
    handler: Arc<dyn Handler>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let (tx, rx) = mpsc::channel::<UdpTask>(WORK_QUEUE_CAPACITY);
    let rx = Arc::new(Mutex::new(rx));

    let mut workers = JoinSet::new();
    for _ in 0..WORKER_COUNT {
        let rx = Arc::clone(&rx);
        let server = Arc::clone(&server);
        let handler = Arc::clone(&handler);
        workers.spawn(async move {
            loop {
                let task = rx.lock().await.recv().await;
                match task {
                    Some(task) => handle_task(&server, &handler, task).await,
                    None => break,
                }
            }
        });
    }

    let result = ingress_loop(&server, tx, &mut shutdown).await;
    // tx dropped above: the channel is closed, workers drain and stop.
    while workers.join_next().await.is_some() {}
    result
}

async fn ingress_loop(
    server: &Arc<Server>,
    tx: mpsc::Sender<UdpTask>,
    shutdown: &mut broadcast::Receiver<()>,
) -> Result<()> {
    let socket = Arc::clone(server.udp_socket());
    loop {
        let mut buf = server.udp_pool().get();
        let (len, src) = tokio::select! {
            _ = shutdown.recv() => return Ok(()),
            received = socket.recv_from(&mut buf) => received?,
        };
        match tx.try_send(UdpTask { src, buf, len }) {
            Ok(()) => {}
            Err(TrySendError::Full(task)) => {
                // Dropping the task returns its buffer to the pool.
                drop(task);
                debug!("UDP worker queue full, dropping packet");
            }
            Err(TrySendError::Closed(_)) => return Ok(()),
        }
    }
}

async fn handle_task(server: &Arc<Server>, handler: &Arc<dyn Handler>, task: UdpTask) {
    let UdpTask { src, buf, len } = task;
    if !server.allow_list().check(src.ip()) {
        debug!(%src, "UDP packet rejected by allow list");
        return;
    }
    let datagram = match Datagram::from_bytes(&buf[..len]) {
        Ok(d) => d,
        Err(e) => {
            trace!(%src, error = %e, "malformed UDP datagram dropped");
            return;
        }
    };
    // Fragmentation is not supported.
    if datagram.frag != 0x00 {
        return;
    }
    if let Err(e) = handler.udp_handle(server, src, datagram).await {
        debug!(%src, error = %e, "UDP handle failed");
    }
}

/// Default relay path for one admitted datagram.
///
/// Reuses the flow for `(src, dst)` when one exists; otherwise dials the
/// origin, remembering and reusing the local bind for the flow so the
/// outbound 5-tuple stays stable, and spawns the upstream reader.
pub(crate) async fn relay_datagram(
    server: &Arc<Server>,
    src: SocketAddr,
    datagram: Datagram,
) -> Result<()> {
    let src_key = src.to_string();
    let mut cancel = None;
    if server.limit_udp() {
        match server.associations().get(&src_key) {
            Some(assoc) => cancel = Some(assoc.subscribe()),
            None => return Err(Socks5Error::NotAssociated(src).into()),
        }
    }

    let dst = datagram.address();
    let key = format!("{}{}", src_key, dst);

    if let Some(exchange) = server.udp_exchanges().get(&key).map(|e| Arc::clone(e.value())) {
        return send_payload(&exchange, &datagram.data, cancel.as_ref()).await;
    }

    let cached_local = server.udp_src().get(&key).map(|e| *e);
    let (socket, local) = match server.dialer().dial_udp(cached_local, &dst).await {
        Ok(socket) => (socket, cached_local),
        Err(_) if cached_local.is_some() => {
            // The remembered local bind is gone; fall back to a fresh one.
            (server.dialer().dial_udp(None, &dst).await?, None)
        }
        Err(e) => return Err(e.into()),
    };
    if local.is_none() {
        if let Ok(local_addr) = socket.local_addr() {
            server.udp_src().insert(key.clone(), local_addr);
        }
    }

    let exchange = Arc::new(UdpExchange {
        client_addr: src,
        socket,
        created_at: Instant::now(),
    });
    send_payload(&exchange, &datagram.data, cancel.as_ref()).await?;

    match server.udp_exchanges().entry(key.clone()) {
        Entry::Occupied(_) => {
            // Another worker created the flow first; ours carried this
            // one payload and now goes away.
        }
        Entry::Vacant(slot) => {
            slot.insert(Arc::clone(&exchange));
            spawn_upstream_reader(Arc::clone(server), key, exchange, cancel);
        }
    }
    Ok(())
}

async fn send_payload(
    exchange: &UdpExchange,
    data: &[u8],
    cancel: Option<&watch::Receiver<()>>,
) -> Result<()> {
    if let Some(rx) = cancel {
        if rx.has_changed().is_err() {
            return Err(Socks5Error::AssociationClosed.into());
        }
    }
    exchange.socket.send(data).await?;
    Ok(())
}

/// Pump origin replies back to the client until the flow dies.
fn spawn_upstream_reader(
    server: Arc<Server>,
    key: String,
    exchange: Arc<UdpExchange>,
    mut cancel: Option<watch::Receiver<()>>,
) {
    let mut shutdown = server.shutdown_rx();
    tokio::spawn(async move {
        let mut buf = server.udp_pool().get();
        loop {
            let received = tokio::select! {
                _ = shutdown.recv() => break,
                _ = association_closed(cancel.as_mut()) => break,
                r = read_upstream(&exchange.socket, &mut buf, server.udp_timeout()) => r,
            };
            let n = match received {
                Ok(n) => n,
                Err(_) => break,
            };
            // Describe the origin straight from the socket endpoint; the
            // textual destination is never re-parsed.
            let peer = match exchange.socket.peer_addr() {
                Ok(peer) => peer,
                Err(_) => break,
            };
            let (atyp, addr, port) = address_parts(peer);
            let reply = Datagram::new(atyp, &addr, port, Bytes::copy_from_slice(&buf[..n]));
            if server
                .udp_socket()
                .send_to(&reply.to_bytes(), exchange.client_addr)
                .await
                .is_err()
            {
                break;
            }
        }
        server.udp_exchanges().remove(&key);
        trace!(key, "UDP flow closed");
        // The origin socket closes when the last reference drops.
    });
}

/// Resolves when the association's sender side goes away. Flows without
/// an association never resolve here.
async fn association_closed(cancel: Option<&mut watch::Receiver<()>>) {
    match cancel {
        Some(rx) => {
            // Err means the sender was dropped, i.e. the TCP side closed.
            while rx.changed().await.is_ok() {}
        }
        None => std::future::pending().await,
    }
}

async fn read_upstream(
    socket: &UdpSocket,
    buf: &mut [u8],
    idle_secs: u64,
) -> io::Result<usize> {
    if idle_secs == 0 {
        return socket.recv(buf).await;
    }
    match tokio::time::timeout(Duration::from_secs(idle_secs), socket.recv(buf)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "UDP idle timeout")),
    }
}

/// Register a UDP association for `client_addr` and park on the TCP
/// stream until the client closes it, which dissolves the association.
pub(crate) async fn associate(
    server: &Arc<Server>,
    mut conn: tokio::net::TcpStream,
    request: crate::protocol::Request,
) -> Result<()> {
    use crate::protocol::{Reply, REP_HOST_UNREACHABLE};

    let client_addr = if request.port() == 0 {
        // Port zero means "expect my datagrams from my TCP endpoint".
        conn.peer_addr()?
    } else {
        match tokio::net::lookup_host(request.address()).await {
            Ok(mut addrs) => match addrs.next() {
                Some(addr) => addr,
                None => {
                    Reply::zeroed(REP_HOST_UNREACHABLE, request.atyp)
                        .write_to(&mut conn)
                        .await?;
                    return Err(Socks5Error::InvalidAddress(request.address()).into());
                }
            },
            Err(e) => {
                Reply::zeroed(REP_HOST_UNREACHABLE, request.atyp)
                    .write_to(&mut conn)
                    .await?;
                return Err(e.into());
            }
        }
    };

    Reply::success(server.advertised_addr())
        .write_to(&mut conn)
        .await?;

    let key = client_addr.to_string();
    let (cancel_tx, _) = watch::channel(());
    server.associations().insert(key.clone(), cancel_tx);
    debug!(client = %client_addr, "UDP association opened");

    // Hold the TCP connection open; EOF or error ends the association.
    let held = tokio::io::copy(&mut conn, &mut tokio::io::sink()).await;

    server.associations().remove(&key);
    debug!(client = %client_addr, "UDP association closed");
    held?;
    Ok(())
}
