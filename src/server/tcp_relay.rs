//! Bidirectional TCP relay
//!
//! Two independent unidirectional copies run between client and origin,
//! each with its own pooled 32 KiB buffer and an idle deadline that is
//! re-armed on every read. EOF on one direction shuts down the peer's
//! write half so half-closes propagate; an error tears down both sides.

use crate::error::Result;
use crate::pool::BufferPool;
use crate::server::Server;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::trace;

/// Relay bytes between the client and the dialed origin until both
/// directions finish.
pub(crate) async fn relay(server: &Arc<Server>, client: TcpStream, origin: TcpStream) -> Result<()> {
    let timeout = server.tcp_timeout();
    let (client_rd, client_wr) = client.into_split();
    let (origin_rd, origin_wr) = origin.into_split();

    let mut upstream = tokio::spawn(pipe(
        client_rd,
        origin_wr,
        Arc::clone(server.tcp_pool()),
        timeout,
    ));
    let mut downstream = tokio::spawn(pipe(
        origin_rd,
        client_wr,
        Arc::clone(server.tcp_pool()),
        timeout,
    ));

    let first_is_upstream;
    let first = tokio::select! {
        r = &mut upstream => {
            first_is_upstream = true;
            r
        }
        r = &mut downstream => {
            first_is_upstream = false;
            r
        }
    };
    let second = if first_is_upstream { downstream } else { upstream };

    match flatten(first) {
        Ok(n) => {
            trace!(bytes = n, "relay direction finished");
            // Clean EOF: let the other direction drain.
            flatten(second.await)?;
            Ok(())
        }
        Err(e) => {
            // One side failed; drop both sockets instead of waiting.
            second.abort();
            let _ = second.await;
            Err(e.into())
        }
    }
}

fn flatten(joined: std::result::Result<io::Result<u64>, tokio::task::JoinError>) -> io::Result<u64> {
    match joined {
        Ok(result) => result,
        Err(join) => Err(io::Error::new(io::ErrorKind::Other, join)),
    }
}

/// Copy one direction with a pooled buffer. The idle deadline applies to
/// each read, not to the whole transfer, and `0` disables it.
async fn pipe<R, W>(mut src: R, mut dst: W, pool: Arc<BufferPool>, idle_secs: u64) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = pool.get();
    let mut total = 0u64;
    loop {
        let n = read_idle(&mut src, &mut buf, idle_secs).await?;
        if n == 0 {
            let _ = dst.shutdown().await;
            return Ok(total);
        }
        dst.write_all(&buf[..n]).await?;
        total += n as u64;
    }
}

async fn read_idle<R>(src: &mut R, buf: &mut [u8], idle_secs: u64) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    if idle_secs == 0 {
        return src.read(buf).await;
    }
    match tokio::time::timeout(Duration::from_secs(idle_secs), src.read(buf)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "idle read timeout")),
    }
}
