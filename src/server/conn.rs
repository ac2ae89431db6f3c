//! Per-connection protocol driver
//!
//! Walks one accepted TCP connection through admission, method
//! negotiation, the optional username/password sub-negotiation, and the
//! command request, then hands the stream to the handler. Every reply is
//! written before the state advances, so a client always learns why it
//! was refused. Errors here only ever close this connection.

use crate::error::{Result, Socks5Error};
use crate::protocol::{
    NegotiationReply, NegotiationRequest, Reply, Request, UserPassReply, UserPassRequest,
    METHOD_NO_ACCEPTABLE, METHOD_USER_PASS, REP_COMMAND_NOT_SUPPORTED, USER_PASS_STATUS_FAILURE,
    USER_PASS_STATUS_SUCCESS,
};
use crate::server::{Handler, Server};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info};

pub(crate) async fn handle_connection(
    server: Arc<Server>,
    handler: Arc<dyn Handler>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    if !server.allow_list().check(peer.ip()) {
        // Denied peers are closed without a single byte written.
        info!(%peer, "TCP connection rejected by allow list");
        return;
    }
    if let Err(e) = serve_connection(&server, handler, stream).await {
        debug!(%peer, error = %e, "connection closed");
    }
}

async fn serve_connection(
    server: &Arc<Server>,
    handler: Arc<dyn Handler>,
    mut stream: TcpStream,
) -> Result<()> {
    negotiate(server, &mut stream).await?;
    let request = read_request(server, &mut stream).await?;
    handler.tcp_handle(server, stream, request).await
}

/// Run method negotiation and, when credentials are configured, the
/// RFC 1929 sub-negotiation.
///
/// A client that does not offer the required method gets a
/// `NO_ACCEPTABLE` reply and the connection ends there.
pub(crate) async fn negotiate<S>(server: &Server, stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = NegotiationRequest::read_from(stream).await?;
    if !request.methods.contains(&server.method()) {
        NegotiationReply::new(METHOD_NO_ACCEPTABLE)
            .write_to(stream)
            .await?;
        return Err(Socks5Error::NoAcceptableMethod.into());
    }
    NegotiationReply::new(server.method()).write_to(stream).await?;

    if server.method() == METHOD_USER_PASS {
        let auth = UserPassRequest::read_from(stream).await?;
        let uname_ok = constant_time_eq(&auth.uname, server.username().as_bytes());
        let passwd_ok = constant_time_eq(&auth.passwd, server.password().as_bytes());
        if !(uname_ok & passwd_ok) {
            UserPassReply::new(USER_PASS_STATUS_FAILURE)
                .write_to(stream)
                .await?;
            return Err(Socks5Error::AuthFailed.into());
        }
        UserPassReply::new(USER_PASS_STATUS_SUCCESS)
            .write_to(stream)
            .await?;
    }
    Ok(())
}

/// Read the command request and refuse anything outside the supported
/// set, mirroring the request's address family in the refusal.
pub(crate) async fn read_request<S>(server: &Server, stream: &mut S) -> Result<Request>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = Request::read_from(stream).await?;
    if !server.supported_commands().contains(&request.cmd) {
        Reply::zeroed(REP_COMMAND_NOT_SUPPORTED, request.atyp)
            .write_to(stream)
            .await?;
        return Err(Socks5Error::CommandNotSupported(request.cmd).into());
    }
    Ok(request)
}

/// Compare credentials without leaking the mismatch position through
/// timing.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}
