//! SOCKS5 frame codec
//!
//! Decoders read exactly the bytes each frame requires, never more, so a
//! stream can carry back-to-back frames. Encoders produce one contiguous
//! byte sequence per frame.

use crate::error::{Result, Socks5Error};
use crate::protocol::consts::*;
use crate::protocol::types::{
    Datagram, NegotiationReply, NegotiationRequest, Reply, Request, UserPassReply, UserPassRequest,
};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Read the ATYP-dependent address bytes of a request or reply.
///
/// Domains come back with their 1-byte length prefix retained.
async fn read_addr<R>(r: &mut R, atyp: u8) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    match atyp {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            r.read_exact(&mut addr).await?;
            Ok(addr.to_vec())
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            r.read_exact(&mut addr).await?;
            Ok(addr.to_vec())
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            r.read_exact(&mut len).await?;
            if len[0] == 0 {
                return Err(Socks5Error::BadRequest.into());
            }
            let mut addr = vec![0u8; len[0] as usize + 1];
            addr[0] = len[0];
            r.read_exact(&mut addr[1..]).await?;
            Ok(addr)
        }
        _ => Err(Socks5Error::BadRequest.into()),
    }
}

impl NegotiationRequest {
    /// Decode a method negotiation request from the stream.
    pub async fn read_from<R>(r: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut head = [0u8; 2];
        r.read_exact(&mut head).await?;
        if head[0] != VER {
            return Err(Socks5Error::UnsupportedVersion(head[0]).into());
        }
        if head[1] == 0 {
            return Err(Socks5Error::BadRequest.into());
        }
        let mut methods = vec![0u8; head[1] as usize];
        r.read_exact(&mut methods).await?;
        Ok(NegotiationRequest {
            ver: head[0],
            nmethods: head[1],
            methods,
        })
    }

    /// Encode to wire bytes.
    pub fn to_bytes(&self) -> Bytes {
        let mut b = BytesMut::with_capacity(2 + self.methods.len());
        b.put_u8(self.ver);
        b.put_u8(self.nmethods);
        b.put_slice(&self.methods);
        b.freeze()
    }
}

impl NegotiationReply {
    /// Decode a negotiation reply from the stream.
    pub async fn read_from<R>(r: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut b = [0u8; 2];
        r.read_exact(&mut b).await?;
        if b[0] != VER {
            return Err(Socks5Error::UnsupportedVersion(b[0]).into());
        }
        Ok(NegotiationReply {
            ver: b[0],
            method: b[1],
        })
    }

    /// Encode to wire bytes.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&[self.ver, self.method])
    }

    /// Encode and write to the stream.
    pub async fn write_to<W>(&self, w: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        w.write_all(&self.to_bytes()).await?;
        w.flush().await?;
        Ok(())
    }
}

impl UserPassRequest {
    /// Decode a username/password sub-negotiation request.
    pub async fn read_from<R>(r: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut head = [0u8; 2];
        r.read_exact(&mut head).await?;
        if head[0] != USER_PASS_VER {
            return Err(Socks5Error::UnsupportedUserPassVersion(head[0]).into());
        }
        let ulen = head[1];
        if ulen == 0 {
            return Err(Socks5Error::BadRequest.into());
        }
        // Username and the following PLEN byte in one read.
        let mut ub = vec![0u8; ulen as usize + 1];
        r.read_exact(&mut ub).await?;
        let plen = ub[ulen as usize];
        if plen == 0 {
            return Err(Socks5Error::BadRequest.into());
        }
        let mut passwd = vec![0u8; plen as usize];
        r.read_exact(&mut passwd).await?;
        ub.truncate(ulen as usize);
        Ok(UserPassRequest {
            ver: head[0],
            ulen,
            uname: ub,
            plen,
            passwd,
        })
    }

    /// Encode to wire bytes.
    pub fn to_bytes(&self) -> Bytes {
        let mut b = BytesMut::with_capacity(3 + self.uname.len() + self.passwd.len());
        b.put_u8(self.ver);
        b.put_u8(self.ulen);
        b.put_slice(&self.uname);
        b.put_u8(self.plen);
        b.put_slice(&self.passwd);
        b.freeze()
    }
}

impl UserPassReply {
    /// Decode a sub-negotiation reply from the stream.
    pub async fn read_from<R>(r: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut b = [0u8; 2];
        r.read_exact(&mut b).await?;
        if b[0] != USER_PASS_VER {
            return Err(Socks5Error::UnsupportedUserPassVersion(b[0]).into());
        }
        Ok(UserPassReply {
            ver: b[0],
            status: b[1],
        })
    }

    /// Encode to wire bytes.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&[self.ver, self.status])
    }

    /// Encode and write to the stream.
    pub async fn write_to<W>(&self, w: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        w.write_all(&self.to_bytes()).await?;
        w.flush().await?;
        Ok(())
    }
}

impl Request {
    /// Decode a command request from the stream.
    pub async fn read_from<R>(r: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut head = [0u8; 4];
        r.read_exact(&mut head).await?;
        if head[0] != VER {
            return Err(Socks5Error::UnsupportedVersion(head[0]).into());
        }
        let dst_addr = read_addr(r, head[3]).await?;
        let mut dst_port = [0u8; 2];
        r.read_exact(&mut dst_port).await?;
        Ok(Request {
            ver: head[0],
            cmd: head[1],
            rsv: head[2],
            atyp: head[3],
            dst_addr,
            dst_port,
        })
    }

    /// Encode to wire bytes.
    pub fn to_bytes(&self) -> Bytes {
        let mut b = BytesMut::with_capacity(6 + self.dst_addr.len());
        b.put_u8(self.ver);
        b.put_u8(self.cmd);
        b.put_u8(self.rsv);
        b.put_u8(self.atyp);
        b.put_slice(&self.dst_addr);
        b.put_slice(&self.dst_port);
        b.freeze()
    }
}

impl Reply {
    /// Decode a command reply from the stream.
    pub async fn read_from<R>(r: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut head = [0u8; 4];
        r.read_exact(&mut head).await?;
        if head[0] != VER {
            return Err(Socks5Error::UnsupportedVersion(head[0]).into());
        }
        let bnd_addr = read_addr(r, head[3]).await?;
        let mut bnd_port = [0u8; 2];
        r.read_exact(&mut bnd_port).await?;
        Ok(Reply {
            ver: head[0],
            rep: head[1],
            rsv: head[2],
            atyp: head[3],
            bnd_addr,
            bnd_port,
        })
    }

    /// Encode to wire bytes.
    pub fn to_bytes(&self) -> Bytes {
        let mut b = BytesMut::with_capacity(6 + self.bnd_addr.len());
        b.put_u8(self.ver);
        b.put_u8(self.rep);
        b.put_u8(self.rsv);
        b.put_u8(self.atyp);
        b.put_slice(&self.bnd_addr);
        b.put_slice(&self.bnd_port);
        b.freeze()
    }

    /// Encode and write to the stream.
    pub async fn write_to<W>(&self, w: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        w.write_all(&self.to_bytes()).await?;
        w.flush().await?;
        Ok(())
    }
}

impl Datagram {
    /// Decode a whole UDP packet.
    ///
    /// The minimum legal size depends on the ATYP (10 bytes for IPv4, 22
    /// for IPv6, 7 plus the name for a domain); packets with no payload
    /// are rejected as malformed.
    pub fn from_bytes(b: &[u8]) -> Result<Self> {
        let n = b.len();
        let mut minl = 4usize;
        if n < minl {
            return Err(Socks5Error::BadRequest.into());
        }
        let atyp = b[3];
        let dst_addr: Vec<u8> = match atyp {
            ATYP_IPV4 => {
                minl += 4;
                if n < minl {
                    return Err(Socks5Error::BadRequest.into());
                }
                b[minl - 4..minl].to_vec()
            }
            ATYP_IPV6 => {
                minl += 16;
                if n < minl {
                    return Err(Socks5Error::BadRequest.into());
                }
                b[minl - 16..minl].to_vec()
            }
            ATYP_DOMAIN => {
                minl += 1;
                if n < minl {
                    return Err(Socks5Error::BadRequest.into());
                }
                let l = b[4] as usize;
                if l == 0 {
                    return Err(Socks5Error::BadRequest.into());
                }
                minl += l;
                if n < minl {
                    return Err(Socks5Error::BadRequest.into());
                }
                let mut addr = Vec::with_capacity(l + 1);
                addr.push(l as u8);
                addr.extend_from_slice(&b[minl - l..minl]);
                addr
            }
            _ => return Err(Socks5Error::BadRequest.into()),
        };
        minl += 2;
        if n <= minl {
            return Err(Socks5Error::BadRequest.into());
        }
        let dst_port = [b[minl - 2], b[minl - 1]];
        Ok(Datagram {
            rsv: [b[0], b[1]],
            frag: b[2],
            atyp,
            dst_addr,
            dst_port,
            data: Bytes::copy_from_slice(&b[minl..]),
        })
    }

    /// Encode to wire bytes.
    pub fn to_bytes(&self) -> Bytes {
        let mut b =
            BytesMut::with_capacity(4 + self.dst_addr.len() + 2 + self.data.len());
        b.put_slice(&self.rsv);
        b.put_u8(self.frag);
        b.put_u8(self.atyp);
        b.put_slice(&self.dst_addr);
        b.put_slice(&self.dst_port);
        b.put_slice(&self.data);
        b.freeze()
    }
}
