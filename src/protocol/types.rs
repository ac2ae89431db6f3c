//! SOCKS5 frame definitions
//!
//! The structs below mirror the wire layout byte for byte. For
//! `ATYP_DOMAIN` addresses the stored `dst_addr`/`bnd_addr` keeps the
//! 1-byte length prefix so that encoding and decoding stay symmetric.

use crate::error::{Result, Socks5Error};
use crate::protocol::consts::*;
use bytes::Bytes;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Method negotiation request: `VER | NMETHODS | METHODS`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationRequest {
    /// Protocol version, always 0x05
    pub ver: u8,
    /// Number of methods offered
    pub nmethods: u8,
    /// Offered method bytes
    pub methods: Vec<u8>,
}

/// Method negotiation reply: `VER | METHOD`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiationReply {
    /// Protocol version, always 0x05
    pub ver: u8,
    /// Selected method
    pub method: u8,
}

/// Username/password sub-negotiation request (RFC 1929)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPassRequest {
    /// Sub-negotiation version, always 0x01
    pub ver: u8,
    /// Username length
    pub ulen: u8,
    /// Username bytes
    pub uname: Vec<u8>,
    /// Password length
    pub plen: u8,
    /// Password bytes
    pub passwd: Vec<u8>,
}

/// Username/password sub-negotiation reply: `VER | STATUS`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserPassReply {
    /// Sub-negotiation version, always 0x01
    pub ver: u8,
    /// 0x00 on success, non-zero on failure
    pub status: u8,
}

/// Command request: `VER | CMD | RSV | ATYP | DST.ADDR | DST.PORT`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Protocol version, always 0x05
    pub ver: u8,
    /// Requested command
    pub cmd: u8,
    /// Reserved, written as 0x00 and not validated on read
    pub rsv: u8,
    /// Address type of `dst_addr`
    pub atyp: u8,
    /// Destination address (length-prefixed for domains)
    pub dst_addr: Vec<u8>,
    /// Destination port, big endian
    pub dst_port: [u8; 2],
}

/// Command reply: `VER | REP | RSV | ATYP | BND.ADDR | BND.PORT`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Protocol version, always 0x05
    pub ver: u8,
    /// Reply code
    pub rep: u8,
    /// Reserved, always 0x00
    pub rsv: u8,
    /// Address type of `bnd_addr`
    pub atyp: u8,
    /// Bound address (length-prefixed for domains)
    pub bnd_addr: Vec<u8>,
    /// Bound port, big endian
    pub bnd_port: [u8; 2],
}

/// UDP datagram encapsulation: `RSV | FRAG | ATYP | DST.ADDR | DST.PORT | DATA`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    /// Reserved, always 0x0000
    pub rsv: [u8; 2],
    /// Fragment number; anything but 0x00 is dropped
    pub frag: u8,
    /// Address type of `dst_addr`
    pub atyp: u8,
    /// Destination address (length-prefixed for domains)
    pub dst_addr: Vec<u8>,
    /// Destination port, big endian
    pub dst_port: [u8; 2],
    /// Payload
    pub data: Bytes,
}

impl NegotiationRequest {
    /// Build a negotiation request offering the given methods.
    pub fn new(methods: Vec<u8>) -> Self {
        NegotiationRequest {
            ver: VER,
            nmethods: methods.len() as u8,
            methods,
        }
    }
}

impl NegotiationReply {
    /// Build a negotiation reply selecting `method`.
    pub fn new(method: u8) -> Self {
        NegotiationReply { ver: VER, method }
    }
}

impl UserPassRequest {
    /// Build a username/password request.
    pub fn new(uname: Vec<u8>, passwd: Vec<u8>) -> Self {
        UserPassRequest {
            ver: USER_PASS_VER,
            ulen: uname.len() as u8,
            uname,
            plen: passwd.len() as u8,
            passwd,
        }
    }
}

impl UserPassReply {
    /// Build a sub-negotiation reply with the given status byte.
    pub fn new(status: u8) -> Self {
        UserPassReply {
            ver: USER_PASS_VER,
            status,
        }
    }
}

impl Request {
    /// Build a request. For `ATYP_DOMAIN` the address is given without
    /// the length prefix; it is prepended here.
    pub fn new(cmd: u8, atyp: u8, dst_addr: &[u8], dst_port: [u8; 2]) -> Self {
        Request {
            ver: VER,
            cmd,
            rsv: RSV,
            atyp,
            dst_addr: prefix_domain(atyp, dst_addr),
            dst_port,
        }
    }

    /// Destination as a dialable `host:port` string.
    pub fn address(&self) -> String {
        format_address(self.atyp, &self.dst_addr, self.dst_port)
    }

    /// Destination port in host byte order.
    pub fn port(&self) -> u16 {
        u16::from_be_bytes(self.dst_port)
    }
}

impl Reply {
    /// Build a reply. For `ATYP_DOMAIN` the address is given without the
    /// length prefix; it is prepended here.
    pub fn new(rep: u8, atyp: u8, bnd_addr: &[u8], bnd_port: [u8; 2]) -> Self {
        Reply {
            ver: VER,
            rep,
            rsv: RSV,
            atyp,
            bnd_addr: prefix_domain(atyp, bnd_addr),
            bnd_port,
        }
    }

    /// Build an error reply with a zeroed address mirroring the request:
    /// IPv4 zeros when the request used IPv4 or a domain, IPv6 zeros when
    /// it used IPv6.
    pub fn zeroed(rep: u8, request_atyp: u8) -> Self {
        if request_atyp == ATYP_IPV6 {
            Reply::new(rep, ATYP_IPV6, &[0u8; 16], [0, 0])
        } else {
            Reply::new(rep, ATYP_IPV4, &[0u8; 4], [0, 0])
        }
    }

    /// Build a success reply naming a bound socket endpoint.
    pub fn success(addr: SocketAddr) -> Self {
        let (atyp, bnd_addr, bnd_port) = address_parts(addr);
        Reply::new(REP_SUCCESS, atyp, &bnd_addr, bnd_port)
    }

    /// Bound address as a `host:port` string.
    pub fn address(&self) -> String {
        format_address(self.atyp, &self.bnd_addr, self.bnd_port)
    }

    /// Bound port in host byte order.
    pub fn port(&self) -> u16 {
        u16::from_be_bytes(self.bnd_port)
    }
}

impl Datagram {
    /// Build a datagram. For `ATYP_DOMAIN` the address is given without
    /// the length prefix; it is prepended here.
    pub fn new(atyp: u8, dst_addr: &[u8], dst_port: [u8; 2], data: Bytes) -> Self {
        Datagram {
            rsv: [0, 0],
            frag: 0x00,
            atyp,
            dst_addr: prefix_domain(atyp, dst_addr),
            dst_port,
            data,
        }
    }

    /// Destination as a dialable `host:port` string.
    pub fn address(&self) -> String {
        format_address(self.atyp, &self.dst_addr, self.dst_port)
    }

    /// Destination port in host byte order.
    pub fn port(&self) -> u16 {
        u16::from_be_bytes(self.dst_port)
    }
}

fn prefix_domain(atyp: u8, addr: &[u8]) -> Vec<u8> {
    if atyp == ATYP_DOMAIN {
        let mut v = Vec::with_capacity(addr.len() + 1);
        v.push(addr.len() as u8);
        v.extend_from_slice(addr);
        v
    } else {
        addr.to_vec()
    }
}

/// Format a decoded `(ATYP, ADDR, PORT)` triple as `host:port`.
///
/// IPv6 hosts are bracketed so the result feeds straight into the
/// resolver; domain addresses have their length prefix stripped.
pub fn format_address(atyp: u8, addr: &[u8], port: [u8; 2]) -> String {
    let port = u16::from_be_bytes(port);
    match atyp {
        ATYP_IPV4 if addr.len() == 4 => {
            let ip = Ipv4Addr::new(addr[0], addr[1], addr[2], addr[3]);
            format!("{}:{}", ip, port)
        }
        ATYP_IPV6 if addr.len() == 16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(addr);
            format!("[{}]:{}", Ipv6Addr::from(octets), port)
        }
        ATYP_DOMAIN if !addr.is_empty() => {
            let domain = String::from_utf8_lossy(&addr[1..]);
            format!("{}:{}", domain, port)
        }
        _ => format!(":{}", port),
    }
}

/// Split a textual `host:port` into `(ATYP, ADDR, PORT)`.
///
/// IP literals map to `ATYP_IPV4`/`ATYP_IPV6`; anything else becomes a
/// length-prefixed `ATYP_DOMAIN` address.
pub fn parse_address(address: &str) -> Result<(u8, Vec<u8>, [u8; 2])> {
    if let Ok(sa) = address.parse::<SocketAddr>() {
        return Ok(address_parts(sa));
    }
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| Socks5Error::InvalidAddress(address.to_string()))?;
    let port: u16 = port
        .parse()
        .map_err(|_| Socks5Error::InvalidAddress(address.to_string()))?;
    if host.is_empty() || host.len() > MAX_DOMAIN_LEN {
        return Err(Socks5Error::InvalidAddress(address.to_string()).into());
    }
    let mut addr = Vec::with_capacity(host.len() + 1);
    addr.push(host.len() as u8);
    addr.extend_from_slice(host.as_bytes());
    Ok((ATYP_DOMAIN, addr, port.to_be_bytes()))
}

/// Read `(ATYP, ADDR, PORT)` directly off a socket endpoint.
///
/// This is the path replies take; it never re-parses text and cannot
/// confuse literals with domains.
pub fn address_parts(addr: SocketAddr) -> (u8, Vec<u8>, [u8; 2]) {
    let port = addr.port().to_be_bytes();
    match addr.ip() {
        IpAddr::V4(ip) => (ATYP_IPV4, ip.octets().to_vec(), port),
        IpAddr::V6(ip) => (ATYP_IPV6, ip.octets().to_vec(), port),
    }
}
