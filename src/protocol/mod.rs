//! SOCKS5 wire protocol
//!
//! Frame definitions and the codec for every message exchanged with a
//! SOCKS5 client: method negotiation, username/password sub-negotiation,
//! request/reply, and the UDP datagram encapsulation.

mod codec;
mod consts;
mod types;

pub use consts::*;
pub use types::{
    address_parts, format_address, parse_address, Datagram, NegotiationReply, NegotiationRequest,
    Reply, Request, UserPassReply, UserPassRequest,
};
