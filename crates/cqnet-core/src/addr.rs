//! IPv4 address helpers.
//!
//! Public APIs take dotted quads; `"*"` (or an empty string) binds to
//! every local interface.

use crate::error::{NetError, Result};
use std::net::{Ipv4Addr, SocketAddrV4};

pub const ANY_INTERFACE: &str = "*";

pub fn parse_ipv4(ip: &str) -> Result<Ipv4Addr> {
    let ip = ip.trim();
    if ip.is_empty() || ip == ANY_INTERFACE {
        return Ok(Ipv4Addr::UNSPECIFIED);
    }
    ip.parse()
        .map_err(|_| NetError::InvalidAddress(ip.to_string()))
}

pub fn socket_addr(ip: &str, port: u16) -> Result<SocketAddrV4> {
    Ok(SocketAddrV4::new(parse_ipv4(ip)?, port))
}

pub fn to_sockaddr(addr: SocketAddrV4) -> libc::sockaddr_in {
    // Zeroed so sin_zero (and any platform padding) is clean.
    let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sa.sin_family = libc::AF_INET as libc::sa_family_t;
    sa.sin_port = addr.port().to_be();
    sa.sin_addr.s_addr = u32::from(*addr.ip()).to_be();
    sa
}

pub fn from_sockaddr(sa: &libc::sockaddr_in) -> SocketAddrV4 {
    SocketAddrV4::new(
        Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr)),
        u16::from_be(sa.sin_port),
    )
}

#[inline]
pub const fn sockaddr_len() -> libc::socklen_t {
    std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
}
