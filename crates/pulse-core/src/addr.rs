//! Address-family-agnostic socket address helpers.
//!
//! A dual-stack IPv6 listener reports IPv4 peers as `::ffff:a.b.c.d`; these
//! helpers compare and print such peers the same way as native IPv4 ones.

use std::net::{IpAddr, SocketAddr};

/// Unmap IPv4-mapped IPv6 addresses so equal peers compare equal.
pub fn canonical(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), v6.port()),
            None => addr,
        },
        SocketAddr::V4(_) => addr,
    }
}

/// Same host and port.
pub fn same_endpoint(a: &SocketAddr, b: &SocketAddr) -> bool {
    canonical(*a) == canonical(*b)
}

/// Same host, any port.
pub fn same_host(a: &SocketAddr, b: &SocketAddr) -> bool {
    canonical(*a).ip() == canonical(*b).ip()
}

pub fn with_port(addr: SocketAddr, port: u16) -> SocketAddr {
    let mut addr = addr;
    addr.set_port(port);
    addr
}

/// Printable host part, without port or brackets.
pub fn host_string(addr: &SocketAddr) -> String {
    canonical(*addr).ip().to_string()
}
