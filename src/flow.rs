// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Network flow 4-tuple.
//
// Flows live inside the shared channel segment (buffer headers, control
// queue entries) and cross the process boundary, so the layout is fixed
// and all addresses are kept in host byte order.

use std::fmt;
use std::net::Ipv4Addr;

use crate::error::{Error, Result};

/// A flow 4-tuple identifying a connection or connectionless endpoint.
///
/// Addresses and ports are in host byte order within the channel; the
/// dotted-quad API boundary converts on the way in.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetFlow {
    pub src_ip: u32,
    pub dst_ip: u32,
    pub src_port: u16,
    pub dst_port: u16,
}

impl fmt::Display for NetFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            Ipv4Addr::from(self.src_ip),
            self.src_port,
            Ipv4Addr::from(self.dst_ip),
            self.dst_port
        )
    }
}

/// Parse a dotted-quad IPv4 string into a host-order address, rejecting
/// the limited broadcast (255.255.255.255) and the any-address (0.0.0.0).
/// Neither is a usable flow endpoint.
pub fn parse_unicast(s: &str) -> Result<u32> {
    let addr: Ipv4Addr = s
        .parse()
        .map_err(|_| Error::InvalidArgument("malformed IPv4 address"))?;
    if addr.is_broadcast() {
        return Err(Error::InvalidArgument("broadcast address not allowed"));
    }
    if addr.is_unspecified() {
        return Err(Error::InvalidArgument("zero address not allowed"));
    }
    Ok(u32::from(addr))
}
