//! Client IP detection from forwarding headers and the transport peer.

use crate::config::{ClientIpConfig, ScanDirection};
use crate::error::{DdnsError, Result};
use axum::http::HeaderMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// IPv4 ranges never accepted from a forwarding header.
const PRIVATE_V4_RANGES: [(Ipv4Addr, u8); 6] = [
    (Ipv4Addr::new(10, 0, 0, 0), 8),
    (Ipv4Addr::new(100, 64, 0, 0), 10),
    (Ipv4Addr::new(172, 16, 0, 0), 12),
    (Ipv4Addr::new(192, 0, 0, 0), 24),
    (Ipv4Addr::new(192, 168, 0, 0), 16),
    (Ipv4Addr::new(198, 18, 0, 0), 15),
];

/// Resolves the caller's public address.
#[derive(Debug, Clone)]
pub struct IpDetector {
    headers: Vec<String>,
    scan: ScanDirection,
}

impl IpDetector {
    /// Create a detector with the default `X-Real-Ip`, `X-Forwarded-For` headers.
    pub fn new() -> Self {
        Self::from_config(&ClientIpConfig::default())
    }

    /// Create a detector from configuration.
    pub fn from_config(config: &ClientIpConfig) -> Self {
        Self {
            headers: config.headers.clone(),
            scan: config.scan,
        }
    }

    /// First public address found in the trusted headers, in priority order.
    pub fn from_headers(&self, headers: &HeaderMap) -> Option<IpAddr> {
        for name in &self.headers {
            let Some(value) = headers.get(name.as_str()).and_then(|v| v.to_str().ok()) else {
                continue;
            };

            let entries: Vec<&str> = value.split(',').map(str::trim).collect();
            let found = match self.scan {
                ScanDirection::RightToLeft => entries.iter().rev().find_map(|e| public_ip(e)),
                ScanDirection::LeftToRight => entries.iter().find_map(|e| public_ip(e)),
            };

            if let Some(ip) = found {
                tracing::debug!("Client address {} taken from {}", ip, name);
                return Some(ip);
            }
        }
        None
    }

    /// Header address, falling back to the peer's host part.
    pub fn detect(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> Result<IpAddr> {
        self.from_headers(headers)
            .or_else(|| peer.map(|p| p.ip()))
            .ok_or(DdnsError::NoClientAddress)
    }
}

impl Default for IpDetector {
    fn default() -> Self {
        Self::new()
    }
}

fn public_ip(entry: &str) -> Option<IpAddr> {
    let ip: IpAddr = entry.parse().ok()?;
    (is_global_unicast(&ip) && !is_private_subnet(&ip)).then_some(ip)
}

fn is_global_unicast(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_unspecified()
                || v4.is_loopback()
                || v4.is_multicast()
                || v4.is_link_local()
                || v4.is_broadcast())
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_global_unicast(&IpAddr::V4(mapped));
            }
            let link_local = (v6.segments()[0] & 0xffc0) == 0xfe80;
            !(v6.is_unspecified() || v6.is_loopback() || v6.is_multicast() || link_local)
        }
    }
}

fn is_private_subnet(ip: &IpAddr) -> bool {
    let v4 = match ip {
        IpAddr::V4(v4) => *v4,
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(mapped) => mapped,
            None => return false,
        },
    };

    let bits = u32::from(v4);
    PRIVATE_V4_RANGES.iter().any(|(network, prefix)| {
        let mask = u32::MAX << (32 - u32::from(*prefix));
        bits & mask == u32::from(*network) & mask
    })
}
