//! Public UDP endpoint learning.
//!
//! Every `acceptConnection` tells us how the acceptor saw us. The endpoint a
//! strict majority of observations agree on becomes our public endpoint; a
//! configured endpoint overrides learning entirely.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use tessera_protocol::PublicEndpoint;

pub struct ExternalAddr {
    config_override: Option<SocketAddr>,
    observations: HashMap<SocketAddr, u32>,
    total: u32,
    resolved: Option<SocketAddr>,
}

impl ExternalAddr {
    pub fn new(config_override: Option<SocketAddr>) -> Self {
        Self {
            config_override,
            observations: HashMap::new(),
            total: 0,
            resolved: None,
        }
    }

    /// Record one observation reported by a remote acceptor.
    pub fn observe(&mut self, endpoint: &PublicEndpoint) {
        if self.config_override.is_some() {
            return;
        }
        let Some(addr) = parse_endpoint(endpoint) else {
            tracing::debug!(address = %endpoint.address, "udp: unparseable public endpoint ignored");
            return;
        };
        if !is_public(addr.ip()) {
            return;
        }
        self.total = self.total.saturating_add(1);
        *self.observations.entry(addr).or_insert(0) += 1;
        self.recompute();
    }

    pub fn get(&self) -> Option<SocketAddr> {
        self.config_override.or(self.resolved)
    }

    fn recompute(&mut self) {
        let Some((&addr, &count)) = self.observations.iter().max_by_key(|(_, c)| **c) else {
            return;
        };
        if count * 2 <= self.total || self.resolved == Some(addr) {
            return;
        }
        // New majority: restart counting from it so a later move converges quickly
        self.observations.clear();
        self.observations.insert(addr, count);
        self.total = count;
        self.resolved = Some(addr);
        tracing::info!(%addr, "udp: public endpoint learned");
    }
}

fn parse_endpoint(endpoint: &PublicEndpoint) -> Option<SocketAddr> {
    let ip: IpAddr = endpoint.address.parse().ok()?;
    Some(SocketAddr::new(ip, endpoint.port))
}

/// Loopback, unspecified, link-local and RFC1918 addresses say nothing about
/// how the wider network sees us.
pub fn is_public(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => !(v4.is_loopback() || v4.is_unspecified() || v4.is_private() || v4.is_link_local()),
        IpAddr::V6(v6) => !(v6.is_loopback() || v6.is_unspecified()),
    }
}
