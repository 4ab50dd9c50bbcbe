//! Configuration of the available relay regions and servers.

use std::{
    collections::HashMap,
    fmt,
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

/// Configuration of all the relay servers that can be used.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RelayMap {
    /// A map of the different region IDs to the [`RelayRegion`] information
    regions: Arc<HashMap<u16, RelayRegion>>,
}

impl RelayMap {
    /// Returns the sorted region IDs.
    pub fn region_ids(&self) -> Vec<u16> {
        let mut ids: Vec<_> = self.regions.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Returns an `Iterator` over all known regions.
    pub fn regions(&self) -> impl Iterator<Item = &RelayRegion> {
        self.regions.values()
    }

    /// Is this a known region?
    pub fn contains_region(&self, region_id: u16) -> bool {
        self.regions.contains_key(&region_id)
    }

    /// Get the given region.
    pub fn get_region(&self, region_id: u16) -> Option<&RelayRegion> {
        self.regions.get(&region_id)
    }

    /// How many regions are known?
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Are there any regions in this map?
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Creates a map with a single region containing a single server.
    pub fn default_from_node(region_id: u16, host: String, port: u16, stun_port: u16) -> Self {
        let mut regions = HashMap::with_capacity(1);
        regions.insert(
            region_id,
            RelayRegion {
                region_id,
                region_code: "default".into(),
                avoid: false,
                nodes: vec![RelayNode {
                    name: "default-1".into(),
                    region_id,
                    host,
                    port,
                    stun_only: false,
                    stun_port,
                    ipv4: None,
                    ipv6: None,
                }],
            },
        );

        RelayMap {
            regions: Arc::new(regions),
        }
    }

    /// Constructs the [`RelayMap`] from an iterator of [`RelayRegion`]s.
    pub fn from_regions(value: impl IntoIterator<Item = RelayRegion>) -> Result<Self> {
        let mut map = HashMap::new();
        for region in value.into_iter() {
            ensure!(!map.contains_key(&region.region_id), "duplicate region id");
            ensure!(!region.nodes.is_empty(), "a region must have nodes");
            for node in region.nodes.iter() {
                ensure!(
                    node.region_id == region.region_id,
                    "node region_id does not match region"
                );
            }
            map.insert(region.region_id, region);
        }
        Ok(RelayMap {
            regions: map.into(),
        })
    }
}

impl fmt::Display for RelayMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self, f)
    }
}

/// A geographic region running relay node(s).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, PartialOrd, Ord)]
pub struct RelayRegion {
    /// A unique integer for a geographic region.
    pub region_id: u16,
    /// A list of [`RelayNode`]s in this region.
    pub nodes: Vec<RelayNode>,
    /// Whether or not to avoid this region.
    pub avoid: bool,
    /// The region-specific string identifier.
    pub region_code: String,
}

impl RelayRegion {
    /// The node new connections to this region should dial.
    pub fn dial_node(&self) -> Option<&RelayNode> {
        self.nodes.iter().find(|n| !n.stun_only)
    }
}

/// Information on a specific relay server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, PartialOrd, Ord)]
pub struct RelayNode {
    /// The name of this relay server.
    ///
    /// This name MUST be unique among all configured relay servers.
    pub name: String,
    /// The numeric region ID.
    pub region_id: u16,
    /// The hostname to dial.
    pub host: String,
    /// The port the relay service listens on.
    pub port: u16,
    /// Whether this server should only be used for STUN requests.
    pub stun_only: bool,
    /// The STUN port of the server.
    pub stun_port: u16,
    /// Optional IPv4 address, to skip resolution of `host`.
    pub ipv4: Option<std::net::Ipv4Addr>,
    /// Optional IPv6 address, to skip resolution of `host`.
    pub ipv6: Option<std::net::Ipv6Addr>,
}

impl RelayNode {
    /// The address to dial for the relay service, if known without DNS.
    pub fn relay_addr(&self) -> Option<SocketAddr> {
        self.ip()
            .map(|ip| SocketAddr::new(ip, self.port))
    }

    /// The address to send STUN probes to, if known without DNS.
    pub fn stun_addr(&self) -> Option<SocketAddr> {
        self.ip()
            .map(|ip| SocketAddr::new(ip, self.stun_port))
    }

    fn ip(&self) -> Option<IpAddr> {
        self.ipv4
            .map(IpAddr::V4)
            .or(self.ipv6.map(IpAddr::V6))
    }
}

impl fmt::Display for RelayNode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_regions_rejects_duplicates() {
        let region = |id: u16| RelayRegion {
            region_id: id,
            region_code: format!("r{id}"),
            avoid: false,
            nodes: vec![RelayNode {
                name: format!("r{id}-1"),
                region_id: id,
                host: "relay.example".into(),
                port: 443,
                stun_only: false,
                stun_port: 3478,
                ipv4: None,
                ipv6: None,
            }],
        };

        let map = RelayMap::from_regions([region(1), region(2)]).unwrap();
        assert_eq!(map.region_ids(), vec![1, 2]);
        assert!(map.contains_region(2));
        assert!(!map.contains_region(3));

        assert!(RelayMap::from_regions([region(1), region(1)]).is_err());
    }
}
