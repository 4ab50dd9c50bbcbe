//! Configuration types exchanged with the control plane and the tunnel layer.

use std::{
    collections::HashMap,
    fmt::Display,
    net::{IpAddr, Ipv4Addr, SocketAddr},
};

use serde::{Deserialize, Serialize};

use crate::key::PublicKey;

/// Fake endpoint IP address that means "use the relay". When used, the port
/// number of the endpoint is the relay region ID to use.
///
/// This convention is part of the public send interface: callers can
/// address a relay without a separate API.
pub const RELAY_MAGIC_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(127, 3, 3, 40));

/// An endpoint and how it was discovered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// The address of the endpoint.
    pub addr: SocketAddr,
    /// The kind of endpoint.
    pub typ: EndpointType,
}

/// Type of endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndpointType {
    /// Endpoint is bound to a local address.
    Local,
    /// Endpoint has a publicly reachable address found via STUN.
    Stun,
    /// Endpoint uses a port mapping in the router.
    Portmapped,
    /// Hard NAT: STUN'ed IPv4 address + local fixed port.
    Stun4LocalPort,
}

impl Display for EndpointType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointType::Local => write!(f, "local"),
            EndpointType::Stun => write!(f, "stun"),
            EndpointType::Portmapped => write!(f, "portmap"),
            EndpointType::Stun4LocalPort => write!(f, "stun4localport"),
        }
    }
}

/// Information about the host's network conditions, rebuilt after every
/// probe and forwarded to the control plane when materially changed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NetInfo {
    /// Whether the host's NAT mappings vary based on the destination IP.
    pub mapping_varies_by_dest_ip: Option<bool>,

    /// Whether the host has IPv6 internet connectivity.
    pub working_ipv6: Option<bool>,

    /// Whether the host has UDP internet connectivity.
    pub working_udp: Option<bool>,

    /// Whether there is an existing portmap open.
    pub have_port_map: bool,

    /// Result of the port mapping protocol probe, if one ran.
    pub portmap_probe: Option<crate::portmapper::ProbeOutput>,

    /// This node's preferred relay region for incoming traffic.
    /// Zero means disconnected or unknown.
    pub preferred_relay: u16,

    /// The fastest recent time to reach the relay regions' STUN servers, in
    /// seconds, keyed by "regionID-v4" / "regionID-v6".
    pub relay_latency: HashMap<String, f64>,
}

impl NetInfo {
    /// Reports whether `self` and `other` are basically equal, ignoring
    /// changes in relay latency.
    pub fn basically_equal(&self, other: &Self) -> bool {
        self.mapping_varies_by_dest_ip == other.mapping_varies_by_dest_ip
            && self.working_ipv6 == other.working_ipv6
            && self.working_udp == other.working_udp
            && self.have_port_map == other.have_port_map
            && self.portmap_probe == other.portmap_probe
            && self.preferred_relay == other.preferred_relay
    }
}

/// A peer as configured by the control plane.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    /// The tunnel public key, the primary identifier of this peer.
    pub key: PublicKey,
    /// The discovery key, if the peer participates in path discovery.
    ///
    /// Legacy relay-only peers have none.
    pub disco_key: Option<PublicKey>,
    /// The peer's home relay region, if any.
    pub relay_region: Option<u16>,
    /// Endpoints on which we believe the peer is reachable.
    pub endpoints: Vec<SocketAddr>,
}

/// The set of peers the engine should track, as installed by the control
/// plane. Replaces the previous map wholesale.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NetworkMap {
    /// All currently known peers.
    pub peers: Vec<Node>,
}

/// Outcome of a user-initiated ping to a peer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PingOutcome {
    /// Measured round trip.
    pub latency_seconds: Option<f64>,
    /// The ip:port if direct UDP was used.
    pub endpoint: Option<SocketAddr>,
    /// Non-zero relay region ID if the relay was used.
    pub relay_region_id: Option<u16>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_net_info_basically_equal_ignores_latency() {
        let mut a = NetInfo {
            preferred_relay: 2,
            ..Default::default()
        };
        let mut b = a.clone();
        b.relay_latency.insert("2-v4".into(), 0.012);
        assert!(a.basically_equal(&b));

        a.working_udp = Some(true);
        assert!(!a.basically_equal(&b));
    }
}
