//! A "magic" UDP socket for peer-to-peer overlay networks.
//!
//! [`RoverSock`] presents a single virtual endpoint per peer to an
//! encrypted-tunnel layer above it, while underneath it continuously probes
//! candidate UDP paths, measures latency, promotes the best one and falls
//! back to a TCP relay whenever no direct path works.

#![recursion_limit = "256"]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod disco;
pub mod key;
pub mod net;
pub mod netprobe;
pub mod portmapper;
pub mod relay;
pub mod sock;
pub mod stun;
pub mod util;

pub use crate::config::RELAY_MAGIC_IP;
pub use crate::key::{PublicKey, SecretKey};
pub use crate::relay::{RelayMap, RelayNode, RelayRegion};
pub use crate::sock::{
    Callbacks, ConnectionType, EndpointInfo, Options, PeerHandle, PingOutcome, RoverSock,
    SendError,
};
