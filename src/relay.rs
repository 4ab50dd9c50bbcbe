//! Relay servers: configuration map, wire framing and the long-lived client.
//!
//! Relays forward sealed payloads between peers that cannot reach each other
//! directly. Clients are addressed by their public keys. A relay connection
//! is a last resort, but one is kept open to the home region at all times so
//! peers can always reach us there.

pub(crate) mod client;
pub(crate) mod codec;
mod map;

pub use self::client::{Client, ClientBuilder, ClientError, ClientReceiver, ReceivedMessage};
pub use self::map::{RelayMap, RelayNode, RelayRegion};

/// The maximum size of a packet sent over a relay.
/// (This only includes the payload visible to the socket layer, not the
/// on-wire framing overhead.)
pub const MAX_PACKET_SIZE: usize = 64 * 1024;
