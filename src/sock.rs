//! A socket that can change its communication path while in use.
//!
//! [`RoverSock`] hides the churn of peer-to-peer connectivity from the
//! tunnel layer above it: it hands out one stable [`PeerHandle`] per peer
//! and underneath continuously probes candidate UDP paths, promotes the
//! lowest-latency validated one and falls back to the relay mesh whenever
//! the direct path is absent or in doubt.

use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context as _, Result};
use bytes::Bytes;
use rand::{seq::SliceRandom, Rng, SeedableRng};
use tokio::sync::{self, mpsc, oneshot, Mutex};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error_span, info, info_span, instrument, trace, warn, Instrument};

use crate::config::{self, RELAY_MAGIC_IP};
use crate::disco;
use crate::key::{PublicKey, SecretKey, SharedSecret};
use crate::net::LocalAddresses;
use crate::netprobe;
use crate::portmapper;
use crate::relay::RelayMap;
use crate::stun;
use crate::util::AbortingJoinHandle;

mod endpoint;
mod rebinding_conn;
mod relay_actor;
mod timer;
mod udp_actor;

pub use self::endpoint::{ConnectionType, EndpointInfo};
pub use crate::config::PingOutcome;

use self::endpoint::{PeerMap, PingAction, SESSION_ACTIVE_TIMEOUT};
use self::rebinding_conn::RebindingUdpConn;
use self::relay_actor::{
    try_send_relay, RelayActor, RelayActorMessage, RelayRoutes, RelayTrySend, RelayWriteChannels,
};
use self::timer::Timer;
use self::udp_actor::UdpActor;

/// How long our reported endpoints are considered fresh enough to put into
/// a call-me-maybe. UDP NAT mappings typically expire at 30 seconds, so
/// this is a few seconds shy of that.
const ENDPOINTS_FRESH_ENOUGH_DURATION: Duration = Duration::from_secs(27);

/// Capacity of the payload streams handed to the upper layer.
const PAYLOAD_QUEUE_DEPTH: usize = 512;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum CurrentPortFate {
    Keep,
    Drop,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Network {
    Ipv4,
    Ipv6,
}

impl Network {
    fn default_addr(&self) -> IpAddr {
        match self {
            Self::Ipv4 => Ipv4Addr::UNSPECIFIED.into(),
            Self::Ipv6 => Ipv6Addr::UNSPECIFIED.into(),
        }
    }
}

/// Errors surfaced by the send path and the control-plane entry points.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SendError {
    /// The engine is shut down or logged out.
    #[error("socket closed")]
    Closed,
    /// No interface is up; sending is pointless.
    #[error("network down")]
    NetworkDown,
    /// No peer record for the requested handle or key.
    #[error("unknown peer")]
    UnknownPeer,
    /// Neither a direct path nor a relay fallback is known.
    #[error("no path to peer")]
    NoPath,
    /// The relay write queue is saturated; the caller may retry.
    #[error("relay queue full")]
    RelayQueueFull,
}

/// The stable, opaque per-peer address handed to the upper layer.
///
/// The tunnel layer expects peers to look like UDP addresses; this is a
/// synthetic unique-local IPv6 address that never appears on the wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct PeerHandle(SocketAddr);

/// Counter ensuring unique [`PeerHandle`]s.
static HANDLE_COUNTER: AtomicU64 = AtomicU64::new(0);

impl PeerHandle {
    /// The Prefix/L of our unique local addresses.
    const ADDR_PREFIXL: u8 = 0xfd;
    /// The Global ID used in our unique local addresses.
    const ADDR_GLOBAL_ID: [u8; 5] = [18, 52, 86, 120, 154];
    /// The Subnet ID used in our unique local addresses.
    const ADDR_SUBNET: [u8; 2] = [0; 2];

    /// Generates a globally unique fake UDP address (an RFC 4193 unique
    /// local IPv6 address).
    pub(crate) fn generate() -> Self {
        let mut addr = [0u8; 16];
        addr[0] = Self::ADDR_PREFIXL;
        addr[1..6].copy_from_slice(&Self::ADDR_GLOBAL_ID);
        addr[6..8].copy_from_slice(&Self::ADDR_SUBNET);

        let counter = HANDLE_COUNTER.fetch_add(1, Ordering::Relaxed);
        addr[8..16].copy_from_slice(&counter.to_be_bytes());

        Self(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(addr)), 12345))
    }

    /// The raw UDP-shaped form of this handle.
    pub fn as_socket_addr(&self) -> SocketAddr {
        self.0
    }
}

impl Display for PeerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "PeerHandle({})", self.0)
    }
}

/// A concrete destination: either a UDP address or a relay region.
///
/// Relay destinations cross UDP-address-shaped interfaces encoded as the
/// sentinel [`RELAY_MAGIC_IP`] with the region id as the port; that
/// convention is part of the public contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum SendAddr {
    /// UDP, the ip addr.
    Udp(SocketAddr),
    /// Relay, the region id.
    Relay(u16),
}

impl SendAddr {
    fn is_relay(&self) -> bool {
        matches!(self, Self::Relay(_))
    }

    /// Returns the sentinel-encoded version or the actual `SocketAddr`.
    pub(crate) fn as_socket_addr(&self) -> SocketAddr {
        match self {
            Self::Relay(region) => SocketAddr::new(RELAY_MAGIC_IP, *region),
            Self::Udp(addr) => *addr,
        }
    }
}

impl From<SocketAddr> for SendAddr {
    fn from(addr: SocketAddr) -> Self {
        if addr.ip() == RELAY_MAGIC_IP {
            SendAddr::Relay(addr.port())
        } else {
            SendAddr::Udp(addr)
        }
    }
}

impl Display for SendAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendAddr::Relay(id) => write!(f, "Relay({})", id),
            SendAddr::Udp(addr) => write!(f, "UDP({})", addr),
        }
    }
}

/// Contains options for `RoverSock::new`.
#[derive(derive_more::Debug)]
pub struct Options {
    /// The port to listen on. Zero means to pick one automatically.
    pub port: u16,

    /// Discovery secret key for this node.
    pub disco_secret_key: SecretKey,

    /// The relay servers to use; leave empty to go without relays.
    pub relay_map: RelayMap,

    /// Callbacks to emit on various socket events.
    pub callbacks: Callbacks,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            port: 0,
            disco_secret_key: SecretKey::generate(),
            relay_map: RelayMap::default(),
            callbacks: Callbacks::default(),
        }
    }
}

/// Hooks the engine invokes towards its host.
#[derive(derive_more::Debug, Default)]
pub struct Callbacks {
    /// Called when our set of reachable endpoints changes.
    #[debug("on_endpoints: Option<Box<..>>")]
    pub on_endpoints: Option<Box<dyn Fn(&[config::Endpoint]) + Send + Sync + 'static>>,

    /// Called when the discovered network conditions change materially.
    #[debug("on_net_info: Option<Box<..>>")]
    pub on_net_info: Option<Box<dyn Fn(config::NetInfo) + Send + Sync + 'static>>,

    /// Called when a connection to a relay server is established.
    #[debug("on_relay_active: Option<Box<..>>")]
    pub on_relay_active: Option<Box<dyn Fn() + Send + Sync + 'static>>,

    /// Called (at most once per 10 seconds per peer) when payloads arrive
    /// from a peer, so the host can un-throttle its state for it.
    #[debug("on_note_recv_activity: Option<Box<..>>")]
    pub on_note_recv_activity: Option<Box<dyn Fn(&PublicKey) + Send + Sync + 'static>>,

    /// Reports how long the host has been idle; used to suspend periodic
    /// re-probing when nothing is going on.
    #[debug("idle_for: Option<Box<..>>")]
    pub idle_for: Option<Box<dyn Fn() -> Duration + Send + Sync + 'static>>,
}

/// A stream of tunnel payloads from one source class.
#[derive(Debug)]
pub struct PayloadReceiver {
    recv: flume::Receiver<(Bytes, PeerHandle)>,
}

impl PayloadReceiver {
    /// Receives the next payload and the peer it came from.
    ///
    /// Returns `None` when the engine shut down.
    pub async fn recv(&self) -> Option<(Bytes, PeerHandle)> {
        self.recv.recv_async().await.ok()
    }

    /// Non-blocking variant of [`Self::recv`].
    pub fn try_recv(&self) -> Option<(Bytes, PeerHandle)> {
        self.recv.try_recv().ok()
    }
}

/// The three payload streams of an open socket.
#[derive(Debug)]
pub struct PayloadReceivers {
    /// Payloads that arrived on the IPv4 socket.
    pub ipv4: PayloadReceiver,
    /// Payloads that arrived on the IPv6 socket.
    pub ipv6: PayloadReceiver,
    /// Payloads that arrived via a relay.
    pub relay: PayloadReceiver,
}

#[derive(Debug)]
struct PayloadSenders {
    v4: flume::Sender<(Bytes, PeerHandle)>,
    v6: flume::Sender<(Bytes, PeerHandle)>,
    relay: flume::Sender<(Bytes, PeerHandle)>,
}

/// A peer-to-peer overlay datagram socket.
///
/// Cheaply cloneable. One instance per host process is the expectation; all
/// tunnel traffic of all peers funnels through it.
#[derive(Clone, derive_more::Debug)]
pub struct RoverSock {
    inner: Arc<Inner>,
    // Empty when closed.
    #[debug(skip)]
    actor_tasks: Arc<Mutex<Vec<AbortingJoinHandle<()>>>>,
}

/// The shared state of a [`RoverSock`].
#[derive(derive_more::Debug)]
pub(crate) struct Inner {
    /// Short form of our discovery key, for log lines.
    me: String,
    actor_sender: mpsc::Sender<ActorMessage>,
    relay_actor_sender: mpsc::Sender<RelayActorMessage>,
    #[debug(skip)]
    pub(crate) callbacks: Callbacks,

    pub(crate) disco_secret_key: SecretKey,
    disco_public: PublicKey,
    /// The tunnel key; `None` means logged out.
    tunnel_key: parking_lot::RwLock<Option<SecretKey>>,

    pub(crate) peer_map: PeerMap,
    pub(crate) relay_channels: RelayWriteChannels,
    pub(crate) relay_routes: RelayRoutes,
    relay_map: parking_lot::RwLock<RelayMap>,

    pconn4: RebindingUdpConn,
    pconn6: Option<RebindingUdpConn>,
    /// Cached local addresses of the sockets.
    local_addrs: parking_lot::RwLock<(SocketAddr, Option<SocketAddr>)>,
    /// Preferred port from [`Options::port`]; 0 means auto.
    port: AtomicU16,

    network_up: AtomicBool,
    /// Close is in progress (or done).
    closing: AtomicBool,
    /// Close was called.
    closed: AtomicBool,
    /// Whether IPv4 is known to be unable to send at all.
    no_v4: AtomicBool,
    /// Whether IPv6 is known to be unable to send at all.
    no_v6: AtomicBool,
    /// Nearest relay region id; 0 means none/unknown.
    my_relay: AtomicU16,
    /// Whether payload delivery towards the upper layer is on.
    bound: AtomicBool,

    #[debug(skip)]
    payload_senders: PayloadSenders,
    #[debug(skip)]
    payload_receivers: parking_lot::Mutex<Option<PayloadReceivers>>,

    pub(crate) epoch: Instant,
}

impl Inner {
    pub(crate) fn my_relay(&self) -> u16 {
        self.my_relay.load(Ordering::Relaxed)
    }

    fn set_my_relay(&self, region: u16) {
        self.my_relay.store(region, Ordering::Relaxed);
    }

    pub(crate) fn relay_map(&self) -> RelayMap {
        self.relay_map.read().clone()
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Relaxed)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn has_tunnel_key(&self) -> bool {
        self.tunnel_key.read().is_some()
    }

    fn network_up(&self) -> bool {
        self.network_up.load(Ordering::Relaxed)
    }

    fn bound(&self) -> bool {
        self.bound.load(Ordering::Relaxed)
    }

    /// Sends a raw datagram, treating a known-unavailable family as "not
    /// sent, no error".
    async fn send_udp(&self, addr: SocketAddr, data: &[u8]) -> io::Result<bool> {
        if addr.is_ipv6() {
            let Some(ref pconn6) = self.pconn6 else {
                return Ok(false);
            };
            if self.no_v6.load(Ordering::Relaxed) {
                return Ok(false);
            }
            let n = pconn6.send_to(data, addr).await?;
            Ok(n > 0)
        } else {
            if self.no_v4.load(Ordering::Relaxed) {
                return Ok(false);
            }
            let n = self.pconn4.send_to(data, addr).await?;
            Ok(n > 0)
        }
    }

    /// Queues a packet towards a relay region for `peer`.
    ///
    /// The warm path writes straight into the open connection's bounded
    /// queue; without an open connection the packet travels via the relay
    /// actor, which dials first.
    fn send_relay(&self, region: u16, peer: PublicKey, contents: Bytes) -> Result<(), SendError> {
        match try_send_relay(
            &self.relay_channels,
            &self.relay_routes,
            region,
            peer,
            contents.clone(),
        ) {
            RelayTrySend::Sent => Ok(()),
            RelayTrySend::QueueFull => Err(SendError::RelayQueueFull),
            RelayTrySend::NoChannel => {
                match self.relay_actor_sender.try_send(RelayActorMessage::Send {
                    region_id: region,
                    peer,
                    contents,
                }) {
                    Ok(()) => Ok(()),
                    Err(mpsc::error::TrySendError::Full(_)) => Err(SendError::RelayQueueFull),
                    Err(mpsc::error::TrySendError::Closed(_)) => Err(SendError::Closed),
                }
            }
        }
    }

    /// Sends to either UDP or a relay, depending on the address.
    async fn send_addr(
        &self,
        addr: SendAddr,
        pub_key: Option<&PublicKey>,
        pkt: Bytes,
    ) -> Result<bool> {
        match addr {
            SendAddr::Udp(addr) => Ok(self.send_udp(addr, &pkt).await?),
            SendAddr::Relay(region) => match pub_key {
                None => bail!("missing pub key for relay route"),
                Some(pub_key) => match self.send_relay(region, *pub_key, pkt) {
                    Ok(()) => Ok(true),
                    Err(SendError::RelayQueueFull) => {
                        warn!(region, "relay queue full, dropping message");
                        Ok(false)
                    }
                    Err(err) => bail!("relay send failed: {err}"),
                },
            },
        }
    }
}

impl RoverSock {
    /// Creates a socket listening on [`Options::port`].
    ///
    /// As the set of our possible endpoints changes,
    /// [`Callbacks::on_endpoints`] is invoked.
    pub async fn new(opts: Options) -> Result<Self> {
        let me = opts.disco_secret_key.public().fmt_short();
        Self::with_name(me.clone(), opts)
            .instrument(error_span!("roversock", %me))
            .await
    }

    async fn with_name(me: String, opts: Options) -> Result<Self> {
        let Options {
            port,
            disco_secret_key,
            relay_map,
            callbacks,
        } = opts;

        let (pconn4, pconn6) = bind(port).await?;
        let bound_port = pconn4.port();
        let ipv4_addr = pconn4.local_addr()?;
        let ipv6_addr = pconn6.as_ref().and_then(|c| c.local_addr().ok());

        let port_mapper = portmapper::Client::new();
        match bound_port.try_into() {
            Ok(non_zero_port) => port_mapper.update_local_port(non_zero_port),
            Err(_zero_port) => debug!("skipping port mapping with zero local port"),
        }

        let net_probe = netprobe::Client::new();

        let (actor_sender, actor_receiver) = mpsc::channel(256);
        let (relay_actor_sender, relay_actor_receiver) = mpsc::channel(256);

        let (v4_tx, v4_rx) = flume::bounded(PAYLOAD_QUEUE_DEPTH);
        let (v6_tx, v6_rx) = flume::bounded(PAYLOAD_QUEUE_DEPTH);
        let (relay_tx, relay_rx) = flume::bounded(PAYLOAD_QUEUE_DEPTH);

        let inner = Arc::new(Inner {
            me,
            actor_sender: actor_sender.clone(),
            relay_actor_sender: relay_actor_sender.clone(),
            callbacks,
            disco_public: disco_secret_key.public(),
            disco_secret_key,
            tunnel_key: parking_lot::RwLock::new(None),
            peer_map: PeerMap::default(),
            relay_channels: Default::default(),
            relay_routes: Default::default(),
            relay_map: parking_lot::RwLock::new(relay_map),
            pconn4: pconn4.clone(),
            pconn6: pconn6.clone(),
            local_addrs: parking_lot::RwLock::new((ipv4_addr, ipv6_addr)),
            port: AtomicU16::new(port),
            network_up: AtomicBool::new(true),
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            no_v4: AtomicBool::new(false),
            no_v6: AtomicBool::new(false),
            my_relay: AtomicU16::new(0),
            bound: AtomicBool::new(false),
            payload_senders: PayloadSenders {
                v4: v4_tx,
                v6: v6_tx,
                relay: relay_tx,
            },
            payload_receivers: parking_lot::Mutex::new(Some(PayloadReceivers {
                ipv4: PayloadReceiver { recv: v4_rx },
                ipv6: PayloadReceiver { recv: v6_rx },
                relay: PayloadReceiver { recv: relay_rx },
            })),
            epoch: Instant::now(),
        });

        let udp_cancel = CancellationToken::new();
        let mut tasks: Vec<AbortingJoinHandle<()>> = Vec::new();

        let v4_actor = UdpActor::new(
            inner.clone(),
            pconn4.clone(),
            net_probe.clone(),
            actor_sender.clone(),
            inner.payload_senders.v4.clone(),
        );
        let cancel = udp_cancel.clone();
        tasks.push(
            tokio::task::spawn(
                async move { v4_actor.run(cancel).await }.instrument(info_span!("udp.reader.v4")),
            )
            .into(),
        );

        if let Some(pconn6) = pconn6.clone() {
            let v6_actor = UdpActor::new(
                inner.clone(),
                pconn6,
                net_probe.clone(),
                actor_sender.clone(),
                inner.payload_senders.v6.clone(),
            );
            let cancel = udp_cancel.clone();
            tasks.push(
                tokio::task::spawn(
                    async move { v6_actor.run(cancel).await }
                        .instrument(info_span!("udp.reader.v6")),
                )
                .into(),
            );
        }

        let relay_actor = RelayActor::new(inner.clone(), actor_sender.clone());
        tasks.push(
            tokio::task::spawn(
                async move { relay_actor.run(relay_actor_receiver).await }
                    .instrument(info_span!("relay.actor")),
            )
            .into(),
        );

        let inner2 = inner.clone();
        let main_actor_task = tokio::task::spawn(
            async move {
                let actor = Actor {
                    msg_receiver: actor_receiver,
                    msg_sender: actor_sender,
                    relay_actor_sender,
                    inner: inner2,
                    endpoints_update_state: EndpointUpdateState::new(),
                    last_endpoints: Vec::new(),
                    last_endpoints_time: None,
                    on_endpoint_refreshed: HashMap::new(),
                    periodic_probe_timer: new_probe_timer(false),
                    net_info_last: None,
                    disco_info: HashMap::new(),
                    port_mapper,
                    net_probe,
                    no_v4_send: false,
                    udp_cancel,
                };

                if let Err(err) = actor.run().await {
                    warn!("actor errored: {err:?}");
                }
            }
            .instrument(info_span!("actor")),
        );
        tasks.push(main_actor_task.into());

        Ok(RoverSock {
            inner,
            actor_tasks: Arc::new(Mutex::new(tasks)),
        })
    }

    /// This socket's public discovery key.
    pub fn disco_public_key(&self) -> PublicKey {
        self.inner.disco_public
    }

    /// The cached local addresses of the two sockets.
    pub fn local_addr(&self) -> (SocketAddr, Option<SocketAddr>) {
        *self.inner.local_addrs.read()
    }

    /// The local port of the IPv4 socket.
    pub fn local_port(&self) -> u16 {
        self.local_addr().0.port()
    }

    /// The current home relay region, if any.
    pub fn my_relay(&self) -> Option<u16> {
        match self.inner.my_relay() {
            0 => None,
            region => Some(region),
        }
    }

    /// Takes the payload receivers and switches payload delivery on.
    ///
    /// Returns the three inbound streams (IPv4, IPv6, relay) and the
    /// current IPv4 port. Fails if the receivers were already taken.
    pub fn bind_open(&self) -> Result<(PayloadReceivers, u16)> {
        let receivers = self
            .inner
            .payload_receivers
            .lock()
            .take()
            .context("already bound")?;
        self.inner.bound.store(true, Ordering::Relaxed);
        Ok((receivers, self.local_port()))
    }

    /// Stops payload delivery. Discovery keeps running.
    pub fn bind_close(&self) {
        self.inner.bound.store(false, Ordering::Relaxed);
    }

    /// Converts a node key into the handle used by [`RoverSock::send`].
    pub fn resolve_peer_handle(&self, node_key: &PublicKey) -> Result<PeerHandle, SendError> {
        if self.inner.is_closed() {
            return Err(SendError::Closed);
        }
        self.inner
            .peer_map
            .handle_for_node_key(node_key)
            .ok_or(SendError::UnknownPeer)
    }

    /// Whether path discovery can work for the peer, i.e. it has a non-zero
    /// discovery key in the current network map.
    pub fn peer_can_disco(&self, node_key: &PublicKey) -> bool {
        self.inner.peer_map.peer_can_disco(node_key)
    }

    /// Enqueues a tunnel payload for a peer.
    ///
    /// While the best path is unconfirmed the packet goes to both the best
    /// path and the relay; the cost of the duplicate hides failover
    /// latency. Succeeds if at least one of the two went out.
    pub async fn send(&self, handle: PeerHandle, data: Bytes) -> Result<(), SendError> {
        if self.inner.is_closed() || !self.inner.has_tunnel_key() {
            return Err(SendError::Closed);
        }
        if !self.inner.network_up() {
            return Err(SendError::NetworkDown);
        }

        let info = self
            .inner
            .peer_map
            .get_send_info(&handle)
            .ok_or(SendError::UnknownPeer)?;

        if !info.actions.is_empty() {
            // Discovery work spawned by this send happens on the actor.
            self.inner
                .actor_sender
                .try_send(ActorMessage::PingActions(info.actions))
                .ok();
        }

        let (udp_addr, relay_region) = (info.udp_addr, info.relay_region);
        if udp_addr.is_none() && relay_region.is_none() {
            return Err(SendError::NoPath);
        }

        let mut sent = false;
        let mut relay_err = None;
        if let Some(addr) = udp_addr {
            match self.inner.send_udp(addr, &data).await {
                Ok(true) => sent = true,
                Ok(false) => {}
                Err(err) => {
                    warn!(%addr, "failed to send UDP: {err:#}");
                }
            }
        }
        if let Some(region) = relay_region {
            match self.inner.send_relay(region, info.node_key, data) {
                Ok(()) => sent = true,
                Err(err) => relay_err = Some(err),
            }
        }

        if sent {
            Ok(())
        } else if let Some(err) = relay_err {
            Err(err)
        } else {
            Err(SendError::NoPath)
        }
    }

    /// Installs or clears the tunnel private key. `None` means logged out:
    /// payloads stop flowing and relay connections close.
    pub async fn set_tunnel_private_key(&self, key: Option<SecretKey>) {
        let changed = {
            let mut guard = self.inner.tunnel_key.write();
            let changed = match (&*guard, &key) {
                (None, None) => false,
                (Some(a), Some(b)) => a.to_bytes() != b.to_bytes(),
                _ => true,
            };
            *guard = key;
            changed
        };
        if changed {
            self.send_actor_and_wait(|s| ActorMessage::TunnelKeyChanged(s))
                .await;
        }
    }

    /// Installs a new network map; peer records are created, updated and
    /// removed to match it.
    pub async fn set_network_map(&self, nm: config::NetworkMap) {
        self.send_actor_and_wait(|s| ActorMessage::SetNetworkMap(nm, s))
            .await;
    }

    /// Replaces the relay map. Open relay connections are reset.
    pub async fn set_relay_map(&self, rm: RelayMap) {
        self.send_actor_and_wait(|s| ActorMessage::SetRelayMap(rm, s))
            .await;
    }

    /// Prunes per-peer tracking state to the given set of peers.
    pub async fn update_peer_set(&self, peers: HashSet<PublicKey>) {
        self.send_actor_and_wait(|s| ActorMessage::UpdatePeerSet(peers, s))
            .await;
    }

    /// Sets the preferred local port and rebinds onto it.
    pub async fn set_preferred_port(&self, port: u16) {
        self.send_actor_and_wait(|s| ActorMessage::SetPreferredPort(port, s))
            .await;
    }

    /// Closes and re-binds the UDP sockets, keeping the current port.
    /// Should be followed by a probe; trust in all paths is reset.
    pub async fn rebind(&self) {
        self.send_actor_and_wait(|s| ActorMessage::RebindAll(s)).await;
    }

    /// Notes whether any network interface is up.
    pub fn set_network_up(&self, up: bool) {
        self.inner.network_up.store(up, Ordering::Relaxed);
        self.inner
            .actor_sender
            .try_send(ActorMessage::NetworkUp(up))
            .ok();
    }

    /// Triggers an endpoint re-probe. The reason is for logs only.
    pub async fn re_probe(&self, why: &'static str) {
        self.inner
            .actor_sender
            .send(ActorMessage::ReProbe(why))
            .await
            .ok();
    }

    /// Pings a peer on its current paths and reports the outcome.
    pub async fn ping(&self, node_key: PublicKey) -> Result<PingOutcome, SendError> {
        if self.inner.is_closed() {
            return Err(SendError::Closed);
        }
        let (s, r) = oneshot::channel();
        self.inner
            .actor_sender
            .send(ActorMessage::StatusPing(node_key, s))
            .await
            .map_err(|_| SendError::Closed)?;
        r.await.map_err(|_| SendError::UnknownPeer)
    }

    /// Path information for every tracked peer.
    pub async fn tracked_endpoints(&self) -> Vec<EndpointInfo> {
        self.inner.peer_map.endpoint_infos()
    }

    /// Path information for one peer.
    pub async fn tracked_endpoint(&self, node_key: &PublicKey) -> Option<EndpointInfo> {
        self.inner.peer_map.endpoint_info(node_key)
    }

    /// The endpoints discovered during the last endpoint update.
    pub async fn local_endpoints(&self) -> Vec<config::Endpoint> {
        let (s, r) = oneshot::channel();
        if self
            .inner
            .actor_sender
            .send(ActorMessage::LocalEndpoints(s))
            .await
            .is_ok()
        {
            return r.await.unwrap_or_default();
        }
        Vec::new()
    }

    async fn send_actor_and_wait(&self, f: impl FnOnce(oneshot::Sender<()>) -> ActorMessage) {
        let (s, r) = oneshot::channel();
        if self.inner.actor_sender.send(f(s)).await.is_ok() {
            r.await.ok();
        }
    }

    /// Closes the socket.
    ///
    /// Only the first close does anything; later calls succeed silently.
    #[instrument(skip_all, fields(me = %self.inner.me))]
    pub async fn close(&self) -> Result<()> {
        if self.inner.is_closed() {
            return Ok(());
        }
        self.inner.closing.store(true, Ordering::Relaxed);
        self.inner.actor_sender.send(ActorMessage::Shutdown).await?;
        self.inner.closed.store(true, Ordering::SeqCst);

        let mut tasks = self.actor_tasks.lock().await;
        let task_count = tasks.len();
        let mut i = 0;
        while let Some(task) = tasks.pop() {
            debug!("waiting for task {i}/{task_count}");
            task.await.ok();
            i += 1;
        }

        Ok(())
    }
}

/// The info and state for one remote discovery key.
///
/// Holds the precomputed shared key plus the little bit of state needed to
/// tell heartbeat pings from fresh ones in the logs.
struct DiscoInfo {
    /// The precomputed key for sealing traffic to this discovery key.
    /// Not modified once initialized.
    shared_key: SharedSecret,

    /// The src of the last ping from this key.
    last_ping_from: Option<SendAddr>,

    /// The time of the last ping from this key.
    last_ping_time: Option<Instant>,
}

/// Returns the previous or new [`DiscoInfo`] for `k`.
fn get_disco_info<'a>(
    disco_info: &'a mut HashMap<PublicKey, DiscoInfo>,
    disco_private: &SecretKey,
    k: &PublicKey,
) -> &'a mut DiscoInfo {
    disco_info.entry(*k).or_insert_with(|| DiscoInfo {
        shared_key: disco_private.shared(k),
        last_ping_from: None,
        last_ping_time: None,
    })
}

/// Reports whether x and y represent the same set of endpoints, order
/// independent.
fn endpoint_sets_equal(xs: &[config::Endpoint], ys: &[config::Endpoint]) -> bool {
    if xs.is_empty() && ys.is_empty() {
        return true;
    }
    if xs.len() == ys.len() {
        let mut order_matches = true;
        for (i, x) in xs.iter().enumerate() {
            if x != &ys[i] {
                order_matches = false;
                break;
            }
        }
        if order_matches {
            return true;
        }
    }
    let mut m: HashMap<&config::Endpoint, usize> = HashMap::new();
    for x in xs {
        *m.entry(x).or_default() |= 1;
    }
    for y in ys {
        *m.entry(y).or_default() |= 2;
    }

    m.values().all(|v| *v == 3)
}

#[derive(Debug)]
struct EndpointUpdateState {
    /// If running, holds the reason for the update.
    running: sync::watch::Sender<Option<&'static str>>,
    /// A follow-up requested while an update ran; multiple collapse.
    want_update: Option<&'static str>,
}

impl EndpointUpdateState {
    fn new() -> Self {
        let (running, _) = sync::watch::channel(None);
        EndpointUpdateState {
            running,
            want_update: None,
        }
    }

    /// Returns `true` if an update is currently in progress.
    fn is_running(&self) -> bool {
        self.running.borrow().is_some()
    }
}

#[derive(derive_more::Debug)]
#[allow(clippy::large_enum_variant)]
enum ActorMessage {
    Shutdown,
    ReProbe(&'static str),
    PingActions(#[debug(skip)] Vec<PingAction>),
    ReceiveDisco {
        sender: PublicKey,
        #[debug(skip)]
        sealed_box: Vec<u8>,
        src: SendAddr,
        relay_node_src: Option<PublicKey>,
    },
    ReceiveRelay {
        region_id: u16,
        src: PublicKey,
        #[debug(skip)]
        buf: Bytes,
    },
    EndpointPingExpired(usize, stun::TransactionId),
    EndpointHeartbeat(usize),
    SetNetworkMap(config::NetworkMap, oneshot::Sender<()>),
    SetRelayMap(RelayMap, oneshot::Sender<()>),
    TunnelKeyChanged(oneshot::Sender<()>),
    UpdatePeerSet(HashSet<PublicKey>, oneshot::Sender<()>),
    SetPreferredPort(u16, oneshot::Sender<()>),
    RebindAll(oneshot::Sender<()>),
    NetworkUp(bool),
    StatusPing(PublicKey, oneshot::Sender<PingOutcome>),
    LocalEndpoints(oneshot::Sender<Vec<config::Endpoint>>),
}

struct Actor {
    inner: Arc<Inner>,
    msg_receiver: mpsc::Receiver<ActorMessage>,
    msg_sender: mpsc::Sender<ActorMessage>,
    relay_actor_sender: mpsc::Sender<RelayActorMessage>,
    /// Tracks the endpoint update debounce: at most one running, at most
    /// one queued follow-up.
    endpoints_update_state: EndpointUpdateState,
    /// The endpoints found during the previous endpoint discovery, used to
    /// suppress duplicate change notifications.
    last_endpoints: Vec<config::Endpoint>,
    /// The last time the endpoints were updated, even without change.
    last_endpoints_time: Option<Instant>,
    /// Call-me-maybes deferred until our endpoints are fresh again, one per
    /// peer (endpoint id -> relay region); later requests overwrite.
    on_endpoint_refreshed: HashMap<usize, u16>,
    periodic_probe_timer: time::Interval,
    /// The `NetInfo` sent to the host last, to deduplicate.
    net_info_last: Option<config::NetInfo>,
    /// Per remote discovery key state, incl. precomputed shared keys.
    disco_info: HashMap<PublicKey, DiscoInfo>,
    port_mapper: portmapper::Client,
    net_probe: netprobe::Client,
    /// Whether the last probe reported IPv4 as unable to send; triggers a
    /// rebind on the next endpoint update.
    no_v4_send: bool,
    udp_cancel: CancellationToken,
}

impl Actor {
    async fn run(mut self) -> Result<()> {
        let mut endpoints_update_receiver = self.endpoints_update_state.running.subscribe();
        let mut portmap_watcher = self.port_mapper.watch_external_address();

        loop {
            tokio::select! {
                Some(msg) = self.msg_receiver.recv() => {
                    trace!(?msg, "tick: msg");
                    if self.handle_actor_message(msg).await {
                        return Ok(());
                    }
                }
                tick = self.periodic_probe_timer.tick() => {
                    trace!("tick: re_probe {:?}", tick);
                    if self.should_do_periodic_re_probe() {
                        self.re_probe("periodic").await;
                    }
                }
                Ok(()) = portmap_watcher.changed() => {
                    let new_external_address = *portmap_watcher.borrow();
                    debug!("external address updated: {new_external_address:?}");
                    self.re_probe("portmap-changed").await;
                }
                _ = endpoints_update_receiver.changed() => {
                    let reason = *endpoints_update_receiver.borrow();
                    trace!("tick: endpoints update receiver {:?}", reason);
                    if let Some(reason) = reason {
                        self.update_endpoints(reason).await;
                    }
                }
                else => {
                    trace!("tick: other");
                }
            }
        }
    }

    /// Processes an incoming actor message.
    ///
    /// Returns `true` if it was a shutdown.
    async fn handle_actor_message(&mut self, msg: ActorMessage) -> bool {
        match msg {
            ActorMessage::Shutdown => {
                debug!("shutting down");
                self.inner.peer_map.notify_shutdown();
                self.port_mapper.deactivate();
                self.relay_actor_sender
                    .send(RelayActorMessage::Shutdown)
                    .await
                    .ok();
                self.udp_cancel.cancel();
                debug!("shutdown complete");
                return true;
            }
            ActorMessage::ReProbe(reason) => {
                self.re_probe(reason).await;
            }
            ActorMessage::PingActions(actions) => {
                self.handle_ping_actions(actions).await;
            }
            ActorMessage::ReceiveDisco {
                sender,
                sealed_box,
                src,
                relay_node_src,
            } => {
                self.handle_disco_message(sender, &sealed_box, src, relay_node_src)
                    .await;
            }
            ActorMessage::ReceiveRelay {
                region_id,
                src,
                buf,
            } => {
                self.process_relay_read(region_id, src, buf).await;
            }
            ActorMessage::EndpointPingExpired(id, txid) => {
                self.inner
                    .peer_map
                    .with_endpoint_mut(id, |ep| ep.ping_timeout(txid));
            }
            ActorMessage::EndpointHeartbeat(id) => {
                if !self.inner.network_up() || self.inner.is_closing() {
                    return false;
                }
                if let Some(actions) = self
                    .inner
                    .peer_map
                    .with_endpoint_mut(id, |ep| ep.heartbeat())
                {
                    self.handle_ping_actions(actions).await;
                }
            }
            ActorMessage::SetNetworkMap(nm, s) => {
                self.set_network_map(nm).await;
                s.send(()).ok();
            }
            ActorMessage::SetRelayMap(rm, s) => {
                self.set_relay_map(rm).await;
                s.send(()).ok();
            }
            ActorMessage::TunnelKeyChanged(s) => {
                if self.inner.has_tunnel_key() {
                    self.re_probe("tunnel-key-changed").await;
                } else {
                    // Logged out: stop all discovery state and drop the
                    // relay mesh.
                    info!("tunnel key cleared, parking the engine");
                    self.inner.peer_map.notify_shutdown();
                    self.relay_actor_sender
                        .send(RelayActorMessage::CloseAll("logged-out"))
                        .await
                        .ok();
                }
                s.send(()).ok();
            }
            ActorMessage::UpdatePeerSet(peers, s) => {
                self.update_peer_set(&peers);
                s.send(()).ok();
            }
            ActorMessage::SetPreferredPort(port, s) => {
                self.set_preferred_port(port).await;
                s.send(()).ok();
            }
            ActorMessage::RebindAll(s) => {
                self.rebind_all().await;
                s.send(()).ok();
            }
            ActorMessage::NetworkUp(up) => {
                if up {
                    self.re_probe("network-up").await;
                    let home = self.inner.my_relay();
                    if home != 0 {
                        self.send_relay_actor(RelayActorMessage::Connect {
                            region_id: home,
                            peer: None,
                        });
                    }
                } else {
                    self.send_relay_actor(RelayActorMessage::CloseAll("network-down"));
                }
            }
            ActorMessage::StatusPing(node_key, s) => {
                // If the peer is unknown `s` drops here and the caller
                // observes the cancellation.
                let actions = self.inner.peer_map.write(|inner| {
                    inner
                        .endpoint_for_node_key_mut(&node_key)
                        .map(|ep| ep.start_status_ping(s))
                });
                if let Some(actions) = actions {
                    self.handle_ping_actions(actions).await;
                }
            }
            ActorMessage::LocalEndpoints(s) => {
                s.send(self.last_endpoints.clone()).ok();
            }
        }

        false
    }

    async fn handle_ping_actions(&mut self, msgs: Vec<PingAction>) {
        for msg in msgs {
            // Abort as soon as we know we are shutting down.
            if self.inner.is_closing() || self.inner.is_closed() {
                break;
            }
            match msg {
                PingAction::EnqueueCallMeMaybe {
                    relay_region,
                    endpoint_id,
                } => {
                    self.enqueue_call_me_maybe(relay_region, endpoint_id).await;
                }
                PingAction::SendPing {
                    id,
                    dst,
                    dst_node_key,
                    dst_disco_key,
                    tx_id,
                    purpose,
                } => {
                    let msg = disco::Message::Ping(disco::Ping { tx_id });
                    match self
                        .send_disco_message(dst, dst_node_key, dst_disco_key, msg)
                        .await
                    {
                        Ok(true) => {
                            self.inner
                                .peer_map
                                .with_endpoint_mut(id, |ep| ep.ping_sent(dst, tx_id, purpose));
                        }
                        _ => {
                            debug!(%dst, "failed to send ping");
                            self.inner
                                .peer_map
                                .with_endpoint_mut(id, |ep| ep.forget_ping(tx_id));
                        }
                    }
                }
            }
        }
    }

    #[instrument(skip_all)]
    async fn send_disco_message(
        &mut self,
        dst: SendAddr,
        dst_node_key: PublicKey,
        dst_disco_key: PublicKey,
        msg: disco::Message,
    ) -> Result<bool> {
        debug!(%dst, %msg, "sending disco message");
        if self.inner.is_closed() {
            bail!("connection closed");
        }
        let di = get_disco_info(&mut self.disco_info, &self.inner.disco_secret_key, &dst_disco_key);
        let seal = di.shared_key.seal(&msg.as_bytes());

        let pkt = disco::encode_message(&self.inner.disco_public, seal);
        match self
            .inner
            .send_addr(dst, Some(&dst_node_key), pkt.into())
            .await
        {
            Ok(true) => Ok(true),
            Ok(false) => {
                // Can't send (e.g. no IPv6 locally); not an error, the
                // state machine self-heals via retries.
                debug!(%dst, "disco message not sent");
                Ok(false)
            }
            Err(err) => {
                warn!(%dst, "failed to send disco message: {err:#}");
                Err(err)
            }
        }
    }

    /// Handles an inbound discovery frame.
    ///
    /// For messages received over the relay, src is the sentinel region
    /// address and `relay_node_src` is the node key the relay attributed
    /// the frame to; it is `None` for UDP.
    #[instrument(skip_all)]
    async fn handle_disco_message(
        &mut self,
        sender: PublicKey,
        sealed_box: &[u8],
        src: SendAddr,
        relay_node_src: Option<PublicKey>,
    ) {
        trace!(sender = %sender.fmt_short(), %src, "handle disco message");
        if self.inner.is_closed() {
            return;
        }

        let known = self
            .inner
            .peer_map
            .read(|inner| inner.endpoint_for_disco_key(&sender).map(|ep| *ep.node_key()));
        let Some(node_key) = known else {
            debug!(sender = %sender.fmt_short(), "disco message from unknown key, dropping");
            return;
        };

        let di = get_disco_info(&mut self.disco_info, &self.inner.disco_secret_key, &sender);
        let Ok(payload) = di.shared_key.open(sealed_box) else {
            // Likely a key changed between restarts; drop silently.
            debug!(
                sender = %sender.fmt_short(),
                "failed to open disco box (wrong recipient?)"
            );
            return;
        };
        let dm = match disco::Message::from_bytes(&payload) {
            Ok(dm) => dm,
            Err(err) => {
                // Inside a correctly sealed box, so from a newer version of
                // the protocol; ignore for forward compatibility.
                trace!("undecodable disco payload: {err:#}");
                return;
            }
        };

        match dm {
            disco::Message::Ping(ping) => {
                self.handle_disco_ping(ping, sender, node_key, src, relay_node_src)
                    .await;
            }
            disco::Message::Pong(pong) => {
                self.inner.peer_map.write(|inner| {
                    if let Some(ep) = inner.endpoint_for_disco_key_mut(&sender) {
                        let id = ep.id;
                        if let Some(addr) = ep.handle_pong(&pong, src) {
                            inner.set_endpoint_for_ip_port(addr, id);
                        }
                    }
                });
            }
            disco::Message::CallMeMaybe(cm) => {
                if !src.is_relay() || relay_node_src.is_none() {
                    // Call-me-maybes only make sense via the relay.
                    debug!("call-me-maybe not received via relay, dropping");
                    return;
                }
                let node_src = relay_node_src.expect("checked");
                let actions = self.inner.peer_map.write(|inner| {
                    let ep = inner.endpoint_for_node_key_mut(&node_src)?;
                    if ep.disco_key() != Some(sender) {
                        warn!(
                            peer = %node_src.fmt_short(),
                            "call-me-maybe under mismatched disco key, dropping"
                        );
                        return None;
                    }
                    info!(
                        peer = %node_src.fmt_short(),
                        endpoints = cm.my_numbers.len(),
                        "disco: got call-me-maybe"
                    );
                    let id = ep.id;
                    let actions = ep.handle_call_me_maybe(&cm);
                    inner.sync_pruned(id);
                    Some(actions)
                });
                if let Some(actions) = actions {
                    self.handle_ping_actions(actions).await;
                }
            }
        }
    }

    async fn handle_disco_ping(
        &mut self,
        dm: disco::Ping,
        sender: PublicKey,
        node_key: PublicKey,
        src: SendAddr,
        relay_node_src: Option<PublicKey>,
    ) {
        let di = get_disco_info(&mut self.disco_info, &self.inner.disco_secret_key, &sender);
        let likely_heart_beat = Some(src) == di.last_ping_from
            && di
                .last_ping_time
                .map(|t| t.elapsed() < Duration::from_secs(5))
                .unwrap_or_default();
        di.last_ping_from.replace(src);
        di.last_ping_time.replace(Instant::now());

        if likely_heart_beat {
            trace!(peer = %node_key.fmt_short(), %src, "disco: got ping (heartbeat)");
        } else {
            info!(
                peer = %node_key.fmt_short(),
                %src,
                "disco: got ping tx={}",
                hex::encode(dm.tx_id)
            );
        }

        if let SendAddr::Udp(addr) = src {
            // The ping proves the peer is reachable at this source; track
            // it as a candidate path and route future payloads from it.
            self.inner.peer_map.write(|inner| {
                if let Some(ep) = inner.endpoint_for_disco_key_mut(&sender) {
                    let id = ep.id;
                    ep.add_candidate_path(addr);
                    inner.set_endpoint_for_ip_port(addr, id);
                }
            });
        }

        // Reply on the path the ping came in on, telling the peer what we
        // saw as its source.
        let pong = disco::Message::Pong(disco::Pong {
            tx_id: dm.tx_id,
            src: src.as_socket_addr(),
        });
        let dst_node_key = relay_node_src.unwrap_or(node_key);
        if let Err(err) = self.send_disco_message(src, dst_node_key, sender, pong).await {
            warn!(%src, "disco: failed to send pong: {err:#}");
        }
    }

    /// Handles one packet read off a relay connection.
    async fn process_relay_read(&mut self, region_id: u16, src: PublicKey, buf: Bytes) {
        trace!(region_id, src = %src.fmt_short(), len = buf.len(), "process relay read");
        if buf.is_empty() {
            warn!("received empty relay packet");
            return;
        }

        if let Some((sender, sealed_box)) = disco::source_and_box(&buf) {
            let sealed_box = sealed_box.to_vec();
            self.handle_disco_message(sender, &sealed_box, SendAddr::Relay(region_id), Some(src))
                .await;
            return;
        }

        if !self.inner.has_tunnel_key() {
            trace!("dropping relay payload, no tunnel key installed");
            return;
        }

        let Some(info) = self.inner.peer_map.receive_relay(&src) else {
            info!(peer = %src.fmt_short(), "relay packet from unknown peer, dropping");
            return;
        };
        if info.fire_activity_hook {
            if let Some(ref hook) = self.inner.callbacks.on_note_recv_activity {
                hook(&info.node_key);
            }
        }
        if self.inner.bound() {
            self.inner
                .payload_senders
                .relay
                .try_send((buf, info.handle))
                .ok();
        }
    }

    /// Sends a call-me-maybe with our current endpoints, re-probing first
    /// if they are stale.
    #[instrument(skip_all)]
    async fn enqueue_call_me_maybe(&mut self, relay_region: u16, endpoint_id: usize) {
        let fresh = self
            .last_endpoints_time
            .map(|t| t.elapsed() <= ENDPOINTS_FRESH_ENOUGH_DURATION)
            .unwrap_or(false);
        if !fresh {
            info!(
                "want call-me-maybe but endpoints stale; re-probing ({:?})",
                self.last_endpoints_time
            );
            // Only one pending continuation per peer; later wins.
            self.on_endpoint_refreshed.insert(endpoint_id, relay_region);
            self.re_probe("refresh-for-peering").await;
            return;
        }

        let keys = self.inner.peer_map.read(|inner| {
            inner
                .by_id_ref(endpoint_id)
                .map(|ep| (*ep.node_key(), ep.disco_key()))
        });
        let Some((node_key, Some(disco_key))) = keys else {
            warn!(endpoint_id, "call-me-maybe for unknown or undiscoverable peer");
            return;
        };

        let msg = disco::Message::CallMeMaybe(disco::CallMeMaybe {
            my_numbers: self.last_endpoints.iter().map(|ep| ep.addr).collect(),
        });
        debug!(peer = %node_key.fmt_short(), "sending call-me-maybe");
        if let Err(err) = self
            .send_disco_message(SendAddr::Relay(relay_region), node_key, disco_key, msg)
            .await
        {
            warn!(relay_region, "failed to send call-me-maybe: {err:#}");
        }
    }

    async fn set_network_map(&mut self, nm: config::NetworkMap) {
        let removed =
            self.inner
                .peer_map
                .apply_network_map(&nm, &self.msg_sender, self.inner.epoch);
        for (_, disco_key) in &removed {
            if let Some(dk) = disco_key {
                self.disco_info.remove(dk);
            }
        }
        if !removed.is_empty() {
            let gone: HashSet<PublicKey> = removed.iter().map(|(nk, _)| *nk).collect();
            self.inner
                .relay_routes
                .lock()
                .retain(|peer, _| !gone.contains(peer));
        }
        debug!(
            peers = self.inner.peer_map.node_count(),
            removed = removed.len(),
            "network map applied"
        );
        self.re_probe("network-map-changed").await;
    }

    async fn set_relay_map(&mut self, rm: RelayMap) {
        *self.inner.relay_map.write() = rm;
        let home = self.inner.my_relay();
        if home != 0 && !self.inner.relay_map().contains_region(home) {
            self.inner.set_my_relay(0);
        }
        self.relay_actor_sender
            .send(RelayActorMessage::CloseAll("relay-map-changed"))
            .await
            .ok();
        self.re_probe("relay-map-changed").await;
    }

    fn update_peer_set(&mut self, peers: &HashSet<PublicKey>) {
        let keep: HashSet<PublicKey> = self.inner.peer_map.read(|inner| {
            self.disco_info
                .keys()
                .filter(|dk| {
                    inner
                        .endpoint_for_disco_key(dk)
                        .map(|ep| peers.contains(ep.node_key()))
                        .unwrap_or(false)
                })
                .copied()
                .collect()
        });
        self.disco_info.retain(|dk, _| keep.contains(dk));
        self.inner
            .relay_routes
            .lock()
            .retain(|peer, _| peers.contains(peer));
    }

    /// Requests an endpoint update, debounced: at most one runs; a request
    /// during a run queues exactly one follow-up.
    #[instrument(level = "debug", skip_all, fields(reason = why))]
    async fn re_probe(&mut self, why: &'static str) {
        if self.endpoints_update_state.is_running() {
            if Some(why) != self.endpoints_update_state.want_update {
                debug!(
                    active_reason = ?self.endpoints_update_state.want_update,
                    "endpoint update active, need another later",
                );
                self.endpoints_update_state.want_update.replace(why);
            }
        } else {
            debug!("started");
            self.endpoints_update_state
                .running
                .send(Some(why))
                .expect("update state not to go away");
        }
    }

    #[instrument(level = "debug", skip_all)]
    async fn update_endpoints(&mut self, why: &'static str) {
        debug!("starting endpoint update ({})", why);
        if self.no_v4_send && !self.inner.is_closed() {
            warn!("last probe reported send error, rebinding");
            self.rebind_all().await;
        }

        match self.determine_endpoints().await {
            Ok(endpoints) => {
                if self.set_endpoints(&endpoints) {
                    log_endpoint_change(&endpoints);
                    if let Some(ref cb) = self.inner.callbacks.on_endpoints {
                        cb(&endpoints[..]);
                    }
                }
                // Endpoints are fresh: release deferred call-me-maybes.
                let refreshed: Vec<(usize, u16)> =
                    self.on_endpoint_refreshed.drain().collect();
                for (endpoint_id, relay_region) in refreshed {
                    info!("endpoints refreshed; sending deferred call-me-maybe");
                    self.enqueue_call_me_maybe(relay_region, endpoint_id).await;
                }
            }
            Err(err) => {
                info!("endpoint update ({}) failed: {:#}", why, err);
            }
        }

        let new_why = self.endpoints_update_state.want_update.take();
        if !self.inner.is_closed() {
            if let Some(new_why) = new_why {
                debug!("endpoint update: needed new ({})", new_why);
                self.endpoints_update_state
                    .running
                    .send(Some(new_why))
                    .expect("sender not to go away");
                return;
            }
            self.periodic_probe_timer = new_probe_timer(true);
        }

        self.endpoints_update_state
            .running
            .send(None)
            .expect("sender not to go away");

        debug!("endpoint update done ({})", why);
    }

    /// Determines our machine's endpoints, STUN lookup included.
    #[instrument(level = "debug", skip_all)]
    async fn determine_endpoints(&mut self) -> Result<Vec<config::Endpoint>> {
        self.port_mapper.procure_mapping();
        let portmap_watcher = self.port_mapper.watch_external_address();
        let report = self.update_net_info().await.context("update_net_info")?;

        // Endpoint -> how it was found, to dedupe.
        let mut already = HashMap::new();
        // Unique endpoints, in priority order: "farthest but most reliable"
        // first, "closest but least reliable" last.
        let mut eps = Vec::new();

        let mut add_addr = |eps: &mut Vec<config::Endpoint>, addr: SocketAddr, typ| {
            if addr.ip().is_unspecified() || already.contains_key(&addr) {
                return;
            }
            already.insert(addr, typ);
            eps.push(config::Endpoint { addr, typ });
        };

        let maybe_port_mapped = *portmap_watcher.borrow();
        if let Some(portmap_ext) = maybe_port_mapped.map(SocketAddr::V4) {
            add_addr(&mut eps, portmap_ext, config::EndpointType::Portmapped);
            self.set_net_info_have_port_map();
        }

        if let Some(global_v4) = report.global_v4 {
            add_addr(&mut eps, global_v4, config::EndpointType::Stun);

            // If they're behind a hard NAT and are using a fixed local
            // port, assume they might've set up a static port mapping on
            // their router to that port. Worst case it's an invalid
            // candidate.
            let port = self.inner.port.load(Ordering::Relaxed);
            if report.mapping_varies_by_dest_ip.unwrap_or_default() && port != 0 {
                let mut addr = global_v4;
                addr.set_port(port);
                add_addr(&mut eps, addr, config::EndpointType::Stun4LocalPort);
            }
        }
        if let Some(global_v6) = report.global_v6 {
            add_addr(&mut eps, global_v6, config::EndpointType::Stun);
        }

        if report.global_v4.is_none()
            && report.global_v6.is_none()
            && self.inner.relay_map().is_empty()
        {
            // Still warming up, this would otherwise wipe the endpoint set.
            bail!("no STUN address and no relay map, discarding update");
        }

        let local_addr_v4 = self.inner.pconn4.local_addr().ok();
        let local_addr_v6 = self.inner.pconn6.as_ref().and_then(|c| c.local_addr().ok());

        let is_unspecified_v4 = local_addr_v4
            .map(|a| a.ip().is_unspecified())
            .unwrap_or(false);
        let is_unspecified_v6 = local_addr_v6
            .map(|a| a.ip().is_unspecified())
            .unwrap_or(false);

        if is_unspecified_v4 || is_unspecified_v6 {
            let LocalAddresses {
                regular: mut ips,
                loopback,
            } = LocalAddresses::new();
            if ips.is_empty() && eps.is_empty() {
                // No locally assigned addresses and no public ones either:
                // include loopback so local testing works offline.
                ips = loopback;
            }
            let v4_port = local_addr_v4.filter(|a| a.ip().is_unspecified()).map(|a| a.port());
            let v6_port = local_addr_v6.filter(|a| a.ip().is_unspecified()).map(|a| a.port());
            for ip in ips {
                let port = match ip {
                    IpAddr::V4(_) => v4_port,
                    IpAddr::V6(_) => v6_port,
                };
                if let Some(port) = port {
                    add_addr(
                        &mut eps,
                        SocketAddr::new(ip, port),
                        config::EndpointType::Local,
                    );
                }
            }
        }

        if !is_unspecified_v4 {
            if let Some(addr) = local_addr_v4 {
                // Bound to a particular address, offer only that one.
                add_addr(&mut eps, addr, config::EndpointType::Local);
            }
        }
        if !is_unspecified_v6 {
            if let Some(addr) = local_addr_v6 {
                add_addr(&mut eps, addr, config::EndpointType::Local);
            }
        }

        Ok(eps)
    }

    /// Records the new endpoints, reporting whether they changed.
    fn set_endpoints(&mut self, endpoints: &[config::Endpoint]) -> bool {
        self.last_endpoints_time = Some(Instant::now());
        if endpoint_sets_equal(endpoints, &self.last_endpoints) {
            return false;
        }
        self.last_endpoints.clear();
        self.last_endpoints.extend_from_slice(endpoints);
        true
    }

    #[instrument(level = "debug", skip_all)]
    async fn update_net_info(&mut self) -> Result<Arc<netprobe::Report>> {
        let relay_map = self.inner.relay_map();
        if relay_map.is_empty() {
            debug!("skipping probe, empty relay map");
            return Ok(Default::default());
        }

        let pconn4 = Some(self.inner.pconn4.as_socket());
        let pconn6 = self.inner.pconn6.as_ref().map(|p| p.as_socket());

        let portmap_probe_rx = self.port_mapper.probe();

        debug!("requesting probe report");
        let report = time::timeout(
            Duration::from_secs(5),
            self.net_probe.get_report(relay_map.clone(), pconn4, pconn6),
        )
        .await??;

        let portmap_probe = match time::timeout(Duration::from_secs(1), portmap_probe_rx).await {
            Ok(Ok(Ok(output))) => Some(output),
            _ => None,
        };

        self.inner
            .no_v4
            .store(!report.ipv4_can_send, Ordering::Relaxed);
        self.inner
            .no_v6
            .store(!report.ipv6_can_send, Ordering::Relaxed);
        self.no_v4_send = !report.ipv4_can_send;

        let have_port_map = self.port_mapper.watch_external_address().borrow().is_some();
        let mut ni = config::NetInfo {
            mapping_varies_by_dest_ip: report.mapping_varies_by_dest_ip,
            have_port_map,
            portmap_probe,
            working_ipv6: Some(report.ipv6),
            working_udp: Some(report.udp),
            preferred_relay: report.preferred_relay,
            relay_latency: Default::default(),
        };
        for (rid, d) in report.region_v4_latency.iter() {
            ni.relay_latency.insert(format!("{rid}-v4"), d.as_secs_f64());
        }
        for (rid, d) in report.region_v6_latency.iter() {
            ni.relay_latency.insert(format!("{rid}-v6"), d.as_secs_f64());
        }

        if ni.preferred_relay == 0 {
            // Perhaps UDP is blocked. Pick a deterministic but arbitrary
            // one.
            ni.preferred_relay = self.pick_relay_fallback();
        }

        if !self.set_nearest_relay(ni.preferred_relay) {
            ni.preferred_relay = 0;
        }

        self.call_net_info_callback(ni);
        Ok(report)
    }

    fn set_nearest_relay(&mut self, region: u16) -> bool {
        let my_relay = self.inner.my_relay();
        if region == my_relay {
            // No change.
            return true;
        }
        self.inner.set_my_relay(region);
        if region == 0 {
            return false;
        }

        match self.inner.relay_map().get_region(region) {
            Some(r) => {
                info!("home is now relay-{} ({})", region, r.region_code);
            }
            None => {
                warn!("relay_map.regions[{}] is empty", region);
                return false;
            }
        }

        // On change, all connected relay servers learn their new standing
        // and the home connection is (re)established.
        self.send_relay_actor(RelayActorMessage::NotePreferred(region));
        self.send_relay_actor(RelayActorMessage::Connect {
            region_id: region,
            peer: None,
        });
        true
    }

    /// Returns a deterministic relay region to connect to when latency
    /// probes cannot find a nearest one (e.g. UDP is blocked).
    fn pick_relay_fallback(&self) -> u16 {
        let ids = self.inner.relay_map().region_ids();
        if ids.is_empty() {
            return 0;
        }

        let my_relay = self.inner.my_relay();
        if my_relay > 0 {
            // If we already had a home, stay on it.
            return my_relay;
        }

        let mut rng = rand::rngs::StdRng::seed_from_u64(0);
        *ids.choose(&mut rng).expect("checked non-empty")
    }

    fn set_net_info_have_port_map(&mut self) {
        if let Some(ref mut net_info_last) = self.net_info_last {
            if net_info_last.have_port_map {
                return;
            }
            net_info_last.have_port_map = true;
            let net_info = net_info_last.clone();
            self.store_net_info(net_info);
        }
    }

    /// Calls the net-info callback if `ni` materially changed since the
    /// last invocation.
    fn call_net_info_callback(&mut self, ni: config::NetInfo) {
        if let Some(ref net_info_last) = self.net_info_last {
            if ni.basically_equal(net_info_last) {
                return;
            }
        }
        self.store_net_info(ni);
    }

    fn store_net_info(&mut self, ni: config::NetInfo) {
        self.net_info_last = Some(ni.clone());
        if let Some(ref on_net_info) = self.inner.callbacks.on_net_info {
            debug!("net_info update: {:?}", ni);
            on_net_info(ni);
        }
    }

    /// Periodic re-probing is only worth it while someone is using us.
    fn should_do_periodic_re_probe(&self) -> bool {
        if self.inner.peer_map.node_count() == 0 || !self.inner.has_tunnel_key() {
            return false;
        }
        match self.inner.callbacks.idle_for {
            Some(ref idle_for) => idle_for() < SESSION_ACTIVE_TIMEOUT,
            None => true,
        }
    }

    #[instrument(skip_all, fields(me = %self.inner.me))]
    async fn rebind_all(&mut self) {
        if let Err(err) = self.rebind(CurrentPortFate::Keep).await {
            debug!("{err:?}");
            return;
        }
        // The home connection may be bound to an address that no longer
        // exists; give it a fresh start.
        let home = self.inner.my_relay();
        if home != 0 {
            self.send_relay_actor(RelayActorMessage::CloseOrReconnect(home, "rebind"));
        }
        // All bets on existing paths are off until re-validated.
        self.inner.peer_map.reset_endpoint_states();
    }

    /// Closes and re-binds the UDP sockets. Successful as long as the IPv4
    /// socket could be bound.
    async fn rebind(&mut self, cur_port_fate: CurrentPortFate) -> Result<()> {
        let mut ipv6_addr = None;
        if let Some(ref pconn6) = self.inner.pconn6 {
            let preferred_port = self.inner.port.load(Ordering::Relaxed);
            if let Err(err) = pconn6.rebind(preferred_port, cur_port_fate).await {
                info!("rebind ignoring IPv6 bind failure: {err:#}");
            } else {
                ipv6_addr = pconn6.local_addr().ok();
            }
        }

        let preferred_port = self.inner.port.load(Ordering::Relaxed);
        self.inner
            .pconn4
            .rebind(preferred_port, cur_port_fate)
            .await
            .context("rebind IPv4 failed")?;

        // Re-read, it might have changed.
        match self.inner.pconn4.port().try_into() {
            Ok(non_zero_port) => self.port_mapper.update_local_port(non_zero_port),
            Err(_zero_port) => debug!("skipping port mapping with zero local port"),
        }
        let ipv4_addr = self.inner.pconn4.local_addr()?;

        *self.inner.local_addrs.write() = (ipv4_addr, ipv6_addr);

        Ok(())
    }

    async fn set_preferred_port(&mut self, port: u16) {
        let existing_port = self.inner.port.swap(port, Ordering::Relaxed);
        if existing_port == port {
            return;
        }
        if let Err(err) = self.rebind(CurrentPortFate::Drop).await {
            warn!("failed to rebind: {err:?}");
            return;
        }
        self.inner.peer_map.reset_endpoint_states();
    }

    fn send_relay_actor(&self, msg: RelayActorMessage) {
        match self.relay_actor_sender.try_send(msg) {
            Ok(_) => {}
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("unable to reach relay actor, already closed");
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("dropping message for relay actor, channel is full");
            }
        }
    }
}

fn new_probe_timer(initial_delay: bool) -> time::Interval {
    // Pick a random duration between 20 and 26 seconds (just under 30s, a
    // common UDP NAT timeout).
    let mut rng = rand::thread_rng();
    let d: Duration = rng.gen_range(Duration::from_secs(20)..=Duration::from_secs(26));
    debug!("scheduling periodic probe to run in {}s", d.as_secs());
    if initial_delay {
        time::interval_at(time::Instant::now() + d, d)
    } else {
        time::interval(d)
    }
}

/// Initial socket setup. IPv6 bind failures are tolerated.
async fn bind(port: u16) -> Result<(RebindingUdpConn, Option<RebindingUdpConn>)> {
    let ip6_port = if port != 0 { port + 1 } else { 0 };
    let pconn6 = match RebindingUdpConn::bind(ip6_port, Network::Ipv6).await {
        Ok(conn) => Some(conn),
        Err(err) => {
            info!("bind ignoring IPv6 bind failure: {err:#}");
            None
        }
    };

    let pconn4 = RebindingUdpConn::bind(port, Network::Ipv4)
        .await
        .context("bind IPv4 failed")?;

    Ok((pconn4, pconn6))
}

fn log_endpoint_change(endpoints: &[config::Endpoint]) {
    debug!("endpoints changed: {}", {
        let mut s = String::new();
        for (i, ep) in endpoints.iter().enumerate() {
            if i > 0 {
                s += ", ";
            }
            s += &format!("{} ({})", ep.addr, ep.typ);
        }
        s
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(addr: &str, typ: config::EndpointType) -> config::Endpoint {
        config::Endpoint {
            addr: addr.parse().unwrap(),
            typ,
        }
    }

    #[test]
    fn test_endpoint_sets_equal() {
        let a = ep("203.0.113.1:42", config::EndpointType::Stun);
        let b = ep("192.168.1.2:42", config::EndpointType::Local);
        let c = ep("203.0.113.1:43", config::EndpointType::Stun);

        assert!(endpoint_sets_equal(&[], &[]));
        assert!(endpoint_sets_equal(&[a.clone()], &[a.clone()]));
        assert!(endpoint_sets_equal(
            &[a.clone(), b.clone()],
            &[b.clone(), a.clone()]
        ));
        assert!(!endpoint_sets_equal(&[a.clone()], &[]));
        assert!(!endpoint_sets_equal(&[a.clone(), b.clone()], &[b, c]));
    }

    #[test]
    fn test_relay_pseudo_addr_encoding() {
        let addr = SendAddr::Relay(17).as_socket_addr();
        assert_eq!(addr.ip(), RELAY_MAGIC_IP);
        assert_eq!(addr.port(), 17);
        assert_eq!(SendAddr::from(addr), SendAddr::Relay(17));

        let udp: SocketAddr = "198.51.100.7:41641".parse().unwrap();
        assert_eq!(SendAddr::from(udp), SendAddr::Udp(udp));
    }

    #[test]
    fn test_peer_handles_are_unique_and_ula() {
        let a = PeerHandle::generate();
        let b = PeerHandle::generate();
        assert_ne!(a, b);
        match a.as_socket_addr().ip() {
            IpAddr::V6(ip) => assert_eq!(ip.octets()[0], 0xfd),
            IpAddr::V4(_) => panic!("fake wire address must be IPv6"),
        }
    }

    async fn new_test_sock() -> RoverSock {
        RoverSock::new(Options::default()).await.unwrap()
    }

    #[tokio::test]
    async fn test_send_requires_key_and_peer() {
        let sock = new_test_sock().await;
        let handle = PeerHandle::generate();

        // Logged out: everything is Closed.
        assert_eq!(
            sock.send(handle, Bytes::from_static(b"x")).await,
            Err(SendError::Closed)
        );

        sock.set_tunnel_private_key(Some(SecretKey::generate())).await;
        assert_eq!(
            sock.send(handle, Bytes::from_static(b"x")).await,
            Err(SendError::UnknownPeer)
        );

        sock.set_network_up(false);
        assert_eq!(
            sock.send(handle, Bytes::from_static(b"x")).await,
            Err(SendError::NetworkDown)
        );

        sock.close().await.unwrap();
        assert_eq!(
            sock.send(handle, Bytes::from_static(b"x")).await,
            Err(SendError::Closed)
        );
        // Close is idempotent.
        sock.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_resolve_peer_handle() {
        let sock = new_test_sock().await;
        let peer_key = SecretKey::generate().public();
        assert_eq!(
            sock.resolve_peer_handle(&peer_key),
            Err(SendError::UnknownPeer)
        );

        sock.set_network_map(config::NetworkMap {
            peers: vec![config::Node {
                key: peer_key,
                disco_key: Some(SecretKey::generate().public()),
                relay_region: None,
                endpoints: vec![],
            }],
        })
        .await;

        let handle = sock.resolve_peer_handle(&peer_key).unwrap();
        assert_eq!(sock.resolve_peer_handle(&peer_key).unwrap(), handle);
        assert!(sock.peer_can_disco(&peer_key));

        sock.set_network_map(config::NetworkMap::default()).await;
        assert_eq!(
            sock.resolve_peer_handle(&peer_key),
            Err(SendError::UnknownPeer)
        );
        sock.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_no_path() {
        let sock = new_test_sock().await;
        sock.set_tunnel_private_key(Some(SecretKey::generate())).await;
        let peer_key = SecretKey::generate().public();
        // A relay-less peer with no endpoints has no path at all.
        sock.set_network_map(config::NetworkMap {
            peers: vec![config::Node {
                key: peer_key,
                disco_key: None,
                relay_region: None,
                endpoints: vec![],
            }],
        })
        .await;
        let handle = sock.resolve_peer_handle(&peer_key).unwrap();
        assert_eq!(
            sock.send(handle, Bytes::from_static(b"x")).await,
            Err(SendError::NoPath)
        );
        sock.close().await.unwrap();
    }

    /// Two sockets on loopback discover each other's direct path via
    /// ping/pong and then exchange a payload over it.
    #[tokio::test]
    async fn test_direct_path_promotion_end_to_end() {
        let a = new_test_sock().await;
        let b = new_test_sock().await;

        a.set_tunnel_private_key(Some(SecretKey::generate())).await;
        b.set_tunnel_private_key(Some(SecretKey::generate())).await;

        let a_node = SecretKey::generate().public();
        let b_node = SecretKey::generate().public();

        let a_addr: SocketAddr = format!("127.0.0.1:{}", a.local_port()).parse().unwrap();
        let b_addr: SocketAddr = format!("127.0.0.1:{}", b.local_port()).parse().unwrap();

        a.set_network_map(config::NetworkMap {
            peers: vec![config::Node {
                key: b_node,
                disco_key: Some(b.disco_public_key()),
                relay_region: None,
                endpoints: vec![b_addr],
            }],
        })
        .await;
        b.set_network_map(config::NetworkMap {
            peers: vec![config::Node {
                key: a_node,
                disco_key: Some(a.disco_public_key()),
                relay_region: None,
                endpoints: vec![a_addr],
            }],
        })
        .await;

        let (b_receivers, _port) = b.bind_open().unwrap();

        let handle = a.resolve_peer_handle(&b_node).unwrap();
        // The first send has no validated path yet (and no relay), but it
        // kicks off discovery.
        let _ = a.send(handle, Bytes::from_static(b"warmup")).await;

        // Wait for the pong to promote the direct path.
        let mut direct = false;
        for _ in 0..100 {
            if let Some(info) = a.tracked_endpoint(&b_node).await {
                if matches!(info.conn_type, ConnectionType::Direct(_)) {
                    direct = true;
                    break;
                }
            }
            time::sleep(Duration::from_millis(50)).await;
        }
        assert!(direct, "no direct path was established");

        a.send(handle, Bytes::from_static(b"hello")).await.unwrap();

        let received = time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some((payload, _from)) = b_receivers.ipv4.recv().await {
                    if &payload[..] == b"hello" {
                        return true;
                    }
                }
            }
        })
        .await
        .unwrap_or(false);
        assert!(received, "payload did not arrive on the direct path");

        a.close().await.unwrap();
        b.close().await.unwrap();
    }
}
