//! Per-peer path state and the peer index.

use std::{
    collections::{hash_map::Entry, HashMap, HashSet},
    net::{IpAddr, SocketAddr},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace};

use crate::{config, key::PublicKey, net::ip::is_unicast_link_local, stun};

use super::{ActorMessage, PeerHandle, SendAddr, Timer};

/// How long we wait for a pong reply before assuming it's never coming.
const PING_TIMEOUT_DURATION: Duration = Duration::from_secs(5);

/// The minimum time between pings to the same candidate path. (Except when a
/// call-me-maybe resets the counters, as the first pings likely didn't make
/// it through the firewall.)
const DISCO_PING_INTERVAL: Duration = Duration::from_secs(5);

/// The latency at or under which we don't try to upgrade to a better path.
const GOOD_ENOUGH_LATENCY: Duration = Duration::from_millis(5);

/// How long since the last activity we try to keep an established peering
/// alive. Also the idle time at which heartbeats stop.
pub(super) const SESSION_ACTIVE_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// How often we try to upgrade to a better path even if we have a working
/// direct route.
const UPGRADE_INTERVAL: Duration = Duration::from_secs(60);

/// How long we trust a UDP address as the exclusive path (without the relay)
/// without having heard a pong on it.
const TRUST_UDP_ADDR_DURATION: Duration = Duration::from_secs(5);

/// How often the best UDP path is pinged while a session is active.
pub(super) const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);

/// How many pong replies to keep per candidate path.
const PONG_HISTORY_COUNT: usize = 64;

/// How often the activity hook may fire per peer.
const ACTIVITY_HOOK_INTERVAL: Duration = Duration::from_secs(10);

/// Work the state machine wants done outside the peer map lock.
#[derive(Debug)]
pub(super) enum PingAction {
    EnqueueCallMeMaybe {
        relay_region: u16,
        endpoint_id: usize,
    },
    SendPing {
        id: usize,
        dst: SendAddr,
        dst_node_key: PublicKey,
        dst_disco_key: PublicKey,
        tx_id: stun::TransactionId,
        purpose: DiscoPingPurpose,
    },
}

/// Options for adding a peer record.
#[derive(Debug)]
pub(super) struct Options {
    pub(super) node_key: PublicKey,
    pub(super) disco_key: Option<PublicKey>,
    pub(super) relay_region: Option<u16>,
    /// Is this peer currently sending data?
    pub(super) active: bool,
}

/// The state machine converging on the best available path to one peer.
#[derive(derive_more::Debug)]
pub(super) struct Endpoint {
    pub(super) id: usize,
    /// The stable fake address identifying this peer to the layer above.
    handle: PeerHandle,
    node_key: PublicKey,
    disco_key: Option<PublicKey>,
    /// The peer's home relay region, the fallback/bootstrap path.
    relay_region: Option<u16>,
    /// Candidate UDP paths and their state.
    direct_addr_state: HashMap<IpPort, PathState>,
    /// Best non-relay path.
    best_addr: Option<AddrLatency>,
    /// Last time `best_addr` was re-confirmed.
    best_addr_at: Option<Instant>,
    /// Past this instant the best path is re-questioned.
    trust_best_addr_until: Option<Instant>,
    /// Last time we pinged all candidate paths.
    last_full_ping: Option<Instant>,
    /// Last outbound payload.
    last_send: Option<Instant>,
    /// Outstanding pings by transaction id.
    sent_pings: HashMap<stun::TransactionId, SentPing>,
    /// Armed while the session is active.
    heartbeat_timer: Option<Timer>,
    /// User-initiated pings waiting for the next pong.
    #[debug(skip)]
    pending_pings: Vec<oneshot::Sender<config::PingOutcome>>,
    /// Candidate paths that were removed by a state transition; drained by
    /// the peer map to keep its source-address index consistent.
    pruned: Vec<IpPort>,
    /// Receive bookkeeping shared with the per-reader address caches.
    recv_tracker: RecvTracker,
    #[debug(skip)]
    actor_sender: mpsc::Sender<ActorMessage>,
}

/// Hot-path receive counters of one peer.
///
/// Shared between the peer record and the reader tasks' one-slot address
/// caches, so payloads from a cached source touch no locks.
#[derive(Debug, Clone)]
pub(super) struct RecvTracker {
    /// Coarse receive timestamp, milliseconds relative to `epoch`, offset
    /// by one so zero means "never".
    last_recv: Arc<AtomicU64>,
    /// Bumped on stop-and-reset, invalidates caches.
    stop_gen: Arc<AtomicU64>,
    epoch: Instant,
}

impl RecvTracker {
    fn new(epoch: Instant) -> Self {
        RecvTracker {
            last_recv: Arc::new(AtomicU64::new(0)),
            stop_gen: Arc::new(AtomicU64::new(0)),
            epoch,
        }
    }

    /// Notes an inbound payload; returns whether the activity hook is due.
    pub(super) fn record(&self) -> bool {
        let now_ms = self.epoch.elapsed().as_millis() as u64 + 1;
        let prev = self.last_recv.swap(now_ms, Ordering::Relaxed);
        prev == 0 || now_ms.saturating_sub(prev) >= ACTIVITY_HOOK_INTERVAL.as_millis() as u64
    }

    pub(super) fn stop_generation(&self) -> u64 {
        self.stop_gen.load(Ordering::Relaxed)
    }

    fn bump_stop_generation(&self) {
        self.stop_gen.fetch_add(1, Ordering::Relaxed);
    }
}

impl Endpoint {
    fn new(
        id: usize,
        options: Options,
        actor_sender: mpsc::Sender<ActorMessage>,
        epoch: Instant,
    ) -> Self {
        let handle = PeerHandle::generate();
        let mut ep = Endpoint {
            id,
            handle,
            node_key: options.node_key,
            disco_key: options.disco_key,
            relay_region: options.relay_region,
            direct_addr_state: HashMap::new(),
            best_addr: None,
            best_addr_at: None,
            trust_best_addr_until: None,
            last_full_ping: None,
            last_send: None,
            sent_pings: HashMap::new(),
            heartbeat_timer: None,
            pending_pings: Vec::new(),
            pruned: Vec::new(),
            recv_tracker: RecvTracker::new(epoch),
            actor_sender,
        };
        if options.active {
            ep.note_active();
        }
        ep
    }

    pub(super) fn node_key(&self) -> &PublicKey {
        &self.node_key
    }

    pub(super) fn disco_key(&self) -> Option<PublicKey> {
        self.disco_key
    }

    pub(super) fn handle(&self) -> PeerHandle {
        self.handle
    }

    pub(super) fn recv_tracker(&self) -> &RecvTracker {
        &self.recv_tracker
    }

    #[cfg(test)]
    pub(super) fn stop_generation(&self) -> u64 {
        self.recv_tracker.stop_generation()
    }

    /// Whether path discovery can run for this peer at all.
    pub(super) fn can_disco(&self) -> bool {
        self.disco_key.is_some()
    }

    /// Returns info about this peer's paths.
    pub(super) fn info(&self) -> EndpointInfo {
        let (conn_type, latency) = if self.is_best_addr_valid(Instant::now()) {
            let addr_info = self.best_addr.as_ref().expect("checked");
            (ConnectionType::Direct(addr_info.addr), addr_info.latency)
        } else if let Some(region_id) = self.relay_region {
            (ConnectionType::Relay(region_id), None)
        } else {
            (ConnectionType::None, None)
        };
        let addrs = self
            .direct_addr_state
            .iter()
            .map(|(addr, state)| {
                (
                    SocketAddr::from(*addr),
                    state.recent_pong().map(|pong| pong.latency),
                )
            })
            .collect();

        EndpointInfo {
            id: self.id,
            node_key: self.node_key,
            relay_region: self.relay_region,
            addrs,
            conn_type,
            latency,
        }
    }

    /// The addresses the next packet for this peer should go to.
    ///
    /// Zero, one or both of the UDP address and the relay region may be
    /// present: while the best path is absent or past its trust window the
    /// relay is included so packets keep flowing during (re-)discovery.
    fn addr_for_send(&self, now: Instant) -> (Option<SocketAddr>, Option<u16>) {
        let udp_addr = self.best_addr.as_ref().map(|a| a.addr);
        let relay = if udp_addr.is_none() || !self.is_best_addr_valid(now) {
            self.relay_region
        } else {
            None
        };
        (udp_addr, relay)
    }

    fn is_best_addr_valid(&self, now: Instant) -> bool {
        match (&self.best_addr, self.trust_best_addr_until) {
            (Some(_), Some(trust_until)) => now < trust_until,
            _ => false,
        }
    }

    /// Whether to ping all candidates looking for a better path.
    fn want_full_ping(&self, now: Instant) -> bool {
        if !self.can_disco() {
            return false;
        }
        if self.best_addr.is_none() || self.last_full_ping.is_none() {
            return true;
        }
        if !self.is_best_addr_valid(now) {
            return true;
        }
        let latency = self.best_addr.as_ref().and_then(|a| a.latency);
        if latency.map(|l| l <= GOOD_ENOUGH_LATENCY).unwrap_or(false) {
            return false;
        }
        now.duration_since(self.last_full_ping.expect("checked")) >= UPGRADE_INTERVAL
    }

    /// Records an outbound payload and keeps the heartbeat armed.
    fn note_active(&mut self) {
        self.last_send = Some(Instant::now());
        if self.heartbeat_timer.is_none() && self.can_disco() {
            self.arm_heartbeat();
        }
    }

    fn arm_heartbeat(&mut self) {
        let sender = self.actor_sender.clone();
        let id = self.id;
        self.heartbeat_timer = Some(Timer::after(HEARTBEAT_INTERVAL, async move {
            sender.send(ActorMessage::EndpointHeartbeat(id)).await.ok();
        }));
    }

    /// Periodic keep-alive of the best path, and discovery of better ones.
    ///
    /// Heartbeats end when the session has been idle for
    /// [`SESSION_ACTIVE_TIMEOUT`]; the next send re-arms them.
    pub(super) fn heartbeat(&mut self) -> Vec<PingAction> {
        self.heartbeat_timer = None;
        if !self.can_disco() {
            return Vec::new();
        }

        let idle = self
            .last_send
            .map(|last| last.elapsed() > SESSION_ACTIVE_TIMEOUT)
            .unwrap_or(true);
        if idle {
            trace!(peer = %self.node_key.fmt_short(), "ending heartbeats for idle session");
            return Vec::new();
        }

        let now = Instant::now();
        let mut msgs = Vec::new();
        let (udp_addr, _) = self.addr_for_send(now);
        if let Some(udp_addr) = udp_addr {
            // Keep the NAT pinhole of the preferred path warm.
            if let Some(msg) = self.start_ping(SendAddr::Udp(udp_addr), DiscoPingPurpose::Heartbeat)
            {
                msgs.push(msg);
            }
        }
        if self.want_full_ping(now) {
            msgs.extend(self.send_pings(now, true));
        }

        self.arm_heartbeat();
        msgs
    }

    /// The entry point of the send path: records activity, picks addresses
    /// and starts a discovery round when the best path is in doubt.
    pub(super) fn get_send_addrs(&mut self) -> (Option<SocketAddr>, Option<u16>, Vec<PingAction>) {
        let now = Instant::now();
        self.note_active();
        let (udp_addr, relay_region) = self.addr_for_send(now);

        let mut msgs = Vec::new();
        if self.can_disco() && (udp_addr.is_none() || !self.is_best_addr_valid(now)) {
            msgs = self.send_pings(now, true);
        }

        (udp_addr, relay_region, msgs)
    }

    fn start_ping(&self, dst: SendAddr, purpose: DiscoPingPurpose) -> Option<PingAction> {
        let disco_key = self.disco_key?;
        let tx_id = stun::TransactionId::default();
        trace!(peer = %self.node_key.fmt_short(), %dst, ?purpose, "start ping");
        Some(PingAction::SendPing {
            id: self.id,
            dst,
            dst_node_key: self.node_key,
            dst_disco_key: disco_key,
            tx_id,
            purpose,
        })
    }

    /// Records that a ping went out on the wire and arms its timeout.
    pub(super) fn ping_sent(
        &mut self,
        to: SendAddr,
        tx_id: stun::TransactionId,
        purpose: DiscoPingPurpose,
    ) {
        debug!(peer = %self.node_key.fmt_short(), %to, "disco: sent ping [{}]", hex::encode(tx_id));

        let now = Instant::now();
        if purpose != DiscoPingPurpose::StatusCheck {
            if let SendAddr::Udp(addr) = to {
                if let Some(st) = self.direct_addr_state.get_mut(&addr.into()) {
                    st.last_ping.replace(now);
                }
            }
        }

        let id = self.id;
        let sender = self.actor_sender.clone();
        let timer = Timer::after(PING_TIMEOUT_DURATION, async move {
            sender
                .send(ActorMessage::EndpointPingExpired(id, tx_id))
                .await
                .ok();
        });
        self.sent_pings.insert(
            tx_id,
            SentPing {
                to,
                at: now,
                purpose,
                timer,
            },
        );
    }

    /// Removes a ping that never made it to the wire.
    pub(super) fn forget_ping(&mut self, tx_id: stun::TransactionId) {
        if let Some(sp) = self.sent_pings.remove(&tx_id) {
            sp.timer.abort();
        }
    }

    /// The pong never came; drops the outstanding entry.
    ///
    /// The path is not otherwise penalized, the next pong on any path will
    /// re-establish a best.
    pub(super) fn ping_timeout(&mut self, tx_id: stun::TransactionId) {
        if let Some(sp) = self.sent_pings.remove(&tx_id) {
            debug!(
                peer = %self.node_key.fmt_short(),
                to = %sp.to,
                "disco: timeout waiting for pong [{}]",
                hex::encode(tx_id),
            );
            if let SendAddr::Udp(addr) = sp.to {
                if let Some(st) = self.direct_addr_state.get_mut(&addr.into()) {
                    st.last_ping = None;
                }
            }
        }
    }

    /// A full probe: ping every candidate whose last ping is old enough and
    /// advertise our endpoints via call-me-maybe.
    fn send_pings(&mut self, now: Instant, send_call_me_maybe: bool) -> Vec<PingAction> {
        self.last_full_ping.replace(now);

        let mut to_delete = Vec::new();
        let mut to_ping = Vec::new();
        for (ipp, st) in &self.direct_addr_state {
            if st.should_delete() {
                to_delete.push(*ipp);
                continue;
            }
            if st.needs_ping(now) {
                to_ping.push(*ipp);
            }
        }
        for ipp in to_delete {
            self.delete_path(ipp);
        }

        let mut msgs = Vec::new();
        for ipp in &to_ping {
            if let Some(msg) = self.start_ping(SendAddr::Udp((*ipp).into()), DiscoPingPurpose::Discovery)
            {
                msgs.push(msg);
            }
        }

        let sent_any = !msgs.is_empty();
        if sent_any && send_call_me_maybe {
            if let Some(relay_region) = self.relay_region {
                // We pinged, so our firewall ports are probably open: a good
                // time to ask the peer to ping us back at our endpoints.
                msgs.push(PingAction::EnqueueCallMeMaybe {
                    relay_region,
                    endpoint_id: self.id,
                });
            }
        }

        msgs
    }

    /// Applies the advertised state from a network map update.
    pub(super) fn update_from_node(&mut self, n: &config::Node) {
        if self.disco_key != n.disco_key {
            debug!(
                peer = %self.node_key.fmt_short(),
                "disco key changed, resetting endpoint state"
            );
            self.disco_key = n.disco_key;
            self.reset();
        }
        self.relay_region = n.relay_region;

        // Tentatively mark every path as gone from the advertised list,
        // then walk the new list.
        for st in self.direct_addr_state.values_mut() {
            st.index = None;
        }
        for (i, addr) in n.endpoints.iter().take(u16::MAX as usize).enumerate() {
            let index = Some(i as u16);
            match self.direct_addr_state.entry((*addr).into()) {
                Entry::Occupied(mut occupied) => occupied.get_mut().index = index,
                Entry::Vacant(vacant) => {
                    vacant.insert(PathState {
                        index,
                        ..Default::default()
                    });
                }
            }
        }

        self.cleanup_paths();
    }

    /// Adds `ep` as a path we should ping, learned from an inbound ping.
    pub(super) fn add_candidate_path(&mut self, ep: SocketAddr) {
        let ipp = ep.into();
        if let Some(st) = self.direct_addr_state.get_mut(&ipp) {
            if st.last_got_ping.is_none() {
                // Already-known path from the network map.
                return;
            }
            st.last_got_ping.replace(Instant::now());
            return;
        }

        info!(peer = %self.node_key.fmt_short(), %ep, "disco: new candidate path");
        self.direct_addr_state.insert(
            ipp,
            PathState {
                last_got_ping: Some(Instant::now()),
                ..Default::default()
            },
        );

        // If for some reason this gets very large, do some cleanup.
        let size = self.direct_addr_state.len();
        if size > 100 {
            self.cleanup_paths();
            let size2 = self.direct_addr_state.len();
            info!("disco: pruned candidate set from {} to {} entries", size, size2);
        }
    }

    /// Called when connectivity changes enough that we should question our
    /// earlier assumptions about which paths work.
    pub(super) fn note_connectivity_change(&mut self) {
        trace!(peer = %self.node_key.fmt_short(), "connectivity changed");
        self.trust_best_addr_until = None;
    }

    /// Handles a pong (a reply to one of our earlier pings).
    ///
    /// Reports the source address to insert into the peer map's
    /// source-address index, if any.
    pub(super) fn handle_pong(
        &mut self,
        m: &crate::disco::Pong,
        src: SendAddr,
    ) -> Option<SocketAddr> {
        let Some(sp) = self.sent_pings.remove(&m.tx_id) else {
            // Not a pong for a ping we sent (or a duplicate); ignore.
            debug!(peer = %self.node_key.fmt_short(), %src, "disco: unexpected pong [{}]", hex::encode(m.tx_id));
            return None;
        };
        sp.timer.abort();

        let now = Instant::now();
        let latency = now.duration_since(sp.at);
        let mut index_insert = None;

        if let SendAddr::Udp(addr) = src {
            match self.direct_addr_state.get_mut(&addr.into()) {
                None => {
                    // The path was deleted while the ping was in flight; a
                    // pong must not resurrect it.
                    debug!(peer = %self.node_key.fmt_short(), %addr, "disco: ignoring pong for dropped path");
                    return None;
                }
                Some(st) => {
                    st.add_pong_reply(PongReply {
                        latency,
                        pong_at: now,
                        from: addr,
                        pong_src: m.src,
                    });
                    index_insert = Some(addr);
                }
            }
        }

        info!(
            peer = %self.node_key.fmt_short(),
            %src,
            latency = ?latency,
            pong_src = %m.src,
            "disco: got pong [{}]",
            hex::encode(m.tx_id)
        );

        for s in self.pending_pings.drain(..) {
            let mut outcome = config::PingOutcome {
                latency_seconds: Some(latency.as_secs_f64()),
                ..Default::default()
            };
            match sp.to {
                SendAddr::Udp(addr) => outcome.endpoint = Some(addr),
                SendAddr::Relay(region) => outcome.relay_region_id = Some(region),
            }
            s.send(outcome).ok();
        }

        // Promote this pong's path to best if the comparator prefers it.
        if let SendAddr::Udp(to) = sp.to {
            let this_pong = AddrLatency {
                addr: to,
                latency: Some(latency),
            };
            let is_better = match self.best_addr {
                None => true,
                Some(ref best) => this_pong.is_better_than(best),
            };
            if is_better {
                info!(peer = %self.node_key.fmt_short(), addr = %to, "disco: new best path");
                self.best_addr = Some(this_pong);
            }
            if let Some(best) = self.best_addr.as_mut() {
                if best.addr == to {
                    best.latency.replace(latency);
                    self.best_addr_at = Some(now);
                    self.trust_best_addr_until = Some(now + TRUST_UDP_ADDR_DURATION);
                }
            }
        }

        index_insert
    }

    /// Handles a call-me-maybe, received via the relay.
    ///
    /// The peer advertises where it believes it can be reached; the contract
    /// is that it has already sent UDP packets our way to open its firewall,
    /// so we ping back immediately, ignoring the per-path ping interval.
    pub(super) fn handle_call_me_maybe(&mut self, m: &crate::disco::CallMeMaybe) -> Vec<PingAction> {
        let now = Instant::now();

        // Mark prior call-me-maybe paths for reconsideration.
        for st in self.direct_addr_state.values_mut() {
            st.is_call_me_maybe = false;
        }

        let mut new_paths = Vec::new();
        for ep in &m.my_numbers {
            if let IpAddr::V6(ip) = ep.ip() {
                if is_unicast_link_local(ip) {
                    // We advertise these ourselves, but don't ping them yet.
                    continue;
                }
            }
            match self.direct_addr_state.entry((*ep).into()) {
                Entry::Occupied(mut occupied) => {
                    let st = occupied.get_mut();
                    st.is_call_me_maybe = true;
                    st.call_me_maybe_time.replace(now);
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(PathState {
                        is_call_me_maybe: true,
                        call_me_maybe_time: Some(now),
                        ..Default::default()
                    });
                    new_paths.push(*ep);
                }
            }
        }
        if !new_paths.is_empty() {
            debug!(
                peer = %self.node_key.fmt_short(),
                ?new_paths,
                "disco: call-me-maybe added new paths"
            );
        }

        // Paths that only existed because of an earlier call-me-maybe and
        // were not re-advertised are gone now.
        let stale: Vec<IpPort> = self
            .direct_addr_state
            .iter()
            .filter(|(_, st)| {
                !st.is_call_me_maybe && st.call_me_maybe_time.is_some()
            })
            .map(|(ipp, _)| *ipp)
            .collect();
        for ipp in stale {
            let advertised = self
                .direct_addr_state
                .get(&ipp)
                .map(|st| st.index.is_some())
                .unwrap_or(false);
            if let Some(st) = self.direct_addr_state.get_mut(&ipp) {
                st.call_me_maybe_time = None;
            }
            if !advertised {
                if let Some(st) = self.direct_addr_state.get(&ipp) {
                    if st.should_delete() {
                        self.delete_path(ipp);
                    }
                }
            }
        }

        // Zero the last-ping times so the probe below pings every candidate
        // even inside the usual interval.
        for st in self.direct_addr_state.values_mut() {
            st.last_ping = None;
        }
        self.send_pings(now, false)
    }

    /// Starts a user-initiated status ping; the sender resolves on the next
    /// pong from this peer.
    pub(super) fn start_status_ping(
        &mut self,
        s: oneshot::Sender<config::PingOutcome>,
    ) -> Vec<PingAction> {
        self.pending_pings.push(s);

        let now = Instant::now();
        let mut msgs = Vec::new();
        if let Some(region) = self.relay_region {
            if let Some(msg) = self.start_ping(SendAddr::Relay(region), DiscoPingPurpose::StatusCheck)
            {
                msgs.push(msg);
            }
        }
        let (udp_addr, _) = self.addr_for_send(now);
        if self.is_best_addr_valid(now) {
            if let Some(udp_addr) = udp_addr {
                // An active session; just ping the path we're using.
                if let Some(msg) =
                    self.start_ping(SendAddr::Udp(udp_addr), DiscoPingPurpose::StatusCheck)
                {
                    msgs.push(msg);
                }
            }
        } else {
            let paths: Vec<_> = self.direct_addr_state.keys().copied().collect();
            for ipp in paths {
                if let Some(msg) =
                    self.start_ping(SendAddr::Udp(ipp.into()), DiscoPingPurpose::StatusCheck)
                {
                    msgs.push(msg);
                }
            }
        }
        msgs
    }

    /// Notes an inbound payload; returns whether the activity hook is due.
    pub(super) fn record_recv(&self) -> bool {
        self.recv_tracker.record()
    }

    fn delete_path(&mut self, ipp: IpPort) {
        if self.direct_addr_state.remove(&ipp).is_some() {
            self.pruned.push(ipp);
        }
        if let Some(best) = self.best_addr.as_ref() {
            if best.addr == SocketAddr::from(ipp) {
                self.best_addr = None;
                self.best_addr_at = None;
                self.trust_best_addr_until = None;
            }
        }
    }

    /// Deletes paths that are neither advertised, nor freshly learned from a
    /// ping, nor advertised in a call-me-maybe.
    fn cleanup_paths(&mut self) {
        let to_delete: Vec<IpPort> = self
            .direct_addr_state
            .iter()
            .filter(|(_, st)| st.should_delete())
            .map(|(ipp, _)| *ipp)
            .collect();
        for ipp in to_delete {
            self.delete_path(ipp);
        }
    }

    /// Paths removed since the last drain, for index maintenance.
    pub(super) fn take_pruned(&mut self) -> Vec<IpPort> {
        std::mem::take(&mut self.pruned)
    }

    /// Clears the p2p state, reverting to a relay-only peer.
    fn reset(&mut self) {
        self.last_full_ping = None;
        self.best_addr = None;
        self.best_addr_at = None;
        self.trust_best_addr_until = None;
        for st in self.direct_addr_state.values_mut() {
            st.last_ping = None;
        }
        for (_, sp) in self.sent_pings.drain() {
            sp.timer.abort();
        }
    }

    /// Stops timers and resets state to zero. Called when the peer leaves
    /// the network map or the engine logs out.
    pub(super) fn stop_and_reset(&mut self) {
        self.recv_tracker.bump_stop_generation();
        self.reset();
        self.heartbeat_timer = None;
        self.pending_pings.clear();
        self.last_send = None;
    }
}

/// A `SocketAddr` with an associated latency.
#[derive(Debug, Clone)]
pub(super) struct AddrLatency {
    pub(super) addr: SocketAddr,
    pub(super) latency: Option<Duration>,
}

impl AddrLatency {
    /// Reports whether `self` is a better path to use than `other`.
    ///
    /// IPv6 is preferred over IPv4 whenever its latency is within 10%, for
    /// being a bit more robust against NAT rebinds.
    pub(super) fn is_better_than(&self, other: &Self) -> bool {
        if self.addr == other.addr {
            return false;
        }
        if self.addr.is_ipv6() && other.addr.is_ipv4() {
            if let (Some(latency), Some(other_latency)) = (self.latency, other.latency) {
                if latency / 10 * 9 < other_latency {
                    return true;
                }
            }
        } else if self.addr.is_ipv4() && other.addr.is_ipv6() && other.is_better_than(self) {
            return false;
        }
        self.latency < other.latency
    }
}

/// An (Ip, Port) pair.
///
/// Storing an [`IpPort`] is safer than storing a [`SocketAddr`] because for
/// IPv6 socket addresses include fields that can't be assumed consistent
/// even within a single connection.
#[derive(Debug, derive_more::Display, Clone, Copy, Hash, PartialEq, Eq)]
#[display("{}", SocketAddr::from(*self))]
pub(super) struct IpPort {
    ip: IpAddr,
    port: u16,
}

impl From<SocketAddr> for IpPort {
    fn from(socket_addr: SocketAddr) -> Self {
        Self {
            ip: socket_addr.ip(),
            port: socket_addr.port(),
        }
    }
}

impl From<IpPort> for SocketAddr {
    fn from(ip_port: IpPort) -> Self {
        let IpPort { ip, port } = ip_port;
        (ip, port).into()
    }
}

/// State and history of one candidate path of one peer.
#[derive(Debug, Clone, Default)]
pub(super) struct PathState {
    /// Position in the peer's advertised endpoint list, `None` when the
    /// address is not in the current advertised set.
    index: Option<u16>,

    /// The last outgoing ping time.
    last_ping: Option<Instant>,

    /// Non-empty means this path was learned at runtime from an incoming
    /// ping and is not (necessarily) in the network map. Kept fresh to
    /// discard old candidates.
    last_got_ping: Option<Instant>,

    /// When this path was last advertised in a call-me-maybe.
    call_me_maybe_time: Option<Instant>,

    /// Whether the most recent call-me-maybe included this path.
    is_call_me_maybe: bool,

    /// Ring buffer up to [`PONG_HISTORY_COUNT`] entries.
    recent_pongs: Vec<PongReply>,
    /// Index of the most recent pong in `recent_pongs`.
    recent_pong: usize,
}

impl PathState {
    fn add_pong_reply(&mut self, r: PongReply) {
        let n = self.recent_pongs.len();
        if n < PONG_HISTORY_COUNT {
            self.recent_pong = n;
            self.recent_pongs.push(r);
            return;
        }
        let mut i = self.recent_pong + 1;
        if i == PONG_HISTORY_COUNT {
            i = 0;
        }
        self.recent_pongs[i] = r;
        self.recent_pong = i;
    }

    /// Returns the most recent pong if available.
    fn recent_pong(&self) -> Option<&PongReply> {
        self.recent_pongs.get(self.recent_pong)
    }

    /// Whether this path should be removed from the candidate set.
    fn should_delete(&self) -> bool {
        if self.call_me_maybe_time.is_some() {
            return false;
        }
        match self.last_got_ping {
            // Learned from a ping; gone once pings stop coming.
            Some(last_got_ping) => last_got_ping.elapsed() > SESSION_ACTIVE_TIMEOUT,
            // From the network map; gone once no longer advertised.
            None => self.index.is_none(),
        }
    }

    fn needs_ping(&self, now: Instant) -> bool {
        match self.last_ping {
            None => true,
            Some(last_ping) => now.duration_since(last_ping) > DISCO_PING_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PongReply {
    latency: Duration,
    /// When we received the pong.
    pong_at: Instant,
    /// The path the pong arrived on.
    from: SocketAddr,
    /// What the peer reported they saw as our address.
    pong_src: SocketAddr,
}

#[derive(Debug)]
pub(super) struct SentPing {
    pub(super) to: SendAddr,
    pub(super) at: Instant,
    #[allow(dead_code)]
    pub(super) purpose: DiscoPingPurpose,
    pub(super) timer: Timer,
}

/// The reason why a discovery ping message was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum DiscoPingPurpose {
    /// Looking for a (better) path.
    Discovery,
    /// Keeping the current path's NAT mapping warm.
    Heartbeat,
    /// A user asked for the peer's status.
    StatusCheck,
}

/// The type of connection we have to a peer.
#[derive(derive_more::Display, Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum ConnectionType {
    /// Direct UDP connection.
    #[display("direct")]
    Direct(SocketAddr),
    /// Connection via a relay region.
    #[display("relay")]
    Relay(u16),
    /// No verified path to this peer.
    #[display("none")]
    None,
}

/// Details about a tracked peer.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct EndpointInfo {
    /// The id in the peer map.
    pub id: usize,
    /// The tunnel public key of the peer.
    pub node_key: PublicKey,
    /// Home relay region, if available.
    pub relay_region: Option<u16>,
    /// Addresses at which this peer might be reachable, plus any latency
    /// information we have about them.
    pub addrs: Vec<(SocketAddr, Option<Duration>)>,
    /// The kind of path we currently use.
    pub conn_type: ConnectionType,
    /// The latency of the current path.
    pub latency: Option<Duration>,
}

/// Everything the send path needs about one peer, resolved in one lock hold.
#[derive(Debug)]
pub(super) struct SendInfo {
    pub(super) node_key: PublicKey,
    pub(super) udp_addr: Option<SocketAddr>,
    pub(super) relay_region: Option<u16>,
    pub(super) actions: Vec<PingAction>,
}

/// What the receive path needs to surface a payload.
#[derive(Debug)]
pub(super) struct RecvInfo {
    pub(super) handle: PeerHandle,
    pub(super) node_key: PublicKey,
    /// Whether the upper layer's activity hook is due for this peer.
    pub(super) fire_activity_hook: bool,
    /// Shared counters for the reader's one-slot cache.
    pub(super) tracker: RecvTracker,
}

/// The index of all tracked peers.
///
/// Peers can be looked up by node key, by discovery key, by an observed UDP
/// source address and by the fake wire address handed to the upper layer.
/// All four indexes point at the same records.
#[derive(Default, Debug)]
pub(crate) struct PeerMap {
    inner: Mutex<PeerMapInner>,
}

#[derive(Default, Debug)]
pub(super) struct PeerMapInner {
    by_node_key: HashMap<PublicKey, usize>,
    by_disco_key: HashMap<PublicKey, usize>,
    by_ip_port: HashMap<IpPort, usize>,
    by_handle: HashMap<PeerHandle, usize>,
    by_id: HashMap<usize, Endpoint>,
    next_id: usize,
}

impl PeerMap {
    pub(super) fn read<T>(&self, f: impl FnOnce(&PeerMapInner) -> T) -> T {
        let inner = self.inner.lock();
        f(&inner)
    }

    pub(super) fn write<T>(&self, f: impl FnOnce(&mut PeerMapInner) -> T) -> T {
        let mut inner = self.inner.lock();
        f(&mut inner)
    }

    pub(super) fn node_count(&self) -> usize {
        self.inner.lock().by_id.len()
    }

    pub(super) fn handle_for_node_key(&self, nk: &PublicKey) -> Option<PeerHandle> {
        self.read(|inner| inner.endpoint_for_node_key(nk).map(|ep| ep.handle()))
    }

    pub(super) fn peer_can_disco(&self, nk: &PublicKey) -> bool {
        self.read(|inner| {
            inner
                .endpoint_for_node_key(nk)
                .map(|ep| ep.can_disco())
                .unwrap_or(false)
        })
    }

    /// Resolves the send path for one peer handle.
    pub(super) fn get_send_info(&self, handle: &PeerHandle) -> Option<SendInfo> {
        self.write(|inner| {
            let id = *inner.by_handle.get(handle)?;
            let ep = inner.by_id.get_mut(&id)?;
            let node_key = *ep.node_key();
            let (udp_addr, relay_region, actions) = ep.get_send_addrs();
            Some(SendInfo {
                node_key,
                udp_addr,
                relay_region,
                actions,
            })
        })
    }

    /// Looks up an inbound UDP payload's source.
    pub(super) fn receive_udp(&self, src: SocketAddr) -> Option<RecvInfo> {
        self.read(|inner| {
            let ep = inner.endpoint_for_ip_port(src)?;
            Some(RecvInfo {
                handle: ep.handle(),
                node_key: *ep.node_key(),
                fire_activity_hook: ep.record_recv(),
                tracker: ep.recv_tracker().clone(),
            })
        })
    }

    /// Looks up an inbound relay payload's source peer.
    pub(super) fn receive_relay(&self, src: &PublicKey) -> Option<RecvInfo> {
        self.read(|inner| {
            let ep = inner.endpoint_for_node_key(src)?;
            Some(RecvInfo {
                handle: ep.handle(),
                node_key: *ep.node_key(),
                fire_activity_hook: ep.record_recv(),
                tracker: ep.recv_tracker().clone(),
            })
        })
    }

    /// Runs `f` on the endpoint `id`, then drains any paths it pruned into
    /// the source-address index.
    pub(super) fn with_endpoint_mut<T>(
        &self,
        id: usize,
        f: impl FnOnce(&mut Endpoint) -> T,
    ) -> Option<T> {
        self.write(|inner| {
            let ep = inner.by_id.get_mut(&id)?;
            let res = f(ep);
            inner.sync_pruned(id);
            Some(res)
        })
    }

    /// Installs or updates every peer of a new network map, and drops peers
    /// that disappeared from it. Returns the node and discovery keys of
    /// dropped peers.
    pub(super) fn apply_network_map(
        &self,
        nm: &config::NetworkMap,
        sender: &mpsc::Sender<ActorMessage>,
        epoch: Instant,
    ) -> Vec<(PublicKey, Option<PublicKey>)> {
        self.write(|inner| {
            let mut present: HashSet<PublicKey> = HashSet::with_capacity(nm.peers.len());
            for node in &nm.peers {
                present.insert(node.key);
                inner.upsert_node(node, sender, epoch);
            }
            inner.remove_missing(&present)
        })
    }

    pub(super) fn endpoint_infos(&self) -> Vec<EndpointInfo> {
        self.read(|inner| inner.by_id.values().map(|ep| ep.info()).collect())
    }

    pub(super) fn endpoint_info(&self, nk: &PublicKey) -> Option<EndpointInfo> {
        self.read(|inner| inner.endpoint_for_node_key(nk).map(|ep| ep.info()))
    }

    /// Stops all endpoint state machines (logout or shutdown).
    pub(super) fn notify_shutdown(&self) {
        self.write(|inner| {
            for ep in inner.by_id.values_mut() {
                ep.stop_and_reset();
            }
        });
    }

    /// Resets the trust window of every peer, called on connectivity change.
    pub(super) fn reset_endpoint_states(&self) {
        self.write(|inner| {
            for ep in inner.by_id.values_mut() {
                ep.note_connectivity_change();
            }
        });
    }
}

impl PeerMapInner {
    pub(super) fn endpoint_for_node_key(&self, nk: &PublicKey) -> Option<&Endpoint> {
        self.by_node_key.get(nk).and_then(|id| self.by_id.get(id))
    }

    pub(super) fn endpoint_for_node_key_mut(&mut self, nk: &PublicKey) -> Option<&mut Endpoint> {
        self.by_node_key
            .get(nk)
            .and_then(|id| self.by_id.get_mut(id))
    }

    pub(super) fn endpoint_for_disco_key(&self, dk: &PublicKey) -> Option<&Endpoint> {
        self.by_disco_key.get(dk).and_then(|id| self.by_id.get(id))
    }

    pub(super) fn endpoint_for_disco_key_mut(&mut self, dk: &PublicKey) -> Option<&mut Endpoint> {
        self.by_disco_key
            .get(dk)
            .and_then(|id| self.by_id.get_mut(id))
    }

    pub(super) fn endpoint_for_ip_port(&self, ipp: impl Into<IpPort>) -> Option<&Endpoint> {
        self.by_ip_port
            .get(&ipp.into())
            .and_then(|id| self.by_id.get(id))
    }

    pub(super) fn by_id_ref(&self, id: usize) -> Option<&Endpoint> {
        self.by_id.get(&id)
    }

    /// Makes future lookups by `ipp` resolve to the endpoint `id`.
    ///
    /// Only to be called with a verified mapping, since this defines which
    /// peer inbound payloads from `ipp` are attributed to.
    pub(super) fn set_endpoint_for_ip_port(&mut self, ipp: impl Into<IpPort>, id: usize) {
        let ipp = ipp.into();
        trace!(%ipp, %id, "peer map: index source address");
        self.by_ip_port.insert(ipp, id);
    }

    /// Drains the endpoint's pruned paths out of the source-address index.
    pub(super) fn sync_pruned(&mut self, id: usize) {
        let Some(ep) = self.by_id.get_mut(&id) else {
            return;
        };
        for ipp in ep.take_pruned() {
            if self.by_ip_port.get(&ipp) == Some(&id) {
                self.by_ip_port.remove(&ipp);
            }
        }
    }

    pub(super) fn insert_endpoint(
        &mut self,
        options: Options,
        sender: &mpsc::Sender<ActorMessage>,
        epoch: Instant,
    ) -> usize {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        let ep = Endpoint::new(id, options, sender.clone(), epoch);

        self.by_handle.insert(ep.handle(), id);
        self.by_node_key.insert(*ep.node_key(), id);
        if let Some(dk) = ep.disco_key() {
            self.by_disco_key.insert(dk, id);
        }
        self.by_id.insert(id, ep);
        id
    }

    fn upsert_node(
        &mut self,
        n: &config::Node,
        sender: &mpsc::Sender<ActorMessage>,
        epoch: Instant,
    ) {
        if self.endpoint_for_node_key(&n.key).is_none() {
            info!(peer = %n.key.fmt_short(), relay = ?n.relay_region, "peer map: new peer");
            self.insert_endpoint(
                Options {
                    node_key: n.key,
                    disco_key: n.disco_key,
                    relay_region: n.relay_region,
                    active: false,
                },
                sender,
                epoch,
            );
        }

        let id = *self.by_node_key.get(&n.key).expect("just inserted");
        let old_disco = self.by_id.get(&id).and_then(|ep| ep.disco_key());
        if let Some(ep) = self.by_id.get_mut(&id) {
            ep.update_from_node(n);
        }
        if old_disco != n.disco_key {
            if let Some(old) = old_disco {
                self.by_disco_key.remove(&old);
            }
            if let Some(new) = n.disco_key {
                self.by_disco_key.insert(new, id);
            }
        }
        self.sync_pruned(id);
        for addr in &n.endpoints {
            self.set_endpoint_for_ip_port(*addr, id);
        }
    }

    fn remove_missing(
        &mut self,
        present: &HashSet<PublicKey>,
    ) -> Vec<(PublicKey, Option<PublicKey>)> {
        let gone: Vec<usize> = self
            .by_id
            .iter()
            .filter(|(_, ep)| !present.contains(ep.node_key()))
            .map(|(id, _)| *id)
            .collect();
        let mut removed = Vec::with_capacity(gone.len());
        for id in gone {
            if let Some(mut ep) = self.by_id.remove(&id) {
                info!(peer = %ep.node_key().fmt_short(), "peer map: peer removed");
                ep.stop_and_reset();
                self.by_node_key.remove(ep.node_key());
                self.by_handle.remove(&ep.handle());
                if let Some(dk) = ep.disco_key() {
                    self.by_disco_key.remove(&dk);
                }
                self.by_ip_port.retain(|_, v| *v != id);
                removed.push((*ep.node_key(), ep.disco_key()));
            }
        }
        removed
    }

    #[cfg(test)]
    pub(super) fn consistent(&self) -> bool {
        let ids: HashSet<usize> = self.by_id.keys().copied().collect();
        self.by_node_key.values().all(|id| ids.contains(id))
            && self.by_disco_key.values().all(|id| ids.contains(id))
            && self.by_ip_port.values().all(|id| ids.contains(id))
            && self.by_handle.values().all(|id| ids.contains(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::SecretKey;

    fn test_sender() -> mpsc::Sender<ActorMessage> {
        mpsc::channel(64).0
    }

    fn new_endpoint(disco: bool, relay: Option<u16>) -> Endpoint {
        Endpoint::new(
            0,
            Options {
                node_key: SecretKey::generate().public(),
                disco_key: disco.then(|| SecretKey::generate().public()),
                relay_region: relay,
                active: false,
            },
            test_sender(),
            Instant::now(),
        )
    }

    fn pong(ep: &mut Endpoint, from: SocketAddr, latency: Duration) {
        let tx_id = stun::TransactionId::default();
        ep.direct_addr_state.entry(from.into()).or_default();
        ep.sent_pings.insert(
            tx_id,
            SentPing {
                to: SendAddr::Udp(from),
                at: Instant::now() - latency,
                purpose: DiscoPingPurpose::Discovery,
                timer: Timer::after(PING_TIMEOUT_DURATION, async {}),
            },
        );
        let m = crate::disco::Pong {
            tx_id,
            src: "127.0.0.1:9999".parse().unwrap(),
        };
        ep.handle_pong(&m, SendAddr::Udp(from));
    }

    #[test]
    fn test_comparator_prefers_ipv6_within_ten_percent() {
        let v4 = |lat_ms: u64| AddrLatency {
            addr: "203.0.113.5:41641".parse().unwrap(),
            latency: Some(Duration::from_micros(lat_ms)),
        };
        let v6 = |lat_ms: u64| AddrLatency {
            addr: "[2001:db8::5]:41641".parse().unwrap(),
            latency: Some(Duration::from_micros(lat_ms)),
        };
        // 9ms vs 10ms: 9 * 0.9 = 8.1 < 10, promoted.
        assert!(v6(9000).is_better_than(&v4(10_000)));
        // 9.5ms vs 10ms: 8.55 < 10, still promoted.
        assert!(v6(9500).is_better_than(&v4(10_000)));
        // 11.2ms vs 10ms: 10.08 > 10, not promoted.
        assert!(!v6(11_200).is_better_than(&v4(10_000)));
        // Lower latency wins within a family.
        assert!(v4(5000).is_better_than(&v4(10_000)));
        assert!(!v4(10_000).is_better_than(&v4(5000)));
        // Same address is never better than itself.
        assert!(!v4(5000).is_better_than(&v4(5000)));
    }

    #[tokio::test]
    async fn test_pong_promotes_best_path() {
        let mut ep = new_endpoint(true, Some(1));

        // No best path yet: send goes to the relay only.
        let (udp, relay, _) = ep.get_send_addrs();
        assert_eq!(udp, None);
        assert_eq!(relay, Some(1));

        let addr: SocketAddr = "198.51.100.7:41641".parse().unwrap();
        pong(&mut ep, addr, Duration::from_millis(20));

        assert_eq!(ep.best_addr.as_ref().unwrap().addr, addr);
        assert_eq!(
            ep.best_addr.as_ref().unwrap().latency,
            Some(Duration::from_millis(20))
        );
        assert!(ep.trust_best_addr_until.is_some());

        // Subsequent sends use the direct path exclusively.
        let (udp, relay, _) = ep.get_send_addrs();
        assert_eq!(udp, Some(addr));
        assert_eq!(relay, None);
    }

    #[tokio::test]
    async fn test_expired_trust_sends_to_both() {
        let mut ep = new_endpoint(true, Some(1));
        let addr: SocketAddr = "198.51.100.7:41641".parse().unwrap();
        pong(&mut ep, addr, Duration::from_millis(20));

        // Pretend the trust window lapsed.
        ep.trust_best_addr_until = Some(Instant::now() - Duration::from_millis(1));

        let (udp, relay, actions) = ep.get_send_addrs();
        assert_eq!(udp, Some(addr));
        assert_eq!(relay, Some(1));
        // And a probe started.
        assert!(actions
            .iter()
            .any(|a| matches!(a, PingAction::SendPing { .. })));
    }

    #[tokio::test]
    async fn test_unknown_pong_is_ignored() {
        let mut ep = new_endpoint(true, Some(1));
        let m = crate::disco::Pong {
            tx_id: stun::TransactionId::default(),
            src: "10.0.0.1:1".parse().unwrap(),
        };
        let res = ep.handle_pong(&m, SendAddr::Udp("10.0.0.2:2".parse().unwrap()));
        assert!(res.is_none());
        assert!(ep.best_addr.is_none());
    }

    #[tokio::test]
    async fn test_pong_does_not_resurrect_deleted_path() {
        let mut ep = new_endpoint(true, Some(1));
        let addr: SocketAddr = "198.51.100.7:41641".parse().unwrap();
        let tx_id = stun::TransactionId::default();
        ep.direct_addr_state.entry(addr.into()).or_default();
        ep.sent_pings.insert(
            tx_id,
            SentPing {
                to: SendAddr::Udp(addr),
                at: Instant::now(),
                purpose: DiscoPingPurpose::Discovery,
                timer: Timer::after(PING_TIMEOUT_DURATION, async {}),
            },
        );
        // The path disappears (e.g. network map change) before the pong.
        ep.delete_path(addr.into());

        let m = crate::disco::Pong {
            tx_id,
            src: "127.0.0.1:9999".parse().unwrap(),
        };
        assert!(ep.handle_pong(&m, SendAddr::Udp(addr)).is_none());
        assert!(ep.best_addr.is_none());
    }

    #[tokio::test]
    async fn test_call_me_maybe_semantics() {
        let mut ep = new_endpoint(true, Some(1));
        let a1: SocketAddr = "192.0.2.1:1111".parse().unwrap();
        let a2: SocketAddr = "192.0.2.2:2222".parse().unwrap();
        let a3: SocketAddr = "192.0.2.3:3333".parse().unwrap();

        let actions = ep.handle_call_me_maybe(&crate::disco::CallMeMaybe {
            my_numbers: vec![a1, a2],
        });
        assert!(ep.direct_addr_state.contains_key(&a1.into()));
        assert!(ep.direct_addr_state.contains_key(&a2.into()));
        // Both candidates pinged immediately, no echoed call-me-maybe.
        let pings: Vec<_> = actions
            .iter()
            .filter(|a| matches!(a, PingAction::SendPing { .. }))
            .collect();
        assert_eq!(pings.len(), 2);
        assert!(!actions
            .iter()
            .any(|a| matches!(a, PingAction::EnqueueCallMeMaybe { .. })));

        // A second identical message adds nothing new.
        ep.handle_call_me_maybe(&crate::disco::CallMeMaybe {
            my_numbers: vec![a1, a2],
        });
        assert_eq!(ep.direct_addr_state.len(), 2);

        // {A2, A3}: A1 was never advertised in the network map, so it is
        // deleted; A2 stays; A3 appears.
        ep.handle_call_me_maybe(&crate::disco::CallMeMaybe {
            my_numbers: vec![a2, a3],
        });
        assert!(!ep.direct_addr_state.contains_key(&a1.into()));
        assert!(ep.direct_addr_state.contains_key(&a2.into()));
        assert!(ep.direct_addr_state.contains_key(&a3.into()));
    }

    #[tokio::test]
    async fn test_call_me_maybe_repings_within_interval() {
        let mut ep = new_endpoint(true, Some(1));
        let a1: SocketAddr = "192.0.2.1:1111".parse().unwrap();

        ep.handle_call_me_maybe(&crate::disco::CallMeMaybe {
            my_numbers: vec![a1],
        });
        // The path was pinged moments ago; a regular probe would skip it...
        assert!(ep
            .send_pings(Instant::now(), false)
            .iter()
            .all(|a| !matches!(a, PingAction::SendPing { .. })));
        // ...but a new call-me-maybe zeroes the interval.
        let actions = ep.handle_call_me_maybe(&crate::disco::CallMeMaybe {
            my_numbers: vec![a1],
        });
        assert!(actions
            .iter()
            .any(|a| matches!(a, PingAction::SendPing { .. })));
    }

    #[test]
    fn test_pong_ring_wraps() {
        let mut st = PathState::default();
        let addr: SocketAddr = "10.0.0.1:1".parse().unwrap();
        for i in 0..(PONG_HISTORY_COUNT + 5) {
            st.add_pong_reply(PongReply {
                latency: Duration::from_millis(i as u64),
                pong_at: Instant::now(),
                from: addr,
                pong_src: addr,
            });
        }
        assert_eq!(st.recent_pongs.len(), PONG_HISTORY_COUNT);
        // The most recent entry is the last one written.
        assert_eq!(
            st.recent_pong().unwrap().latency,
            Duration::from_millis((PONG_HISTORY_COUNT + 4) as u64)
        );
    }

    #[test]
    fn test_should_delete() {
        // Advertised paths stay while advertised.
        let st = PathState {
            index: Some(0),
            ..Default::default()
        };
        assert!(!st.should_delete());

        // No longer advertised, no pings, no call-me-maybe: gone.
        let st = PathState::default();
        assert!(st.should_delete());

        // Call-me-maybe paths stay.
        let st = PathState {
            call_me_maybe_time: Some(Instant::now()),
            ..Default::default()
        };
        assert!(!st.should_delete());

        // Ping-learned paths stay while pings are fresh.
        let st = PathState {
            last_got_ping: Some(Instant::now()),
            ..Default::default()
        };
        assert!(!st.should_delete());
    }

    #[tokio::test]
    async fn test_network_map_update_gc() {
        let map = PeerMap::default();
        let sender = test_sender();
        let epoch = Instant::now();
        let key = SecretKey::generate().public();
        let disco = SecretKey::generate().public();
        let ep1: SocketAddr = "192.0.2.1:1111".parse().unwrap();
        let ep2: SocketAddr = "192.0.2.2:2222".parse().unwrap();

        let nm = config::NetworkMap {
            peers: vec![config::Node {
                key,
                disco_key: Some(disco),
                relay_region: Some(1),
                endpoints: vec![ep1, ep2],
            }],
        };
        map.apply_network_map(&nm, &sender, epoch);
        assert_eq!(map.node_count(), 1);
        assert!(map.receive_udp(ep1).is_some());
        assert!(map.receive_udp(ep2).is_some());

        // ep2 disappears from the advertised list; its path and index entry
        // must go with it.
        let nm = config::NetworkMap {
            peers: vec![config::Node {
                key,
                disco_key: Some(disco),
                relay_region: Some(1),
                endpoints: vec![ep1],
            }],
        };
        map.apply_network_map(&nm, &sender, epoch);
        assert!(map.receive_udp(ep1).is_some());
        assert!(map.receive_udp(ep2).is_none());
        map.read(|inner| assert!(inner.consistent()));

        // The peer disappears entirely.
        let removed = map.apply_network_map(&config::NetworkMap::default(), &sender, epoch);
        assert_eq!(removed, vec![(key, Some(disco))]);
        assert_eq!(map.node_count(), 0);
        assert!(map.receive_udp(ep1).is_none());
        map.read(|inner| assert!(inner.consistent()));
    }

    #[tokio::test]
    async fn test_stop_generation_bumps_on_reset() {
        let mut ep = new_endpoint(true, None);
        let before = ep.stop_generation();
        ep.stop_and_reset();
        assert_eq!(ep.stop_generation(), before + 1);
    }

    #[tokio::test]
    async fn test_disco_key_change_resets_state() {
        let map = PeerMap::default();
        let sender = test_sender();
        let epoch = Instant::now();
        let key = SecretKey::generate().public();
        let disco_a = SecretKey::generate().public();
        let disco_b = SecretKey::generate().public();

        let node = |dk| config::Node {
            key,
            disco_key: Some(dk),
            relay_region: None,
            endpoints: vec![],
        };
        map.apply_network_map(
            &config::NetworkMap {
                peers: vec![node(disco_a)],
            },
            &sender,
            epoch,
        );
        map.read(|inner| {
            assert!(inner.endpoint_for_disco_key(&disco_a).is_some());
        });

        map.apply_network_map(
            &config::NetworkMap {
                peers: vec![node(disco_b)],
            },
            &sender,
            epoch,
        );
        map.read(|inner| {
            assert!(inner.endpoint_for_disco_key(&disco_a).is_none());
            assert!(inner.endpoint_for_disco_key(&disco_b).is_some());
            assert!(inner.consistent());
        });
    }

    #[tokio::test]
    async fn test_record_recv_throttles_hook() {
        let ep = new_endpoint(true, None);
        // First receive fires the hook, an immediate second one does not.
        assert!(ep.record_recv());
        std::thread::sleep(Duration::from_millis(2));
        assert!(!ep.record_recv());
    }
}
