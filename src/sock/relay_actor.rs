//! The relay multiplexer: one long-lived connection per active region.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use backoff::backoff::Backoff;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::key::PublicKey;
use crate::relay::{self, ClientError, ReceivedMessage};

use super::{ActorMessage, Inner};

/// How long a non-home relay connection needs to be idle (last written to)
/// before we close it.
const RELAY_INACTIVE_CLEANUP_TIME: Duration = Duration::from_secs(60);

/// How often the stale-connection sweep runs while non-home connections
/// exist.
const RELAY_CLEAN_STALE_INTERVAL: Duration = Duration::from_secs(15);

/// Writes queued per relay connection; further sends drop.
pub(super) const RELAY_WRITES_BEFORE_DROP: usize = 32;

/// A write forwarded to the relay is abandoned (and the connection torn
/// down) if it does not complete within this.
const RELAY_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// A packet for a peer, queued towards one relay connection's writer.
#[derive(Debug)]
pub(crate) struct RelayWriteRequest {
    pub(crate) peer: PublicKey,
    pub(crate) contents: Bytes,
}

/// The warm-path handle to one relay connection's write queue.
#[derive(Debug, Clone)]
pub(crate) struct RelayWriteChannel {
    /// Identifies the connection instance; reverse routes referring to an
    /// older instance are invalid.
    pub(crate) conn_id: u64,
    pub(crate) sender: mpsc::Sender<RelayWriteRequest>,
}

/// Write queues of the open relay connections, shared with the send path.
pub(crate) type RelayWriteChannels = Arc<Mutex<HashMap<u16, RelayWriteChannel>>>;

/// Where we last heard from a peer, an optimization to answer via the relay
/// connection the peer used to reach us instead of dialing its home.
///
/// Never used for ownership, only lookup; entries are validated against the
/// connection instance id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RelayRoute {
    pub(super) region_id: u16,
    pub(crate) conn_id: u64,
}

pub(crate) type RelayRoutes = Arc<Mutex<HashMap<PublicKey, RelayRoute>>>;

/// Outcome of a warm-path relay send attempt.
#[derive(Debug, PartialEq, Eq)]
pub(super) enum RelayTrySend {
    Sent,
    /// The connection's write queue is saturated; the packet was dropped.
    QueueFull,
    /// No open connection; the caller must go through the actor.
    NoChannel,
}

/// Queues `contents` on an already-open relay connection, preferring the
/// reverse route for `peer` over the requested region.
pub(super) fn try_send_relay(
    channels: &RelayWriteChannels,
    routes: &RelayRoutes,
    region_id: u16,
    peer: PublicKey,
    contents: Bytes,
) -> RelayTrySend {
    let sender = {
        let channels = channels.lock();
        let route = routes.lock().get(&peer).copied();
        let via_route = route.and_then(|route| {
            channels
                .get(&route.region_id)
                .filter(|c| c.conn_id == route.conn_id)
        });
        match via_route.or_else(|| channels.get(&region_id)) {
            Some(channel) => channel.sender.clone(),
            None => return RelayTrySend::NoChannel,
        }
    };
    match sender.try_send(RelayWriteRequest { peer, contents }) {
        Ok(()) => RelayTrySend::Sent,
        Err(mpsc::error::TrySendError::Full(_)) => RelayTrySend::QueueFull,
        Err(mpsc::error::TrySendError::Closed(_)) => RelayTrySend::NoChannel,
    }
}

#[derive(Debug)]
pub(super) enum RelayActorMessage {
    /// Cold-path send: connect to the region if needed, then forward.
    Send {
        region_id: u16,
        peer: PublicKey,
        contents: Bytes,
    },
    /// Make sure a connection to the region exists.
    Connect {
        region_id: u16,
        peer: Option<PublicKey>,
    },
    /// The home region changed; inform all open connections.
    NotePreferred(u16),
    /// Close every open connection, but keep running.
    CloseAll(&'static str),
    /// Tear down one region's connection; reconnect if it is home.
    CloseOrReconnect(u16, &'static str),
    Shutdown,
}

#[derive(Debug)]
enum ActiveRelayMessage {
    GetLastWrite(oneshot::Sender<Instant>),
    NotePreferred(bool),
    Shutdown,
}

struct ActiveRelayHandle {
    conn_id: u64,
    inbox: mpsc::Sender<ActiveRelayMessage>,
    task: JoinHandle<()>,
}

pub(super) struct RelayActor {
    conn: Arc<Inner>,
    msg_sender: mpsc::Sender<ActorMessage>,
    active_relay: HashMap<u16, ActiveRelayHandle>,
    next_conn_id: u64,
}

impl RelayActor {
    pub(super) fn new(conn: Arc<Inner>, msg_sender: mpsc::Sender<ActorMessage>) -> Self {
        RelayActor {
            conn,
            msg_sender,
            active_relay: HashMap::new(),
            next_conn_id: 0,
        }
    }

    pub(super) async fn run(mut self, mut receiver: mpsc::Receiver<RelayActorMessage>) {
        let mut cleanup_timer = time::interval_at(
            time::Instant::now() + RELAY_CLEAN_STALE_INTERVAL,
            RELAY_CLEAN_STALE_INTERVAL,
        );

        loop {
            tokio::select! {
                Some(msg) = receiver.recv() => {
                    match msg {
                        RelayActorMessage::Send { region_id, peer, contents } => {
                            self.send_relay(region_id, peer, contents).await;
                        }
                        RelayActorMessage::Connect { region_id, peer } => {
                            self.connect_relay(region_id, peer.as_ref()).await;
                        }
                        RelayActorMessage::NotePreferred(home) => {
                            self.note_preferred(home).await;
                        }
                        RelayActorMessage::CloseAll(why) => {
                            self.close_all_relay(why).await;
                        }
                        RelayActorMessage::CloseOrReconnect(region_id, why) => {
                            self.close_or_reconnect_relay(region_id, why).await;
                        }
                        RelayActorMessage::Shutdown => {
                            debug!("shutting down");
                            self.close_all_relay("conn-close").await;
                            break;
                        }
                    }
                }
                _ = cleanup_timer.tick() => {
                    trace!("tick: cleanup");
                    self.clean_stale_relay().await;
                }
                else => {
                    trace!("shutting down relay recv loop");
                    break;
                }
            }
        }
    }

    async fn note_preferred(&self, home: u16) {
        futures::future::join_all(self.active_relay.iter().map(|(region_id, handle)| {
            let is_preferred = *region_id == home;
            async move {
                handle
                    .inbox
                    .send(ActiveRelayMessage::NotePreferred(is_preferred))
                    .await
                    .ok()
            }
        }))
        .await;
    }

    async fn send_relay(&mut self, region_id: u16, peer: PublicKey, contents: Bytes) {
        trace!(region_id, peer = %peer.fmt_short(), len = contents.len(), "send relay");
        if !self.conn.relay_map().contains_region(region_id) {
            warn!("unknown region id {}", region_id);
            return;
        }
        self.connect_relay(region_id, Some(&peer)).await;
        match try_send_relay(
            &self.conn.relay_channels,
            &self.conn.relay_routes,
            region_id,
            peer,
            contents,
        ) {
            RelayTrySend::Sent => {}
            RelayTrySend::QueueFull => {
                warn!(region_id, "relay write queue full, dropping packet");
            }
            RelayTrySend::NoChannel => {
                warn!(region_id, "no relay connection, dropping packet");
            }
        }
    }

    /// Ensures a connection serving `region_id` (or a reverse route to
    /// `peer`) exists.
    async fn connect_relay(&mut self, region_id: u16, peer: Option<&PublicKey>) {
        // A reverse route to the peer on a live connection is good enough.
        if let Some(peer) = peer {
            let route = self.conn.relay_routes.lock().get(peer).copied();
            if let Some(route) = route {
                if let Some(handle) = self.active_relay.get(&route.region_id) {
                    if handle.conn_id == route.conn_id {
                        return;
                    }
                }
            }
        }

        if self.active_relay.contains_key(&region_id) {
            return;
        }

        let Some(region) = self.conn.relay_map().get_region(region_id).cloned() else {
            warn!(region_id, "connect to unknown region requested");
            return;
        };
        let Some(node) = region.dial_node().cloned() else {
            warn!(region_id, "region has no dialable relay node");
            return;
        };

        let why = match peer {
            Some(peer) => peer.fmt_short(),
            None => "home-keep-alive".to_string(),
        };
        info!(region_id, "adding relay connection for {why}");

        let my_relay = self.conn.my_relay();
        let (client, client_receiver) = relay::ClientBuilder::new(node)
            .can_ack_pings(true)
            .is_preferred(my_relay == region_id)
            .build(self.conn.disco_secret_key.clone());

        let conn_id = self.next_conn_id;
        self.next_conn_id += 1;

        let (write_tx, write_rx) = mpsc::channel(RELAY_WRITES_BEFORE_DROP);
        self.conn.relay_channels.lock().insert(
            region_id,
            RelayWriteChannel {
                conn_id,
                sender: write_tx,
            },
        );

        let (inbox_tx, inbox_rx) = mpsc::channel(64);
        let active = ActiveRelay {
            region_id,
            conn_id,
            client: client.clone(),
            client_receiver,
            msg_sender: self.msg_sender.clone(),
            routes: self.conn.relay_routes.clone(),
            last_write: Arc::new(Mutex::new(Instant::now())),
            peer_present: HashSet::new(),
        };
        let task = tokio::task::spawn(
            async move {
                active.run(inbox_rx, write_rx).await;
            }
            .instrument(info_span!("active-relay", %region_id)),
        );

        self.active_relay.insert(
            region_id,
            ActiveRelayHandle {
                conn_id,
                inbox: inbox_tx,
                task,
            },
        );

        if let Some(ref f) = self.conn.callbacks.on_relay_active {
            f();
        }
    }

    async fn close_or_reconnect_relay(&mut self, region_id: u16, why: &'static str) {
        self.close_relay(region_id, why).await;
        if self.conn.my_relay() == region_id {
            self.connect_relay(region_id, None).await;
        }
    }

    async fn clean_stale_relay(&mut self) {
        let home = self.conn.my_relay();
        if !self.active_relay.keys().any(|region| *region != home) {
            return;
        }
        trace!("checking {} relays for staleness", self.active_relay.len());
        let now = Instant::now();

        let mut to_close = Vec::new();
        for (region_id, handle) in &self.active_relay {
            if *region_id == home {
                continue;
            }
            let (os, or) = oneshot::channel();
            let stale = match handle.inbox.send(ActiveRelayMessage::GetLastWrite(os)).await {
                Ok(()) => match or.await {
                    Ok(last_write) => {
                        now.duration_since(last_write) > RELAY_INACTIVE_CLEANUP_TIME
                    }
                    Err(_) => true,
                },
                Err(_) => true,
            };
            if stale {
                to_close.push(*region_id);
            }
        }

        trace!(
            "closing {} of {} relays",
            to_close.len(),
            self.active_relay.len()
        );
        for region_id in to_close {
            self.close_relay(region_id, "idle").await;
        }
    }

    async fn close_all_relay(&mut self, why: &'static str) {
        if self.active_relay.is_empty() {
            return;
        }
        let regions: Vec<_> = self.active_relay.keys().copied().collect();
        for region in regions {
            self.close_relay(region, why).await;
        }
    }

    async fn close_relay(&mut self, region_id: u16, why: &'static str) {
        if let Some(handle) = self.active_relay.remove(&region_id) {
            debug!(region_id, "closing connection: {}", why);

            {
                let mut channels = self.conn.relay_channels.lock();
                if channels
                    .get(&region_id)
                    .map(|c| c.conn_id == handle.conn_id)
                    .unwrap_or_default()
                {
                    channels.remove(&region_id);
                }
            }
            self.conn
                .relay_routes
                .lock()
                .retain(|_, route| route.conn_id != handle.conn_id);

            // Cancel first, then wait for the task to acknowledge, then the
            // underlying connection goes with it.
            handle.inbox.send(ActiveRelayMessage::Shutdown).await.ok();
            let mut task = handle.task;
            if time::timeout(Duration::from_secs(1), &mut task).await.is_err() {
                debug!(region_id, "relay task did not stop in time, aborting");
                task.abort();
            }
        }
    }
}

/// One open relay connection, driven by its own reader task plus a writer
/// task consuming the bounded write queue.
struct ActiveRelay {
    region_id: u16,
    conn_id: u64,
    client: relay::Client,
    client_receiver: relay::ClientReceiver,
    msg_sender: mpsc::Sender<ActorMessage>,
    routes: RelayRoutes,
    /// The time of the last write on this connection.
    last_write: Arc<Mutex<Instant>>,
    /// Senders we have seen on this connection, for reverse routes.
    peer_present: HashSet<PublicKey>,
}

#[derive(Debug, PartialEq, Eq)]
enum ReadResult {
    Break,
    Continue,
}

impl ActiveRelay {
    async fn run(
        mut self,
        mut inbox: mpsc::Receiver<ActiveRelayMessage>,
        write_rx: mpsc::Receiver<RelayWriteRequest>,
    ) {
        let mut backoff = backoff::exponential::ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(10))
            .with_max_interval(Duration::from_secs(5))
            .with_max_elapsed_time(None)
            .build();

        let writer = RelayWriter {
            client: self.client.clone(),
            last_write: self.last_write.clone(),
        };
        let _writer_task: crate::util::AbortingJoinHandle<()> = tokio::task::spawn(
            writer
                .run(write_rx)
                .instrument(info_span!("active-relay.writer")),
        )
        .into();

        if !self.connect_with_backoff(&mut inbox, &mut backoff).await {
            return;
        }

        loop {
            tokio::select! {
                Some(msg) = inbox.recv() => {
                    match msg {
                        ActiveRelayMessage::GetLastWrite(r) => {
                            r.send(*self.last_write.lock()).ok();
                        }
                        ActiveRelayMessage::NotePreferred(is_preferred) => {
                            self.client.note_preferred(is_preferred).await;
                        }
                        ActiveRelayMessage::Shutdown => {
                            self.forget_routes();
                            self.client.close().await;
                            break;
                        }
                    }
                }
                msg = self.client_receiver.recv() => {
                    match self.handle_relay_msg(msg).await {
                        ReadResult::Continue => {
                            backoff.reset();
                        }
                        ReadResult::Break => {
                            // The connection is broken: maybe our network
                            // conditions changed, get a fresh look at them.
                            self.forget_routes();
                            self.msg_sender
                                .send(ActorMessage::ReProbe("relay-recv-error"))
                                .await
                                .ok();
                            self.client.disconnect().await;
                            if !self.connect_with_backoff(&mut inbox, &mut backoff).await {
                                break;
                            }
                        }
                    }
                }
                else => break,
            }
        }
    }

    /// (Re)establishes the connection, sleeping between attempts.
    ///
    /// Returns false if a shutdown arrived while waiting.
    async fn connect_with_backoff(
        &mut self,
        inbox: &mut mpsc::Receiver<ActiveRelayMessage>,
        backoff: &mut backoff::exponential::ExponentialBackoff<backoff::SystemClock>,
    ) -> bool {
        loop {
            match self.client.connect().await {
                Ok(_) => return true,
                Err(err) => {
                    warn!("connection failed: {err:#}");
                    let pause = backoff
                        .next_backoff()
                        .unwrap_or(Duration::from_secs(5));
                    debug!("backoff sleep: {}ms", pause.as_millis());
                    tokio::select! {
                        _ = time::sleep(pause) => {}
                        msg = inbox.recv() => {
                            match msg {
                                Some(ActiveRelayMessage::Shutdown) | None => {
                                    self.client.close().await;
                                    return false;
                                }
                                Some(ActiveRelayMessage::GetLastWrite(r)) => {
                                    r.send(*self.last_write.lock()).ok();
                                }
                                Some(ActiveRelayMessage::NotePreferred(p)) => {
                                    self.client.note_preferred(p).await;
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    async fn handle_relay_msg(
        &mut self,
        msg: Result<(ReceivedMessage, usize), ClientError>,
    ) -> ReadResult {
        match msg {
            Err(ClientError::Closed) => ReadResult::Break,
            Err(err) => {
                warn!("recv error: {err:#}");
                ReadResult::Break
            }
            Ok((msg, _conn_gen)) => match msg {
                ReceivedMessage::ReceivedPacket { source, data } => {
                    trace!(len = %data.len(), "received msg");
                    // A new sender on this connection: remember the reverse
                    // route.
                    if self.peer_present.insert(source) {
                        self.routes.lock().insert(
                            source,
                            RelayRoute {
                                region_id: self.region_id,
                                conn_id: self.conn_id,
                            },
                        );
                    }
                    self.msg_sender
                        .send(ActorMessage::ReceiveRelay {
                            region_id: self.region_id,
                            src: source,
                            buf: data,
                        })
                        .await
                        .ok();
                    ReadResult::Continue
                }
                ReceivedMessage::Ping(data) => {
                    // Best effort reply.
                    let client = self.client.clone();
                    tokio::task::spawn(async move {
                        if let Err(err) = client.send_pong(data).await {
                            warn!("pong error: {err:#}");
                        }
                    });
                    ReadResult::Continue
                }
                ReceivedMessage::Health { problem } => {
                    if let Some(problem) = problem {
                        warn!(region_id = self.region_id, "relay server unhealthy: {problem}");
                    }
                    ReadResult::Continue
                }
                ReceivedMessage::PeerGone(key) => {
                    self.peer_present.remove(&key);
                    let mut routes = self.routes.lock();
                    if routes
                        .get(&key)
                        .map(|r| r.conn_id == self.conn_id)
                        .unwrap_or_default()
                    {
                        routes.remove(&key);
                    }
                    ReadResult::Continue
                }
                ReceivedMessage::ServerRestarting => ReadResult::Break,
                ReceivedMessage::Pong(_) | ReceivedMessage::KeepAlive => ReadResult::Continue,
            },
        }
    }

    fn forget_routes(&mut self) {
        let peers: Vec<_> = self.peer_present.drain().collect();
        if peers.is_empty() {
            return;
        }
        let mut routes = self.routes.lock();
        for peer in peers {
            if routes
                .get(&peer)
                .map(|r| r.conn_id == self.conn_id)
                .unwrap_or_default()
            {
                routes.remove(&peer);
            }
        }
    }
}

/// Consumes one connection's write queue.
struct RelayWriter {
    client: relay::Client,
    last_write: Arc<Mutex<Instant>>,
}

impl RelayWriter {
    async fn run(self, mut write_rx: mpsc::Receiver<RelayWriteRequest>) {
        while let Some(req) = write_rx.recv().await {
            *self.last_write.lock() = Instant::now();
            match time::timeout(
                RELAY_WRITE_TIMEOUT,
                self.client.send(req.peer, req.contents),
            )
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    debug!("relay write failed: {err:#}");
                }
                Err(_) => {
                    // The connection is wedged; tear it down so the reader
                    // reconnects.
                    warn!("relay write timed out, dropping connection");
                    self.client.disconnect().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::SecretKey;

    fn channels_with(region: u16, conn_id: u64, cap: usize) -> (RelayWriteChannels, mpsc::Receiver<RelayWriteRequest>) {
        let (tx, rx) = mpsc::channel(cap);
        let channels: RelayWriteChannels = Default::default();
        channels.lock().insert(
            region,
            RelayWriteChannel {
                conn_id,
                sender: tx,
            },
        );
        (channels, rx)
    }

    #[tokio::test]
    async fn test_write_queue_drops_packet_33() {
        let (channels, _rx) = channels_with(1, 0, RELAY_WRITES_BEFORE_DROP);
        let routes: RelayRoutes = Default::default();
        let peer = SecretKey::generate().public();

        // The writer never consumes: the first 32 sends are queued, the
        // 33rd is dropped with a queue-full outcome.
        for i in 0..RELAY_WRITES_BEFORE_DROP {
            let outcome = try_send_relay(
                &channels,
                &routes,
                1,
                peer,
                Bytes::from(format!("packet-{i}")),
            );
            assert_eq!(outcome, RelayTrySend::Sent, "send {i}");
        }
        let outcome = try_send_relay(&channels, &routes, 1, peer, Bytes::from_static(b"overflow"));
        assert_eq!(outcome, RelayTrySend::QueueFull);
    }

    #[tokio::test]
    async fn test_reverse_route_preferred_when_valid() {
        let (channels, mut rx_home) = channels_with(1, 7, 4);
        // Also an open connection to region 2, the peer's home.
        let (tx2, mut rx2) = mpsc::channel(4);
        channels.lock().insert(
            2,
            RelayWriteChannel {
                conn_id: 8,
                sender: tx2,
            },
        );

        let routes: RelayRoutes = Default::default();
        let peer = SecretKey::generate().public();
        routes.lock().insert(
            peer,
            RelayRoute {
                region_id: 1,
                conn_id: 7,
            },
        );

        // Addressed at region 2, but the reverse route wins.
        let outcome = try_send_relay(&channels, &routes, 2, peer, Bytes::from_static(b"hi"));
        assert_eq!(outcome, RelayTrySend::Sent);
        assert!(rx_home.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());

        // A stale route (connection replaced) falls back to the addressed
        // region.
        routes.lock().insert(
            peer,
            RelayRoute {
                region_id: 1,
                conn_id: 99,
            },
        );
        let outcome = try_send_relay(&channels, &routes, 2, peer, Bytes::from_static(b"hi"));
        assert_eq!(outcome, RelayTrySend::Sent);
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_no_channel_reported() {
        let channels: RelayWriteChannels = Default::default();
        let routes: RelayRoutes = Default::default();
        let peer = SecretKey::generate().public();
        let outcome = try_send_relay(&channels, &routes, 1, peer, Bytes::from_static(b"hi"));
        assert_eq!(outcome, RelayTrySend::NoChannel);
    }
}
