//! The per-socket reader tasks: classify every inbound datagram.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::{disco, netprobe, stun};

use super::endpoint::RecvTracker;
use super::rebinding_conn::RebindingUdpConn;
use super::{ActorMessage, Inner, PeerHandle, SendAddr};

/// Largest datagram we accept; everything above is relay-framed anyway.
const RECV_BUF_SIZE: usize = 1 << 16;

/// One-slot cache avoiding the peer map lookup for runs of packets from the
/// same source address.
#[derive(Debug, Default)]
struct IppCache {
    inner: Option<CachedSource>,
}

#[derive(Debug)]
struct CachedSource {
    addr: SocketAddr,
    handle: PeerHandle,
    node_key: crate::key::PublicKey,
    /// The peer's stop generation at cache time; a later generation means
    /// the peer was reset or replaced and the entry is stale.
    gen: u64,
    tracker: RecvTracker,
}

impl IppCache {
    fn get(&self, src: SocketAddr) -> Option<(PeerHandle, crate::key::PublicKey, bool)> {
        let c = self.inner.as_ref()?;
        if c.addr == src && c.tracker.stop_generation() == c.gen {
            Some((c.handle, c.node_key, c.tracker.record()))
        } else {
            None
        }
    }

    fn put(&mut self, src: SocketAddr, info: &super::endpoint::RecvInfo) {
        self.inner = Some(CachedSource {
            addr: src,
            handle: info.handle,
            node_key: info.node_key,
            gen: info.tracker.stop_generation(),
            tracker: info.tracker.clone(),
        });
    }
}

/// Reads one UDP socket forever, routing datagrams to the prober, the
/// discovery handler or the payload stream.
pub(super) struct UdpActor {
    conn: Arc<Inner>,
    pconn: RebindingUdpConn,
    net_probe: netprobe::Client,
    actor_sender: mpsc::Sender<ActorMessage>,
    payload_sender: flume::Sender<(Bytes, PeerHandle)>,
    cache: IppCache,
}

impl UdpActor {
    pub(super) fn new(
        conn: Arc<Inner>,
        pconn: RebindingUdpConn,
        net_probe: netprobe::Client,
        actor_sender: mpsc::Sender<ActorMessage>,
        payload_sender: flume::Sender<(Bytes, PeerHandle)>,
    ) -> Self {
        UdpActor {
            conn,
            pconn,
            net_probe,
            actor_sender,
            payload_sender,
            cache: IppCache::default(),
        }
    }

    pub(super) async fn run(mut self, cancel: CancellationToken) {
        let mut buf = vec![0u8; RECV_BUF_SIZE];
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    trace!("reader cancelled");
                    break;
                }
                res = self.pconn.recv_from(&mut buf) => {
                    match res {
                        Ok((n, src)) => {
                            self.process_packet(&buf[..n], src).await;
                        }
                        Err(err) => {
                            if self.conn.is_closed() {
                                break;
                            }
                            warn!("recv error: {err:#}");
                            // Give a rebind a moment before retrying.
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                    }
                }
            }
        }
    }

    async fn process_packet(&mut self, msg: &[u8], src: SocketAddr) {
        trace!(len = msg.len(), %src, "received datagram");

        if stun::is(msg) {
            self.net_probe
                .receive_stun_packet(Bytes::copy_from_slice(msg), src);
            return;
        }

        if let Some((sender, sealed_box)) = disco::source_and_box(msg) {
            self.actor_sender
                .send(ActorMessage::ReceiveDisco {
                    sender,
                    sealed_box: sealed_box.to_vec(),
                    src: SendAddr::Udp(src),
                    relay_node_src: None,
                })
                .await
                .ok();
            return;
        }

        // Tunnel payload from here on.
        if !self.conn.has_tunnel_key() {
            // Logged out; the upper layer would reject it anyway.
            trace!(%src, "dropping payload, no tunnel key installed");
            return;
        }

        let (handle, node_key, fire_hook) = match self.cache.get(src) {
            Some(hit) => hit,
            None => match self.conn.peer_map.receive_udp(src) {
                Some(info) => {
                    let hit = (info.handle, info.node_key, info.fire_activity_hook);
                    self.cache.put(src, &info);
                    hit
                }
                None => {
                    warn!(%src, "no peer state found for source, dropping payload");
                    return;
                }
            },
        };

        if fire_hook {
            if let Some(ref hook) = self.conn.callbacks.on_note_recv_activity {
                hook(&node_key);
            }
        }

        if !self.conn.bound() {
            trace!(%src, "payload delivery is off, dropping packet");
            return;
        }
        // Drop rather than block when the upper layer is not consuming.
        if self
            .payload_sender
            .try_send((Bytes::copy_from_slice(msg), handle))
            .is_err()
        {
            trace!(%src, "payload receiver not keeping up, dropping packet");
        }
    }
}
