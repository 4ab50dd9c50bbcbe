//! Checks the network conditions from the current host.
//!
//! A probe run sends STUN binding requests from the live sockets to the
//! STUN servers of every configured relay region and condenses the replies
//! into a [`Report`]: per-region latencies, our publicly visible addresses,
//! whether the NAT mapping varies by destination and the region closest
//! to us.
//!
//! The sockets used to send the probes also carry real traffic, so this
//! module never reads from them. STUN replies must be handed over via
//! [`Client::receive_stun_packet`].

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};
use tracing::{debug, info_span, trace, warn, Instrument};

use crate::relay::RelayMap;
use crate::stun;
use crate::util::CancelOnDrop;

/// How long the probe phase is allowed to take overall.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Stickiness margin for the home region: a new region must beat the
/// previous home by more than this to displace it.
const PREFERRED_RELAY_FLAP_MARGIN: Duration = Duration::from_millis(10);

/// A report of the current network conditions.
#[derive(Default, Debug, PartialEq, Eq, Clone)]
pub struct Report {
    /// A UDP STUN round trip completed.
    pub udp: bool,
    /// An IPv4 STUN round trip completed.
    pub ipv4: bool,
    /// An IPv6 STUN round trip completed.
    pub ipv6: bool,
    /// An IPv4 packet was able to be sent at all.
    pub ipv4_can_send: bool,
    /// An IPv6 packet was able to be sent at all.
    pub ipv6_can_send: bool,
    /// Whether STUN results depend on which server we talk to (on IPv4).
    pub mapping_varies_by_dest_ip: Option<bool>,
    /// The region with the lowest latency; `0` for unknown.
    pub preferred_relay: u16,
    /// Lowest latency per region, either family.
    pub region_latency: RegionLatencies,
    /// Lowest IPv4 latency per region.
    pub region_v4_latency: RegionLatencies,
    /// Lowest IPv6 latency per region.
    pub region_v6_latency: RegionLatencies,
    /// ip:port of our IPv4 address as visible to the internet.
    pub global_v4: Option<SocketAddr>,
    /// `[ip]:port` of our global IPv6 address, if any.
    pub global_v6: Option<SocketAddr>,
    /// Result of the port mapping probe, when one was requested.
    pub portmap_probe: Option<crate::portmapper::ProbeOutput>,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self, f)
    }
}

/// Latencies per relay region.
#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct RegionLatencies(HashMap<u16, Duration>);

impl RegionLatencies {
    fn new() -> Self {
        Default::default()
    }

    /// Updates a region's latency, if it is faster than before.
    fn update_region(&mut self, region_id: u16, latency: Duration) {
        let val = self.0.entry(region_id).or_insert(latency);
        if latency < *val {
            *val = latency;
        }
    }

    /// Merges another [`RegionLatencies`] into this one.
    fn merge(&mut self, other: &RegionLatencies) {
        for (region_id, latency) in other.iter() {
            self.update_region(region_id, latency);
        }
    }

    /// Returns an iterator over all the regions and their latencies.
    pub fn iter(&self) -> impl Iterator<Item = (u16, Duration)> + '_ {
        self.0.iter().map(|(k, v)| (*k, *v))
    }

    /// Is any latency recorded?
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The latency of a single region, if known.
    pub fn get(&self, region_id: u16) -> Option<Duration> {
        self.0.get(&region_id).copied()
    }
}

/// Client to run network probes.
///
/// Creating this creates an actor which runs in the background. It is idle
/// unless [`Client::get_report`] is called. The client can be cloned; when
/// all clones are dropped the actor stops.
#[derive(Debug, Clone)]
pub struct Client {
    addr: mpsc::Sender<Message>,
    _drop_guard: Arc<CancelOnDrop>,
}

impl Client {
    /// Creates a new probe client with its background actor.
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel(256);
        let mut actor = Actor {
            receiver,
            sender: sender.clone(),
            in_flight: HashMap::new(),
            current: None,
            last_report: None,
        };
        let task = tokio::spawn(
            async move { actor.run().await }.instrument(info_span!("netprobe.actor")),
        );
        Client {
            addr: sender,
            _drop_guard: Arc::new(CancelOnDrop::new("netprobe actor", task.abort_handle())),
        }
    }

    /// Passes a received STUN packet to the prober.
    ///
    /// Safe to call with stray STUN packets; unknown transactions are
    /// ignored.
    pub fn receive_stun_packet(&self, payload: Bytes, src: SocketAddr) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.addr.try_send(Message::StunPacket {
            payload,
            from_addr: src,
        }) {
            warn!("dropping stun packet from {}", src);
        }
    }

    /// Runs a probe, returning the report.
    ///
    /// `sock_v4` and `sock_v6` are the live sockets to send probes from.
    /// This function never reads from them; pass the replies in via
    /// [`Client::receive_stun_packet`].
    pub async fn get_report(
        &self,
        relay_map: RelayMap,
        sock_v4: Option<Arc<UdpSocket>>,
        sock_v6: Option<Arc<UdpSocket>>,
    ) -> Result<Arc<Report>> {
        let (tx, rx) = oneshot::channel();
        self.addr
            .send(Message::RunCheck {
                relay_map,
                sock_v4,
                sock_v6,
                response_tx: tx,
            })
            .await?;
        match rx.await {
            Ok(res) => res,
            Err(_) => Err(anyhow!("channel closed, actor awol")),
        }
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

/// An in-flight STUN transaction.
#[derive(Debug)]
struct Inflight {
    /// The time the probe was sent.
    start: Instant,
    /// Where the reply latency and mapped address go.
    s: oneshot::Sender<(Duration, SocketAddr)>,
}

#[derive(derive_more::Debug)]
enum Message {
    RunCheck {
        relay_map: RelayMap,
        #[debug("sock_v4")]
        sock_v4: Option<Arc<UdpSocket>>,
        #[debug("sock_v6")]
        sock_v6: Option<Arc<UdpSocket>>,
        #[debug("response_tx")]
        response_tx: oneshot::Sender<Result<Arc<Report>>>,
    },
    StunPacket {
        payload: Bytes,
        from_addr: SocketAddr,
    },
    InFlightStun(stun::TransactionId, Inflight),
    ReportReady(Box<Report>),
}

struct Actor {
    receiver: mpsc::Receiver<Message>,
    sender: mpsc::Sender<Message>,
    in_flight: HashMap<stun::TransactionId, Inflight>,
    current: Option<oneshot::Sender<Result<Arc<Report>>>>,
    last_report: Option<Arc<Report>>,
}

impl Actor {
    async fn run(&mut self) {
        while let Some(msg) = self.receiver.recv().await {
            match msg {
                Message::RunCheck {
                    relay_map,
                    sock_v4,
                    sock_v6,
                    response_tx,
                } => {
                    if self.current.is_some() {
                        response_tx
                            .send(Err(anyhow!("probe already running")))
                            .ok();
                        continue;
                    }
                    self.current = Some(response_tx);
                    let sender = self.sender.clone();
                    let last = self.last_report.clone();
                    tokio::spawn(
                        async move {
                            let report =
                                run_probe(relay_map, sock_v4, sock_v6, sender.clone(), last).await;
                            sender.send(Message::ReportReady(Box::new(report))).await.ok();
                        }
                        .instrument(info_span!("netprobe.probe")),
                    );
                }
                Message::StunPacket { payload, from_addr } => {
                    self.handle_stun_packet(&payload, from_addr);
                }
                Message::InFlightStun(txn, inflight) => {
                    self.in_flight.insert(txn, inflight);
                }
                Message::ReportReady(report) => {
                    let report = Arc::new(*report);
                    self.last_report = Some(report.clone());
                    self.in_flight.clear();
                    if let Some(response_tx) = self.current.take() {
                        response_tx.send(Ok(report)).ok();
                    }
                }
            }
        }
    }

    fn handle_stun_packet(&mut self, payload: &[u8], src: SocketAddr) {
        trace!(len = payload.len(), %src, "received STUN packet");
        match stun::parse_response(payload) {
            Ok((txn, addr)) => {
                if let Some(inflight) = self.in_flight.remove(&txn) {
                    let elapsed = inflight.start.elapsed();
                    inflight.s.send((elapsed, addr)).ok();
                } else {
                    debug!(?txn, "received STUN response for unknown transaction");
                }
            }
            Err(err) => {
                trace!(%src, "received invalid STUN response: {err:#}");
            }
        }
    }
}

/// The result of probing one region over one family.
#[derive(Debug)]
struct ProbeResult {
    region_id: u16,
    is_v4: bool,
    send_ok: bool,
    latency: Option<Duration>,
    mapped_addr: Option<SocketAddr>,
}

async fn run_probe(
    relay_map: RelayMap,
    sock_v4: Option<Arc<UdpSocket>>,
    sock_v6: Option<Arc<UdpSocket>>,
    actor: mpsc::Sender<Message>,
    last_report: Option<Arc<Report>>,
) -> Report {
    let mut waiters = Vec::new();

    for region in relay_map.regions() {
        let Some(node) = region
            .nodes
            .iter()
            .find(|n| n.stun_port != 0)
        else {
            continue;
        };
        for (is_v4, sock) in [(true, &sock_v4), (false, &sock_v6)] {
            let Some(sock) = sock else { continue };
            let Some(dst) = resolve_stun_addr(node, is_v4).await else {
                continue;
            };
            let txn = stun::TransactionId::default();
            let (s, r) = oneshot::channel();
            if actor
                .send(Message::InFlightStun(txn, Inflight {
                    start: Instant::now(),
                    s,
                }))
                .await
                .is_err()
            {
                break;
            }
            let request = stun::request(txn);
            let send_ok = match sock.send_to(&request, dst).await {
                Ok(_) => true,
                Err(err) => {
                    debug!(%dst, "failed to send STUN request: {err:#}");
                    false
                }
            };
            waiters.push((region.region_id, is_v4, send_ok, r));
        }
    }

    // Every reply not in by the deadline counts as lost.
    let deadline = Instant::now() + PROBE_TIMEOUT;
    let results = futures::future::join_all(waiters.into_iter().map(
        |(region_id, is_v4, send_ok, r)| async move {
            let reply = tokio::time::timeout_at(deadline, r)
                .await
                .ok()
                .and_then(|r| r.ok());
            ProbeResult {
                region_id,
                is_v4,
                send_ok,
                latency: reply.map(|(l, _)| l),
                mapped_addr: reply.map(|(_, a)| a),
            }
        },
    ))
    .await;

    finalize_report(results, last_report.as_deref())
}

async fn resolve_stun_addr(node: &crate::relay::RelayNode, want_v4: bool) -> Option<SocketAddr> {
    if let Some(addr) = node.stun_addr() {
        if addr.is_ipv4() == want_v4 {
            return Some(addr);
        }
        return None;
    }
    match tokio::net::lookup_host((node.host.as_str(), node.stun_port)).await {
        Ok(addrs) => addrs.into_iter().find(|a| a.is_ipv4() == want_v4),
        Err(err) => {
            debug!(host = %node.host, "failed to resolve STUN host: {err:#}");
            None
        }
    }
}

fn finalize_report(results: Vec<ProbeResult>, last: Option<&Report>) -> Report {
    let mut report = Report::default();
    let mut v4_mapped: Vec<SocketAddr> = Vec::new();

    for res in &results {
        if res.is_v4 {
            report.ipv4_can_send |= res.send_ok;
        } else {
            report.ipv6_can_send |= res.send_ok;
        }
        if let Some(latency) = res.latency {
            report.udp = true;
            if res.is_v4 {
                report.ipv4 = true;
                report.region_v4_latency.update_region(res.region_id, latency);
            } else {
                report.ipv6 = true;
                report.region_v6_latency.update_region(res.region_id, latency);
            }
        }
        if let Some(addr) = res.mapped_addr {
            match addr.ip() {
                IpAddr::V4(_) => {
                    report.global_v4 = Some(addr);
                    if !v4_mapped.contains(&addr) {
                        v4_mapped.push(addr);
                    }
                }
                IpAddr::V6(_) => report.global_v6 = Some(addr),
            }
        }
    }

    let distinct_v4_servers = results
        .iter()
        .filter(|r| r.is_v4 && r.mapped_addr.is_some())
        .count();
    if distinct_v4_servers >= 2 {
        report.mapping_varies_by_dest_ip = Some(v4_mapped.len() > 1);
    }

    report.region_latency = report.region_v4_latency.clone();
    report.region_latency.merge(&report.region_v6_latency);

    report.preferred_relay = pick_preferred_relay(&report.region_latency, last);

    report
}

/// The lowest-latency region, sticky to the previous choice within a small
/// margin so the home does not flap between two close regions.
fn pick_preferred_relay(latencies: &RegionLatencies, last: Option<&Report>) -> u16 {
    let Some((best_region, best_latency)) =
        latencies.iter().min_by_key(|&(region, latency)| (latency, region))
    else {
        return 0;
    };
    if let Some(last) = last {
        if last.preferred_relay != 0 {
            if let Some(prev_latency) = latencies.get(last.preferred_relay) {
                if prev_latency <= best_latency + PREFERRED_RELAY_FLAP_MARGIN {
                    return last.preferred_relay;
                }
            }
        }
    }
    best_region
}

#[cfg(test)]
mod tests {
    use super::*;

    fn res(region_id: u16, is_v4: bool, latency_ms: Option<u64>, mapped: Option<&str>) -> ProbeResult {
        ProbeResult {
            region_id,
            is_v4,
            send_ok: true,
            latency: latency_ms.map(Duration::from_millis),
            mapped_addr: mapped.map(|m| m.parse().unwrap()),
        }
    }

    #[test]
    fn test_region_latencies_keep_min() {
        let mut lat = RegionLatencies::new();
        lat.update_region(1, Duration::from_millis(30));
        lat.update_region(1, Duration::from_millis(10));
        lat.update_region(1, Duration::from_millis(20));
        assert_eq!(lat.get(1), Some(Duration::from_millis(10)));
    }

    #[test]
    fn test_finalize_report_basic() {
        let report = finalize_report(
            vec![
                res(1, true, Some(10), Some("198.51.100.7:41641")),
                res(2, true, Some(35), Some("198.51.100.7:41641")),
                res(1, false, Some(12), Some("[2001:db8::7]:41641")),
            ],
            None,
        );
        assert!(report.udp);
        assert!(report.ipv4 && report.ipv6);
        assert_eq!(report.preferred_relay, 1);
        assert_eq!(report.mapping_varies_by_dest_ip, Some(false));
        assert_eq!(
            report.global_v4,
            Some("198.51.100.7:41641".parse().unwrap())
        );
        assert_eq!(
            report.global_v6,
            Some("[2001:db8::7]:41641".parse().unwrap())
        );
    }

    #[test]
    fn test_finalize_report_detects_varying_mapping() {
        let report = finalize_report(
            vec![
                res(1, true, Some(10), Some("198.51.100.7:41641")),
                res(2, true, Some(15), Some("198.51.100.7:41999")),
            ],
            None,
        );
        assert_eq!(report.mapping_varies_by_dest_ip, Some(true));
    }

    #[test]
    fn test_finalize_report_udp_blocked() {
        let report = finalize_report(
            vec![res(1, true, None, None), res(2, true, None, None)],
            None,
        );
        assert!(!report.udp);
        assert_eq!(report.preferred_relay, 0);
        assert_eq!(report.mapping_varies_by_dest_ip, None);
    }

    #[test]
    fn test_preferred_relay_is_sticky() {
        let last = Report {
            preferred_relay: 2,
            ..Default::default()
        };

        let mut latencies = RegionLatencies::new();
        latencies.update_region(1, Duration::from_millis(20));
        latencies.update_region(2, Duration::from_millis(25));
        // Region 1 is faster, but within the flap margin of the old home.
        assert_eq!(pick_preferred_relay(&latencies, Some(&last)), 2);

        latencies.update_region(1, Duration::from_millis(5));
        // Now region 1 clearly wins.
        assert_eq!(pick_preferred_relay(&latencies, Some(&last)), 1);
    }
}
