//! Port mapping client.
//!
//! Requests a UDP port mapping from the local gateway via NAT-PMP and keeps
//! it alive. The currently mapped external address is published on a watch
//! channel; the engine folds it into its endpoint list and re-probes when
//! it changes.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::num::NonZeroU16;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info_span, trace, Instrument};

use crate::util::{CancelOnDrop, MaybeFuture};

/// The NAT-PMP server port on the gateway.
const NAT_PMP_PORT: u16 = 5351;

/// How long to wait for a gateway response before giving up.
const RECV_TIMEOUT: Duration = Duration::from_millis(500);

/// Requested lifetime for mappings.
const MAPPING_LIFETIME: Duration = Duration::from_secs(60 * 60);

/// Result of a port mapping protocol probe on the local network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeOutput {
    /// Whether the gateway answers NAT-PMP requests.
    pub nat_pmp: bool,
}

impl ProbeOutput {
    /// Whether a port mapping protocol is available at all.
    pub fn available(&self) -> bool {
        self.nat_pmp
    }
}

#[derive(Debug)]
enum Message {
    Probe(oneshot::Sender<Result<ProbeOutput, String>>),
    ProcureMapping,
    UpdateLocalPort(Option<NonZeroU16>),
    Deactivate,
}

/// Port mapping client handle.
///
/// Cheaply cloneable; the last clone dropped stops the service.
#[derive(Debug, Clone)]
pub struct Client {
    service_tx: mpsc::Sender<Message>,
    watch_rx: watch::Receiver<Option<SocketAddrV4>>,
    _guard: Arc<CancelOnDrop>,
}

impl Client {
    /// Creates the client and spawns its service.
    pub fn new() -> Self {
        let (service_tx, service_rx) = mpsc::channel(16);
        let (watch_tx, watch_rx) = watch::channel(None);
        let mut service = Service {
            rx: service_rx,
            watch: watch_tx,
            local_port: None,
            mapping: None,
        };
        let task = tokio::spawn(
            async move { service.run().await }.instrument(info_span!("portmapper.service")),
        );
        Client {
            service_tx,
            watch_rx,
            _guard: Arc::new(CancelOnDrop::new("portmapper service", task.abort_handle())),
        }
    }

    /// Probes the local gateway for port mapping support.
    pub fn probe(&self) -> oneshot::Receiver<Result<ProbeOutput, String>> {
        let (tx, rx) = oneshot::channel();
        if self.service_tx.try_send(Message::Probe(tx)).is_err() {
            // The receiver will observe the drop as a cancellation.
            debug!("portmapper service busy, probe dropped");
        }
        rx
    }

    /// Requests a mapping for the configured local port, if none is active.
    pub fn procure_mapping(&self) {
        self.service_tx.try_send(Message::ProcureMapping).ok();
    }

    /// Updates the local port to map. Invalidates the active mapping if the
    /// port changed.
    pub fn update_local_port(&self, port: NonZeroU16) {
        self.service_tx
            .try_send(Message::UpdateLocalPort(Some(port)))
            .ok();
    }

    /// Releases the active mapping.
    pub fn deactivate(&self) {
        self.service_tx.try_send(Message::Deactivate).ok();
    }

    /// Watches the currently mapped external address.
    pub fn watch_external_address(&self) -> watch::Receiver<Option<SocketAddrV4>> {
        self.watch_rx.clone()
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
struct Mapping {
    external: SocketAddrV4,
    /// When to renew.
    renew_at: Instant,
    internal_port: NonZeroU16,
}

#[derive(Debug)]
struct Service {
    rx: mpsc::Receiver<Message>,
    watch: watch::Sender<Option<SocketAddrV4>>,
    local_port: Option<NonZeroU16>,
    mapping: Option<Mapping>,
}

impl Service {
    async fn run(&mut self) {
        loop {
            let renew = MaybeFuture {
                inner: self
                    .mapping
                    .as_ref()
                    .map(|m| Box::pin(tokio::time::sleep_until(m.renew_at))),
            };
            tokio::select! {
                msg = self.rx.recv() => {
                    let Some(msg) = msg else {
                        break;
                    };
                    match msg {
                        Message::Probe(tx) => {
                            let output = self.probe().await;
                            tx.send(output).ok();
                        }
                        Message::ProcureMapping => {
                            self.procure(false).await;
                        }
                        Message::UpdateLocalPort(port) => {
                            if port != self.local_port {
                                self.local_port = port;
                                self.invalidate().await;
                                self.procure(false).await;
                            }
                        }
                        Message::Deactivate => {
                            self.invalidate().await;
                        }
                    }
                }
                _ = renew => {
                    trace!("renewing mapping");
                    self.procure(true).await;
                }
            }
        }
    }

    async fn probe(&mut self) -> Result<ProbeOutput, String> {
        match request_external_address().await {
            Ok(_) => Ok(ProbeOutput { nat_pmp: true }),
            Err(e) => {
                debug!("nat-pmp probe failed: {e}");
                Ok(ProbeOutput { nat_pmp: false })
            }
        }
    }

    /// Requests (or renews) a mapping for the local port.
    async fn procure(&mut self, renewal: bool) {
        let Some(local_port) = self.local_port else {
            debug!("no local port set, not mapping");
            return;
        };
        if !renewal {
            if let Some(ref mapping) = self.mapping {
                if mapping.internal_port == local_port {
                    // Nothing to do, a mapping is live.
                    return;
                }
            }
        }
        match request_mapping(local_port, MAPPING_LIFETIME).await {
            Ok((external, lifetime)) => {
                debug!(%external, ?lifetime, "mapping obtained");
                self.mapping = Some(Mapping {
                    external,
                    renew_at: Instant::now() + lifetime / 2,
                    internal_port: local_port,
                });
                self.watch.send_if_modified(|current| {
                    let changed = *current != Some(external);
                    *current = Some(external);
                    changed
                });
            }
            Err(e) => {
                debug!("failed to obtain mapping: {e}");
                self.mapping = None;
                self.watch.send_if_modified(|current| {
                    let changed = current.is_some();
                    *current = None;
                    changed
                });
            }
        }
    }

    async fn invalidate(&mut self) {
        if let Some(mapping) = self.mapping.take() {
            // Lifetime zero releases the mapping.
            request_mapping(mapping.internal_port, Duration::ZERO)
                .await
                .ok();
            self.watch.send_if_modified(|current| {
                let changed = current.is_some();
                *current = None;
                changed
            });
        }
    }
}

fn default_gateway() -> Result<Ipv4Addr, String> {
    let gateway = default_net::get_default_gateway().map_err(|e| e.to_string())?;
    match gateway.ip_addr {
        std::net::IpAddr::V4(ip) => Ok(ip),
        std::net::IpAddr::V6(_) => Err("gateway is IPv6, NAT-PMP requires IPv4".into()),
    }
}

async fn natpmp_roundtrip(request: &[u8]) -> Result<Vec<u8>, String> {
    let gateway = default_gateway()?;
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .await
        .map_err(|e| e.to_string())?;
    socket
        .connect(SocketAddr::from((gateway, NAT_PMP_PORT)))
        .await
        .map_err(|e| e.to_string())?;
    socket.send(request).await.map_err(|e| e.to_string())?;

    let mut buf = vec![0u8; 64];
    let n = tokio::time::timeout(RECV_TIMEOUT, socket.recv(&mut buf))
        .await
        .map_err(|_| "gateway did not answer".to_string())?
        .map_err(|e| e.to_string())?;
    buf.truncate(n);
    Ok(buf)
}

async fn request_external_address() -> Result<Ipv4Addr, String> {
    let response = natpmp_roundtrip(&protocol::external_address_request()).await?;
    protocol::parse_external_address_response(&response)
}

async fn request_mapping(
    local_port: NonZeroU16,
    lifetime: Duration,
) -> Result<(SocketAddrV4, Duration), String> {
    let external_ip = request_external_address().await?;
    let response =
        natpmp_roundtrip(&protocol::mapping_request(local_port.get(), lifetime)).await?;
    let (external_port, granted) = protocol::parse_mapping_response(&response, local_port.get())?;
    Ok((SocketAddrV4::new(external_ip, external_port), granted))
}

/// NAT-PMP wire format, RFC 6886.
mod protocol {
    use std::net::Ipv4Addr;
    use std::time::Duration;

    pub(super) const VERSION: u8 = 0;
    const OP_EXTERNAL_ADDRESS: u8 = 0;
    const OP_MAP_UDP: u8 = 1;
    /// Response opcodes are the request opcode plus this.
    const RESPONSE_INDICATOR: u8 = 128;
    const RESULT_SUCCESS: u16 = 0;

    pub(super) fn external_address_request() -> [u8; 2] {
        [VERSION, OP_EXTERNAL_ADDRESS]
    }

    pub(super) fn mapping_request(local_port: u16, lifetime: Duration) -> [u8; 12] {
        let mut buf = [0u8; 12];
        buf[0] = VERSION;
        buf[1] = OP_MAP_UDP;
        // buf[2..4] reserved, zero
        buf[4..6].copy_from_slice(&local_port.to_be_bytes());
        // Suggest the same port externally.
        buf[6..8].copy_from_slice(&local_port.to_be_bytes());
        buf[8..12].copy_from_slice(&(lifetime.as_secs() as u32).to_be_bytes());
        buf
    }

    pub(super) fn parse_external_address_response(buf: &[u8]) -> Result<Ipv4Addr, String> {
        check_header(buf, OP_EXTERNAL_ADDRESS, 12)?;
        let octets: [u8; 4] = buf[8..12].try_into().expect("length checked");
        Ok(Ipv4Addr::from(octets))
    }

    /// Returns (external port, granted lifetime).
    pub(super) fn parse_mapping_response(
        buf: &[u8],
        local_port: u16,
    ) -> Result<(u16, Duration), String> {
        check_header(buf, OP_MAP_UDP, 16)?;
        let internal = u16::from_be_bytes(buf[8..10].try_into().expect("length checked"));
        if internal != local_port {
            return Err(format!(
                "mapping response for port {internal}, expected {local_port}"
            ));
        }
        let external = u16::from_be_bytes(buf[10..12].try_into().expect("length checked"));
        let lifetime = u32::from_be_bytes(buf[12..16].try_into().expect("length checked"));
        Ok((external, Duration::from_secs(lifetime.into())))
    }

    fn check_header(buf: &[u8], op: u8, want_len: usize) -> Result<(), String> {
        if buf.len() < want_len {
            return Err("response too short".into());
        }
        if buf[0] != VERSION {
            return Err(format!("unsupported version {}", buf[0]));
        }
        if buf[1] != op + RESPONSE_INDICATOR {
            return Err(format!("unexpected opcode {}", buf[1]));
        }
        let result = u16::from_be_bytes(buf[2..4].try_into().expect("length checked"));
        if result != RESULT_SUCCESS {
            return Err(format!("gateway error {result}"));
        }
        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_mapping_request_layout() {
            let req = mapping_request(41641, Duration::from_secs(3600));
            assert_eq!(req[0], VERSION);
            assert_eq!(req[1], OP_MAP_UDP);
            assert_eq!(&req[2..4], &[0, 0]);
            assert_eq!(u16::from_be_bytes(req[4..6].try_into().unwrap()), 41641);
            assert_eq!(u16::from_be_bytes(req[6..8].try_into().unwrap()), 41641);
            assert_eq!(u32::from_be_bytes(req[8..12].try_into().unwrap()), 3600);
        }

        #[test]
        fn test_parse_external_address_response() {
            let mut buf = vec![VERSION, OP_EXTERNAL_ADDRESS + RESPONSE_INDICATOR];
            buf.extend_from_slice(&0u16.to_be_bytes()); // success
            buf.extend_from_slice(&1234u32.to_be_bytes()); // epoch
            buf.extend_from_slice(&[203, 0, 113, 9]);
            let ip = parse_external_address_response(&buf).unwrap();
            assert_eq!(ip, Ipv4Addr::new(203, 0, 113, 9));
        }

        #[test]
        fn test_parse_mapping_response() {
            let mut buf = vec![VERSION, OP_MAP_UDP + RESPONSE_INDICATOR];
            buf.extend_from_slice(&0u16.to_be_bytes());
            buf.extend_from_slice(&1234u32.to_be_bytes());
            buf.extend_from_slice(&41641u16.to_be_bytes());
            buf.extend_from_slice(&41800u16.to_be_bytes());
            buf.extend_from_slice(&1800u32.to_be_bytes());
            let (port, lifetime) = parse_mapping_response(&buf, 41641).unwrap();
            assert_eq!(port, 41800);
            assert_eq!(lifetime, Duration::from_secs(1800));

            // Mismatched internal port is rejected.
            assert!(parse_mapping_response(&buf, 41642).is_err());
        }

        #[test]
        fn test_gateway_error_is_surfaced() {
            let mut buf = vec![VERSION, OP_EXTERNAL_ADDRESS + RESPONSE_INDICATOR];
            buf.extend_from_slice(&2u16.to_be_bytes()); // not authorized
            buf.extend_from_slice(&1234u32.to_be_bytes());
            buf.extend_from_slice(&[203, 0, 113, 9]);
            assert!(parse_external_address_response(&buf).is_err());
        }
    }
}
