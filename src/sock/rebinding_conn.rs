//! A UDP socket that can be rebound while in use.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tracing::{debug, info};

use super::{CurrentPortFate, Network};

/// A UDP socket whose underlying file descriptor can be swapped out, e.g.
/// after a network change, without its users noticing.
///
/// Readers blocked in [`RebindingUdpConn::recv_from`] move over to the new
/// socket on the next rebind.
#[derive(Debug, Clone)]
pub(super) struct RebindingUdpConn {
    inner: Arc<RwLock<Arc<UdpSocket>>>,
    rebound: Arc<Notify>,
    network: Network,
}

impl RebindingUdpConn {
    /// Binds a fresh socket for `network` on `port` (0 picks one).
    ///
    /// If `port` is taken, falls back to an ephemeral port.
    pub(super) async fn bind(port: u16, network: Network) -> anyhow::Result<Self> {
        let socket = bind_socket(port, network).await?;
        Ok(RebindingUdpConn {
            inner: Arc::new(RwLock::new(Arc::new(socket))),
            rebound: Arc::new(Notify::new()),
            network,
        })
    }

    /// The currently bound socket.
    pub(super) fn as_socket(&self) -> Arc<UdpSocket> {
        self.inner.read().clone()
    }

    pub(super) fn local_addr(&self) -> io::Result<SocketAddr> {
        self.as_socket().local_addr()
    }

    pub(super) fn port(&self) -> u16 {
        self.local_addr().map(|a| a.port()).unwrap_or_default()
    }

    pub(super) async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.as_socket().send_to(buf, addr).await
    }

    /// Receives a datagram, following the socket across rebinds.
    pub(super) async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        loop {
            let socket = self.as_socket();
            tokio::select! {
                res = socket.recv_from(buf) => return res,
                _ = self.rebound.notified() => {
                    debug!("socket rebound, switching reader");
                    continue;
                }
            }
        }
    }

    /// Closes the current socket and binds a new one.
    pub(super) async fn rebind(
        &self,
        preferred_port: u16,
        cur_port_fate: CurrentPortFate,
    ) -> anyhow::Result<()> {
        let port = match cur_port_fate {
            CurrentPortFate::Keep => self.port(),
            CurrentPortFate::Drop => preferred_port,
        };
        let socket = bind_socket(port, self.network).await?;
        info!(network = ?self.network, port = socket.local_addr().map(|a| a.port()).unwrap_or_default(), "rebound socket");
        *self.inner.write() = Arc::new(socket);
        self.rebound.notify_waiters();
        Ok(())
    }
}

async fn bind_socket(port: u16, network: Network) -> anyhow::Result<UdpSocket> {
    let addr = SocketAddr::new(network.default_addr(), port);
    match UdpSocket::bind(addr).await {
        Ok(socket) => Ok(socket),
        Err(err) if port != 0 => {
            // The preferred port is taken, any port will do.
            debug!(%addr, "failed to bind: {err:#}, trying ephemeral port");
            let addr = SocketAddr::new(network.default_addr(), 0);
            UdpSocket::bind(addr)
                .await
                .with_context(|| format!("failed to bind any port on {addr}"))
        }
        Err(err) => Err(err).with_context(|| format!("failed to bind {addr}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rebind_keeps_readers_alive() {
        let conn = RebindingUdpConn::bind(0, Network::Ipv4).await.unwrap();
        let port_before = conn.port();
        assert_ne!(port_before, 0);

        let reader = conn.clone();
        let read_task = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            reader.recv_from(&mut buf).await.map(|(n, _)| n)
        });

        conn.rebind(0, CurrentPortFate::Drop).await.unwrap();
        let port_after = conn.port();
        assert_ne!(port_after, 0);

        // The reader must pick up the new socket and see this packet.
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(b"hello", (std::net::Ipv4Addr::LOCALHOST, port_after))
            .await
            .unwrap();

        let n = tokio::time::timeout(std::time::Duration::from_secs(5), read_task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(n, 5);
    }

    #[tokio::test]
    async fn test_rebind_keep_prefers_old_port() {
        let conn = RebindingUdpConn::bind(0, Network::Ipv4).await.unwrap();
        let port = conn.port();
        // The old socket still holds the port, so this may land on the
        // preferred port or an ephemeral one; either way it must succeed.
        conn.rebind(0, CurrentPortFate::Keep).await.unwrap();
        assert_ne!(conn.port(), 0);
        let _ = port;
    }
}
