//! The long-lived client side of a relay connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info_span, trace, warn, Instrument};

use crate::key::{PublicKey, SecretKey};
use crate::relay::RelayNode;
use crate::util::AbortingJoinHandle;

use super::codec::{
    recv_frame, ClientInfo, Frame, FrameType, RelayCodec, WriteFrame, PROTOCOL_MAGIC,
    PROTOCOL_VERSION,
};

/// Timeout for the TCP dial plus handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// If no frame arrives within this duration the connection is broken.
const CLIENT_RECV_TIMEOUT: Duration = Duration::from_secs(120);

/// Idle interval after which the writer emits a keep-alive frame.
const KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Frames queued towards the relay writer task.
const WRITER_QUEUE_DEPTH: usize = 64;

/// Errors a [`Client`] surfaces to its driver.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The client is closed or was never connected.
    #[error("client is closed")]
    Closed,
    /// There was an error dialing the server.
    #[error("error dialing: {0}")]
    Dial(std::io::Error),
    /// The dial or handshake did not finish in time.
    #[error("connect timeout")]
    ConnectTimeout,
    /// The handshake with the server failed.
    #[error("handshake failed: {0}")]
    Handshake(String),
    /// There was an error reading from the connection.
    #[error("read error: {0}")]
    Read(std::io::Error),
    /// The connection to the server was idle past the receive timeout.
    #[error("receive timed out")]
    RecvTimeout,
    /// A frame could not be interpreted.
    #[error("unexpected frame received: {0}")]
    UnexpectedFrame(FrameType),
    /// The packet exceeds [`super::MAX_PACKET_SIZE`].
    #[error("packet too large")]
    PacketTooBig,
}

/// A message received from the relay server.
#[derive(Debug, Clone)]
pub enum ReceivedMessage {
    /// A forwarded packet from another peer.
    ReceivedPacket {
        /// The public key of the sending peer.
        source: PublicKey,
        /// The packet payload.
        data: Bytes,
    },
    /// The server wants a [`Client::send_pong`] reply.
    Ping([u8; 8]),
    /// A reply to an earlier ping.
    Pong([u8; 8]),
    /// The server is (un)healthy; `problem` is empty when healthy again.
    Health {
        /// A description of the problem, if any.
        problem: Option<String>,
    },
    /// A peer the server was forwarding for disconnected.
    PeerGone(PublicKey),
    /// The server is restarting soon.
    ServerRestarting,
    /// The connection is idle but alive.
    KeepAlive,
}

#[derive(Debug)]
enum ClientWriterMessage {
    /// Send a packet to the peer.
    Packet(PublicKey, Bytes),
    /// Reply to a server ping.
    Pong([u8; 8]),
    /// Tell the server whether this is our home connection.
    NotePreferred(bool),
}

/// A relay client.
///
/// Cheaply cloneable. [`Client::connect`] establishes (or re-establishes)
/// the underlying TCP connection; received messages arrive on the
/// [`ClientReceiver`] returned by the builder.
#[derive(Debug, Clone)]
pub struct Client {
    inner: Arc<InnerClient>,
}

impl PartialEq for Client {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Client {}

/// The receiving half of a [`Client`].
#[derive(Debug)]
pub struct ClientReceiver {
    /// The reader channel, receiving incoming messages.
    reader_channel: mpsc::Receiver<Result<(ReceivedMessage, usize), ClientError>>,
}

impl ClientReceiver {
    /// Reads the next message from the relay server, tagged with the
    /// connection generation it arrived on.
    ///
    /// Once this returns an error the connection is dead until the next
    /// [`Client::connect`].
    pub async fn recv(&mut self) -> Result<(ReceivedMessage, usize), ClientError> {
        self.reader_channel.recv().await.ok_or(ClientError::Closed)?
    }
}

#[derive(derive_more::Debug)]
struct InnerClient {
    secret_key: SecretKey,
    node: RelayNode,
    can_ack_pings: bool,
    is_preferred: AtomicBool,
    is_closed: AtomicBool,
    conn_gen: AtomicUsize,
    conn: Mutex<Option<ConnState>>,
    #[debug(skip)]
    recv_sender: mpsc::Sender<Result<(ReceivedMessage, usize), ClientError>>,
}

#[derive(Debug)]
struct ConnState {
    writer_channel: mpsc::Sender<ClientWriterMessage>,
    local_addr: SocketAddr,
    server_public_key: PublicKey,
    _writer_task: AbortingJoinHandle<()>,
    _reader_task: AbortingJoinHandle<()>,
}

/// Builds a [`Client`] for one relay server.
#[derive(Debug)]
pub struct ClientBuilder {
    node: RelayNode,
    can_ack_pings: bool,
    is_preferred: bool,
}

impl ClientBuilder {
    /// New builder for a connection to `node`.
    pub fn new(node: RelayNode) -> Self {
        ClientBuilder {
            node,
            can_ack_pings: false,
            is_preferred: false,
        }
    }

    /// Whether the client answers server pings.
    pub fn can_ack_pings(mut self, can: bool) -> Self {
        self.can_ack_pings = can;
        self
    }

    /// Whether this will be the home connection from the start.
    pub fn is_preferred(mut self, preferred: bool) -> Self {
        self.is_preferred = preferred;
        self
    }

    /// Builds the client. Does not dial.
    pub fn build(self, secret_key: SecretKey) -> (Client, ClientReceiver) {
        let (recv_sender, reader_channel) = mpsc::channel(64);
        let client = Client {
            inner: Arc::new(InnerClient {
                secret_key,
                node: self.node,
                can_ack_pings: self.can_ack_pings,
                is_preferred: AtomicBool::new(self.is_preferred),
                is_closed: AtomicBool::new(false),
                conn_gen: AtomicUsize::new(0),
                conn: Mutex::new(None),
                recv_sender,
            }),
        };
        (client, ClientReceiver { reader_channel })
    }
}

impl Client {
    /// Establishes the connection if there is none.
    ///
    /// Returns the generation of the live connection.
    pub async fn connect(&self) -> Result<usize, ClientError> {
        if self.inner.is_closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        let mut conn = self.inner.conn.lock().await;
        if conn.is_some() {
            return Ok(self.inner.conn_gen.load(Ordering::SeqCst));
        }

        let state = time::timeout(CONNECT_TIMEOUT, self.connect_0())
            .await
            .map_err(|_| ClientError::ConnectTimeout)??;

        let gen = self.inner.conn_gen.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(node = %self.inner.node, %gen, "relay connected");
        *conn = Some(state);
        Ok(gen)
    }

    async fn connect_0(&self) -> Result<ConnState, ClientError> {
        let node = &self.inner.node;
        let addr = match node.relay_addr() {
            Some(addr) => addr,
            None => tokio::net::lookup_host((node.host.as_str(), node.port))
                .await
                .map_err(ClientError::Dial)?
                .next()
                .ok_or_else(|| {
                    ClientError::Dial(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "no address for relay host",
                    ))
                })?,
        };

        let stream = TcpStream::connect(addr).await.map_err(ClientError::Dial)?;
        stream.set_nodelay(true).ok();
        let local_addr = stream.local_addr().map_err(ClientError::Dial)?;

        let (rd, wr) = tokio::io::split(stream);
        let mut reader = FramedRead::new(rd, RelayCodec);
        let mut writer = FramedWrite::new(wr, RelayCodec);

        let server_public_key = self.handshake(&mut reader, &mut writer).await?;

        let (writer_sender, writer_receiver) = mpsc::channel(WRITER_QUEUE_DEPTH);
        let writer_task = tokio::task::spawn(
            async move {
                if let Err(err) = run_writer(writer, writer_receiver).await {
                    debug!("writer task shutting down: {err:?}");
                }
            }
            .instrument(info_span!("relay.client.writer")),
        );

        let recv_sender = self.inner.recv_sender.clone();
        let conn_gen = self.inner.conn_gen.load(Ordering::SeqCst) + 1;
        let reader_task = tokio::task::spawn(
            async move {
                run_reader(reader, recv_sender, conn_gen).await;
            }
            .instrument(info_span!("relay.client.reader")),
        );

        if self.inner.is_preferred.load(Ordering::SeqCst) {
            writer_sender
                .send(ClientWriterMessage::NotePreferred(true))
                .await
                .ok();
        }

        Ok(ConnState {
            writer_channel: writer_sender,
            local_addr,
            server_public_key,
            _writer_task: writer_task.into(),
            _reader_task: reader_task.into(),
        })
    }

    async fn handshake<R, W>(
        &self,
        reader: &mut FramedRead<R, RelayCodec>,
        writer: &mut FramedWrite<W, RelayCodec>,
    ) -> Result<PublicKey, ClientError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let buf = recv_frame(FrameType::ServerKey, &mut *reader)
            .await
            .map_err(|e| ClientError::Handshake(format!("server key: {e:#}")))?;
        let magic_len = PROTOCOL_MAGIC.len();
        if buf.len() != magic_len + 32 || &buf[..magic_len] != PROTOCOL_MAGIC.as_bytes() {
            return Err(ClientError::Handshake("bad server key frame".into()));
        }
        let server_key = PublicKey::try_from(&buf[magic_len..])
            .map_err(|_| ClientError::Handshake("invalid server key".into()))?;

        let info = ClientInfo {
            version: PROTOCOL_VERSION,
            can_ack_pings: self.inner.can_ack_pings,
        };
        let msg = postcard::to_stdvec(&info)
            .map_err(|e| ClientError::Handshake(format!("encode client info: {e}")))?;
        let sealed = self.inner.secret_key.shared(&server_key).seal(&msg);
        writer
            .send(WriteFrame::ClientInfo {
                client_public_key: self.inner.secret_key.public(),
                encrypted_message: sealed,
            })
            .await
            .map_err(|e| ClientError::Handshake(format!("send client info: {e}")))?;

        let buf = recv_frame(FrameType::ServerInfo, reader)
            .await
            .map_err(|e| ClientError::Handshake(format!("server info: {e:#}")))?;
        self.inner
            .secret_key
            .shared(&server_key)
            .open(&buf)
            .map_err(|e| ClientError::Handshake(format!("open server info: {e}")))?;

        Ok(server_key)
    }

    /// Sends a packet to the peer identified by `dst_key`.
    pub async fn send(&self, dst_key: PublicKey, packet: Bytes) -> Result<(), ClientError> {
        trace!(dst = %dst_key.fmt_short(), len = packet.len(), "[relay] send");
        if packet.len() > super::MAX_PACKET_SIZE {
            return Err(ClientError::PacketTooBig);
        }
        self.writer_channel()
            .await?
            .send(ClientWriterMessage::Packet(dst_key, packet))
            .await
            .map_err(|_| ClientError::Closed)
    }

    /// Replies to a server [`ReceivedMessage::Ping`].
    pub async fn send_pong(&self, data: [u8; 8]) -> Result<(), ClientError> {
        self.writer_channel()
            .await?
            .send(ClientWriterMessage::Pong(data))
            .await
            .map_err(|_| ClientError::Closed)
    }

    /// Notes whether this connection is the client's home connection.
    ///
    /// Remembered across reconnects; sent immediately when connected.
    pub async fn note_preferred(&self, preferred: bool) {
        let prev = self.inner.is_preferred.swap(preferred, Ordering::SeqCst);
        if prev == preferred {
            return;
        }
        if let Ok(channel) = self.writer_channel().await {
            channel
                .send(ClientWriterMessage::NotePreferred(preferred))
                .await
                .ok();
        }
    }

    /// The local address of the live TCP connection, if any.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        let conn = self.inner.conn.lock().await;
        conn.as_ref().map(|c| c.local_addr)
    }

    /// The public key of the connected server, if any.
    pub async fn server_public_key(&self) -> Option<PublicKey> {
        let conn = self.inner.conn.lock().await;
        conn.as_ref().map(|c| c.server_public_key)
    }

    /// Drops the current connection, if any. The client may reconnect.
    pub async fn disconnect(&self) {
        let mut conn = self.inner.conn.lock().await;
        *conn = None;
    }

    /// Shuts the client down for good.
    pub async fn close(&self) {
        self.inner.is_closed.store(true, Ordering::SeqCst);
        let mut conn = self.inner.conn.lock().await;
        *conn = None;
    }

    async fn writer_channel(&self) -> Result<mpsc::Sender<ClientWriterMessage>, ClientError> {
        if self.inner.is_closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        let conn = self.inner.conn.lock().await;
        match conn.as_ref() {
            Some(state) => Ok(state.writer_channel.clone()),
            None => Err(ClientError::Closed),
        }
    }
}

async fn run_writer<W: AsyncWrite + Unpin>(
    mut writer: FramedWrite<W, RelayCodec>,
    mut inbox: mpsc::Receiver<ClientWriterMessage>,
) -> anyhow::Result<()> {
    let mut keep_alive = time::interval(KEEP_ALIVE);
    keep_alive.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            msg = inbox.recv() => {
                let Some(msg) = msg else {
                    break;
                };
                keep_alive.reset();
                match msg {
                    ClientWriterMessage::Packet(dst_key, packet) => {
                        writer
                            .send(WriteFrame::SendPacket {
                                dst_key,
                                packet: packet.as_ref(),
                            })
                            .await?;
                    }
                    ClientWriterMessage::Pong(data) => {
                        writer.send(WriteFrame::Pong { data }).await?;
                    }
                    ClientWriterMessage::NotePreferred(preferred) => {
                        writer.send(WriteFrame::NotePreferred { preferred }).await?;
                    }
                }
            }
            _ = keep_alive.tick() => {
                writer.send(WriteFrame::KeepAlive).await?;
            }
        }
    }
    Ok(())
}

async fn run_reader<R: AsyncRead + Unpin>(
    mut reader: FramedRead<R, RelayCodec>,
    recv_sender: mpsc::Sender<Result<(ReceivedMessage, usize), ClientError>>,
    conn_gen: usize,
) {
    use futures::StreamExt;

    loop {
        let frame = match time::timeout(CLIENT_RECV_TIMEOUT, reader.next()).await {
            Err(_) => Err(ClientError::RecvTimeout),
            Ok(None) => Err(ClientError::Read(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed",
            ))),
            Ok(Some(Err(err))) => Err(ClientError::Read(err)),
            Ok(Some(Ok(frame))) => Ok(frame),
        };
        match frame {
            Err(err) => {
                recv_sender.send(Err(err)).await.ok();
                break;
            }
            Ok(frame) => match process_frame(frame) {
                Ok(Some(msg)) => {
                    if recv_sender.send(Ok((msg, conn_gen))).await.is_err() {
                        // Receiver gone, no point reading on.
                        break;
                    }
                }
                Ok(None) => continue,
                Err(err) => {
                    warn!("dropping bad frame: {err}");
                    continue;
                }
            },
        }
    }
}

fn process_frame(frame: Frame) -> Result<Option<ReceivedMessage>, ClientError> {
    let msg = match frame.typ {
        FrameType::RecvPacket => {
            if frame.content.len() < 32 {
                return Err(ClientError::UnexpectedFrame(frame.typ));
            }
            let source = PublicKey::try_from(&frame.content[..32])
                .map_err(|_| ClientError::UnexpectedFrame(frame.typ))?;
            ReceivedMessage::ReceivedPacket {
                source,
                data: frame.content.slice(32..),
            }
        }
        FrameType::Ping => {
            let data: [u8; 8] = frame.content[..]
                .try_into()
                .map_err(|_| ClientError::UnexpectedFrame(frame.typ))?;
            ReceivedMessage::Ping(data)
        }
        FrameType::Pong => {
            let data: [u8; 8] = frame.content[..]
                .try_into()
                .map_err(|_| ClientError::UnexpectedFrame(frame.typ))?;
            ReceivedMessage::Pong(data)
        }
        FrameType::Health => {
            let problem = if frame.content.is_empty() {
                None
            } else {
                Some(String::from_utf8_lossy(&frame.content).into_owned())
            };
            ReceivedMessage::Health { problem }
        }
        FrameType::PeerGone => {
            let key = PublicKey::try_from(&frame.content[..])
                .map_err(|_| ClientError::UnexpectedFrame(frame.typ))?;
            ReceivedMessage::PeerGone(key)
        }
        FrameType::Restarting => ReceivedMessage::ServerRestarting,
        FrameType::KeepAlive => ReceivedMessage::KeepAlive,
        other => return Err(ClientError::UnexpectedFrame(other)),
    };
    Ok(Some(msg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use tokio_util::codec::Encoder;

    #[test]
    fn test_process_frame_recv_packet() {
        let src = SecretKey::generate().public();
        let mut codec = RelayCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(
                WriteFrame::SendPacket {
                    dst_key: src,
                    packet: b"payload",
                },
                &mut buf,
            )
            .unwrap();
        // A RecvPacket has the same shape as SendPacket, retag it.
        buf[0] = FrameType::RecvPacket.into();
        let mut codec = RelayCodec;
        let frame = tokio_util::codec::Decoder::decode(&mut codec, &mut buf)
            .unwrap()
            .unwrap();
        match process_frame(frame).unwrap().unwrap() {
            ReceivedMessage::ReceivedPacket { source, data } => {
                assert_eq!(source, src);
                assert_eq!(&data[..], b"payload");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_process_frame_rejects_garbage() {
        let frame = Frame {
            typ: FrameType::RecvPacket,
            content: Bytes::from_static(b"short"),
        };
        assert!(process_frame(frame).is_err());

        let frame = Frame {
            typ: FrameType::Unknown,
            content: Bytes::new(),
        };
        assert!(process_frame(frame).is_err());
    }
}
