//! Length-prefixed framing for the relay wire protocol.

use anyhow::{bail, ensure};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{Stream, StreamExt};
use tokio_util::codec::{Decoder, Encoder};

use crate::key::PublicKey;

use super::MAX_PACKET_SIZE;

/// Hard cap on a single frame, headers included.
pub(crate) const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// The magic number sent in the `ServerKey` frame on connect.
///
/// 8 bytes: 0x52 56 52 45 4c 41 59 31
pub(crate) const PROTOCOL_MAGIC: &str = "RVRELAY1";

/// Protocol version spoken by this client.
pub(crate) const PROTOCOL_VERSION: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
#[repr(u8)]
pub(crate) enum FrameType {
    /// Sent by the server first, magic + server public key.
    #[display("server key")]
    ServerKey = 0x01,
    /// Sent by the client, its public key + sealed client info.
    #[display("client info")]
    ClientInfo = 0x02,
    /// Sent by the server, sealed server info.
    #[display("server info")]
    ServerInfo = 0x03,
    /// 32B destination public key + packet bytes.
    #[display("send packet")]
    SendPacket = 0x04,
    /// 32B source public key + packet bytes.
    #[display("recv packet")]
    RecvPacket = 0x05,
    /// No payload, sent on an idle connection.
    #[display("keep alive")]
    KeepAlive = 0x06,
    /// 1 byte: whether the sender calls this their home connection.
    #[display("note preferred")]
    NotePreferred = 0x07,
    /// 32B public key of a peer that disconnected from the server.
    #[display("peer gone")]
    PeerGone = 0x08,
    /// 8 byte ping payload, to be echoed in a [`FrameType::Pong`].
    #[display("ping")]
    Ping = 0x12,
    /// 8 byte payload echoed from a [`FrameType::Ping`].
    #[display("pong")]
    Pong = 0x13,
    /// Sent by the server to quickly tell the client a health problem
    /// appeared or cleared. Payload is a UTF-8 description, empty = healthy.
    #[display("health")]
    Health = 0x14,
    /// Sent by the server right before restarting.
    #[display("restarting")]
    Restarting = 0x15,
    #[display("unknown frame")]
    Unknown = 0xff,
}

impl From<u8> for FrameType {
    fn from(b: u8) -> Self {
        match b {
            0x01 => FrameType::ServerKey,
            0x02 => FrameType::ClientInfo,
            0x03 => FrameType::ServerInfo,
            0x04 => FrameType::SendPacket,
            0x05 => FrameType::RecvPacket,
            0x06 => FrameType::KeepAlive,
            0x07 => FrameType::NotePreferred,
            0x08 => FrameType::PeerGone,
            0x12 => FrameType::Ping,
            0x13 => FrameType::Pong,
            0x14 => FrameType::Health,
            0x15 => FrameType::Restarting,
            _ => FrameType::Unknown,
        }
    }
}

impl From<FrameType> for u8 {
    fn from(typ: FrameType) -> u8 {
        typ as u8
    }
}

/// Info sealed to the server's key during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub(crate) struct ClientInfo {
    /// The protocol version the client speaks.
    pub(crate) version: usize,
    /// Whether the client will respond to pings with pongs.
    pub(crate) can_ack_pings: bool,
}

#[derive(Debug, Default, Clone)]
pub(crate) struct RelayCodec;

#[derive(Debug)]
pub(crate) struct Frame {
    pub(crate) typ: FrameType,
    pub(crate) content: Bytes,
}

#[derive(Debug)]
pub(crate) enum WriteFrame<'a> {
    ClientInfo {
        client_public_key: PublicKey,
        encrypted_message: Vec<u8>,
    },
    SendPacket {
        dst_key: PublicKey,
        packet: &'a [u8],
    },
    KeepAlive,
    NotePreferred {
        preferred: bool,
    },
    Ping {
        data: [u8; 8],
    },
    Pong {
        data: [u8; 8],
    },
}

const PREFERRED: u8 = 1u8;
const NOT_PREFERRED: u8 = 0u8;

impl WriteFrame<'_> {
    fn typ(&self) -> FrameType {
        match self {
            WriteFrame::ClientInfo { .. } => FrameType::ClientInfo,
            WriteFrame::SendPacket { .. } => FrameType::SendPacket,
            WriteFrame::KeepAlive => FrameType::KeepAlive,
            WriteFrame::NotePreferred { .. } => FrameType::NotePreferred,
            WriteFrame::Ping { .. } => FrameType::Ping,
            WriteFrame::Pong { .. } => FrameType::Pong,
        }
    }

    /// Serialized length (without the frame header).
    fn len(&self) -> usize {
        match self {
            WriteFrame::ClientInfo {
                client_public_key: _,
                encrypted_message,
            } => 32 + encrypted_message.len(),
            WriteFrame::SendPacket { dst_key: _, packet } => 32 + packet.len(),
            WriteFrame::KeepAlive => 0,
            WriteFrame::NotePreferred { .. } => 1,
            WriteFrame::Ping { .. } => 8,
            WriteFrame::Pong { .. } => 8,
        }
    }

    fn write_to(&self, dst: &mut BytesMut) {
        match self {
            WriteFrame::ClientInfo {
                client_public_key,
                encrypted_message,
            } => {
                dst.put(client_public_key.as_ref());
                dst.put(&encrypted_message[..]);
            }
            WriteFrame::SendPacket { dst_key, packet } => {
                dst.put(dst_key.as_ref());
                dst.put(*packet);
            }
            WriteFrame::KeepAlive => {}
            WriteFrame::NotePreferred { preferred } => {
                if *preferred {
                    dst.put_u8(PREFERRED);
                } else {
                    dst.put_u8(NOT_PREFERRED);
                }
            }
            WriteFrame::Ping { data } => {
                dst.put(&data[..]);
            }
            WriteFrame::Pong { data } => {
                dst.put(&data[..]);
            }
        }
    }
}

const HEADER_LEN: usize = 5;

impl Decoder for RelayCodec {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        // Can't use the `get_` Buf api, as that advances the buffer.
        let frame_type: FrameType = src[0].into();
        let frame_len = u32::from_be_bytes(src[1..5].try_into().expect("just checked")) as usize;

        if frame_len > MAX_FRAME_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("frame of length {} is too large", frame_len),
            ));
        }

        if src.len() < HEADER_LEN + frame_len {
            src.reserve(HEADER_LEN + frame_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let content = src.split_to(frame_len).freeze();

        Ok(Some(Frame {
            typ: frame_type,
            content,
        }))
    }
}

impl Encoder<WriteFrame<'_>> for RelayCodec {
    type Error = std::io::Error;

    fn encode(&mut self, frame: WriteFrame<'_>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let frame_len: usize = frame.len();
        if frame_len > MAX_PACKET_SIZE + 32 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("frame of length {} is too large", frame_len),
            ));
        }

        let frame_len_u32 = u32::try_from(frame_len).expect("just checked");

        dst.reserve(HEADER_LEN + frame_len);
        dst.put_u8(frame.typ().into());
        dst.put_u32(frame_len_u32);
        frame.write_to(dst);

        Ok(())
    }
}

/// Receives the next frame and matches the frame type. If the correct type is
/// found returns the content, otherwise an error.
pub(crate) async fn recv_frame<S: Stream<Item = std::io::Result<Frame>> + Unpin>(
    frame_type: FrameType,
    mut stream: S,
) -> anyhow::Result<Bytes> {
    match stream.next().await {
        Some(Ok(frame)) => {
            ensure!(
                frame_type == frame.typ,
                "expected frame {}, found {}",
                frame_type,
                frame.typ
            );
            Ok(frame.content)
        }
        Some(Err(err)) => Err(err.into()),
        None => bail!("EOF: unexpected stream end, expected frame {}", frame_type),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::SecretKey;

    fn roundtrip(frame: WriteFrame<'_>) -> Frame {
        let mut codec = RelayCodec;
        let mut buf = BytesMut::new();
        let typ = frame.typ();
        codec.encode(frame, &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        assert_eq!(decoded.typ, typ);
        decoded
    }

    #[test]
    fn test_frame_roundtrip() {
        let key = SecretKey::generate().public();

        let frame = roundtrip(WriteFrame::SendPacket {
            dst_key: key,
            packet: b"hello world",
        });
        assert_eq!(&frame.content[..32], key.as_bytes());
        assert_eq!(&frame.content[32..], b"hello world");

        let frame = roundtrip(WriteFrame::Ping { data: [7u8; 8] });
        assert_eq!(&frame.content[..], &[7u8; 8]);

        let frame = roundtrip(WriteFrame::NotePreferred { preferred: true });
        assert_eq!(&frame.content[..], &[PREFERRED]);

        let frame = roundtrip(WriteFrame::KeepAlive);
        assert!(frame.content.is_empty());
    }

    #[test]
    fn test_decode_partial_input() {
        let mut codec = RelayCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(
                WriteFrame::SendPacket {
                    dst_key: SecretKey::generate().public(),
                    packet: b"0123456789",
                },
                &mut buf,
            )
            .unwrap();

        let mut partial = BytesMut::from(&buf[..HEADER_LEN + 3]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        let mut whole = BytesMut::from(&buf[..]);
        assert!(codec.decode(&mut whole).unwrap().is_some());
    }

    #[test]
    fn test_oversize_frame_rejected() {
        let mut codec = RelayCodec;
        let mut buf = BytesMut::new();
        buf.put_u8(FrameType::RecvPacket.into());
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        assert!(codec.decode(&mut buf).is_err());
    }
}
