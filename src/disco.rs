//! The discovery message codec.
//!
//! Every discovery frame on the wire is:
//!
//! ```ignore
//! magic:            [u8; 6]
//! sender_disco_pub: [u8; 32]
//! nonce:            [u8; 24]
//! sealed_payload:   [u8]     // ChaCha20-Poly1305 box
//! ```
//!
//! The sealed payload decrypts to:
//!
//! ```ignore
//! message_type:    u8
//! message_version: u8   // 0 for now; ignore trailing bytes
//! message_payload: [u8]
//! ```

use std::{
    fmt::Display,
    net::{IpAddr, SocketAddr},
};

use anyhow::{anyhow, bail, ensure, Result};

use crate::key::PublicKey;
use crate::net::ip::{to_canonical, to_mapped_v6};
use crate::stun;

/// The 6 byte header of all discovery messages.
pub const MAGIC: &str = "RV💫"; // 6 bytes: 0x52 56 f0 9f 92 ab
pub const MAGIC_LEN: usize = MAGIC.len();

/// Current version.
const V0: u8 = 0;

pub(crate) const KEY_LEN: usize = 32;
const TX_LEN: usize = 12;

// Sizes for the inner message structure.

/// Header: Type | Version
const HEADER_LEN: usize = 2;

const PING_LEN: usize = TX_LEN;
const EP_LENGTH: usize = 16 + 2; // 16 byte IP address + 2 byte port

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Ping = 0x01,
    Pong = 0x02,
    CallMeMaybe = 0x03,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0x01 => Ok(MessageType::Ping),
            0x02 => Ok(MessageType::Pong),
            0x03 => Ok(MessageType::CallMeMaybe),
            _ => Err(value),
        }
    }
}

const MESSAGE_HEADER_LEN: usize = MAGIC_LEN + KEY_LEN;

/// Assembles a full wire frame from the sender key and a sealed payload.
pub fn encode_message(sender: &PublicKey, seal: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(MESSAGE_HEADER_LEN + seal.len());
    out.extend_from_slice(MAGIC.as_bytes());
    out.extend_from_slice(sender.as_bytes());
    out.extend(seal);

    out
}

/// Reports whether p looks like it's a packet containing an encrypted
/// discovery message.
pub fn looks_like_disco_wrapper(p: &[u8]) -> bool {
    if p.len() < MESSAGE_HEADER_LEN {
        return false;
    }

    &p[..MAGIC_LEN] == MAGIC.as_bytes()
}

/// If `p` looks like a discovery message, returns the sender's discovery
/// public key and the sealed box.
pub fn source_and_box(p: &[u8]) -> Option<(PublicKey, &[u8])> {
    if !looks_like_disco_wrapper(p) {
        return None;
    }

    let source = &p[MAGIC_LEN..MAGIC_LEN + KEY_LEN];
    let sender = PublicKey::try_from(source).ok()?;
    let sealed_box = &p[MAGIC_LEN + KEY_LEN..];
    Some((sender, sealed_box))
}

/// A discovery message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Ping(Ping),
    Pong(Pong),
    CallMeMaybe(CallMeMaybe),
}

/// Request for a [`Pong`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ping {
    /// Random client-generated per-ping transaction ID.
    pub tx_id: stun::TransactionId,
}

/// A response to a [`Ping`].
///
/// Includes the source the responder saw the ping arrive from, which makes
/// it effectively a STUN response as well.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pong {
    pub tx_id: stun::TransactionId,
    /// 18 bytes (16+2) on the wire; v4-mapped ipv6 for IPv4.
    pub src: SocketAddr,
}

/// Message sent only over the relay to request that the recipient try
/// to open up a path back to the sender.
///
/// The sender should've already sent UDP packets to the peer to open
/// up the stateful firewall mappings inbound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallMeMaybe {
    /// What the sender believes its endpoints are.
    pub my_numbers: Vec<SocketAddr>,
}

impl Ping {
    fn from_bytes(ver: u8, p: &[u8]) -> Result<Self> {
        ensure!(ver == V0, "invalid version");
        // Deliberately lax on longer-than-expected messages, for future
        // compatibility.
        ensure!(p.len() >= PING_LEN, "message too short");
        let tx_id: [u8; TX_LEN] = p[..TX_LEN].try_into().expect("length checked");
        let tx_id = stun::TransactionId::from(tx_id);

        Ok(Ping { tx_id })
    }

    fn as_bytes(&self) -> Vec<u8> {
        let header = msg_header(MessageType::Ping, V0);
        let mut out = vec![0u8; PING_LEN + HEADER_LEN];

        out[..HEADER_LEN].copy_from_slice(&header);
        out[HEADER_LEN..].copy_from_slice(self.tx_id.as_ref());

        out
    }
}

// Assumes p.len() == EP_LENGTH
fn socket_addr_from_bytes(p: &[u8]) -> SocketAddr {
    debug_assert_eq!(p.len(), EP_LENGTH);

    let raw_src_ip: [u8; 16] = p[..16].try_into().expect("length checked");
    let raw_port: [u8; 2] = p[16..].try_into().expect("length checked");

    let src_ip = to_canonical(IpAddr::from(raw_src_ip));
    let src_port = u16::from_le_bytes(raw_port);

    SocketAddr::new(src_ip, src_port)
}

fn socket_addr_as_bytes(addr: &SocketAddr) -> [u8; EP_LENGTH] {
    let mut out = [0u8; EP_LENGTH];
    out[..16].copy_from_slice(&to_mapped_v6(addr.ip()).octets());
    out[16..].copy_from_slice(&addr.port().to_le_bytes());

    out
}

impl Pong {
    fn from_bytes(ver: u8, p: &[u8]) -> Result<Self> {
        ensure!(ver == V0, "invalid version");
        ensure!(p.len() >= TX_LEN + EP_LENGTH, "message too short");
        let tx_id: [u8; TX_LEN] = p[..TX_LEN].try_into().expect("length checked");
        let tx_id = stun::TransactionId::from(tx_id);
        let src = socket_addr_from_bytes(&p[TX_LEN..TX_LEN + EP_LENGTH]);

        Ok(Pong { tx_id, src })
    }

    fn as_bytes(&self) -> Vec<u8> {
        let header = msg_header(MessageType::Pong, V0);
        let mut out = header.to_vec();
        out.extend_from_slice(self.tx_id.as_ref());
        out.extend_from_slice(&socket_addr_as_bytes(&self.src));
        out
    }
}

impl CallMeMaybe {
    fn from_bytes(ver: u8, p: &[u8]) -> Result<Self> {
        ensure!(ver == V0, "invalid version");
        ensure!(p.len() % EP_LENGTH == 0, "invalid entries");

        let num_entries = p.len() / EP_LENGTH;
        let mut m = CallMeMaybe {
            my_numbers: Vec::with_capacity(num_entries),
        };

        for chunk in p.chunks_exact(EP_LENGTH) {
            let src = socket_addr_from_bytes(chunk);
            m.my_numbers.push(src);
        }

        Ok(m)
    }

    fn as_bytes(&self) -> Vec<u8> {
        let header = msg_header(MessageType::CallMeMaybe, V0);
        let mut out = vec![0u8; HEADER_LEN + self.my_numbers.len() * EP_LENGTH];
        out[..HEADER_LEN].copy_from_slice(&header);

        for (m, chunk) in self
            .my_numbers
            .iter()
            .zip(out[HEADER_LEN..].chunks_exact_mut(EP_LENGTH))
        {
            let raw = socket_addr_as_bytes(m);
            chunk.copy_from_slice(&raw);
        }

        out
    }
}

impl Message {
    /// Parses the cleartext of the message found inside the sealed box.
    pub fn from_bytes(p: &[u8]) -> Result<Self> {
        ensure!(p.len() >= HEADER_LEN, "message too short");

        let t = MessageType::try_from(p[0]).map_err(|v| anyhow!("unknown message type: {}", v))?;
        let ver = p[1];
        let p = &p[2..];
        match t {
            MessageType::Ping => {
                let ping = Ping::from_bytes(ver, p)?;
                Ok(Message::Ping(ping))
            }
            MessageType::Pong => {
                let pong = Pong::from_bytes(ver, p)?;
                Ok(Message::Pong(pong))
            }
            MessageType::CallMeMaybe => {
                let cm = CallMeMaybe::from_bytes(ver, p)?;
                Ok(Message::CallMeMaybe(cm))
            }
        }
    }

    /// Serialize this message to bytes.
    pub fn as_bytes(&self) -> Vec<u8> {
        match self {
            Message::Ping(ping) => ping.as_bytes(),
            Message::Pong(pong) => pong.as_bytes(),
            Message::CallMeMaybe(cm) => cm.as_bytes(),
        }
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::Ping(ping) => {
                write!(f, "Ping(tx={})", hex::encode(ping.tx_id))
            }
            Message::Pong(pong) => {
                write!(f, "Pong(tx={})", hex::encode(pong.tx_id))
            }
            Message::CallMeMaybe(cm) => {
                write!(f, "CallMeMaybe({} endpoints)", cm.my_numbers.len())
            }
        }
    }
}

const fn msg_header(t: MessageType, ver: u8) -> [u8; HEADER_LEN] {
    [t as u8, ver]
}

const _: () = assert!(MAGIC.len() == 6);

#[cfg(test)]
mod tests {
    use crate::key::SecretKey;

    use super::*;

    #[test]
    fn test_to_from_bytes() {
        struct Test {
            name: &'static str,
            m: Message,
            want: &'static str,
        }
        let tests = [
            Test {
                name: "ping",
                m: Message::Ping(Ping {
                    tx_id: [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12].into(),
                }),
                want: "01 00 01 02 03 04 05 06 07 08 09 0a 0b 0c",
            },
            Test {
                name: "pong",
                m: Message::Pong(Pong {
                    tx_id: [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12].into(),
                    src: "2.3.4.5:1234".parse().unwrap(),
                }),
                want: "02 00 01 02 03 04 05 06 07 08 09 0a 0b 0c 00 00 00 00 00 00 00 00 00 00 ff ff 02 03 04 05 d2 04",
            },
            Test {
                name: "pongv6",
                m: Message::Pong(Pong {
                    tx_id: [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12].into(),
                    src: "[fed0::12]:6666".parse().unwrap(),
                }),
                want: "02 00 01 02 03 04 05 06 07 08 09 0a 0b 0c fe d0 00 00 00 00 00 00 00 00 00 00 00 00 00 12 0a 1a",
            },
            Test {
                name: "call_me_maybe",
                m: Message::CallMeMaybe(CallMeMaybe {
                    my_numbers: Vec::new(),
                }),
                want: "03 00",
            },
            Test {
                name: "call_me_maybe_endpoints",
                m: Message::CallMeMaybe(CallMeMaybe {
                    my_numbers: vec![
                        "1.2.3.4:567".parse().unwrap(),
                        "[2001::3456]:789".parse().unwrap(),
                    ],
                }),
                want: "03 00 00 00 00 00 00 00 00 00 00 00 ff ff 01 02 03 04 37 02 20 01 00 00 00 00 00 00 00 00 00 00 00 00 34 56 15 03",
            },
        ];
        for test in tests {
            println!("{}", test.name);

            let got = test.m.as_bytes();
            assert_eq!(
                got,
                hex::decode(test.want.replace(' ', "")).unwrap(),
                "wrong as_bytes"
            );

            let back = Message::from_bytes(&got).expect("failed to parse");
            assert_eq!(test.m, back, "wrong from_bytes");
        }
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(Message::from_bytes(&[0x7f, 0x00, 1, 2, 3]).is_err());
        assert!(Message::from_bytes(&[0x01]).is_err());
    }

    #[test]
    fn test_extraction() {
        let sender_key = SecretKey::generate();
        let recv_key = SecretKey::generate();

        let msg = Message::Ping(Ping {
            tx_id: stun::TransactionId::default(),
        });

        let shared = sender_key.shared(&recv_key.public());
        let seal = shared.seal(&msg.as_bytes());

        let bytes = encode_message(&sender_key.public(), seal.clone());

        assert!(looks_like_disco_wrapper(&bytes));

        let (raw_key, seal_back) = source_and_box(&bytes).unwrap();
        assert_eq!(raw_key, sender_key.public());
        assert_eq!(seal_back, seal);

        let shared_recv = recv_key.shared(&sender_key.public());
        let open_seal = shared_recv
            .open(seal_back)
            .expect("failed to open seal_back");
        let msg_back = Message::from_bytes(&open_seal).unwrap();
        assert_eq!(msg_back, msg);
    }

    #[test]
    fn test_wrong_recipient_drops() {
        let sender_key = SecretKey::generate();
        let recv_key = SecretKey::generate();
        let other_key = SecretKey::generate();

        let msg = Message::Ping(Ping {
            tx_id: stun::TransactionId::default(),
        });
        let seal = sender_key.shared(&recv_key.public()).seal(&msg.as_bytes());
        let bytes = encode_message(&sender_key.public(), seal);

        let (sender, sealed_box) = source_and_box(&bytes).unwrap();
        assert!(other_key.shared(&sender).open(sealed_box).is_err());
    }
}
