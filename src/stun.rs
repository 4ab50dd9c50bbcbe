//! STUN packet building and parsing.

use std::net::SocketAddr;

use stun_rs::{
    attributes::stun::{Fingerprint, XorMappedAddress},
    MessageClass, MessageDecoder, MessageEncoderBuilder, StunMessageBuilder,
};
pub use stun_rs::{attributes::StunAttribute, error::StunDecodeError, methods, TransactionId};

use crate::net::ip::to_canonical;

/// Errors that can occur when handling a STUN packet.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The STUN message could not be parsed or is otherwise invalid.
    #[error("invalid message")]
    InvalidMessage,
    /// STUN packet is not a response when it should be.
    #[error("not success response")]
    NotSuccessResponse,
    /// STUN response has malformed attributes.
    #[error("malformed attributes")]
    MalformedAttrs,
}

/// Generates a binding request STUN packet.
pub fn request(tx: TransactionId) -> Vec<u8> {
    let fp = Fingerprint::default();
    let msg = StunMessageBuilder::new(methods::BINDING, MessageClass::Request)
        .with_transaction_id(tx)
        .with_attribute(fp)
        .build();

    let encoder = MessageEncoderBuilder::default().build();
    let mut buffer = vec![0u8; 150];
    let size = encoder.encode(&mut buffer, &msg).expect("invalid encoding");
    buffer.truncate(size);
    buffer
}

// Magic cookie of every STUN packet, RFC 5389.
const COOKIE: [u8; 4] = 0x2112_A442u32.to_be_bytes();

/// Reports whether b is a STUN message.
pub fn is(b: &[u8]) -> bool {
    b.len() >= stun_rs::MESSAGE_HEADER_SIZE &&
	b[0] & 0b11000000 == 0 && // top two bits must be zero
	b[4..8] == COOKIE
}

/// Parses a successful binding response STUN packet.
/// The IP address is extracted from the XOR-MAPPED-ADDRESS attribute.
pub fn parse_response(b: &[u8]) -> Result<(TransactionId, SocketAddr), Error> {
    let decoder = MessageDecoder::default();
    let (msg, _) = decoder.decode(b).map_err(|_| Error::InvalidMessage)?;

    let tx = *msg.transaction_id();
    if msg.class() != MessageClass::SuccessResponse {
        return Err(Error::NotSuccessResponse);
    }

    // XOR-MAPPED-ADDRESS is canonical; fall back to MAPPED-ADDRESS for
    // ancient servers.
    let mut addr = None;
    let mut fallback_addr = None;
    for attr in msg.attributes() {
        match attr {
            StunAttribute::XorMappedAddress(a) => {
                let mut a = *a.socket_address();
                a.set_ip(to_canonical(a.ip()));
                addr = Some(a);
            }
            StunAttribute::MappedAddress(a) => {
                let mut a = *a.socket_address();
                a.set_ip(to_canonical(a.ip()));
                fallback_addr = Some(a);
            }
            _ => {}
        }
    }

    if let Some(addr) = addr {
        return Ok((tx, addr));
    }

    if let Some(addr) = fallback_addr {
        return Ok((tx, addr));
    }

    Err(Error::MalformedAttrs)
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;
    use stun_rs::attributes::stun::XorMappedAddress;

    #[test]
    fn test_is_rejects_short_and_other_traffic() {
        assert!(!is(b"tiny"));
        assert!(!is(&[0u8; 8]));
        let tx = TransactionId::default();
        assert!(is(&request(tx)));
    }

    #[test]
    fn test_parse_response_roundtrip() {
        let tx = TransactionId::default();
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)), 41641);

        let msg = StunMessageBuilder::new(methods::BINDING, MessageClass::SuccessResponse)
            .with_transaction_id(tx)
            .with_attribute(XorMappedAddress::from(addr))
            .build();
        let encoder = MessageEncoderBuilder::default().build();
        let mut buffer = vec![0u8; 150];
        let size = encoder.encode(&mut buffer, &msg).unwrap();
        buffer.truncate(size);

        assert!(is(&buffer));
        let (parsed_tx, parsed_addr) = parse_response(&buffer).unwrap();
        assert_eq!(parsed_tx, tx);
        assert_eq!(parsed_addr, addr);
    }

    #[test]
    fn test_parse_request_as_response_fails() {
        let tx = TransactionId::default();
        let req = request(tx);
        assert!(matches!(
            parse_response(&req),
            Err(Error::NotSuccessResponse)
        ));
    }
}
