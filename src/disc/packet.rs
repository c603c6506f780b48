//! discv4 wire format: `hash ‖ signature ‖ type ‖ rlp(payload)`.

use crate::{
    crypto::Crypto,
    errors::ECIESError,
    rlp::{self, Decodable, DecoderError, Encodable, RlpElement, RlpStream},
    types::{Node, PeerId},
    util::{keccak256, keccak256_concat, pk2id},
};
use ethereum_types::{H256, H520};
use k256::ecdsa::SigningKey;
use std::net::{AddrParseError, IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;

pub const PING: u8 = 0x01;
pub const PONG: u8 = 0x02;
pub const FIND_NODE: u8 = 0x03;
pub const NEIGHBORS: u8 = 0x04;

pub const PING_VERSION: u64 = 4;

const HASH_LEN: usize = 32;
const SIGNATURE_LEN: usize = 65;
const HEADER_LEN: usize = HASH_LEN + SIGNATURE_LEN;
/// Datagram limit of the discovery protocol.
pub const MAX_PACKET_SIZE: usize = 1280;

#[derive(Debug, Error)]
pub enum PacketError {
    #[error("packet of {0} bytes is too small")]
    TooSmall(usize),
    #[error("packet of {0} bytes exceeds the datagram limit")]
    TooLarge(usize),
    #[error("packet hash mismatch")]
    HashMismatch,
    #[error("unknown packet type {0}")]
    UnknownType(u8),
    #[error("malformed packet payload: {0}")]
    Rlp(#[from] DecoderError),
    #[error("bad packet signature: {0}")]
    Signature(#[from] ECIESError),
    #[error("packet expired at {expiration}, now {now}")]
    Expired { expiration: u64, now: u64 },
}

/// Address triple carried by ping and pong.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub udp_port: u16,
    pub tcp_port: u16,
}

impl Endpoint {
    pub fn from_node(node: &Node) -> Result<Self, AddrParseError> {
        Ok(Self {
            ip: node.ip()?,
            udp_port: node.discovery_port,
            tcp_port: node.port,
        })
    }
}

fn append_ip(s: &mut RlpStream, ip: &IpAddr) {
    match ip {
        IpAddr::V4(ip) => s.append(&ip.octets()[..]),
        IpAddr::V6(ip) => s.append(&ip.octets()[..]),
    };
}

fn decode_ip(rlp: &RlpElement) -> Result<IpAddr, DecoderError> {
    let data = rlp.data()?;
    if let Ok(octets) = <[u8; 4]>::try_from(data) {
        return Ok(IpAddr::V4(Ipv4Addr::from(octets)));
    }
    if let Ok(octets) = <[u8; 16]>::try_from(data) {
        return Ok(IpAddr::V6(Ipv6Addr::from(octets)));
    }
    Err(DecoderError::InvalidBytesValue)
}

impl Encodable for Endpoint {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(3);
        append_ip(s, &self.ip);
        s.append(&self.udp_port);
        s.append(&self.tcp_port);
    }
}

impl Decodable for Endpoint {
    fn decode(rlp: &RlpElement) -> Result<Self, DecoderError> {
        Ok(Self {
            ip: decode_ip(rlp.at(0)?)?,
            udp_port: rlp.val_at(1)?,
            tcp_port: rlp.val_at(2)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ping {
    pub version: u64,
    pub from: Endpoint,
    pub to: Endpoint,
    pub expiration: u64,
}

impl Encodable for Ping {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(4);
        s.append(&self.version);
        s.append(&self.from);
        s.append(&self.to);
        s.append(&self.expiration);
    }
}

impl Decodable for Ping {
    fn decode(rlp: &RlpElement) -> Result<Self, DecoderError> {
        Ok(Self {
            version: rlp.val_at(0)?,
            from: rlp.val_at(1)?,
            to: rlp.val_at(2)?,
            expiration: rlp.val_at(3)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pong {
    pub to: Endpoint,
    pub ping_hash: H256,
    pub expiration: u64,
}

impl Encodable for Pong {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(3);
        s.append(&self.to);
        s.append(&self.ping_hash);
        s.append(&self.expiration);
    }
}

impl Decodable for Pong {
    fn decode(rlp: &RlpElement) -> Result<Self, DecoderError> {
        Ok(Self {
            to: rlp.val_at(0)?,
            ping_hash: rlp.val_at(1)?,
            expiration: rlp.val_at(2)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FindNode {
    pub target: PeerId,
    pub expiration: u64,
}

impl Encodable for FindNode {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(2);
        s.append(&self.target);
        s.append(&self.expiration);
    }
}

impl Decodable for FindNode {
    fn decode(rlp: &RlpElement) -> Result<Self, DecoderError> {
        Ok(Self {
            target: rlp.val_at(0)?,
            expiration: rlp.val_at(1)?,
        })
    }
}

/// One entry of a neighbors reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Neighbor {
    pub endpoint: Endpoint,
    pub id: PeerId,
}

impl From<Neighbor> for Node {
    fn from(neighbor: Neighbor) -> Self {
        Self {
            id: neighbor.id,
            host: neighbor.endpoint.ip.to_string(),
            port: neighbor.endpoint.tcp_port,
            discovery_port: neighbor.endpoint.udp_port,
        }
    }
}

impl Encodable for Neighbor {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(4);
        append_ip(s, &self.endpoint.ip);
        s.append(&self.endpoint.udp_port);
        s.append(&self.endpoint.tcp_port);
        s.append(&self.id);
    }
}

impl Decodable for Neighbor {
    fn decode(rlp: &RlpElement) -> Result<Self, DecoderError> {
        Ok(Self {
            endpoint: Endpoint::decode(rlp)?,
            id: rlp.val_at(3)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Neighbors {
    pub nodes: Vec<Neighbor>,
    pub expiration: u64,
}

impl Encodable for Neighbors {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(2);
        s.append_list(&self.nodes);
        s.append(&self.expiration);
    }
}

impl Decodable for Neighbors {
    fn decode(rlp: &RlpElement) -> Result<Self, DecoderError> {
        Ok(Self {
            nodes: rlp.list_at(0)?,
            expiration: rlp.val_at(1)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Ping(Ping),
    Pong(Pong),
    FindNode(FindNode),
    Neighbors(Neighbors),
}

impl Message {
    pub const fn packet_type(&self) -> u8 {
        match self {
            Self::Ping(_) => PING,
            Self::Pong(_) => PONG,
            Self::FindNode(_) => FIND_NODE,
            Self::Neighbors(_) => NEIGHBORS,
        }
    }

    pub const fn expiration(&self) -> u64 {
        match self {
            Self::Ping(m) => m.expiration,
            Self::Pong(m) => m.expiration,
            Self::FindNode(m) => m.expiration,
            Self::Neighbors(m) => m.expiration,
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            Self::Ping(m) => rlp::encode(m),
            Self::Pong(m) => rlp::encode(m),
            Self::FindNode(m) => rlp::encode(m),
            Self::Neighbors(m) => rlp::encode(m),
        }
    }

    fn decode(packet_type: u8, payload: &[u8]) -> Result<Self, PacketError> {
        Ok(match packet_type {
            PING => Self::Ping(rlp::decode_val(payload)?),
            PONG => Self::Pong(rlp::decode_val(payload)?),
            FIND_NODE => Self::FindNode(rlp::decode_val(payload)?),
            NEIGHBORS => Self::Neighbors(rlp::decode_val(payload)?),
            other => return Err(PacketError::UnknownType(other)),
        })
    }
}

/// A verified inbound packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub hash: H256,
    /// Node id recovered from the signature.
    pub sender: PeerId,
    pub message: Message,
}

/// Signs and frames `message`. Returns the datagram and its hash, which a
/// pong to it has to echo.
pub fn encode_packet(
    crypto: &dyn Crypto,
    secret_key: &SigningKey,
    message: &Message,
) -> Result<(Vec<u8>, H256), PacketError> {
    let packet_type = [message.packet_type()];
    let payload = message.payload();

    let signature = crypto.sign(
        secret_key,
        keccak256_concat(&[&packet_type, &payload]),
    )?;
    let hash = keccak256_concat(&[signature.as_bytes(), &packet_type, &payload]);

    let mut out = Vec::with_capacity(HEADER_LEN + 1 + payload.len());
    out.extend_from_slice(hash.as_bytes());
    out.extend_from_slice(signature.as_bytes());
    out.extend_from_slice(&packet_type);
    out.extend_from_slice(&payload);
    if out.len() > MAX_PACKET_SIZE {
        return Err(PacketError::TooLarge(out.len()));
    }
    Ok((out, hash))
}

/// Verifies hash and signature of a datagram and rejects it once its
/// expiration is before `now` (unix seconds).
pub fn decode_packet(crypto: &dyn Crypto, data: &[u8], now: u64) -> Result<Packet, PacketError> {
    if data.len() <= HEADER_LEN {
        return Err(PacketError::TooSmall(data.len()));
    }

    let hash = H256::from_slice(&data[..HASH_LEN]);
    if keccak256(&data[HASH_LEN..]) != hash {
        return Err(PacketError::HashMismatch);
    }

    let signature = H520::from_slice(&data[HASH_LEN..HEADER_LEN]);
    let signed = &data[HEADER_LEN..];
    let sender = pk2id(&crypto.recover(&signature, keccak256(signed))?);

    let message = Message::decode(signed[0], &signed[1..])?;
    let expiration = message.expiration();
    if expiration < now {
        return Err(PacketError::Expired { expiration, now });
    }

    Ok(Packet {
        hash,
        sender,
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{OsRandom, RandomSource, Secp256k1Crypto};
    use hex_literal::hex;

    const NOW: u64 = 1_600_000_000;

    fn endpoint(ip: &str, udp_port: u16, tcp_port: u16) -> Endpoint {
        Endpoint {
            ip: ip.parse().unwrap(),
            udp_port,
            tcp_port,
        }
    }

    fn ping() -> Message {
        Message::Ping(Ping {
            version: PING_VERSION,
            from: endpoint("127.0.0.1", 30303, 30303),
            to: endpoint("10.0.0.1", 30301, 0),
            expiration: NOW + 20,
        })
    }

    #[test]
    fn endpoint_layout() {
        assert_eq!(
            rlp::encode(&endpoint("127.0.0.1", 30303, 0)),
            hex!("c984 7f000001 82765f 80")
        );
        let v6 = endpoint("::1", 1, 2);
        assert_eq!(rlp::decode_val::<Endpoint>(&rlp::encode(&v6)).unwrap(), v6);
    }

    #[test]
    fn sender_is_recovered() {
        let key = OsRandom.random_key();
        let (data, hash) = encode_packet(&Secp256k1Crypto, &key, &ping()).unwrap();

        assert_eq!(data[HEADER_LEN], PING);
        assert_eq!(&data[..HASH_LEN], hash.as_bytes());

        let packet = decode_packet(&Secp256k1Crypto, &data, NOW).unwrap();
        assert_eq!(packet.hash, hash);
        assert_eq!(packet.sender, pk2id(key.verifying_key()));
        assert_eq!(packet.message, ping());
    }

    #[test]
    fn every_message_type() {
        let key = OsRandom.random_key();
        let messages = vec![
            Message::Pong(Pong {
                to: endpoint("10.0.0.1", 30301, 30303),
                ping_hash: H256::repeat_byte(7),
                expiration: NOW,
            }),
            Message::FindNode(FindNode {
                target: PeerId::repeat_byte(9),
                expiration: NOW,
            }),
            Message::Neighbors(Neighbors {
                nodes: vec![
                    Neighbor {
                        endpoint: endpoint("10.0.0.2", 30303, 30303),
                        id: PeerId::repeat_byte(1),
                    },
                    Neighbor {
                        endpoint: endpoint("fe80::1", 30304, 30305),
                        id: PeerId::repeat_byte(2),
                    },
                ],
                expiration: NOW,
            }),
        ];
        for message in messages {
            let (data, _) = encode_packet(&Secp256k1Crypto, &key, &message).unwrap();
            let packet = decode_packet(&Secp256k1Crypto, &data, NOW).unwrap();
            assert_eq!(packet.message, message);
        }
    }

    #[test]
    fn neighbor_into_node() {
        let node = Node::from(Neighbor {
            endpoint: endpoint("10.0.0.2", 30301, 30303),
            id: PeerId::repeat_byte(1),
        });
        assert_eq!(node.host, "10.0.0.2");
        assert_eq!(node.port, 30303);
        assert_eq!(node.discovery_port, 30301);
    }

    #[test]
    fn expired_packets_are_rejected() {
        let key = OsRandom.random_key();
        let (data, _) = encode_packet(&Secp256k1Crypto, &key, &ping()).unwrap();
        assert!(matches!(
            decode_packet(&Secp256k1Crypto, &data, NOW + 21),
            Err(PacketError::Expired { .. })
        ));
    }

    #[test]
    fn tampering_breaks_the_hash() {
        let key = OsRandom.random_key();
        let (mut data, _) = encode_packet(&Secp256k1Crypto, &key, &ping()).unwrap();
        let last = data.len() - 1;
        data[last] ^= 1;
        assert!(matches!(
            decode_packet(&Secp256k1Crypto, &data, NOW),
            Err(PacketError::HashMismatch)
        ));
        assert!(matches!(
            decode_packet(&Secp256k1Crypto, &data[..HEADER_LEN], NOW),
            Err(PacketError::TooSmall(_))
        ));
    }

    #[test]
    fn unknown_type() {
        let key = OsRandom.random_key();
        let (data, _) = encode_packet(&Secp256k1Crypto, &key, &ping()).unwrap();
        let mut signed = data[HASH_LEN..].to_vec();
        signed[SIGNATURE_LEN] = 0x09;
        let mut forged = keccak256(&signed).as_bytes().to_vec();
        forged.extend_from_slice(&signed);
        assert!(matches!(
            decode_packet(&Secp256k1Crypto, &forged, NOW),
            Err(PacketError::UnknownType(0x09))
        ));
    }
}
