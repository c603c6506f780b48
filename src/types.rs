use enum_primitive_derive::Primitive;
pub use ethereum_types::H512 as PeerId;
use std::{
    fmt::{self, Display},
    net::{AddrParseError, IpAddr, SocketAddr},
};

/// Identity and endpoints of a remote devp2p node.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Node {
    /// Uncompressed secp256k1 public key without the `0x04` prefix.
    pub id: PeerId,
    pub host: String,
    /// RLPx TCP port.
    pub port: u16,
    /// Discovery UDP port.
    pub discovery_port: u16,
}

impl Node {
    pub fn ip(&self) -> Result<IpAddr, AddrParseError> {
        self.host.parse()
    }

    /// The TCP socket address of this node
    pub fn tcp_addr(&self) -> Result<SocketAddr, AddrParseError> {
        Ok(SocketAddr::new(self.ip()?, self.port))
    }

    /// The UDP socket address of this node
    pub fn udp_addr(&self) -> Result<SocketAddr, AddrParseError> {
        Ok(SocketAddr::new(self.ip()?, self.discovery_port))
    }
}

impl Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "enode://{}", hex::encode(self.id))?;
        if self.host.is_empty() {
            return Ok(());
        }
        match self.ip() {
            Ok(IpAddr::V6(ip)) => write!(f, "@[{}]:{}", ip, self.port)?,
            _ => write!(f, "@{}:{}", self.host, self.port)?,
        }
        if self.discovery_port != self.port {
            write!(f, "?discport={}", self.discovery_port)?;
        }
        Ok(())
    }
}

/// A node learned through discovery, with its selection bookkeeping.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeRecord {
    pub node: Node,
    /// Already picked for a lookup round.
    pub used: bool,
    /// Cleared for good after a failed session.
    pub eligible: bool,
    pub score: i64,
    /// Unix seconds when the record was learned.
    pub timestamp: u64,
}

impl NodeRecord {
    pub const fn new(node: Node, timestamp: u64) -> Self {
        Self {
            node,
            used: false,
            eligible: true,
            score: 0,
            timestamp,
        }
    }

    pub const fn id(&self) -> PeerId {
        self.node.id
    }
}

/// devp2p disconnect reasons as sent in the `Disconnect` message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Primitive)]
pub enum DisconnectReason {
    DisconnectRequested = 0x00,
    TcpSubsystemError = 0x01,
    ProtocolBreach = 0x02,
    UselessPeer = 0x03,
    TooManyPeers = 0x04,
    AlreadyConnected = 0x05,
    IncompatibleP2PProtocolVersion = 0x06,
    NullNodeIdentity = 0x07,
    ClientQuitting = 0x08,
    UnexpectedHandshakeIdentity = 0x09,
    ConnectedToSelf = 0x0a,
    PingTimeout = 0x0b,
    SubprotocolSpecific = 0x10,
}
