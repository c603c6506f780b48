//! Ethereum devp2p transport and node discovery for light clients

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(
    clippy::large_enum_variant,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::too_many_arguments
)]

pub mod config;
pub mod connection;
pub mod crypto;
pub mod disc;
pub mod ecies;
pub mod errors;
pub mod rlp;
pub mod types;
pub mod util;

pub use config::{Config, ConnectionConfig, DiscoveryConfig};
pub use connection::{Connection, ConnectionEvent, FrameConnection};
pub use crypto::{Crypto, CryptoContext, OsRandom, RandomSource, Secp256k1Crypto};
pub use disc::{
    parse_enode, Discovery, DiscoveryError, DiscoveryEvent, DiscoveryStorage,
    MemoryDiscoveryStorage, NodeDiscovery, NodeManager, NodeManagerEvent,
};
pub use ecies::{ECIESStream, EncryptionHandshake, Frame, FrameCodec, Secrets};
pub use errors::{ConnectionError, ECIESError, FrameError};
pub use types::{DisconnectReason, Node, NodeRecord, PeerId};
