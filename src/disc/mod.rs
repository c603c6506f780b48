//! Node discovery: discv4 packets, lookup rounds over UDP and peer selection.

use crate::types::{Node, NodeRecord, PeerId};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet},
    io,
    net::AddrParseError,
};
use thiserror::Error;

mod discovery;
mod manager;
pub mod packet;
mod parser;
mod udp;

pub use self::{
    discovery::NodeDiscovery,
    manager::{NodeManager, NodeManagerEvent, NodeManagerState},
    packet::{Packet, PacketError},
    parser::{parse_enode, NodeParseError},
    udp::UdpClient,
};

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("all known nodes were already used for lookups")]
    AllNodesUsed,
    #[error("discovery I/O failure: {0}")]
    Io(#[from] io::Error),
    #[error("discovery packet failure: {0}")]
    Packet(#[from] PacketError),
    #[error("node has no usable endpoint: {0}")]
    InvalidEndpoint(#[from] AddrParseError),
}

/// Lookup orchestration as seen by peer selection.
pub trait Discovery: Send + Sync {
    /// Starts up to `alpha` UDP clients and returns without waiting for them.
    fn lookup(&self) -> Result<(), DiscoveryError>;

    /// Whether any client of an earlier lookup is still running.
    fn is_processing(&self) -> bool;
}

/// What discovery reports to whoever owns the node pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Neighbors { from: PeerId, nodes: Vec<Node> },
    ClientStopped { id: PeerId, responded: bool },
}

/// Persistence of discovered nodes, keyed by id.
pub trait DiscoveryStorage: Send + Sync {
    /// Eligible record with the lowest score whose id is not in `exclude`.
    fn least_score_node(&self, exclude: &HashSet<PeerId>) -> Option<NodeRecord>;
    /// Oldest eligible record not yet used for a lookup.
    fn non_used_node(&self) -> Option<NodeRecord>;
    fn node(&self, id: PeerId) -> Option<NodeRecord>;
    /// Stores records whose id is unknown and returns how many were new.
    fn save(&self, records: Vec<NodeRecord>) -> usize;
    fn set_used(&self, id: PeerId);
    fn increase_score(&self, id: PeerId);
    fn set_non_eligible(&self, id: PeerId);
    fn remove(&self, id: PeerId);
}

#[derive(Debug, Default)]
pub struct MemoryDiscoveryStorage {
    records: Mutex<HashMap<PeerId, NodeRecord>>,
}

impl MemoryDiscoveryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    fn update(&self, id: PeerId, f: impl FnOnce(&mut NodeRecord)) {
        if let Some(record) = self.records.lock().get_mut(&id) {
            f(record);
        }
    }
}

impl DiscoveryStorage for MemoryDiscoveryStorage {
    fn least_score_node(&self, exclude: &HashSet<PeerId>) -> Option<NodeRecord> {
        self.records
            .lock()
            .values()
            .filter(|record| record.eligible && !exclude.contains(&record.id()))
            .min_by_key(|record| (record.score, record.timestamp, record.id()))
            .cloned()
    }

    fn non_used_node(&self) -> Option<NodeRecord> {
        self.records
            .lock()
            .values()
            .filter(|record| record.eligible && !record.used)
            .min_by_key(|record| (record.timestamp, record.id()))
            .cloned()
    }

    fn node(&self, id: PeerId) -> Option<NodeRecord> {
        self.records.lock().get(&id).cloned()
    }

    fn save(&self, records: Vec<NodeRecord>) -> usize {
        let mut stored = self.records.lock();
        let mut added = 0;
        for record in records {
            stored.entry(record.id()).or_insert_with(|| {
                added += 1;
                record
            });
        }
        added
    }

    fn set_used(&self, id: PeerId) {
        self.update(id, |record| record.used = true);
    }

    fn increase_score(&self, id: PeerId) {
        self.update(id, |record| record.score += 1);
    }

    fn set_non_eligible(&self, id: PeerId) {
        self.update(id, |record| record.eligible = false);
    }

    fn remove(&self, id: PeerId) {
        self.records.lock().remove(&id);
    }
}
