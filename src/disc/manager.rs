use super::{Discovery, DiscoveryError, DiscoveryEvent, DiscoveryStorage};
use crate::{
    types::{Node, NodeRecord, PeerId},
    util::unix_timestamp,
};
use derivative::Derivative;
use parking_lot::Mutex;
use std::{collections::HashSet, sync::Arc};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tracing::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeManagerEvent {
    NewIdsAdded,
}

/// Ids handed out by [`NodeManager::node`] and not yet reported back.
#[derive(Debug, Default)]
pub struct NodeManagerState {
    used_ids: Mutex<HashSet<PeerId>>,
}

impl NodeManagerState {
    pub fn add(&self, id: PeerId) {
        self.used_ids.lock().insert(id);
    }

    pub fn remove(&self, id: PeerId) {
        self.used_ids.lock().remove(&id);
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.used_ids.lock().contains(&id)
    }

    pub fn used_ids(&self) -> HashSet<PeerId> {
        self.used_ids.lock().clone()
    }
}

/// Peer selection over the discovered node pool.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct NodeManager {
    #[derivative(Debug = "ignore")]
    storage: Arc<dyn DiscoveryStorage>,
    #[derivative(Debug = "ignore")]
    discovery: Arc<dyn Discovery>,
    state: NodeManagerState,
    events: broadcast::Sender<NodeManagerEvent>,
}

impl NodeManager {
    pub fn new(
        storage: Arc<dyn DiscoveryStorage>,
        discovery: Arc<dyn Discovery>,
        event_capacity: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            storage,
            discovery,
            state: NodeManagerState::default(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeManagerEvent> {
        self.events.subscribe()
    }

    pub const fn state(&self) -> &NodeManagerState {
        &self.state
    }

    /// Lowest scored eligible node not currently handed out.
    ///
    /// `None` means retry later: a lookup is started when nothing is left
    /// and none is running yet.
    pub fn node(&self) -> Option<Node> {
        {
            let mut used_ids = self.state.used_ids.lock();
            if let Some(record) = self.storage.least_score_node(&used_ids) {
                used_ids.insert(record.id());
                return Some(record.node);
            }
        }

        if !self.discovery.is_processing() {
            match self.discovery.lookup() {
                Ok(()) => debug!("no candidates, lookup started"),
                Err(DiscoveryError::AllNodesUsed) => debug!("no candidates and no nodes to ask"),
                Err(e) => warn!("lookup failed: {}", e),
            }
        }
        None
    }

    pub fn has_fresh_ids(&self) -> bool {
        let used_ids = self.state.used_ids.lock();
        self.storage.least_score_node(&used_ids).is_some()
    }

    pub fn mark_success(&self, id: PeerId) {
        self.state.remove(id);
        self.storage.increase_score(id);
    }

    /// The node is never selected again.
    pub fn mark_failed(&self, id: PeerId) {
        self.state.remove(id);
        self.storage.set_non_eligible(id);
    }

    pub fn add(&self, nodes: Vec<Node>) {
        if nodes.is_empty() {
            return;
        }
        let timestamp = unix_timestamp();
        let records = nodes
            .into_iter()
            .map(|node| NodeRecord::new(node, timestamp))
            .collect();
        let added = self.storage.save(records);
        if added > 0 {
            debug!("stored {} new nodes", added);
            let _ = self.events.send(NodeManagerEvent::NewIdsAdded);
        }
    }

    /// Feeds neighbors reported by discovery into the pool until the event
    /// channel closes.
    pub fn attach(self: &Arc<Self>, mut events: mpsc::Receiver<DiscoveryEvent>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(
            async move {
                while let Some(event) = events.recv().await {
                    match event {
                        DiscoveryEvent::Neighbors { nodes, .. } => manager.add(nodes),
                        DiscoveryEvent::ClientStopped { id, responded } => {
                            trace!("client for {} stopped, responded: {}", id, responded);
                        }
                    }
                }
            }
            .instrument(span!(Level::DEBUG, "node manager")),
        )
    }
}
