use super::{
    packet::{self, Endpoint, FindNode, Message, Packet, Ping, Pong, PING_VERSION},
    Discovery, DiscoveryError, DiscoveryEvent, DiscoveryStorage, UdpClient,
};
use crate::{
    config::DiscoveryConfig,
    crypto::{Crypto, CryptoContext},
    types::{Node, PeerId},
    util::{pk2id, unix_timestamp},
};
use derivative::Derivative;
use k256::ecdsa::SigningKey;
use parking_lot::Mutex;
use std::{collections::HashSet, io, sync::Arc};
use tokio::{
    runtime::Handle,
    sync::mpsc::{self, error::TrySendError},
};
use tracing::*;

/// Lookup rounds against stored nodes, one UDP client per contacted node.
#[derive(Clone, Debug)]
pub struct NodeDiscovery {
    inner: Arc<Inner>,
}

#[derive(Derivative)]
#[derivative(Debug)]
struct Inner {
    #[derivative(Debug = "ignore")]
    secret_key: Arc<SigningKey>,
    #[derivative(Debug = "ignore")]
    crypto: Arc<dyn Crypto>,
    #[derivative(Debug = "ignore")]
    storage: Arc<dyn DiscoveryStorage>,
    config: DiscoveryConfig,
    self_node: Node,
    clients: Mutex<HashSet<PeerId>>,
    #[derivative(Debug = "ignore")]
    events: mpsc::Sender<DiscoveryEvent>,
    #[derivative(Debug = "ignore")]
    runtime: Handle,
}

impl NodeDiscovery {
    /// Must be called from within a tokio runtime; clients are spawned on it.
    pub fn new(
        secret_key: Arc<SigningKey>,
        context: &CryptoContext,
        storage: Arc<dyn DiscoveryStorage>,
        config: DiscoveryConfig,
    ) -> Result<(Self, mpsc::Receiver<DiscoveryEvent>), DiscoveryError> {
        let runtime =
            Handle::try_current().map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let (events, events_rx) = mpsc::channel(config.event_capacity);
        let self_node = Node {
            id: pk2id(secret_key.verifying_key()),
            host: config.self_host.to_string(),
            port: config.self_port,
            discovery_port: config.self_port,
        };

        Ok((
            Self {
                inner: Arc::new(Inner {
                    secret_key,
                    crypto: context.crypto.clone(),
                    storage,
                    config,
                    self_node,
                    clients: Mutex::new(HashSet::new()),
                    events,
                    runtime,
                }),
            },
            events_rx,
        ))
    }

    pub fn self_id(&self) -> PeerId {
        self.inner.self_node.id
    }

    fn find_neighbors(&self, node: Node) -> Result<(), DiscoveryError> {
        let inner = &self.inner;
        let to = Endpoint::from_node(&node)?;
        let ping = inner.encode(&Message::Ping(Ping {
            version: PING_VERSION,
            from: Endpoint::from_node(&inner.self_node)?,
            to: Endpoint { tcp_port: 0, ..to },
            expiration: inner.expiration(),
        }))?;
        let find_node = inner.find_node()?;

        inner.clients.lock().insert(node.id);
        let span = span!(Level::DEBUG, "udp client", "peer={}", node.id);
        inner.runtime.spawn(
            Inner::run_client(inner.clone(), node, ping, find_node).instrument(span),
        );
        Ok(())
    }
}

impl Inner {
    fn expiration(&self) -> u64 {
        unix_timestamp() + self.config.expiration.as_secs()
    }

    fn encode(&self, message: &Message) -> Result<Vec<u8>, DiscoveryError> {
        Ok(packet::encode_packet(&*self.crypto, &self.secret_key, message)?.0)
    }

    fn find_node(&self) -> Result<Vec<u8>, DiscoveryError> {
        self.encode(&Message::FindNode(FindNode {
            target: self.self_node.id,
            expiration: self.expiration(),
        }))
    }

    async fn run_client(self: Arc<Self>, node: Node, ping: Vec<u8>, find_node: Vec<u8>) {
        let id = node.id;
        let mut client = match UdpClient::bind(node, self.config.response_timeout).await {
            Ok(client) => client,
            Err(e) => {
                warn!("cannot open discovery socket: {}", e);
                self.clients.lock().remove(&id);
                self.publish(DiscoveryEvent::ClientStopped {
                    id,
                    responded: false,
                });
                return;
            }
        };

        if let Err(e) = self.exchange(&mut client, &ping, &find_node).await {
            debug!("discovery client stopped: {}", e);
        }

        let responded = client.responded();
        if !responded {
            debug!("no response, dropping node");
            self.storage.remove(id);
        }
        self.clients.lock().remove(&id);
        self.publish(DiscoveryEvent::ClientStopped { id, responded });
    }

    /// Never waits on the receiver: a full channel loses the event.
    fn publish(&self, event: DiscoveryEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => warn!("event channel full, dropping {:?}", event),
            Err(TrySendError::Closed(_)) => trace!("event receiver gone"),
        }
    }

    async fn exchange(
        &self,
        client: &mut UdpClient,
        ping: &[u8],
        find_node: &[u8],
    ) -> Result<(), DiscoveryError> {
        client.send(ping).await?;
        client.send(find_node).await?;

        while let Some(datagram) = client.recv().await? {
            let packet = match packet::decode_packet(&*self.crypto, &datagram, unix_timestamp()) {
                Ok(packet) => packet,
                Err(e) => {
                    debug!("dropping packet: {}", e);
                    continue;
                }
            };
            if packet.sender != client.node().id {
                debug!("dropping packet signed by {}", packet.sender);
                continue;
            }
            self.handle(client, packet).await?;
        }
        Ok(())
    }

    async fn handle(&self, client: &UdpClient, packet: Packet) -> Result<(), DiscoveryError> {
        match packet.message {
            Message::Ping(ping) => {
                trace!("got ping");
                let pong = self.encode(&Message::Pong(Pong {
                    to: ping.from,
                    ping_hash: packet.hash,
                    expiration: self.expiration(),
                }))?;
                client.send(&pong).await?;
                client.send(&self.find_node()?).await?;
            }
            Message::Neighbors(neighbors) => {
                let nodes = neighbors
                    .nodes
                    .into_iter()
                    .filter(|neighbor| neighbor.id != self.self_node.id)
                    .map(Node::from)
                    .collect::<Vec<_>>();
                debug!("got {} neighbors", nodes.len());
                self.publish(DiscoveryEvent::Neighbors {
                    from: packet.sender,
                    nodes,
                });
            }
            Message::Pong(_) | Message::FindNode(_) => trace!("ignoring unsolicited packet"),
        }
        Ok(())
    }
}

impl Discovery for NodeDiscovery {
    fn lookup(&self) -> Result<(), DiscoveryError> {
        let storage = &self.inner.storage;
        let mut started = 0;
        // Nodes without an endpoint are removed and do not count toward alpha.
        while started < self.inner.config.alpha {
            let record = match storage.non_used_node() {
                Some(record) => record,
                None => break,
            };
            let id = record.id();
            storage.set_used(id);

            match self.find_neighbors(record.node) {
                Ok(()) => started += 1,
                Err(DiscoveryError::InvalidEndpoint(e)) => {
                    debug!("removing node {} without endpoint: {}", id, e);
                    storage.remove(id);
                }
                Err(e) => return Err(e),
            }
        }

        if started > 0 {
            Ok(())
        } else {
            Err(DiscoveryError::AllNodesUsed)
        }
    }

    fn is_processing(&self) -> bool {
        !self.inner.clients.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        crypto::{OsRandom, RandomSource, Secp256k1Crypto},
        disc::{
            packet::{Neighbor, Neighbors},
            MemoryDiscoveryStorage,
        },
        types::NodeRecord,
    };
    use std::{net::SocketAddr, time::Duration};
    use tokio::net::UdpSocket;

    struct Peer {
        key: SigningKey,
        socket: UdpSocket,
    }

    impl Peer {
        async fn new() -> Self {
            Self {
                key: OsRandom.random_key(),
                socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            }
        }

        fn record(&self) -> NodeRecord {
            let addr = self.socket.local_addr().unwrap();
            NodeRecord::new(
                Node {
                    id: pk2id(self.key.verifying_key()),
                    host: addr.ip().to_string(),
                    port: addr.port(),
                    discovery_port: addr.port(),
                },
                unix_timestamp(),
            )
        }

        async fn recv(&self) -> (Packet, SocketAddr) {
            let mut buf = [0_u8; 1280];
            let (len, from) = self.socket.recv_from(&mut buf).await.unwrap();
            (
                packet::decode_packet(&Secp256k1Crypto, &buf[..len], unix_timestamp()).unwrap(),
                from,
            )
        }

        async fn send(&self, message: Message, to: SocketAddr) -> ethereum_types::H256 {
            let (data, hash) = packet::encode_packet(&Secp256k1Crypto, &self.key, &message).unwrap();
            self.socket.send_to(&data, to).await.unwrap();
            hash
        }
    }

    fn discovery(
        storage: Arc<MemoryDiscoveryStorage>,
        response_timeout: Duration,
    ) -> (NodeDiscovery, mpsc::Receiver<DiscoveryEvent>) {
        discovery_with(
            storage,
            DiscoveryConfig {
                response_timeout,
                ..DiscoveryConfig::default()
            },
        )
    }

    fn discovery_with(
        storage: Arc<MemoryDiscoveryStorage>,
        config: DiscoveryConfig,
    ) -> (NodeDiscovery, mpsc::Receiver<DiscoveryEvent>) {
        NodeDiscovery::new(
            Arc::new(OsRandom.random_key()),
            &CryptoContext::default(),
            storage,
            config,
        )
        .unwrap()
    }

    fn neighbors(ids: &[u8]) -> Message {
        Message::Neighbors(Neighbors {
            nodes: ids
                .iter()
                .map(|&i| Neighbor {
                    endpoint: Endpoint {
                        ip: "10.0.0.9".parse().unwrap(),
                        udp_port: 30301,
                        tcp_port: 30303,
                    },
                    id: PeerId::repeat_byte(i),
                })
                .collect(),
            expiration: unix_timestamp() + 20,
        })
    }

    #[tokio::test]
    async fn debug_hides_key_material() {
        let (discovery, _events) =
            discovery(Arc::new(MemoryDiscoveryStorage::new()), Duration::from_secs(1));
        let debug = format!("{:?}", discovery);
        assert!(debug.contains("self_node"));
        assert!(!debug.contains("secret_key"));
    }

    #[tokio::test]
    async fn empty_storage_means_all_nodes_used() {
        let (discovery, _events) = discovery(Arc::new(MemoryDiscoveryStorage::new()), Duration::from_secs(1));
        assert!(matches!(discovery.lookup(), Err(DiscoveryError::AllNodesUsed)));
        assert!(!discovery.is_processing());
    }

    #[tokio::test]
    async fn ping_is_answered_and_neighbors_are_reported() {
        let storage = Arc::new(MemoryDiscoveryStorage::new());
        let peer = Peer::new().await;
        storage.save(vec![peer.record()]);
        let (discovery, mut events) = discovery(storage.clone(), Duration::from_millis(500));

        discovery.lookup().unwrap();
        assert!(discovery.is_processing());
        assert!(storage.node(peer.record().id()).unwrap().used);

        let (ping, client) = peer.recv().await;
        assert!(matches!(ping.message, Message::Ping(_)));
        let (find_node, _) = peer.recv().await;
        match find_node.message {
            Message::FindNode(m) => assert_eq!(m.target, discovery.self_id()),
            other => panic!("unexpected {:?}", other),
        }

        let ping_hash = peer
            .send(
                Message::Ping(Ping {
                    version: PING_VERSION,
                    from: Endpoint::from_node(&peer.record().node).unwrap(),
                    to: Endpoint::from_node(&peer.record().node).unwrap(),
                    expiration: unix_timestamp() + 20,
                }),
                client,
            )
            .await;
        match peer.recv().await.0.message {
            Message::Pong(pong) => assert_eq!(pong.ping_hash, ping_hash),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(peer.recv().await.0.message, Message::FindNode(_)));

        let neighbor = Neighbor {
            endpoint: Endpoint {
                ip: "10.0.0.9".parse().unwrap(),
                udp_port: 30301,
                tcp_port: 30303,
            },
            id: PeerId::repeat_byte(9),
        };
        let own = Neighbor {
            id: discovery.self_id(),
            ..neighbor
        };
        peer.send(
            Message::Neighbors(Neighbors {
                nodes: vec![neighbor, own],
                expiration: unix_timestamp() + 20,
            }),
            client,
        )
        .await;

        assert_eq!(
            events.recv().await.unwrap(),
            DiscoveryEvent::Neighbors {
                from: peer.record().id(),
                nodes: vec![Node::from(neighbor)],
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            DiscoveryEvent::ClientStopped {
                id: peer.record().id(),
                responded: true,
            }
        );
        assert!(storage.node(peer.record().id()).is_some());
        assert!(!discovery.is_processing());
    }

    #[tokio::test]
    async fn silent_node_is_removed() {
        let storage = Arc::new(MemoryDiscoveryStorage::new());
        let peer = Peer::new().await;
        storage.save(vec![peer.record()]);
        let (discovery, mut events) = discovery(storage.clone(), Duration::from_millis(200));

        discovery.lookup().unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            DiscoveryEvent::ClientStopped {
                id: peer.record().id(),
                responded: false,
            }
        );
        assert!(storage.is_empty());
        assert!(matches!(discovery.lookup(), Err(DiscoveryError::AllNodesUsed)));
    }

    #[tokio::test]
    async fn nodes_without_endpoint_are_dropped() {
        let storage = Arc::new(MemoryDiscoveryStorage::new());
        let mut record = Peer::new().await.record();
        record.node.host = String::new();
        storage.save(vec![record]);
        let (discovery, _events) = discovery(storage.clone(), Duration::from_millis(200));

        assert!(matches!(discovery.lookup(), Err(DiscoveryError::AllNodesUsed)));
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn unreachable_records_do_not_use_up_alpha() {
        let storage = Arc::new(MemoryDiscoveryStorage::new());
        // Older than the reachable record, so they are picked first.
        let hostless = (1..=3)
            .map(|i| {
                NodeRecord::new(
                    Node {
                        id: PeerId::repeat_byte(i),
                        host: String::new(),
                        port: 0,
                        discovery_port: 0,
                    },
                    u64::from(i),
                )
            })
            .collect::<Vec<_>>();
        storage.save(hostless);
        let peer = Peer::new().await;
        storage.save(vec![peer.record()]);
        let (discovery, _events) = discovery(storage.clone(), Duration::from_millis(500));

        discovery.lookup().unwrap();
        assert!(discovery.is_processing());
        assert_eq!(storage.len(), 1);
        assert!(storage.node(peer.record().id()).unwrap().used);
        assert!(matches!(peer.recv().await.0.message, Message::Ping(_)));
    }

    #[tokio::test]
    async fn undrained_events_do_not_stall_clients() {
        let storage = Arc::new(MemoryDiscoveryStorage::new());
        let peer = Peer::new().await;
        storage.save(vec![peer.record()]);
        let (discovery, mut events) = discovery_with(
            storage.clone(),
            DiscoveryConfig {
                response_timeout: Duration::from_millis(300),
                event_capacity: 1,
                ..DiscoveryConfig::default()
            },
        );

        discovery.lookup().unwrap();
        let (_, client) = peer.recv().await;
        peer.send(neighbors(&[7]), client).await;
        peer.send(neighbors(&[8]), client).await;

        tokio::time::timeout(Duration::from_secs(5), async {
            while discovery.is_processing() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        match events.recv().await.unwrap() {
            DiscoveryEvent::Neighbors { nodes, .. } => {
                assert_eq!(nodes[0].id, PeerId::repeat_byte(7));
            }
            other => panic!("unexpected {:?}", other),
        }
        // The second batch found the channel full.
        while let Ok(event) = events.try_recv() {
            assert!(matches!(event, DiscoveryEvent::ClientStopped { .. }));
        }
        assert!(storage.node(peer.record().id()).is_some());
    }
}
