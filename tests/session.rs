use futures::{SinkExt, StreamExt};
use spv_devp2p::{
    connection::DISCONNECT_PACKET_TYPE,
    disc::packet::{self, Message},
    util::{pk2id, unix_timestamp},
    Connection, ConnectionConfig, ConnectionEvent, CryptoContext, Discovery, DiscoveryConfig,
    DiscoveryError, DiscoveryEvent, DiscoveryStorage, DisconnectReason, ECIESStream,
    EncryptionHandshake, Frame, MemoryDiscoveryStorage, Node, NodeDiscovery, NodeRecord,
    OsRandom, RandomSource, Secp256k1Crypto,
};
use std::{sync::Arc, time::Duration};
use tokio::net::{TcpListener, UdpSocket};

#[tokio::test]
async fn loopback_rlpx_session() {
    let server_key = Arc::new(OsRandom.random_key());
    let client_key = Arc::new(OsRandom.random_key());
    let client_id = pk2id(client_key.verifying_key());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let node = Node {
        id: pk2id(server_key.verifying_key()),
        host: addr.ip().to_string(),
        port: addr.port(),
        discovery_port: addr.port(),
    };

    let server = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let handshake = EncryptionHandshake::new_server(CryptoContext::default(), server_key);
        let mut stream = ECIESStream::incoming(socket, handshake).await.unwrap();
        assert_eq!(stream.remote_id(), client_id);

        for _ in 0..3 {
            let frame = stream.next().await.unwrap().unwrap();
            let mut payload = frame.payload.to_vec();
            payload.reverse();
            stream
                .send(Frame::new(frame.packet_type + 0x10, payload))
                .await
                .unwrap();
        }

        let disconnect = stream.next().await.unwrap().unwrap();
        assert_eq!(disconnect.packet_type, DISCONNECT_PACKET_TYPE);
        assert_eq!(&disconnect.payload[..], &[0xc1, 0x08]);
    });

    let connection = Connection::new(client_key, ConnectionConfig::default());
    let (handle, mut events) = connection.connect(node.clone());
    assert_eq!(handle.node(), &node);

    match events.recv().await.unwrap() {
        ConnectionEvent::Connected { remote_id } => assert_eq!(remote_id, node.id),
        other => panic!("unexpected {:?}", other),
    }

    for (packet_type, payload) in [(0x10, vec![]), (0x11, vec![1]), (0x12, vec![7; 1000])] {
        handle.send(packet_type, payload.clone()).await.unwrap();
        match events.recv().await.unwrap() {
            ConnectionEvent::Frame(frame) => {
                let mut expected = payload;
                expected.reverse();
                assert_eq!(frame.packet_type, packet_type + 0x10);
                assert_eq!(&frame.payload[..], &expected[..]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    handle.disconnect(DisconnectReason::ClientQuitting).await;
    match events.recv().await.unwrap() {
        ConnectionEvent::Disconnected { reason, error } => {
            assert_eq!(reason, DisconnectReason::ClientQuitting);
            assert!(error.is_none());
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(events.recv().await.is_none());

    server.await.unwrap();
}

#[tokio::test]
async fn remote_disconnect_is_reported_once() {
    let server_key = Arc::new(OsRandom.random_key());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let node = Node {
        id: pk2id(server_key.verifying_key()),
        host: addr.ip().to_string(),
        port: addr.port(),
        discovery_port: addr.port(),
    };

    let server = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let handshake = EncryptionHandshake::new_server(CryptoContext::default(), server_key);
        let mut stream = ECIESStream::incoming(socket, handshake).await.unwrap();
        stream
            .send(Frame::new(DISCONNECT_PACKET_TYPE, vec![0xc1, 0x04]))
            .await
            .unwrap();
    });

    let connection = Connection::new(Arc::new(OsRandom.random_key()), ConnectionConfig::default());
    let (_handle, mut events) = connection.connect(node);

    assert!(matches!(
        events.recv().await.unwrap(),
        ConnectionEvent::Connected { .. }
    ));
    match events.recv().await.unwrap() {
        ConnectionEvent::Disconnected { reason, error } => {
            assert_eq!(reason, DisconnectReason::TooManyPeers);
            assert!(error.is_some());
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(events.recv().await.is_none());

    server.await.unwrap();
}

#[tokio::test]
async fn lookup_fans_out_to_alpha_nodes() {
    let storage = Arc::new(MemoryDiscoveryStorage::new());
    let mut peers = Vec::new();
    for _ in 0..4 {
        let key = OsRandom.random_key();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let node = Node {
            id: pk2id(key.verifying_key()),
            host: addr.ip().to_string(),
            port: addr.port(),
            discovery_port: addr.port(),
        };
        peers.push((node, socket));
    }
    // The fourth peer is the newest and must wait for the next round.
    let records = peers
        .iter()
        .enumerate()
        .map(|(i, (node, _))| NodeRecord::new(node.clone(), 1_000 + i as u64))
        .collect();
    storage.save(records);

    let (discovery, mut events) = NodeDiscovery::new(
        Arc::new(OsRandom.random_key()),
        &CryptoContext::default(),
        storage.clone(),
        DiscoveryConfig {
            response_timeout: Duration::from_millis(300),
            ..DiscoveryConfig::default()
        },
    )
    .unwrap();

    discovery.lookup().unwrap();
    assert!(discovery.is_processing());

    for (node, socket) in &peers[..3] {
        let mut buf = [0_u8; 1280];
        let mut types = Vec::new();
        for _ in 0..2 {
            let (len, _) = socket.recv_from(&mut buf).await.unwrap();
            let packet =
                packet::decode_packet(&Secp256k1Crypto, &buf[..len], unix_timestamp()).unwrap();
            assert_eq!(packet.sender, discovery.self_id());
            types.push(packet.message.packet_type());
            if let Message::FindNode(find_node) = packet.message {
                assert_eq!(find_node.target, discovery.self_id());
            }
        }
        assert_eq!(types, vec![packet::PING, packet::FIND_NODE]);
        assert!(storage.node(node.id).unwrap().used);
    }
    assert!(!storage.node(peers[3].0.id).unwrap().used);

    for _ in 0..3 {
        assert!(matches!(
            events.recv().await.unwrap(),
            DiscoveryEvent::ClientStopped { responded: false, .. }
        ));
    }
    assert!(!discovery.is_processing());
    assert_eq!(storage.len(), 1);

    discovery.lookup().unwrap();
    assert!(matches!(
        events.recv().await.unwrap(),
        DiscoveryEvent::ClientStopped { responded: false, .. }
    ));
    assert!(storage.is_empty());
    assert!(matches!(discovery.lookup(), Err(DiscoveryError::AllNodesUsed)));
}
