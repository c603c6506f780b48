use anyhow::Context;
use spv_devp2p::{
    parse_enode, Config, CryptoContext, Discovery, MemoryDiscoveryStorage, NodeDiscovery,
    NodeManager, NodeManagerEvent, OsRandom, RandomSource,
};
use std::{sync::Arc, time::Duration};
use tracing::*;
use tracing_subscriber::EnvFilter;

const BOOTNODES: &[&str] = &[
    "enode://d860a01f9722d78051619d1e2351aba3f43f943f6f00718d1b9baa4101932a1f5011f16bb2b1bb35db20d6fe28fa0bf09636d26a87d31de9ec6203eeedb1f666@18.138.108.67:30303",
    "enode://22a8232c3abc76a16ae9d6c3b164f98775fe226f0917b0ca871128a74a8e9630b458460865bab457221f1d448dd9791d24c4e5d88786180ac185df813a68d4de@3.209.45.79:30303",
];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(&path).with_context(|| format!("loading {}", path))?,
        None => Config::default(),
    };
    let bootnodes = if config.discovery.bootnodes.is_empty() {
        BOOTNODES.iter().map(|s| s.to_string()).collect()
    } else {
        config.discovery.bootnodes.clone()
    };

    let storage = Arc::new(MemoryDiscoveryStorage::new());
    let (discovery, discovery_events) = NodeDiscovery::new(
        Arc::new(OsRandom.random_key()),
        &CryptoContext::default(),
        storage.clone(),
        config.discovery.clone(),
    )?;
    let discovery = Arc::new(discovery);
    let manager = Arc::new(NodeManager::new(
        storage.clone(),
        discovery.clone(),
        config.discovery.event_capacity,
    ));
    let _pump = manager.attach(discovery_events);
    let mut announcements = manager.subscribe();

    manager.add(
        bootnodes
            .iter()
            .map(|uri| parse_enode(uri))
            .collect::<Result<Vec<_>, _>>()?,
    );

    for round in 0..5 {
        if let Err(e) = discovery.lookup() {
            warn!("lookup round {} not started: {}", round, e);
        }
        while discovery.is_processing() {
            if let Ok(Ok(NodeManagerEvent::NewIdsAdded)) =
                tokio::time::timeout(Duration::from_secs(1), announcements.recv()).await
            {
                info!("{} nodes known", storage.len());
            }
        }
    }

    while let Some(node) = manager.node() {
        println!("{}", node);
    }

    Ok(())
}
