use spv_devp2p::{
    Connection, ConnectionConfig, ConnectionEvent, DisconnectReason, Node, OsRandom,
    RandomSource,
};
use std::sync::Arc;
use tracing::*;
use tracing_subscriber::EnvFilter;

const BOOTNODE: &str = "enode://d860a01f9722d78051619d1e2351aba3f43f943f6f00718d1b9baa4101932a1f5011f16bb2b1bb35db20d6fe28fa0bf09636d26a87d31de9ec6203eeedb1f666@18.138.108.67:30303";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let node: Node = std::env::args()
        .nth(1)
        .as_deref()
        .unwrap_or(BOOTNODE)
        .parse()?;

    let connection = Connection::new(Arc::new(OsRandom.random_key()), ConnectionConfig::default());
    let (handle, mut events) = connection.connect(node);

    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::Connected { remote_id } => {
                info!("handshake with {} complete", remote_id);
                handle.disconnect(DisconnectReason::ClientQuitting).await;
            }
            ConnectionEvent::Frame(frame) => {
                info!("frame of type {} ({} bytes)", frame.packet_type, frame.payload.len());
            }
            ConnectionEvent::Disconnected { reason, error } => {
                info!("disconnected: {:?} {:?}", reason, error);
            }
        }
    }

    Ok(())
}
