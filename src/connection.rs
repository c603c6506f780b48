//! Dialing side of an RLPx session, run as a task per connection.

use crate::{
    config::ConnectionConfig,
    crypto::CryptoContext,
    ecies::{ECIESStream, EncryptionHandshake, Frame},
    errors::ConnectionError,
    rlp,
    types::{DisconnectReason, Node, PeerId},
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use k256::ecdsa::SigningKey;
use num_traits::{FromPrimitive, ToPrimitive};
use std::{future::Future, io, sync::Arc};
use tokio::{net::TcpStream, sync::mpsc, time::timeout};
use tracing::*;
use uuid::Uuid;

/// Base protocol message id of `Disconnect`.
pub const DISCONNECT_PACKET_TYPE: u64 = 0x01;

#[derive(Debug)]
pub enum ConnectionEvent {
    Connected { remote_id: PeerId },
    Frame(Frame),
    /// Always the last event of a connection.
    Disconnected {
        reason: DisconnectReason,
        error: Option<ConnectionError>,
    },
}

#[derive(Debug)]
enum Command {
    Send(Frame),
    Disconnect(DisconnectReason),
}

/// Opens RLPx sessions with one local identity.
#[derive(Clone, Debug)]
pub struct Connection {
    secret_key: Arc<SigningKey>,
    context: CryptoContext,
    config: ConnectionConfig,
}

impl Connection {
    pub fn new(secret_key: Arc<SigningKey>, config: ConnectionConfig) -> Self {
        Self {
            secret_key,
            context: CryptoContext::default(),
            config,
        }
    }

    #[must_use]
    pub fn with_crypto(mut self, context: CryptoContext) -> Self {
        self.context = context;
        self
    }

    /// Spawns the session task. Events arrive on the returned receiver; the
    /// session ends when the handle is dropped.
    pub fn connect(&self, node: Node) -> (FrameConnection, mpsc::Receiver<ConnectionEvent>) {
        let id = Uuid::new_v4();
        let (commands_tx, commands_rx) = mpsc::channel(self.config.command_capacity);
        let (events_tx, events_rx) = mpsc::channel(self.config.command_capacity);

        let span = span!(Level::DEBUG, "connection", "id={}, peer={}", id, node.id);
        tokio::spawn(
            run(
                node.clone(),
                self.clone(),
                commands_rx,
                events_tx,
            )
            .instrument(span),
        );

        (
            FrameConnection {
                id,
                node,
                commands: commands_tx,
            },
            events_rx,
        )
    }
}

/// Handle to a running session.
#[derive(Debug)]
pub struct FrameConnection {
    id: Uuid,
    node: Node,
    commands: mpsc::Sender<Command>,
}

impl FrameConnection {
    pub const fn id(&self) -> Uuid {
        self.id
    }

    pub const fn node(&self) -> &Node {
        &self.node
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    pub async fn send(
        &self,
        packet_type: u64,
        payload: impl Into<Bytes>,
    ) -> Result<(), ConnectionError> {
        self.send_frame(Frame::new(packet_type, payload)).await
    }

    /// Queues a frame; frames sent before the handshake finishes wait for it.
    pub async fn send_frame(&self, frame: Frame) -> Result<(), ConnectionError> {
        self.commands
            .send(Command::Send(frame))
            .await
            .map_err(|_| ConnectionError::Io(io::ErrorKind::NotConnected.into()))
    }

    /// Sends `Disconnect` to the peer and closes the socket.
    pub async fn disconnect(&self, reason: DisconnectReason) {
        let _ = self.commands.send(Command::Disconnect(reason)).await;
    }
}

async fn run(
    node: Node,
    connection: Connection,
    mut commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<ConnectionEvent>,
) {
    let event = match session(&node, connection, &mut commands, &events).await {
        Ok(reason) => {
            debug!("disconnected: {:?}", reason);
            ConnectionEvent::Disconnected {
                reason,
                error: None,
            }
        }
        Err(error) => {
            debug!("connection closed with error: {}", error);
            ConnectionEvent::Disconnected {
                reason: error.reason(),
                error: Some(error),
            }
        }
    };
    let _ = events.send(event).await;
}

async fn session(
    node: &Node,
    connection: Connection,
    commands: &mut mpsc::Receiver<Command>,
    events: &mpsc::Sender<ConnectionEvent>,
) -> Result<DisconnectReason, ConnectionError> {
    let Connection {
        secret_key,
        context,
        config,
    } = connection;

    let addr = node
        .tcp_addr()
        .map_err(|e| ConnectionError::Io(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
    let handshake = EncryptionHandshake::new_client(context, secret_key, node.id)?;

    // Commands issued before the session is up wait in `pending`.
    let mut pending = Vec::new();
    trace!("connecting to {}", addr);
    let socket = match until_dropped(
        timeout(config.connect_timeout, TcpStream::connect(addr)),
        commands,
        &mut pending,
    )
    .await
    {
        Some(socket) => socket.map_err(|_| ConnectionError::Timeout("connect"))??,
        None => return Ok(DisconnectReason::ClientQuitting),
    };
    let mut stream = match until_dropped(
        timeout(
            config.handshake_timeout,
            ECIESStream::connect(socket, handshake),
        ),
        commands,
        &mut pending,
    )
    .await
    {
        Some(stream) => stream.map_err(|_| ConnectionError::Timeout("handshake"))??,
        None => return Ok(DisconnectReason::ClientQuitting),
    };

    info!("RLPx session established");
    let connected = ConnectionEvent::Connected {
        remote_id: stream.remote_id(),
    };
    if events.send(connected).await.is_err() {
        return Ok(DisconnectReason::ClientQuitting);
    }

    for command in pending {
        if let Some(reason) = execute(&mut stream, command).await? {
            return Ok(reason);
        }
    }

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => {
                    if let Some(reason) = execute(&mut stream, command).await? {
                        return Ok(reason);
                    }
                }
                None => {
                    let _ = stream.close().await;
                    return Ok(DisconnectReason::ClientQuitting);
                }
            },
            inbound = timeout(config.idle_timeout, stream.next()) => match inbound {
                Err(_) => return Err(ConnectionError::Timeout("idle")),
                Ok(None) => return Err(ConnectionError::ClosedByPeer),
                Ok(Some(frame)) => {
                    let frame = frame?;
                    if frame.packet_type == DISCONNECT_PACKET_TYPE {
                        return Err(ConnectionError::Disconnected(parse_disconnect(&frame.payload)?));
                    }
                    if events.send(ConnectionEvent::Frame(frame)).await.is_err() {
                        return Ok(DisconnectReason::ClientQuitting);
                    }
                }
            },
        }
    }
}

/// Drives `step` while queueing commands. `None` once every handle is dropped.
async fn until_dropped<F: Future>(
    step: F,
    commands: &mut mpsc::Receiver<Command>,
    pending: &mut Vec<Command>,
) -> Option<F::Output> {
    tokio::pin!(step);
    loop {
        tokio::select! {
            output = &mut step => return Some(output),
            command = commands.recv() => match command {
                Some(command) => pending.push(command),
                None => return None,
            },
        }
    }
}

/// Returns the reason when the command ends the session.
async fn execute(
    stream: &mut ECIESStream<TcpStream>,
    command: Command,
) -> Result<Option<DisconnectReason>, ConnectionError> {
    match command {
        Command::Send(frame) => {
            trace!("sending frame of type {}", frame.packet_type);
            stream.send(frame).await?;
            Ok(None)
        }
        Command::Disconnect(reason) => {
            let payload = rlp::encode_list(&[reason.to_u8().unwrap_or_default()]);
            let _ = stream.send(Frame::new(DISCONNECT_PACKET_TYPE, payload)).await;
            let _ = stream.close().await;
            Ok(Some(reason))
        }
    }
}

/// Reads the reason of a `Disconnect` payload, list-wrapped or bare.
pub fn parse_disconnect(payload: &[u8]) -> Result<DisconnectReason, ConnectionError> {
    let element = rlp::decode(payload)
        .map_err(|_| ConnectionError::Protocol(DisconnectReason::ProtocolBreach))?;
    let code = if element.is_list() {
        element.val_at::<u8>(0)
    } else {
        element.as_val::<u8>()
    }
    .map_err(|_| ConnectionError::Protocol(DisconnectReason::ProtocolBreach))?;
    DisconnectReason::from_u8(code).ok_or(ConnectionError::Protocol(DisconnectReason::ProtocolBreach))
}
