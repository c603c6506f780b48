use super::{
    frame::{Frame, FrameCodec},
    handshake::EncryptionHandshake,
};
use crate::{
    errors::{ECIESError, FrameError},
    types::PeerId,
};
use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BytesMut};
use futures::{Sink, SinkExt, Stream, TryStreamExt};
use std::{
    fmt::Debug,
    io,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::*;
use tracing::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Current ECIES state of a connection
pub enum ECIESState {
    Auth,
    Ack,
    Frame,
}

#[derive(Clone, Debug, PartialEq, Eq)]
/// Raw values for an ECIES protocol
pub enum ECIESValue {
    Auth,
    Ack,
    AuthReceive(PeerId),
    Frame(Frame),
}

/// Tokio codec for the handshake followed by frame traffic
#[derive(Debug)]
pub struct ECIESCodec {
    handshake: EncryptionHandshake,
    frames: Option<FrameCodec>,
    state: ECIESState,
}

impl ECIESCodec {
    pub fn new(handshake: EncryptionHandshake) -> Self {
        let state = if handshake.is_initiator() {
            ECIESState::Ack
        } else {
            ECIESState::Auth
        };
        Self {
            handshake,
            frames: None,
            state,
        }
    }

    pub const fn state(&self) -> ECIESState {
        self.state
    }

    /// Splits one size-prefixed handshake message off `buf`, if complete.
    fn split_handshake_message(buf: &mut BytesMut) -> Option<BytesMut> {
        if buf.len() < 2 {
            return None;
        }
        let size = 2 + usize::from(BigEndian::read_u16(&buf[..2]));
        if buf.len() < size {
            return None;
        }
        Some(buf.split_to(size))
    }
}

impl Decoder for ECIESCodec {
    type Item = ECIESValue;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.state {
            ECIESState::Auth => {
                trace!("parsing auth");
                let data = match Self::split_handshake_message(buf) {
                    Some(data) => data,
                    None => return Ok(None),
                };
                let remote_id = self.handshake.parse_auth(&data)?;
                Ok(Some(ECIESValue::AuthReceive(remote_id)))
            }
            ECIESState::Ack => {
                trace!("parsing ack with len {}", buf.len());
                let data = match Self::split_handshake_message(buf) {
                    Some(data) => data,
                    None => return Ok(None),
                };
                let secrets = self.handshake.extract_secrets(&data)?;
                self.frames = Some(FrameCodec::new(secrets));
                self.state = ECIESState::Frame;
                Ok(Some(ECIESValue::Ack))
            }
            ECIESState::Frame => {
                let frames = self.frames.as_mut().ok_or(FrameError::MissingSecrets)?;
                match frames.read_frame(&buf[..])? {
                    Some(frame) => {
                        buf.advance(frame.size);
                        Ok(Some(ECIESValue::Frame(frame)))
                    }
                    None => Ok(None),
                }
            }
        }
    }
}

impl Encoder<ECIESValue> for ECIESCodec {
    type Error = io::Error;

    fn encode(&mut self, item: ECIESValue, buf: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            ECIESValue::AuthReceive(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "AuthReceive is not expected",
            )),
            ECIESValue::Auth => {
                let data = self.handshake.create_auth_message()?;
                self.state = ECIESState::Ack;
                buf.extend_from_slice(&data);
                Ok(())
            }
            ECIESValue::Ack => {
                let (data, secrets) = self.handshake.create_ack()?;
                self.frames = Some(FrameCodec::new(secrets));
                self.state = ECIESState::Frame;
                buf.extend_from_slice(&data);
                Ok(())
            }
            ECIESValue::Frame(frame) => {
                let frames = self.frames.as_mut().ok_or(FrameError::MissingSecrets)?;
                let data = frames.encode_frame(&frame)?;
                buf.extend_from_slice(&data);
                Ok(())
            }
        }
    }
}

/// `ECIES` stream over TCP exchanging frames
#[derive(Debug)]
pub struct ECIESStream<Io> {
    stream: Framed<Io, ECIESCodec>,
    remote_id: PeerId,
}

impl<Io> ECIESStream<Io>
where
    Io: AsyncRead + AsyncWrite + Debug + Send + Unpin,
{
    /// Run the initiator handshake over `transport`
    pub async fn connect(transport: Io, handshake: EncryptionHandshake) -> Result<Self, io::Error> {
        let remote_id = handshake
            .remote_id()
            .ok_or_else(|| io::Error::from(ECIESError::InvalidPublicKey))?;
        let mut transport = ECIESCodec::new(handshake).framed(transport);

        debug!("sending ecies auth ...");
        transport.send(ECIESValue::Auth).await?;

        debug!("waiting for ecies ack ...");
        let ack = transport.try_next().await?;

        debug!("parsing ecies ack ...");
        match ack {
            Some(ECIESValue::Ack) => Ok(Self {
                stream: transport,
                remote_id,
            }),
            None => Err(io::ErrorKind::UnexpectedEof.into()),
            Some(other) => Err(io::Error::new(
                io::ErrorKind::Other,
                format!("invalid handshake: expected ack, got {:?} instead", other),
            )),
        }
    }

    /// Run the recipient handshake on a just connected client
    pub async fn incoming(transport: Io, handshake: EncryptionHandshake) -> Result<Self, io::Error> {
        debug!("incoming ecies stream ...");
        let mut transport = ECIESCodec::new(handshake).framed(transport);
        let auth = transport.try_next().await?;

        debug!("receiving ecies auth");
        let remote_id = match auth {
            Some(ECIESValue::AuthReceive(remote_id)) => remote_id,
            other => {
                debug!("expected auth, got {:?} instead", other);
                return Err(io::Error::new(io::ErrorKind::Other, "invalid handshake"));
            }
        };

        debug!("sending ecies ack ...");
        transport.send(ECIESValue::Ack).await?;

        Ok(Self {
            stream: transport,
            remote_id,
        })
    }

    /// Get the remote id
    pub const fn remote_id(&self) -> PeerId {
        self.remote_id
    }
}

impl<Io> Stream for ECIESStream<Io>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    type Item = Result<Frame, io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match futures::ready!(Pin::new(&mut self.get_mut().stream).poll_next(cx)) {
            Some(Ok(ECIESValue::Frame(frame))) => Poll::Ready(Some(Ok(frame))),
            Some(Ok(_)) => Poll::Ready(Some(Err(io::Error::new(
                io::ErrorKind::Other,
                "ECIES stream protocol error",
            )))),
            Some(Err(e)) => Poll::Ready(Some(Err(e))),
            None => Poll::Ready(None),
        }
    }
}

impl<Io> Sink<Frame> for ECIESStream<Io>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    type Error = io::Error;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.get_mut().stream).poll_ready(cx)
    }

    fn start_send(self: Pin<&mut Self>, item: Frame) -> Result<(), Self::Error> {
        Pin::new(&mut self.get_mut().stream).start_send(ECIESValue::Frame(item))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.get_mut().stream).poll_close(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        crypto::{CryptoContext, OsRandom, RandomSource},
        util::pk2id,
    };
    use futures::StreamExt;
    use std::sync::Arc;

    #[tokio::test]
    async fn duplex_session() {
        let server_key = Arc::new(OsRandom.random_key());
        let client_key = Arc::new(OsRandom.random_key());
        let server_id = pk2id(server_key.verifying_key());
        let client_id = pk2id(client_key.verifying_key());

        let (client_io, server_io) = tokio::io::duplex(4096);

        let server = tokio::spawn(async move {
            let handshake = EncryptionHandshake::new_server(CryptoContext::default(), server_key);
            let mut stream = ECIESStream::incoming(server_io, handshake).await.unwrap();
            assert_eq!(stream.remote_id(), client_id);

            let frame = stream.next().await.unwrap().unwrap();
            stream
                .send(Frame::new(frame.packet_type + 1, frame.payload))
                .await
                .unwrap();
        });

        let handshake =
            EncryptionHandshake::new_client(CryptoContext::default(), client_key, server_id).unwrap();
        let mut stream = ECIESStream::connect(client_io, handshake).await.unwrap();
        assert_eq!(stream.remote_id(), server_id);

        stream.send(Frame::new(0x10, vec![1, 2, 3])).await.unwrap();
        let reply = stream.next().await.unwrap().unwrap();
        assert_eq!(reply.packet_type, 0x11);
        assert_eq!(&reply.payload[..], &[1, 2, 3]);

        server.await.unwrap();
    }

    #[test]
    fn frames_before_handshake_are_refused() {
        let handshake = EncryptionHandshake::new_server(
            CryptoContext::default(),
            Arc::new(OsRandom.random_key()),
        );
        let mut codec = ECIESCodec::new(handshake);
        assert_eq!(codec.state(), ECIESState::Auth);

        let mut buf = BytesMut::new();
        assert!(codec
            .encode(ECIESValue::Frame(Frame::new(0, Vec::new())), &mut buf)
            .is_err());
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }
}
