use crate::{rlp::DecoderError, types::DisconnectReason};
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ECIESError {
    #[error("secp256k1 failure: {0}")]
    Secp256k1(#[from] k256::ecdsa::Error),
    #[error("I/O failure: {0}")]
    Io(#[from] io::Error),
    #[error("malformed handshake payload: {0}")]
    Rlp(#[from] DecoderError),
    #[error("tag check failed")]
    TagCheckFailed,
    #[error("invalid auth data")]
    InvalidAuthData,
    #[error("invalid ack data")]
    InvalidAckData,
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("ECIES message of {0} bytes does not fit the size prefix")]
    MessageTooLarge(usize),
}

impl From<ECIESError> for io::Error {
    fn from(error: ECIESError) -> Self {
        match error {
            ECIESError::Io(error) => error,
            other => Self::new(io::ErrorKind::InvalidData, other),
        }
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame MAC mismatch")]
    MacMismatch,
    #[error("malformed frame: {0}")]
    Rlp(#[from] DecoderError),
    #[error("frame body of {0} bytes does not fit the 24-bit size field")]
    FrameTooLarge(usize),
    #[error("frame header fields do not fit the header block")]
    InvalidHeader,
    #[error("frame traffic before the handshake finished")]
    MissingSecrets,
}

impl From<FrameError> for io::Error {
    fn from(error: FrameError) -> Self {
        Self::new(io::ErrorKind::InvalidData, error)
    }
}

/// Terminal error of a single RLPx connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("handshake failed: {0}")]
    Handshake(#[from] ECIESError),
    #[error("frame failure: {0}")]
    Frame(#[from] FrameError),
    #[error("socket failure: {0}")]
    Io(io::Error),
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("connection closed by peer")]
    ClosedByPeer,
    #[error("protocol violation: {0:?}")]
    Protocol(DisconnectReason),
    #[error("peer disconnected: {0:?}")]
    Disconnected(DisconnectReason),
}

impl ConnectionError {
    /// Disconnect reason a higher layer should report for this error.
    pub const fn reason(&self) -> DisconnectReason {
        match self {
            Self::Handshake(_) | Self::Frame(_) => DisconnectReason::ProtocolBreach,
            Self::Io(_) => DisconnectReason::TcpSubsystemError,
            Self::Timeout(_) => DisconnectReason::PingTimeout,
            Self::ClosedByPeer => DisconnectReason::DisconnectRequested,
            Self::Protocol(reason) | Self::Disconnected(reason) => *reason,
        }
    }
}

impl From<io::Error> for ConnectionError {
    fn from(error: io::Error) -> Self {
        let typed = error
            .get_ref()
            .map_or(false, |e| e.is::<FrameError>() || e.is::<ECIESError>());
        if !typed {
            return Self::Io(error);
        }

        match error.into_inner().map(|e| e.downcast::<FrameError>()) {
            Some(Ok(e)) => Self::Frame(*e),
            Some(Err(e)) => match e.downcast::<ECIESError>() {
                Ok(e) => Self::Handshake(*e),
                Err(e) => Self::Io(io::Error::new(io::ErrorKind::Other, e)),
            },
            None => Self::Io(io::ErrorKind::Other.into()),
        }
    }
}
