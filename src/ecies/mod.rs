//! RLPx transport: ECIES handshake and encrypted frames.

mod frame;
mod handshake;
mod mac;
mod proto;

pub use self::{
    frame::{frame_size, padded, read_u24, write_u24, Frame, FrameCodec, HEADER_LEN, MAC_LEN},
    handshake::{AuthAckMessage, AuthMessage, EncryptionHandshake, Secrets},
    mac::MAC,
    proto::{ECIESCodec, ECIESState, ECIESStream, ECIESValue},
};
