//! MAC-protected, AES-256-CTR encrypted RLPx frames.

use super::handshake::Secrets;
use crate::{
    errors::FrameError,
    rlp::{self, RlpStream},
};
use aes::cipher::{KeyIvInit, StreamCipher};
use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;
use derivative::Derivative;
use ethereum_types::H128;
use tracing::*;

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

pub const HEADER_LEN: usize = 16;
pub const MAC_LEN: usize = 16;
const MAX_BODY_SIZE: usize = 0x00ff_ffff;

/// A logical message carried by one RLPx frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub packet_type: u64,
    pub payload: Bytes,
    /// Bytes the frame occupies on the wire.
    pub size: usize,
    pub context_id: Option<u64>,
    pub all_frames_total_size: Option<u64>,
}

impl Frame {
    pub fn new(packet_type: u64, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        let body_size = rlp::encode(&packet_type).len() + payload.len();
        Self {
            packet_type,
            payload,
            size: frame_size(body_size),
            context_id: None,
            all_frames_total_size: None,
        }
    }

    /// Tags the frame as part of a chunked message.
    pub const fn with_context(mut self, context_id: u64, all_frames_total_size: Option<u64>) -> Self {
        self.context_id = Some(context_id);
        self.all_frames_total_size = all_frames_total_size;
        self
    }
}

pub const fn padded(len: usize) -> usize {
    (len + 15) / 16 * 16
}

pub const fn frame_size(body_size: usize) -> usize {
    HEADER_LEN + MAC_LEN + padded(body_size) + MAC_LEN
}

pub fn write_u24(buf: &mut [u8], value: usize) -> Result<(), FrameError> {
    if value > MAX_BODY_SIZE {
        return Err(FrameError::FrameTooLarge(value));
    }
    BigEndian::write_u24(buf, value as u32);
    Ok(())
}

pub fn read_u24(buf: &[u8]) -> usize {
    BigEndian::read_u24(buf) as usize
}

#[derive(Clone, Copy, Debug)]
struct FrameHeader {
    body_size: usize,
    context_id: Option<u64>,
    all_frames_total_size: Option<u64>,
}

/// Encodes and decodes frames for one established session.
///
/// Each direction owns its own cipher and MAC stream; both advance with
/// every frame and must be driven from a single task.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct FrameCodec {
    secrets: Secrets,
    #[derivative(Debug = "ignore")]
    encryptor: Aes256Ctr,
    #[derivative(Debug = "ignore")]
    decryptor: Aes256Ctr,
    header: Option<FrameHeader>,
}

impl FrameCodec {
    pub fn new(secrets: Secrets) -> Self {
        let iv = H128::zero();
        let encryptor = Aes256Ctr::new(secrets.aes.as_bytes().into(), iv.as_bytes().into());
        let decryptor = Aes256Ctr::new(secrets.aes.as_bytes().into(), iv.as_bytes().into());
        Self {
            secrets,
            encryptor,
            decryptor,
            header: None,
        }
    }

    pub fn encode_frame(&mut self, frame: &Frame) -> Result<Vec<u8>, FrameError> {
        let packet_type = rlp::encode(&frame.packet_type);
        let body_size = packet_type.len() + frame.payload.len();

        let mut header = [0_u8; HEADER_LEN];
        write_u24(&mut header[..3], body_size)?;
        let header_data = encode_header_data(frame);
        if 3 + header_data.len() > HEADER_LEN {
            return Err(FrameError::InvalidHeader);
        }
        header[3..3 + header_data.len()].copy_from_slice(&header_data);

        self.encryptor.apply_keystream(&mut header);
        let header_mac = self.secrets.egress_mac.update_header(&header);

        let mut body = vec![0_u8; padded(body_size)];
        body[..packet_type.len()].copy_from_slice(&packet_type);
        body[packet_type.len()..body_size].copy_from_slice(&frame.payload);
        self.encryptor.apply_keystream(&mut body);
        let body_mac = self.secrets.egress_mac.update_body(&body);

        let mut out = Vec::with_capacity(frame_size(body_size));
        out.extend_from_slice(&header);
        out.extend_from_slice(header_mac.as_bytes());
        out.extend_from_slice(&body);
        out.extend_from_slice(body_mac.as_bytes());
        Ok(out)
    }

    /// Reads one frame from the front of `data`.
    ///
    /// Returns `Ok(None)` until the whole frame is buffered. The verified
    /// header is kept between calls, so the caller passes the same unconsumed
    /// bytes again and advances by [`Frame::size`] once a frame is returned.
    pub fn read_frame(&mut self, data: &[u8]) -> Result<Option<Frame>, FrameError> {
        let header = match self.header {
            Some(header) => header,
            None => {
                if data.len() < HEADER_LEN + MAC_LEN {
                    return Ok(None);
                }
                let header = self.read_header(&data[..HEADER_LEN + MAC_LEN])?;
                self.header = Some(header);
                header
            }
        };

        let size = frame_size(header.body_size);
        if data.len() < size {
            trace!("waiting for {} more frame bytes", size - data.len());
            return Ok(None);
        }

        let body_start = HEADER_LEN + MAC_LEN;
        let body_end = size - MAC_LEN;
        let mut body = data[body_start..body_end].to_vec();
        let expected = H128::from_slice(&data[body_end..size]);
        if self.secrets.ingress_mac.update_body(&body) != expected {
            return Err(FrameError::MacMismatch);
        }
        self.header = None;

        self.decryptor.apply_keystream(&mut body);
        body.truncate(header.body_size);

        let packet_type = rlp::decode(&body)?;
        let payload = Bytes::copy_from_slice(&body[packet_type.encoded_len()..]);

        Ok(Some(Frame {
            packet_type: packet_type.as_u64()?,
            payload,
            size,
            context_id: header.context_id,
            all_frames_total_size: header.all_frames_total_size,
        }))
    }

    fn read_header(&mut self, data: &[u8]) -> Result<FrameHeader, FrameError> {
        let mut header = [0_u8; HEADER_LEN];
        header.copy_from_slice(&data[..HEADER_LEN]);
        let expected = H128::from_slice(&data[HEADER_LEN..HEADER_LEN + MAC_LEN]);
        if self.secrets.ingress_mac.update_header(&header) != expected {
            return Err(FrameError::MacMismatch);
        }

        self.decryptor.apply_keystream(&mut header);
        let body_size = read_u24(&header[..3]);

        let header_data = rlp::decode(&header[3..])?;
        let context_id = match header_data.at(1) {
            Ok(element) => Some(element.as_u64()?),
            Err(_) => None,
        };
        let all_frames_total_size = match header_data.at(2) {
            Ok(element) => Some(element.as_u64()?),
            Err(_) => None,
        };

        Ok(FrameHeader {
            body_size,
            context_id,
            all_frames_total_size,
        })
    }
}

/// `[capability-id, context-id?, total-size?]`; the total size is only
/// written alongside a context id.
fn encode_header_data(frame: &Frame) -> Vec<u8> {
    let fields = match (frame.context_id, frame.all_frames_total_size) {
        (Some(_), Some(_)) => 3,
        (Some(_), None) => 2,
        (None, _) => 1,
    };
    let mut s = RlpStream::new_list(fields);
    s.append(&0_u64);
    if let Some(context_id) = frame.context_id {
        s.append(&context_id);
        if let Some(total) = frame.all_frames_total_size {
            s.append(&total);
        }
    }
    s.out()
}
