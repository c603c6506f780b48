//! Recursive Length Prefix serialization.
//!
//! Encoding goes through [`RlpStream`] and the [`Encodable`] trait, decoding
//! produces an [`RlpElement`] tree with typed accessors that refuse to coerce
//! a list into a string or the other way around.

use bytes::Bytes;
use ethereum_types::{H128, H256, H512, H520, U256};
use thiserror::Error;

const MAX_DEPTH: usize = 128;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum DecoderError {
    #[error("empty RLP input")]
    EmptyData,
    #[error("RLP input is shorter than the declared element length")]
    InvalidElementLength,
    #[error("RLP element is not a list")]
    InvalidListValue,
    #[error("RLP element is not an integer")]
    InvalidIntValue,
    #[error("RLP element is not a big integer")]
    InvalidBigIntValue,
    #[error("RLP element is not a UTF-8 string")]
    InvalidStringValue,
    #[error("RLP element is not a byte string of the expected size")]
    InvalidBytesValue,
    #[error("RLP list has too few elements")]
    ListTooShort,
    #[error("RLP nesting is too deep")]
    TooDeep,
}

/// Values that know how to append themselves to an [`RlpStream`].
pub trait Encodable {
    fn rlp_append(&self, s: &mut RlpStream);
}

/// Values that can be read back from a decoded [`RlpElement`].
pub trait Decodable: Sized {
    fn decode(rlp: &RlpElement) -> Result<Self, DecoderError>;
}

#[derive(Clone, Copy, Debug)]
struct ListInfo {
    position: usize,
    remaining: usize,
}

/// Appends RLP items into a single buffer, closing lists once their declared
/// number of items has been written.
#[derive(Clone, Debug, Default)]
pub struct RlpStream {
    buffer: Vec<u8>,
    unfinished: Vec<ListInfo>,
}

impl RlpStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_list(len: usize) -> Self {
        let mut stream = Self::new();
        stream.begin_list(len);
        stream
    }

    pub fn append<E: Encodable + ?Sized>(&mut self, value: &E) -> &mut Self {
        value.rlp_append(self);
        self
    }

    pub fn append_list<E: Encodable>(&mut self, values: &[E]) -> &mut Self {
        self.begin_list(values.len());
        for value in values {
            self.append(value);
        }
        self
    }

    /// Appends already encoded RLP, counting it as `item_count` items.
    pub fn append_raw(&mut self, encoded: &[u8], item_count: usize) -> &mut Self {
        self.buffer.extend_from_slice(encoded);
        self.note_appended(item_count);
        self
    }

    pub fn begin_list(&mut self, len: usize) -> &mut Self {
        if len == 0 {
            self.buffer.push(0xc0);
            self.note_appended(1);
        } else {
            self.unfinished.push(ListInfo {
                position: self.buffer.len(),
                remaining: len,
            });
        }
        self
    }

    pub fn append_empty_data(&mut self) -> &mut Self {
        self.buffer.push(0x80);
        self.note_appended(1);
        self
    }

    /// Appends a byte string.
    pub fn encoder_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        if bytes.len() == 1 && bytes[0] < 0x80 {
            self.buffer.push(bytes[0]);
        } else {
            self.buffer
                .extend_from_slice(&encode_header(bytes.len(), 0x80, 0xb7));
            self.buffer.extend_from_slice(bytes);
        }
        self.note_appended(1);
        self
    }

    /// Appends an unsigned integer given in big-endian form.
    pub fn encoder_uint(&mut self, big_endian: &[u8]) -> &mut Self {
        let first = big_endian
            .iter()
            .position(|b| *b != 0)
            .unwrap_or(big_endian.len());
        if first == big_endian.len() {
            self.append_empty_data()
        } else {
            self.encoder_bytes(&big_endian[first..])
        }
    }

    pub fn is_finished(&self) -> bool {
        self.unfinished.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Consumes the stream.
    ///
    /// # Panics
    /// If a list was begun but not all of its items were appended.
    pub fn out(self) -> Vec<u8> {
        assert!(self.is_finished(), "out() called on an unfinished RLP stream");
        self.buffer
    }

    fn note_appended(&mut self, count: usize) {
        let mut count = count;
        while count > 0 {
            let list = match self.unfinished.last_mut() {
                Some(list) => list,
                None => return,
            };
            list.remaining = list.remaining.saturating_sub(count);
            if list.remaining > 0 {
                return;
            }

            let position = list.position;
            self.unfinished.pop();
            let payload_len = self.buffer.len() - position;
            let header = encode_header(payload_len, 0xc0, 0xf7);
            self.buffer.splice(position..position, header);
            count = 1;
        }
    }
}

fn encode_header(len: usize, short_tag: u8, long_tag: u8) -> Vec<u8> {
    if len < 56 {
        return vec![short_tag + len as u8];
    }
    let be = (len as u64).to_be_bytes();
    let first = be.iter().position(|b| *b != 0).unwrap_or(be.len() - 1);
    let mut header = Vec::with_capacity(1 + be.len() - first);
    header.push(long_tag + (be.len() - first) as u8);
    header.extend_from_slice(&be[first..]);
    header
}

/// Encodes a single value.
pub fn encode<E: Encodable + ?Sized>(value: &E) -> Vec<u8> {
    let mut s = RlpStream::new();
    s.append(value);
    s.out()
}

/// Encodes a homogeneous list.
pub fn encode_list<E: Encodable>(values: &[E]) -> Vec<u8> {
    let mut s = RlpStream::new();
    s.append_list(values);
    s.out()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RlpValue {
    String(Bytes),
    List(Vec<RlpElement>),
}

/// One decoded element, together with the size of its header and payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RlpElement {
    length: usize,
    prefix_length: usize,
    value: RlpValue,
}

impl RlpElement {
    /// Payload length in bytes.
    pub fn length(&self) -> usize {
        self.length
    }

    /// Length of the element's own header.
    pub fn prefix_length(&self) -> usize {
        self.prefix_length
    }

    /// Header plus payload.
    pub fn encoded_len(&self) -> usize {
        self.prefix_length + self.length
    }

    pub fn is_list(&self) -> bool {
        matches!(self.value, RlpValue::List(_))
    }

    pub fn value(&self) -> &RlpValue {
        &self.value
    }

    pub fn data(&self) -> Result<&[u8], DecoderError> {
        match &self.value {
            RlpValue::String(data) => Ok(data),
            RlpValue::List(_) => Err(DecoderError::InvalidBytesValue),
        }
    }

    pub fn as_list(&self) -> Result<&[RlpElement], DecoderError> {
        match &self.value {
            RlpValue::List(items) => Ok(items),
            RlpValue::String(_) => Err(DecoderError::InvalidListValue),
        }
    }

    pub fn item_count(&self) -> Result<usize, DecoderError> {
        self.as_list().map(<[RlpElement]>::len)
    }

    pub fn at(&self, index: usize) -> Result<&RlpElement, DecoderError> {
        self.as_list()?
            .get(index)
            .ok_or(DecoderError::ListTooShort)
    }

    pub fn val_at<T: Decodable>(&self, index: usize) -> Result<T, DecoderError> {
        T::decode(self.at(index)?)
    }

    pub fn list_at<T: Decodable>(&self, index: usize) -> Result<Vec<T>, DecoderError> {
        self.at(index)?.as_list()?.iter().map(T::decode).collect()
    }

    pub fn as_val<T: Decodable>(&self) -> Result<T, DecoderError> {
        T::decode(self)
    }

    pub fn as_u64(&self) -> Result<u64, DecoderError> {
        let data = match &self.value {
            RlpValue::String(data) if data.len() <= 8 => data,
            _ => return Err(DecoderError::InvalidIntValue),
        };
        Ok(data
            .iter()
            .fold(0_u64, |acc, byte| (acc << 8) | u64::from(*byte)))
    }

    pub fn as_usize(&self) -> Result<usize, DecoderError> {
        usize::try_from(self.as_u64()?).map_err(|_| DecoderError::InvalidIntValue)
    }

    pub fn as_u256(&self) -> Result<U256, DecoderError> {
        match &self.value {
            RlpValue::String(data) if data.len() <= 32 => Ok(U256::from_big_endian(data)),
            _ => Err(DecoderError::InvalidBigIntValue),
        }
    }

    pub fn as_string(&self) -> Result<String, DecoderError> {
        match &self.value {
            RlpValue::String(data) => String::from_utf8(data.to_vec())
                .map_err(|_| DecoderError::InvalidStringValue),
            RlpValue::List(_) => Err(DecoderError::InvalidStringValue),
        }
    }
}

/// Reads exactly one element from the front of `input`. Bytes after it are
/// left alone; [`RlpElement::encoded_len`] tells how much was consumed.
pub fn decode(input: &[u8]) -> Result<RlpElement, DecoderError> {
    decode_at_depth(input, 0)
}

pub fn decode_val<T: Decodable>(input: &[u8]) -> Result<T, DecoderError> {
    T::decode(&decode(input)?)
}

fn decode_at_depth(input: &[u8], depth: usize) -> Result<RlpElement, DecoderError> {
    if depth > MAX_DEPTH {
        return Err(DecoderError::TooDeep);
    }

    let (prefix_length, length, is_list) = decode_length(input)?;
    let end = prefix_length
        .checked_add(length)
        .ok_or(DecoderError::InvalidElementLength)?;
    if input.len() < end {
        return Err(DecoderError::InvalidElementLength);
    }
    let payload = &input[prefix_length..end];

    let value = if is_list {
        let mut items = Vec::new();
        let mut offset = 0;
        while offset < payload.len() {
            let item = decode_at_depth(&payload[offset..], depth + 1)?;
            offset += item.encoded_len();
            items.push(item);
        }
        RlpValue::List(items)
    } else {
        RlpValue::String(Bytes::copy_from_slice(payload))
    };

    Ok(RlpElement {
        length,
        prefix_length,
        value,
    })
}

fn decode_length(input: &[u8]) -> Result<(usize, usize, bool), DecoderError> {
    let prefix = *input.first().ok_or(DecoderError::EmptyData)?;
    Ok(match prefix {
        0x00..=0x7f => (0, 1, false),
        0x80..=0xb7 => (1, usize::from(prefix - 0x80), false),
        0xb8..=0xbf => {
            let len_of_len = usize::from(prefix - 0xb7);
            (1 + len_of_len, read_length(&input[1..], len_of_len)?, false)
        }
        0xc0..=0xf7 => (1, usize::from(prefix - 0xc0), true),
        0xf8..=0xff => {
            let len_of_len = usize::from(prefix - 0xf7);
            (1 + len_of_len, read_length(&input[1..], len_of_len)?, true)
        }
    })
}

fn read_length(input: &[u8], len_of_len: usize) -> Result<usize, DecoderError> {
    if input.len() < len_of_len || len_of_len > std::mem::size_of::<usize>() {
        return Err(DecoderError::InvalidElementLength);
    }
    Ok(input[..len_of_len]
        .iter()
        .fold(0_usize, |acc, byte| (acc << 8) | usize::from(*byte)))
}

impl<T: Encodable + ?Sized> Encodable for &T {
    fn rlp_append(&self, s: &mut RlpStream) {
        (**self).rlp_append(s);
    }
}

impl Encodable for [u8] {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.encoder_bytes(self);
    }
}

impl Encodable for Vec<u8> {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.encoder_bytes(self);
    }
}

impl Encodable for Bytes {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.encoder_bytes(self);
    }
}

impl Encodable for str {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.encoder_bytes(self.as_bytes());
    }
}

impl Encodable for String {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.encoder_bytes(self.as_bytes());
    }
}

impl Encodable for U256 {
    fn rlp_append(&self, s: &mut RlpStream) {
        let mut be = [0_u8; 32];
        self.to_big_endian(&mut be);
        s.encoder_uint(&be);
    }
}

macro_rules! impl_uint {
    ($($t:ty),*) => {
        $(
            impl Encodable for $t {
                fn rlp_append(&self, s: &mut RlpStream) {
                    s.encoder_uint(&self.to_be_bytes());
                }
            }

            impl Decodable for $t {
                fn decode(rlp: &RlpElement) -> Result<Self, DecoderError> {
                    <$t>::try_from(rlp.as_u64()?).map_err(|_| DecoderError::InvalidIntValue)
                }
            }
        )*
    };
}

impl_uint!(u8, u16, u32, u64, usize);

macro_rules! impl_hash {
    ($($t:ty),*) => {
        $(
            impl Encodable for $t {
                fn rlp_append(&self, s: &mut RlpStream) {
                    s.encoder_bytes(self.as_bytes());
                }
            }

            impl Decodable for $t {
                fn decode(rlp: &RlpElement) -> Result<Self, DecoderError> {
                    let data = rlp.data()?;
                    if data.len() != <$t>::len_bytes() {
                        return Err(DecoderError::InvalidBytesValue);
                    }
                    Ok(<$t>::from_slice(data))
                }
            }
        )*
    };
}

impl_hash!(H128, H256, H512, H520);

impl Decodable for U256 {
    fn decode(rlp: &RlpElement) -> Result<Self, DecoderError> {
        rlp.as_u256()
    }
}

impl Decodable for String {
    fn decode(rlp: &RlpElement) -> Result<Self, DecoderError> {
        rlp.as_string()
    }
}

impl Decodable for Vec<u8> {
    fn decode(rlp: &RlpElement) -> Result<Self, DecoderError> {
        rlp.data().map(<[u8]>::to_vec)
    }
}

impl Decodable for Bytes {
    fn decode(rlp: &RlpElement) -> Result<Self, DecoderError> {
        match &rlp.value {
            RlpValue::String(data) => Ok(data.clone()),
            RlpValue::List(_) => Err(DecoderError::InvalidBytesValue),
        }
    }
}
