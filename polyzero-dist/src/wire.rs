//! Binary wire codec
//!
//! Little-endian throughout. Strings and blobs are `u64` length-prefixed;
//! maps are a `u64` count followed by key/value pairs; tensors are a dtype
//! byte, a dimension count, `i64` dimensions and the raw element bytes.

use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, BytesMut};
use rand::Rng;
use rustc_hash::FxHashMap;
use thiserror::Error;

use polyzero_core::{Dtype, StateDict, Tensor};

/// Error types for decoding
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("truncated payload")]
    Truncated,

    #[error("unknown message tag {0}")]
    UnknownTag(u8),

    #[error("unknown dtype byte {0}")]
    UnknownDtype(u8),

    #[error("tensor payload does not match its header")]
    BadTensor,

    #[error("oversized field ({0} bytes)")]
    Oversized(u64),
}

/// Hard cap on any single length field, to bound allocations on bad input.
const MAX_FIELD: u64 = 1 << 32;

/// Random lowercase-alphanumeric identifier (client and request ids).
pub fn rand_id(len: usize) -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

// ============================================================================
// SERIALIZER
// ============================================================================

#[derive(Default)]
pub struct Serializer {
    buf: BytesMut,
}

impl Serializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.put_u8(v as u8);
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.put_i32_le(v);
    }

    pub fn write_f32(&mut self, v: f32) {
        self.buf.put_f32_le(v);
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.put_u64_le(v);
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.put_i64_le(v);
    }

    pub fn write_str(&mut self, v: &str) {
        self.write_u64(v.len() as u64);
        self.buf.put_slice(v.as_bytes());
    }

    pub fn write_bytes(&mut self, v: &[u8]) {
        self.write_u64(v.len() as u64);
        self.buf.put_slice(v);
    }

    pub fn write_tensor(&mut self, v: &Tensor) {
        self.write_u8(v.dtype().to_byte());
        self.write_u8(v.shape().len() as u8);
        for &dim in v.shape() {
            self.write_i64(dim);
        }
        self.buf.put_slice(v.data());
    }

    pub fn write_state_dict(&mut self, v: &StateDict) {
        self.write_u64(v.len() as u64);
        for (key, tensor) in v {
            self.write_str(key);
            self.write_tensor(tensor);
        }
    }

    pub fn write_ratio_map(&mut self, v: &FxHashMap<String, f32>) {
        self.write_u64(v.len() as u64);
        for (key, ratio) in v {
            self.write_str(key);
            self.write_f32(*ratio);
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

// ============================================================================
// DESERIALIZER
// ============================================================================

pub struct Deserializer<'a> {
    buf: &'a [u8],
}

impl<'a> Deserializer<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        if self.buf.len() < len {
            return Err(ProtocolError::Truncated);
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, ProtocolError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(LittleEndian::read_i32(self.take(4)?))
    }

    pub fn read_f32(&mut self) -> Result<f32, ProtocolError> {
        Ok(LittleEndian::read_f32(self.take(4)?))
    }

    pub fn read_u64(&mut self) -> Result<u64, ProtocolError> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    pub fn read_i64(&mut self) -> Result<i64, ProtocolError> {
        Ok(LittleEndian::read_i64(self.take(8)?))
    }

    fn read_len(&mut self) -> Result<usize, ProtocolError> {
        let len = self.read_u64()?;
        if len > MAX_FIELD {
            return Err(ProtocolError::Oversized(len));
        }
        Ok(len as usize)
    }

    pub fn read_str(&mut self) -> Result<String, ProtocolError> {
        let len = self.read_len()?;
        let bytes = self.take(len)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let len = self.read_len()?;
        Ok(self.take(len)?.to_vec())
    }

    pub fn read_tensor(&mut self) -> Result<Tensor, ProtocolError> {
        let dtype_byte = self.read_u8()?;
        let dtype = Dtype::from_byte(dtype_byte).ok_or(ProtocolError::UnknownDtype(dtype_byte))?;
        let ndim = self.read_u8()? as usize;
        let mut shape = Vec::with_capacity(ndim);
        for _ in 0..ndim {
            let dim = self.read_i64()?;
            if dim < 0 {
                return Err(ProtocolError::BadTensor);
            }
            shape.push(dim);
        }
        let numel: i64 = shape.iter().product();
        let byte_len = numel as u64 * dtype.itemsize() as u64;
        if byte_len > MAX_FIELD {
            return Err(ProtocolError::Oversized(byte_len));
        }
        let data = self.take(byte_len as usize)?.to_vec();
        Tensor::from_raw(dtype, shape, data).map_err(|_| ProtocolError::BadTensor)
    }

    pub fn read_state_dict(&mut self) -> Result<StateDict, ProtocolError> {
        let count = self.read_len()?;
        let mut map = StateDict::default();
        for _ in 0..count {
            let key = self.read_str()?;
            let tensor = self.read_tensor()?;
            map.insert(key, tensor);
        }
        Ok(map)
    }

    pub fn read_ratio_map(&mut self) -> Result<FxHashMap<String, f32>, ProtocolError> {
        let count = self.read_len()?;
        let mut map = FxHashMap::default();
        for _ in 0..count {
            let key = self.read_str()?;
            let ratio = self.read_f32()?;
            map.insert(key, ratio);
        }
        Ok(map)
    }
}
