//! Framework-free tensor value type
//!
//! State dicts and replay rows travel as dtype + shape + raw little-endian
//! bytes. This is deliberately not a compute tensor: the training framework
//! on the other side of the wire owns the math.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Mapping from parameter name to tensor, i.e. a model snapshot.
pub type StateDict = FxHashMap<String, Tensor>;

/// Element type of a tensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dtype {
    F32 = 0,
    F64 = 1,
    I32 = 2,
    I64 = 3,
    U8 = 4,
}

impl Dtype {
    /// Size of one element in bytes.
    pub fn itemsize(self) -> usize {
        match self {
            Dtype::F32 | Dtype::I32 => 4,
            Dtype::F64 | Dtype::I64 => 8,
            Dtype::U8 => 1,
        }
    }

    /// Wire byte for this dtype.
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Dtype::F32),
            1 => Some(Dtype::F64),
            2 => Some(Dtype::I32),
            3 => Some(Dtype::I64),
            4 => Some(Dtype::U8),
            _ => None,
        }
    }
}

/// Error types for tensor construction and row operations
#[derive(Debug, Error)]
pub enum TensorError {
    #[error("data length {got} does not match shape (expected {expected} elements)")]
    LengthMismatch { got: usize, expected: usize },

    #[error("row shapes differ: {0:?} vs {1:?}")]
    RowShapeMismatch(Vec<i64>, Vec<i64>),

    #[error("dtype mismatch: {0:?} vs {1:?}")]
    DtypeMismatch(Dtype, Dtype),

    #[error("row index {index} out of range for first dimension {dim0}")]
    RowOutOfRange { index: i64, dim0: i64 },
}

/// Dense tensor: dtype, shape, raw little-endian bytes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    dtype: Dtype,
    shape: Vec<i64>,
    data: Vec<u8>,
}

impl Tensor {
    /// Zero-filled tensor of the given shape.
    pub fn zeros(dtype: Dtype, shape: Vec<i64>) -> Self {
        let numel: i64 = shape.iter().product();
        Self {
            dtype,
            data: vec![0u8; numel as usize * dtype.itemsize()],
            shape,
        }
    }

    /// Build an f32 tensor from values in row-major order.
    pub fn from_f32(shape: Vec<i64>, values: &[f32]) -> Result<Self, TensorError> {
        let expected: i64 = shape.iter().product();
        if values.len() != expected as usize {
            return Err(TensorError::LengthMismatch {
                got: values.len(),
                expected: expected as usize,
            });
        }
        let mut data = Vec::with_capacity(values.len() * 4);
        for v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        Ok(Self {
            dtype: Dtype::F32,
            shape,
            data,
        })
    }

    /// Rebuild from raw parts (used by the wire codec).
    pub fn from_raw(dtype: Dtype, shape: Vec<i64>, data: Vec<u8>) -> Result<Self, TensorError> {
        let expected = shape.iter().product::<i64>() as usize * dtype.itemsize();
        if data.len() != expected {
            return Err(TensorError::LengthMismatch {
                got: data.len(),
                expected,
            });
        }
        Ok(Self { dtype, shape, data })
    }

    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Total number of elements.
    pub fn numel(&self) -> i64 {
        self.shape.iter().product()
    }

    /// First dimension, or 0 for a rank-0 tensor.
    pub fn dim0(&self) -> i64 {
        self.shape.first().copied().unwrap_or(0)
    }

    /// Shape of one row (everything after the first dimension).
    pub fn row_shape(&self) -> &[i64] {
        if self.shape.is_empty() {
            &self.shape
        } else {
            &self.shape[1..]
        }
    }

    /// Byte length of one row.
    pub fn row_bytes(&self) -> usize {
        self.row_shape().iter().product::<i64>() as usize * self.dtype.itemsize()
    }

    /// Decode all elements as f32 (only valid for `Dtype::F32`).
    pub fn to_f32_vec(&self) -> Vec<f32> {
        debug_assert_eq!(self.dtype, Dtype::F32);
        self.data
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    /// Copy row `src_row` of `src` into row `dst_row` of `self`.
    ///
    /// Dtypes and row shapes must match.
    pub fn copy_row_from(
        &mut self,
        dst_row: i64,
        src: &Tensor,
        src_row: i64,
    ) -> Result<(), TensorError> {
        if self.dtype != src.dtype {
            return Err(TensorError::DtypeMismatch(self.dtype, src.dtype));
        }
        if self.row_shape() != src.row_shape() {
            return Err(TensorError::RowShapeMismatch(
                self.row_shape().to_vec(),
                src.row_shape().to_vec(),
            ));
        }
        if dst_row < 0 || dst_row >= self.dim0() {
            return Err(TensorError::RowOutOfRange {
                index: dst_row,
                dim0: self.dim0(),
            });
        }
        if src_row < 0 || src_row >= src.dim0() {
            return Err(TensorError::RowOutOfRange {
                index: src_row,
                dim0: src.dim0(),
            });
        }
        let rb = self.row_bytes();
        let dst_off = dst_row as usize * rb;
        let src_off = src_row as usize * rb;
        self.data[dst_off..dst_off + rb].copy_from_slice(&src.data[src_off..src_off + rb]);
        Ok(())
    }

    /// Gather the given rows into a fresh tensor of shape `[rows.len(), ..]`.
    pub fn select_rows(&self, rows: &[i64]) -> Result<Tensor, TensorError> {
        let rb = self.row_bytes();
        let mut shape = self.shape.clone();
        if shape.is_empty() {
            shape.push(0);
        }
        shape[0] = rows.len() as i64;
        let mut data = Vec::with_capacity(rows.len() * rb);
        for &r in rows {
            if r < 0 || r >= self.dim0() {
                return Err(TensorError::RowOutOfRange {
                    index: r,
                    dim0: self.dim0(),
                });
            }
            let off = r as usize * rb;
            data.extend_from_slice(&self.data[off..off + rb]);
        }
        Ok(Tensor {
            dtype: self.dtype,
            shape,
            data,
        })
    }
}
