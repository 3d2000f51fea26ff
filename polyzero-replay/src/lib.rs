//! POLYZERO Replay - Circular training-sample store
//!
//! A set of named tensors sharing one first dimension and one insertion
//! index. Buffers are allocated lazily from the first batch, rows are
//! overwritten round-robin, and sampling draws distinct rows. The whole
//! buffer (including the RNG) checkpoints into a serialisable state.

use parking_lot::Mutex;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use polyzero_core::Tensor;

/// Error types for buffer operations
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("batch size {batch} exceeds capacity {capacity}")]
    BatchTooLarge { batch: i64, capacity: i64 },

    #[error("sample size {requested} exceeds current size {size}")]
    SampleTooLarge { requested: i64, size: i64 },

    #[error("tensor names do not match the buffer layout (missing or extra: {0})")]
    NameMismatch(String),

    #[error("tensor '{name}' rows have shape {got:?}, buffer expects {expected:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<i64>,
        got: Vec<i64>,
    },

    #[error("tensor '{name}' has batch size {got}, expected {expected}")]
    BatchMismatch {
        name: String,
        expected: i64,
        got: i64,
    },

    #[error("attempt to initialize a buffer of capacity {capacity} from state of capacity {state}")]
    CapacityMismatch { capacity: i64, state: i64 },
}

/// Serialisable checkpoint of a buffer.
#[derive(Clone, Serialize, Deserialize)]
pub struct ReplayBufferState {
    pub capacity: i64,
    pub size: i64,
    pub next_idx: i64,
    pub rng: ChaCha8Rng,
    pub buffer: FxHashMap<String, Tensor>,
}

struct Inner {
    buffer: FxHashMap<String, Tensor>,
    size: i64,
    next_idx: i64,
    rng: ChaCha8Rng,
    num_add: i64,
    num_sample: i64,
}

/// Circular buffer of named tensors.
pub struct ReplayBuffer {
    capacity: i64,
    inner: Mutex<Inner>,
}

impl ReplayBuffer {
    pub fn new(capacity: i64, seed: u64) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner {
                buffer: FxHashMap::default(),
                size: 0,
                next_idx: 0,
                rng: ChaCha8Rng::seed_from_u64(seed),
                num_add: 0,
                num_sample: 0,
            }),
        }
    }

    pub fn capacity(&self) -> i64 {
        self.capacity
    }

    pub fn size(&self) -> i64 {
        self.inner.lock().size
    }

    pub fn next_idx(&self) -> i64 {
        self.inner.lock().next_idx
    }

    /// Rows ever added.
    pub fn num_add(&self) -> i64 {
        self.inner.lock().num_add
    }

    /// Rows ever sampled.
    pub fn num_sample(&self) -> i64 {
        self.inner.lock().num_sample
    }

    /// Append a batch of rows, overwriting the oldest once full.
    ///
    /// The first call fixes the buffer layout from the input's shapes and
    /// dtypes; later calls must match it exactly.
    pub fn add(&self, input: &FxHashMap<String, Tensor>) -> Result<(), ReplayError> {
        let mut inner = self.inner.lock();

        let batch = self.validate(&mut inner, input)?;

        // Destination rows, wrapping at capacity.
        let indices: Vec<i64> = (0..batch)
            .map(|i| (inner.next_idx + i) % self.capacity)
            .collect();
        if inner.size < self.capacity {
            inner.size = (inner.size + batch).min(self.capacity);
        }
        inner.next_idx = (inner.next_idx + batch) % self.capacity;
        inner.num_add += batch;

        for (name, src) in input {
            let dst = inner.buffer.get_mut(name).unwrap();
            for (i, &row) in indices.iter().enumerate() {
                dst.copy_row_from(row, src, i as i64)
                    .expect("validated row copy");
            }
        }
        Ok(())
    }

    /// Draw `sample_size` distinct rows as a per-name gather.
    pub fn sample(&self, sample_size: i64) -> Result<FxHashMap<String, Tensor>, ReplayError> {
        let mut inner = self.inner.lock();
        if sample_size > inner.size {
            return Err(ReplayError::SampleTooLarge {
                requested: sample_size,
                size: inner.size,
            });
        }
        let size = inner.size as usize;
        let rows: Vec<i64> =
            rand::seq::index::sample(&mut inner.rng, size, sample_size as usize)
                .iter()
                .map(|i| i as i64)
                .collect();
        inner.num_sample += sample_size;

        let mut out = FxHashMap::default();
        for (name, tensor) in &inner.buffer {
            out.insert(
                name.clone(),
                tensor.select_rows(&rows).expect("in-range gather"),
            );
        }
        Ok(out)
    }

    /// Snapshot for checkpointing.
    pub fn to_state(&self) -> ReplayBufferState {
        let inner = self.inner.lock();
        ReplayBufferState {
            capacity: self.capacity,
            size: inner.size,
            next_idx: inner.next_idx,
            rng: inner.rng.clone(),
            buffer: inner.buffer.clone(),
        }
    }

    /// Restore from a checkpoint taken with the same capacity.
    pub fn init_from_state(&self, state: ReplayBufferState) -> Result<(), ReplayError> {
        if state.capacity != self.capacity {
            return Err(ReplayError::CapacityMismatch {
                capacity: self.capacity,
                state: state.capacity,
            });
        }
        let mut inner = self.inner.lock();
        inner.size = state.size;
        inner.next_idx = state.next_idx;
        inner.rng = state.rng;
        inner.buffer = state.buffer;
        Ok(())
    }

    /// Layout and size checks; allocates the buffers on first use. Returns
    /// the (uniform) batch size.
    fn validate(
        &self,
        inner: &mut Inner,
        input: &FxHashMap<String, Tensor>,
    ) -> Result<i64, ReplayError> {
        if inner.buffer.is_empty() && inner.size == 0 {
            for (name, tensor) in input {
                let mut shape = vec![self.capacity];
                shape.extend_from_slice(tensor.row_shape());
                inner
                    .buffer
                    .insert(name.clone(), Tensor::zeros(tensor.dtype(), shape));
            }
        }

        if input.len() != inner.buffer.len() {
            return Err(ReplayError::NameMismatch(format!(
                "got {} names, buffer has {}",
                input.len(),
                inner.buffer.len()
            )));
        }

        let mut batch: Option<i64> = None;
        for (name, src) in input {
            let dst = inner
                .buffer
                .get(name)
                .ok_or_else(|| ReplayError::NameMismatch(name.clone()))?;
            if dst.row_shape() != src.row_shape() || dst.dtype() != src.dtype() {
                return Err(ReplayError::ShapeMismatch {
                    name: name.clone(),
                    expected: dst.row_shape().to_vec(),
                    got: src.row_shape().to_vec(),
                });
            }
            match batch {
                None => {
                    if src.dim0() > self.capacity {
                        return Err(ReplayError::BatchTooLarge {
                            batch: src.dim0(),
                            capacity: self.capacity,
                        });
                    }
                    batch = Some(src.dim0());
                }
                Some(expected) if src.dim0() != expected => {
                    return Err(ReplayError::BatchMismatch {
                        name: name.clone(),
                        expected,
                        got: src.dim0(),
                    });
                }
                Some(_) => {}
            }
        }
        Ok(batch.unwrap_or(0))
    }
}

// ============================================================================
// TESTS
// ============================================================================
