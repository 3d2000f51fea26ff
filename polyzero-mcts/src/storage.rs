//! Pool-allocated node storage with O(1) recycling
//!
//! Nodes are handed out sequentially from fixed-size chunks; there is no
//! per-node free list. When the last node of a storage is freed the whole
//! storage resets its indices and returns to a process-wide free list, so
//! the next tree reuses its already-allocated chunks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::node::{Node, NodeRef};

pub(crate) const CHUNK_SIZE: usize = 16;

#[repr(align(128))]
struct Chunk {
    nodes: [Node; CHUNK_SIZE],
}

impl Chunk {
    fn new_boxed() -> Box<Self> {
        Box::new(Chunk {
            nodes: std::array::from_fn(|_| Node::new()),
        })
    }
}

struct StorageInner {
    chunks: Vec<Box<Chunk>>,
    chunk_index: usize,
    sub_index: usize,
}

/// Retired storages, ready for reuse by the next tree. One push per tree
/// tear-down, so contention here is negligible.
static FREE_STORAGES: Mutex<Vec<Arc<Storage>>> = Mutex::new(Vec::new());

/// Chunked slab allocator for tree nodes.
///
/// Chunk boxes are never dropped or moved while any node is outstanding,
/// which keeps `NodeRef`s stable across chunk growth.
pub struct Storage {
    inner: Mutex<StorageInner>,
    allocated: AtomicUsize,
    self_weak: Weak<Storage>,
}

impl Storage {
    /// Pop a retired storage from the free list, or allocate a fresh one.
    pub fn acquire() -> Arc<Storage> {
        if let Some(storage) = FREE_STORAGES.lock().pop() {
            return storage;
        }
        Arc::new_cyclic(|weak| Storage {
            inner: Mutex::new(StorageInner {
                chunks: Vec::new(),
                chunk_index: 0,
                sub_index: 0,
            }),
            allocated: AtomicUsize::new(0),
            self_weak: weak.clone(),
        })
    }

    /// Hand out the next node slot, reset and ready for `init`.
    pub fn new_node(self: &Arc<Self>) -> NodeRef {
        let mut inner = self.inner.lock();
        if inner.chunk_index >= inner.chunks.len() {
            let chunk = Chunk::new_boxed();
            for node in &chunk.nodes {
                node.set_storage(Arc::as_ptr(self));
            }
            inner.chunks.push(chunk);
        }
        let node: *const Node = &inner.chunks[inner.chunk_index].nodes[inner.sub_index];
        inner.sub_index += 1;
        if inner.sub_index == CHUNK_SIZE {
            inner.sub_index = 0;
            inner.chunk_index += 1;
        }
        drop(inner);
        self.allocated.fetch_add(1, Ordering::AcqRel);
        unsafe { NodeRef::from_ptr(node) }
    }

    /// Return one node. The last free resets the storage and retires it to
    /// the free list.
    pub(crate) fn free_node(&self) {
        if self.allocated.fetch_sub(1, Ordering::AcqRel) == 1 {
            let mut inner = self.inner.lock();
            inner.chunk_index = 0;
            inner.sub_index = 0;
            drop(inner);
            if let Some(arc) = self.self_weak.upgrade() {
                FREE_STORAGES.lock().push(arc);
            }
        }
    }

    /// Outstanding node count.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }

    /// Number of chunks ever allocated by this storage.
    pub fn num_chunks(&self) -> usize {
        self.inner.lock().chunks.len()
    }

    /// Bypass the free list; unit tests use this to keep storages isolated
    /// from concurrently retiring tests.
    #[cfg(test)]
    pub(crate) fn acquire_fresh() -> Arc<Storage> {
        Arc::new_cyclic(|weak| Storage {
            inner: Mutex::new(StorageInner {
                chunks: Vec::new(),
                chunk_index: 0,
                sub_index: 0,
            }),
            allocated: AtomicUsize::new(0),
            self_weak: weak.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_allocation() {
        let storage = Storage::acquire_fresh();
        let nodes: Vec<NodeRef> = (0..CHUNK_SIZE + 1).map(|_| storage.new_node()).collect();
        assert_eq!(storage.allocated(), CHUNK_SIZE + 1);
        assert_eq!(storage.num_chunks(), 2);

        // Distinct slots.
        for (i, a) in nodes.iter().enumerate() {
            for b in &nodes[i + 1..] {
                assert!(!NodeRef::ptr_eq(*a, *b));
            }
        }

        for _ in &nodes {
            storage.free_node();
        }
        assert_eq!(storage.allocated(), 0);
    }

    #[test]
    fn test_recycle_reuses_chunks() {
        let storage = Storage::acquire_fresh();
        let count = 3 * CHUNK_SIZE;
        let first: Vec<NodeRef> = (0..count).map(|_| storage.new_node()).collect();
        let chunks = storage.num_chunks();
        for _ in &first {
            storage.free_node();
        }
        assert_eq!(storage.allocated(), 0);

        // An identically-sized second round must not grow the chunk list.
        let second: Vec<NodeRef> = (0..count).map(|_| storage.new_node()).collect();
        assert_eq!(storage.num_chunks(), chunks);
        assert_eq!(storage.allocated(), count);
        for _ in &second {
            storage.free_node();
        }
    }
}
