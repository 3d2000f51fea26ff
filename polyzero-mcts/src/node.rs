//! Tree nodes
//!
//! A node's statistics are atomics (see `MctsStats`); everything else that
//! mutates during descent (children, evaluation output, stored state) sits
//! behind the node's raw lock. The lock is acquired on the way down and, at
//! the selected leaf, stays held across the batched evaluation window until
//! the next sweep settles the node. A losing concurrent descent therefore
//! blocks on the lock and observes `visited == true` when it gets in.

use std::fmt::Write as _;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::lock_api::RawMutex as _;
use parking_lot::RawMutex;
use smallvec::{smallvec, SmallVec};

use polyzero_core::{Action, PiVal, PlayerId, State};

use crate::stats::MctsStats;
use crate::storage::Storage;

/// Copyable reference to a pool-allocated node.
///
/// Valid while the owning `Storage` is alive and the node has not been
/// recycled into another tree; `Tree` and the engine's rollout slots hold
/// the storage `Arc`s that guarantee this.
#[derive(Clone, Copy)]
pub struct NodeRef(ptr::NonNull<Node>);

// Nodes are interior-mutable (atomics + raw lock) and chunk-pinned.
unsafe impl Send for NodeRef {}
unsafe impl Sync for NodeRef {}

impl NodeRef {
    /// # Safety
    ///
    /// `node` must point into a live storage chunk.
    pub(crate) unsafe fn from_ptr(node: *const Node) -> Self {
        Self(ptr::NonNull::new_unchecked(node as *mut Node))
    }

    pub fn ptr_eq(a: NodeRef, b: NodeRef) -> bool {
        a.0 == b.0
    }
}

impl std::ops::Deref for NodeRef {
    type Target = Node;

    fn deref(&self) -> &Node {
        unsafe { self.0.as_ref() }
    }
}

/// Children of one action, kept sorted by action in the parent.
///
/// Deterministic transitions keep exactly one node here; stochastic ones
/// keep one node per observed state hash.
pub(crate) struct Edge {
    pub action: Action,
    pub nodes: SmallVec<[NodeRef; 1]>,
}

/// Lock-guarded part of a node.
pub(crate) struct NodeInner {
    pub pi_val: PiVal,
    pub children: Vec<Edge>,
    pub local_state: Option<Box<dyn State>>,
}

pub struct Node {
    parent: AtomicPtr<Node>,
    storage: AtomicPtr<Storage>,
    visited: AtomicBool,
    /// Valid only together with `inner.local_state`; readable without the
    /// lock so descent can spot checkpoints on the fly.
    state_valid: AtomicBool,
    state_hash: AtomicU64,
    stats: MctsStats,
    lock: RawMutex,
    inner: std::cell::UnsafeCell<NodeInner>,
}

// All mutation goes through atomics or the raw lock; `inner` is only touched
// under the lock or at quiescent points (init, free, inspection).
unsafe impl Send for Node {}
unsafe impl Sync for Node {}

impl Node {
    pub(crate) fn new() -> Self {
        Self {
            parent: AtomicPtr::new(ptr::null_mut()),
            storage: AtomicPtr::new(ptr::null_mut()),
            visited: AtomicBool::new(false),
            state_valid: AtomicBool::new(false),
            state_hash: AtomicU64::new(0),
            stats: MctsStats::new(),
            lock: RawMutex::INIT,
            inner: std::cell::UnsafeCell::new(NodeInner {
                pi_val: PiVal::default(),
                children: Vec::new(),
                local_state: None,
            }),
        }
    }

    pub(crate) fn set_storage(&self, storage: *const Storage) {
        self.storage.store(storage as *mut Storage, Ordering::Relaxed);
    }

    fn storage(&self) -> &Storage {
        unsafe { &*self.storage.load(Ordering::Relaxed) }
    }

    fn self_ref(&self) -> NodeRef {
        unsafe { NodeRef::from_ptr(self) }
    }

    /// # Safety
    ///
    /// Caller must hold this node's lock, or be at a point where no other
    /// thread can touch the node (fresh from `init`, tree tear-down,
    /// post-barrier inspection).
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn inner(&self) -> &mut NodeInner {
        &mut *self.inner.get()
    }

    /// Read-only variant of [`Node::inner`], same safety contract.
    ///
    /// # Safety
    ///
    /// Caller must hold this node's lock or the node must be quiescent.
    pub(crate) unsafe fn inner_ref(&self) -> &NodeInner {
        &*self.inner.get()
    }

    /// Field projections, so the evaluation output can be written while the
    /// stored state is borrowed. Same safety contract as [`Node::inner`].
    ///
    /// # Safety
    ///
    /// Caller must hold this node's lock or the node must be quiescent, and
    /// must not hold another reference to `pi_val`.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn pi_val_mut(&self) -> &mut PiVal {
        &mut (*self.inner.get()).pi_val
    }

    /// # Safety
    ///
    /// Caller must hold this node's lock, or read only after `visited` was
    /// observed (the evaluation output is stable once settled).
    pub(crate) unsafe fn pi_val_ref(&self) -> &PiVal {
        &(*self.inner.get()).pi_val
    }

    // ========================================================================
    // Lock and flags
    // ========================================================================

    pub fn acquire(&self) {
        self.lock.lock();
    }

    /// Must pair with a prior `acquire` on the same thread.
    pub fn release(&self) {
        unsafe { self.lock.unlock() }
    }

    pub fn visited(&self) -> bool {
        self.visited.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> &MctsStats {
        &self.stats
    }

    pub fn parent(&self) -> Option<NodeRef> {
        let p = self.parent.load(Ordering::Relaxed);
        if p.is_null() {
            None
        } else {
            Some(unsafe { NodeRef::from_ptr(p) })
        }
    }

    pub fn state_hash(&self) -> u64 {
        self.state_hash.load(Ordering::Relaxed)
    }

    pub fn has_state(&self) -> bool {
        self.state_valid.load(Ordering::Relaxed)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Reset every field and attach to `parent`. Called on freshly handed
    /// out (possibly recycled) slots before the node is shared, so no lock
    /// is needed; allocations inside are kept for reuse. Roots passed to
    /// `compute_rollouts` must be initialised this way.
    pub fn init(
        &self,
        parent: Option<NodeRef>,
        state: Option<Box<dyn State>>,
        state_hash: u64,
    ) {
        let inner = unsafe { self.inner() };
        inner.children.clear();
        inner.pi_val.reset();
        self.visited.store(false, Ordering::Relaxed);
        self.state_valid.store(false, Ordering::Relaxed);
        self.state_hash.store(state_hash, Ordering::Relaxed);
        self.stats.reset();
        self.parent.store(
            parent.map_or(ptr::null_mut(), |p| p.0.as_ptr()),
            Ordering::Relaxed,
        );
        if let Some(state) = state {
            inner.local_state = Some(state);
            self.state_valid.store(true, Ordering::Relaxed);
        }
    }

    /// Write `pi_val` completion: fold this node's value into the parent's
    /// child-value accumulator (in the root player's frame) and flip
    /// `visited`. Requires the node lock.
    pub(crate) fn settle(&self, root_player: PlayerId) {
        let pi = unsafe { self.pi_val_ref() };
        if let Some(parent) = self.parent() {
            let flip = if pi.player_id == root_player { 1.0 } else { -1.0 };
            parent.stats().add_child_v(pi.value * flip);
        }
        self.visited.store(true, Ordering::Release);
    }

    /// Release every descendant and then this node back to its storage.
    /// Only valid on a quiescent tree.
    pub fn free_tree(&self) {
        let inner = unsafe { self.inner() };
        for edge in &inner.children {
            for child in &edge.nodes {
                child.free_tree();
            }
        }
        inner.children.clear();
        inner.pi_val.reset();
        self.visited.store(false, Ordering::Relaxed);
        self.state_valid.store(false, Ordering::Relaxed);
        self.parent.store(ptr::null_mut(), Ordering::Relaxed);
        self.stats.reset();
        self.storage().free_node();
    }

    // ========================================================================
    // Children (lock required)
    // ========================================================================

    /// Attach a freshly allocated node under `action`, keeping the edge
    /// vector sorted by ascending action. Requires the node lock.
    pub(crate) fn new_child(&self, child: NodeRef, action: Action) -> NodeRef {
        child.init(Some(self.self_ref()), None, 0);
        let inner = unsafe { self.inner() };
        match inner.children.binary_search_by_key(&action, |e| e.action) {
            Ok(idx) => inner.children[idx].nodes.push(child),
            Err(idx) => inner.children.insert(
                idx,
                Edge {
                    action,
                    nodes: smallvec![child],
                },
            ),
        }
        child
    }

    /// First child under `action`, if any. Requires the node lock.
    pub(crate) fn get_child(&self, action: Action) -> Option<NodeRef> {
        let inner = unsafe { self.inner_ref() };
        inner
            .children
            .binary_search_by_key(&action, |e| e.action)
            .ok()
            .map(|idx| inner.children[idx].nodes[0])
    }

    /// Child lookup with creation, the stochastic-capable variant.
    ///
    /// For stochastic transitions an existing child is matched by
    /// `state_hash`; otherwise a sibling is appended under the same action.
    /// With `store_state` the child clones this node's state and forwards
    /// it. Requires the node lock.
    pub(crate) fn get_or_add_child(
        &self,
        storage: &Arc<Storage>,
        action: Action,
        store_state: bool,
        stochastic: bool,
        state_hash: u64,
    ) -> NodeRef {
        let inner = unsafe { self.inner() };
        if let Ok(idx) = inner.children.binary_search_by_key(&action, |e| e.action) {
            if !stochastic {
                return inner.children[idx].nodes[0];
            }
            // Stochastic games always forward the caller's state, so stored
            // states never mix with hash-deduped children.
            for &node in &inner.children[idx].nodes {
                if node.state_hash() == state_hash {
                    return node;
                }
            }
            let child = storage.new_node();
            child.init(Some(self.self_ref()), None, state_hash);
            inner.children[idx].nodes.push(child);
            return child;
        }

        let mut hash = state_hash;
        let mut child_state = None;
        if store_state {
            let own = inner
                .local_state
                .as_deref()
                .expect("store-state parent has no stored state");
            let mut next = own.clone_state();
            next.forward(action);
            hash = next.hash();
            child_state = Some(next);
        }
        let child = storage.new_node();
        child.init(Some(self.self_ref()), child_state, hash);
        let idx = inner
            .children
            .binary_search_by_key(&action, |e| e.action)
            .unwrap_err();
        inner.children.insert(
            idx,
            Edge {
                action,
                nodes: smallvec![child],
            },
        );
        child
    }

    // ========================================================================
    // Stored state (checkpoints)
    // ========================================================================

    /// Copy `src` into this node's state slot, reusing the previous
    /// allocation when the concrete type matches. Requires the node lock.
    pub(crate) fn store_state_from(&self, src: &dyn State) {
        let inner = unsafe { self.inner() };
        match &mut inner.local_state {
            Some(existing) if (**existing).state_type_id() == src.state_type_id() => {
                existing.copy_from(src);
            }
            slot => *slot = Some(src.clone_state()),
        }
        self.state_valid.store(true, Ordering::Relaxed);
    }

    /// # Safety
    ///
    /// `has_state` must be true and no other thread may be mutating this
    /// node (the engine guarantees one task per tree).
    pub(crate) unsafe fn stored_state_unchecked(&self) -> &dyn State {
        (*self.inner.get())
            .local_state
            .as_deref()
            .expect("stored_state_unchecked on node without state")
    }

    // ========================================================================
    // Quiescent inspection
    // ========================================================================

    /// Number of distinct children under each action (1 for deterministic
    /// transitions, one per observed state hash for stochastic ones).
    pub fn children_per_action(&self) -> Vec<(Action, usize)> {
        self.acquire();
        let counts = unsafe { self.inner_ref() }
            .children
            .iter()
            .map(|e| (e.action, e.nodes.len()))
            .collect();
        self.release();
        counts
    }

    /// Per-action visit counts, summed over stochastic siblings.
    pub fn visit_counts(&self) -> Vec<(Action, i32)> {
        self.acquire();
        let inner = unsafe { self.inner_ref() };
        let counts = inner
            .children
            .iter()
            .map(|e| {
                (
                    e.action,
                    e.nodes.iter().map(|n| n.stats().num_visit()).sum(),
                )
            })
            .collect();
        self.release();
        counts
    }

    /// Most-visited action; ties break toward the lowest action.
    pub fn best_action(&self) -> Action {
        let mut best = polyzero_core::INVALID_ACTION;
        let mut best_visits = 0;
        for (action, visits) in self.visit_counts() {
            if visits > best_visits {
                best_visits = visits;
                best = action;
            }
        }
        best
    }

    /// Pre-order traversal over the subtree.
    pub fn visit_nodes(&self, f: &mut dyn FnMut(&Node)) {
        f(self);
        self.acquire();
        let children: Vec<NodeRef> = unsafe { self.inner_ref() }
            .children
            .iter()
            .flat_map(|e| e.nodes.iter().copied())
            .collect();
        self.release();
        for child in children {
            child.visit_nodes(f);
        }
    }

    /// Indented statistics dump for debugging.
    pub fn debug_dump(&self, max_depth: usize) -> String {
        let mut out = String::new();
        self.dump_into(&mut out, 0, max_depth, polyzero_core::INVALID_ACTION);
        out
    }

    fn dump_into(&self, out: &mut String, depth: usize, max_depth: usize, action: Action) {
        if depth > max_depth {
            return;
        }
        let visits = self.stats().num_visit();
        let value = self.stats().value();
        let avg = if visits > 0 { value / visits as f32 } else { 0.0 };
        let _ = writeln!(
            out,
            "{}{} {}/{} ({:.3}), vloss:{}",
            "    ".repeat(depth),
            action,
            value,
            visits,
            avg,
            self.stats().virtual_loss(),
        );
        self.acquire();
        let children: Vec<(Action, NodeRef)> = unsafe { self.inner_ref() }
            .children
            .iter()
            .flat_map(|e| e.nodes.iter().map(move |&n| (e.action, n)))
            .collect();
        self.release();
        for (action, child) in children {
            child.dump_into(out, depth + 1, max_depth, action);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
