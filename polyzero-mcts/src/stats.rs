//! Per-node search statistics
//!
//! Statistics are updated with plain atomic read-modify-write during
//! backpropagation and read during selection; the node lock is never taken
//! for them. Float accumulators are CAS loops over the bit pattern.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

/// f32 stored as its bit pattern in an `AtomicU32`.
pub(crate) struct AtomicF32(AtomicU32);

impl AtomicF32 {
    pub fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.to_bits()))
    }

    pub fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn store(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn fetch_add(&self, delta: f32) {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            let next = (f32::from_bits(current) + delta).to_bits();
            match self.0.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }
}

/// Visit count, backed-up value sum, virtual loss and the child-value
/// accumulator behind the value prior.
///
/// `value` is the sum of backed-up values in the root player's frame;
/// `value / num_visit` is the node's empirical value from that perspective.
pub struct MctsStats {
    num_visit: AtomicI32,
    value: AtomicF32,
    virtual_loss: AtomicF32,
    sum_child_v: AtomicF32,
    num_child_v: AtomicI32,
}

impl MctsStats {
    pub fn new() -> Self {
        Self {
            num_visit: AtomicI32::new(0),
            value: AtomicF32::new(0.0),
            virtual_loss: AtomicF32::new(0.0),
            sum_child_v: AtomicF32::new(0.0),
            num_child_v: AtomicI32::new(0),
        }
    }

    pub fn reset(&self) {
        self.num_visit.store(0, Ordering::Relaxed);
        self.value.store(0.0);
        self.virtual_loss.store(0.0);
        self.sum_child_v.store(0.0);
        self.num_child_v.store(0, Ordering::Relaxed);
    }

    pub fn num_visit(&self) -> i32 {
        self.num_visit.load(Ordering::Relaxed)
    }

    pub fn value(&self) -> f32 {
        self.value.load()
    }

    pub fn virtual_loss(&self) -> f32 {
        self.virtual_loss.load()
    }

    /// Mean of settled children's values, or 0 before any child settled.
    pub fn avg_child_v(&self) -> f32 {
        let n = self.num_child_v.load(Ordering::Relaxed);
        if n == 0 {
            0.0
        } else {
            self.sum_child_v.load() / n as f32
        }
    }

    pub fn add_virtual_loss(&self, amount: f32) {
        self.virtual_loss.fetch_add(amount);
    }

    /// One backpropagation step: count the visit, fold in the rollout value,
    /// clear this descent's virtual loss.
    pub fn atomic_update(&self, value: f32, virtual_loss: f32) {
        self.num_visit.fetch_add(1, Ordering::Relaxed);
        self.value.fetch_add(value);
        self.virtual_loss.fetch_add(-virtual_loss);
    }

    /// Fold a settled child's value into the prior accumulator.
    pub fn add_child_v(&self, value: f32) {
        self.sum_child_v.fetch_add(value);
        self.num_child_v.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_visit(&self) {
        self.num_visit.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subtract_visit(&self) {
        self.num_visit.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Default for MctsStats {
    fn default() -> Self {
        Self::new()
    }
}
