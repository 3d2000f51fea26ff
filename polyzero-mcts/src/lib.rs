//! POLYZERO MCTS - Parallel PUCT tree search with batched evaluation
//!
//! This crate provides the search core of the self-play system:
//! - Pool-allocated nodes with O(1) storage recycling
//! - Multi-root rollout batches driven over the async worker pool
//! - PUCT selection with virtual loss, value priors and forced playouts
//! - Deferred state advancement with checkpoint states, or per-node states
//! - Stochastic-transition support with hash-deduped children
//!
//! ## Architecture
//!
//! - Level 1: `Search` (orchestration over a batch of roots)
//! - Level 2: `compute_rollouts` (sweep loop, barrier, batched evaluation)
//! - Level 3: selection, expansion, backpropagation
//! - Level 4: `Node`/`Storage`/`MctsStats` primitives

mod node;
mod search;
mod stats;
mod storage;
mod tree;

pub use node::{Node, NodeRef};
pub use search::{compute_rollouts, rollout_count};
pub use stats::MctsStats;
pub use storage::Storage;
pub use tree::{RootStats, Search, SearchBatch, SearchResult, Tree};

use thiserror::Error;

/// Error types for search operations
#[derive(Debug, Error)]
pub enum MctsError {
    #[error("empty rollout batch")]
    EmptyBatch,

    #[error("policy bias size mismatch, got {got}, expected {expected}")]
    PolicyBiasMismatch { expected: usize, got: usize },
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Search configuration
#[derive(Clone, Debug)]
pub struct MctsConfig {
    /// Rollouts per search call (ignored when `max_time_s` is set; a
    /// minimum of 2 always runs).
    pub num_rollouts: i32,
    /// PUCT exploration constant.
    pub puct: f32,
    /// Penalty applied along the descent path until backpropagation.
    pub virtual_loss: f32,
    /// Use the mean of settled sibling values as q for unexplored actions.
    pub use_value_prior: bool,
    /// Replace scores by draws from `U(0, exp(4 * score))` before argmax.
    pub sampling_mcts: bool,
    /// Keep a state snapshot in every node instead of re-simulating.
    pub store_state_in_node: bool,
    /// Checkpoint every this many descent edges (deferred-state variant).
    pub store_state_interval: usize,
    /// Root exploration forcing; 0 disables. Forced visits are removed from
    /// the final counts again after search.
    pub forced_rollouts_multiplier: f32,
    /// Perturb the rollout budget around its nominal value.
    pub randomized_rollouts: bool,
    /// Wall-clock bound in seconds; 0 means rollout-count mode.
    pub max_time_s: f64,
    /// Seed for the search RNG streams.
    pub seed: u64,
}

impl Default for MctsConfig {
    fn default() -> Self {
        Self {
            num_rollouts: 400,
            puct: 1.0,
            virtual_loss: 1.0,
            use_value_prior: true,
            sampling_mcts: false,
            store_state_in_node: false,
            store_state_interval: 8,
            forced_rollouts_multiplier: 0.0,
            randomized_rollouts: false,
            max_time_s: 0.0,
            seed: 0,
        }
    }
}

impl MctsConfig {
    /// Config with a specific rollout budget.
    pub fn with_rollouts(mut self, n: i32) -> Self {
        self.num_rollouts = n;
        self
    }

    /// Config with a specific PUCT constant.
    pub fn with_puct(mut self, puct: f32) -> Self {
        self.puct = puct;
        self
    }

    /// Config with a specific RNG seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}
