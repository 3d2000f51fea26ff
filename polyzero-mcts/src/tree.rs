//! Search trees and the batched search wrapper

use std::sync::Arc;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use polyzero_async::Threads;
use polyzero_core::{Action, Actor, State};

use crate::node::NodeRef;
use crate::search::compute_rollouts;
use crate::storage::Storage;
use crate::{MctsConfig, MctsError};

/// One root and the storage its nodes came from. Dropping the tree releases
/// every node back to the storage, which then recycles itself.
pub struct Tree {
    root: NodeRef,
    storage: Arc<Storage>,
}

impl Tree {
    pub fn root(&self) -> NodeRef {
        self.root
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Most-visited root action (first insertion wins ties).
    pub fn best_action(&self) -> Action {
        self.root.best_action()
    }

    /// Per-action visit counts at the root.
    pub fn visit_counts(&self) -> Vec<(Action, i32)> {
        self.root.visit_counts()
    }

    /// Empirical root value in the root player's frame.
    pub fn root_value(&self) -> f32 {
        let visits = self.root.stats().num_visit();
        if visits == 0 {
            0.0
        } else {
            self.root.stats().value() / visits as f32
        }
    }

    pub fn debug_dump(&self, max_depth: usize) -> String {
        self.root.debug_dump(max_depth)
    }
}

impl Drop for Tree {
    fn drop(&mut self) {
        self.root.free_tree();
    }
}

/// Result of one batched search call, with the trees still alive.
pub struct SearchBatch {
    pub trees: Vec<Tree>,
    /// Rollout budget that was applied (after optional randomisation).
    pub rollouts: i32,
}

impl SearchBatch {
    pub fn best_actions(&self) -> Vec<Action> {
        self.trees.iter().map(|t| t.best_action()).collect()
    }

    /// Collapse into plain statistics, freeing the trees.
    pub fn into_result(self) -> SearchResult {
        SearchResult {
            rollouts: self.rollouts,
            roots: self
                .trees
                .iter()
                .map(|t| RootStats {
                    best_action: t.best_action(),
                    value: t.root_value(),
                    visits: t.visit_counts(),
                })
                .collect(),
        }
    }
}

/// Statistics for one root after search.
#[derive(Clone, Debug)]
pub struct RootStats {
    pub best_action: Action,
    pub value: f32,
    pub visits: Vec<(Action, i32)>,
}

/// Result of a batched search
#[derive(Clone, Debug)]
pub struct SearchResult {
    pub rollouts: i32,
    pub roots: Vec<RootStats>,
}

// ============================================================================
// SEARCH WRAPPER
// ============================================================================

/// Batched search driver owning the evaluator, the pool binding and the RNG.
pub struct Search {
    actor: Arc<dyn Actor>,
    config: MctsConfig,
    threads: Arc<Threads>,
    rng: ChaCha8Rng,
}

impl Search {
    /// Search on the process-global pool.
    pub fn new(actor: Arc<dyn Actor>, config: MctsConfig) -> Self {
        Self::with_threads(actor, config, Arc::clone(polyzero_async::global()))
    }

    pub fn with_threads(actor: Arc<dyn Actor>, config: MctsConfig, threads: Arc<Threads>) -> Self {
        let rng = ChaCha8Rng::seed_from_u64(config.seed);
        Self {
            actor,
            config,
            threads,
            rng,
        }
    }

    pub fn config(&self) -> &MctsConfig {
        &self.config
    }

    /// Run the rollout budget over a batch of root states and keep the
    /// trees alive for inspection.
    pub fn run_trees(
        &mut self,
        states: &[&dyn State],
        rnn_state: &[Vec<f32>],
        policy_bias: &[Vec<f32>],
    ) -> Result<SearchBatch, MctsError> {
        let mut roots = Vec::with_capacity(states.len());
        let mut storages = Vec::with_capacity(states.len());
        for state in states {
            let storage = Storage::acquire();
            let root = storage.new_node();
            let stored = self
                .config
                .store_state_in_node
                .then(|| state.clone_state());
            root.init(None, stored, state.hash());
            roots.push(root);
            storages.push(storage);
        }

        let outcome = compute_rollouts(
            &roots,
            states,
            rnn_state,
            policy_bias,
            &storages,
            &self.actor,
            &self.config,
            self.config.max_time_s,
            &mut self.rng,
            &self.threads,
        );

        // Wrap before surfacing errors so partially grown trees are freed.
        let trees: Vec<Tree> = roots
            .into_iter()
            .zip(storages)
            .map(|(root, storage)| Tree { root, storage })
            .collect();
        let rollouts = outcome?;
        Ok(SearchBatch { trees, rollouts })
    }

    /// Convenience wrapper returning plain statistics.
    pub fn run(&mut self, states: &[&dyn State]) -> Result<SearchResult, MctsError> {
        Ok(self.run_trees(states, &[], &[])?.into_result())
    }
}
