//! End-to-end search scenarios and tree invariants
//!
//! Exercised over small fixture games with scripted evaluators, on a private
//! worker pool. Tests in this binary serialise on one lock because retired
//! node storages go through a process-wide free list.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use polyzero_async::Threads;
use polyzero_core::{Action, Actor, PiVal, PlayerId, State, INVALID_ACTION};
use polyzero_mcts::{compute_rollouts, MctsConfig, MctsError, Node, Search, Storage};

static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock()
}

// ============================================================================
// FIXTURE GAMES
// ============================================================================

/// Two actions, terminal after one ply. Action 0 wins for the mover,
/// action 1 loses.
#[derive(Clone)]
struct OnePlyGame {
    played: Option<Action>,
}

impl OnePlyGame {
    fn new() -> Self {
        Self { played: None }
    }
}

impl State for OnePlyGame {
    fn clone_state(&self) -> Box<dyn State> {
        Box::new(self.clone())
    }
    fn copy_from(&mut self, other: &dyn State) {
        *self = other.as_any().downcast_ref::<Self>().unwrap().clone();
    }
    fn forward(&mut self, action: Action) {
        self.played = Some(action);
    }
    fn terminated(&self) -> bool {
        self.played.is_some()
    }
    fn get_reward(&self, player: PlayerId) -> f32 {
        let mover_reward = if self.played == Some(0) { 1.0 } else { -1.0 };
        if player == 0 {
            mover_reward
        } else {
            -mover_reward
        }
    }
    fn current_player(&self) -> PlayerId {
        if self.played.is_some() {
            1
        } else {
            0
        }
    }
    fn hash(&self) -> u64 {
        self.played.map_or(0, |a| a as u64 + 1)
    }
    fn is_stochastic(&self) -> bool {
        false
    }
    fn action_space(&self) -> usize {
        2
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Two actions, both terminal with reward 0. Only the priors steer visits.
#[derive(Clone)]
struct FlatGame {
    done: bool,
}

impl State for FlatGame {
    fn clone_state(&self) -> Box<dyn State> {
        Box::new(self.clone())
    }
    fn copy_from(&mut self, other: &dyn State) {
        *self = other.as_any().downcast_ref::<Self>().unwrap().clone();
    }
    fn forward(&mut self, _action: Action) {
        self.done = true;
    }
    fn terminated(&self) -> bool {
        self.done
    }
    fn get_reward(&self, _player: PlayerId) -> f32 {
        0.0
    }
    fn current_player(&self) -> PlayerId {
        if self.done {
            1
        } else {
            0
        }
    }
    fn hash(&self) -> u64 {
        self.done as u64
    }
    fn is_stochastic(&self) -> bool {
        false
    }
    fn action_space(&self) -> usize {
        2
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Alternating two-player chain game of fixed depth. The mover picking
/// action 0 at the last ply wins; everything else draws.
#[derive(Clone)]
struct ChainGame {
    depth: usize,
    max_depth: usize,
    last: Action,
}

impl ChainGame {
    fn new(max_depth: usize) -> Self {
        Self {
            depth: 0,
            max_depth,
            last: INVALID_ACTION,
        }
    }
}

impl State for ChainGame {
    fn clone_state(&self) -> Box<dyn State> {
        Box::new(self.clone())
    }
    fn copy_from(&mut self, other: &dyn State) {
        *self = other.as_any().downcast_ref::<Self>().unwrap().clone();
    }
    fn forward(&mut self, action: Action) {
        self.depth += 1;
        self.last = action;
    }
    fn terminated(&self) -> bool {
        self.depth >= self.max_depth
    }
    fn get_reward(&self, player: PlayerId) -> f32 {
        if self.last != 0 {
            return 0.0;
        }
        // The player who made the final move is the previous mover.
        let final_mover = ((self.depth + 1) % 2) as PlayerId;
        if player == final_mover {
            1.0
        } else {
            -1.0
        }
    }
    fn current_player(&self) -> PlayerId {
        (self.depth % 2) as PlayerId
    }
    fn hash(&self) -> u64 {
        (self.depth as u64) << 8 | (self.last + 1) as u64
    }
    fn is_stochastic(&self) -> bool {
        false
    }
    fn action_space(&self) -> usize {
        2
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

static CHANCE_TICKS: AtomicUsize = AtomicUsize::new(0);

/// One chance ply: each forward lands on one of two outcomes, driven by a
/// global tick so successive descents see both.
#[derive(Clone)]
struct ChanceGame {
    outcome: Option<u64>,
}

impl State for ChanceGame {
    fn clone_state(&self) -> Box<dyn State> {
        Box::new(self.clone())
    }
    fn copy_from(&mut self, other: &dyn State) {
        *self = other.as_any().downcast_ref::<Self>().unwrap().clone();
    }
    fn forward(&mut self, action: Action) {
        let tick = CHANCE_TICKS.fetch_add(1, Ordering::Relaxed) as u64;
        self.outcome = Some((action as u64) << 1 | (tick % 2));
    }
    fn terminated(&self) -> bool {
        self.outcome.is_some()
    }
    fn get_reward(&self, _player: PlayerId) -> f32 {
        0.0
    }
    fn current_player(&self) -> PlayerId {
        self.outcome.is_some() as PlayerId
    }
    fn hash(&self) -> u64 {
        self.outcome.map_or(0, |o| o + 1)
    }
    fn is_stochastic(&self) -> bool {
        true
    }
    fn action_space(&self) -> usize {
        2
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ============================================================================
// FIXTURE ACTOR
// ============================================================================

/// Scripted evaluator: fixed priors over the action space, fixed value.
struct FixedActor {
    policy: Vec<f32>,
    value: f32,
    slots: Mutex<Vec<PlayerId>>,
    evaluations: AtomicUsize,
}

impl FixedActor {
    fn new(policy: Vec<f32>, value: f32) -> Self {
        Self {
            policy,
            value,
            slots: Mutex::new(Vec::new()),
            evaluations: AtomicUsize::new(0),
        }
    }
}

impl Actor for FixedActor {
    fn batch_resize(&self, n: usize) {
        self.slots.lock().resize(n, 0);
    }
    fn batch_prepare(&self, index: usize, state: &dyn State, _rnn_state: &[f32]) {
        self.slots.lock()[index] = state.current_player();
    }
    fn batch_evaluate(&self, _n: usize) {
        self.evaluations.fetch_add(1, Ordering::Relaxed);
    }
    fn batch_result(&self, index: usize, _state: &dyn State, pi_val: &mut PiVal) {
        let player = self.slots.lock()[index];
        pi_val.reset();
        pi_val.policy.extend_from_slice(&self.policy);
        pi_val.value = self.value;
        pi_val.player_id = player;
    }
}

// ============================================================================
// INVARIANT HELPERS
// ============================================================================

fn assert_no_virtual_loss(root: &Node) {
    root.visit_nodes(&mut |node| {
        assert!(
            node.stats().virtual_loss().abs() < 1e-6,
            "virtual loss left behind: {}",
            node.stats().virtual_loss()
        );
    });
}

fn assert_children_visit_sums(root: &Node) {
    root.visit_nodes(&mut |node| {
        let counts = node.visit_counts();
        if !counts.is_empty() {
            let sum: i32 = counts.iter().map(|(_, v)| v).sum();
            assert_eq!(
                sum,
                node.stats().num_visit() - 1,
                "children visits must equal parent visits minus one"
            );
        }
    });
}

fn pool() -> Arc<Threads> {
    Arc::new(Threads::new(2))
}

// ============================================================================
// SCENARIOS
// ============================================================================

#[test]
fn test_one_ply_lookahead_picks_winning_action() {
    let _guard = serial();
    let actor = Arc::new(FixedActor::new(vec![0.5, 0.5], 0.0));
    let config = MctsConfig::default().with_rollouts(20).with_seed(1);
    let mut search = Search::with_threads(actor, config, pool());

    let state = OnePlyGame::new();
    let result = search.run(&[&state]).unwrap();
    assert_eq!(result.roots[0].best_action, 0);
    assert!(result.roots[0].value > 0.5);
}

#[test]
fn test_minimum_two_rollouts() {
    let _guard = serial();
    let actor = Arc::new(FixedActor::new(vec![0.5, 0.5], 0.0));
    let config = MctsConfig::default().with_rollouts(1).with_seed(1);
    let mut search = Search::with_threads(actor, config, pool());

    let state = OnePlyGame::new();
    let batch = search.run_trees(&[&state], &[], &[]).unwrap();
    assert!(batch.trees[0].root().stats().num_visit() >= 2);
    assert_ne!(batch.trees[0].best_action(), INVALID_ACTION);
}

#[test]
fn test_puct_exploration_follows_priors() {
    let _guard = serial();
    let rollouts = 100;
    let actor = Arc::new(FixedActor::new(vec![0.9, 0.1], 0.0));
    let config = MctsConfig::default().with_rollouts(rollouts).with_seed(3);
    let mut search = Search::with_threads(actor, config, pool());

    let state = FlatGame { done: false };
    let batch = search.run_trees(&[&state], &[], &[]).unwrap();
    let tree = &batch.trees[0];

    assert_eq!(tree.root().stats().num_visit(), rollouts);
    let counts = tree.visit_counts();
    let n0 = counts.iter().find(|(a, _)| *a == 0).map_or(0, |(_, v)| *v);
    let n1 = counts.iter().find(|(a, _)| *a == 1).map_or(0, |(_, v)| *v);
    // The root's own first rollout settles the root, every later one
    // descends into a child.
    assert_eq!(n0 + n1, rollouts - 1);
    assert!(n0 > n1, "n0={n0} n1={n1}");
}

#[test]
fn test_tree_invariants_after_search() {
    let _guard = serial();
    let actor = Arc::new(FixedActor::new(vec![0.6, 0.4], 0.1));
    let config = MctsConfig::default().with_rollouts(64).with_seed(5);
    let mut search = Search::with_threads(actor, config, pool());

    let state = ChainGame::new(12);
    let batch = search.run_trees(&[&state], &[], &[]).unwrap();
    let root = batch.trees[0].root();

    assert_eq!(root.stats().num_visit(), 64);
    assert_no_virtual_loss(&root);
    assert_children_visit_sums(&root);
}

#[test]
fn test_multi_root_batch() {
    let _guard = serial();
    let actor = Arc::new(FixedActor::new(vec![0.5, 0.5], 0.0));
    let config = MctsConfig::default().with_rollouts(24).with_seed(7);
    let mut search = Search::with_threads(actor, config, pool());

    let states: Vec<ChainGame> = (0..5).map(|_| ChainGame::new(8)).collect();
    let refs: Vec<&dyn State> = states.iter().map(|s| s as &dyn State).collect();
    let batch = search.run_trees(&refs, &[], &[]).unwrap();

    assert_eq!(batch.trees.len(), 5);
    for tree in &batch.trees {
        assert_eq!(tree.root().stats().num_visit(), 24);
        assert_no_virtual_loss(&tree.root());
        assert_children_visit_sums(&tree.root());
    }
}

#[test]
fn test_store_state_in_node_variant() {
    let _guard = serial();
    let actor = Arc::new(FixedActor::new(vec![0.6, 0.4], 0.0));
    let config = MctsConfig {
        store_state_in_node: true,
        ..MctsConfig::default().with_rollouts(48).with_seed(9)
    };
    let mut search = Search::with_threads(actor, config, pool());

    let state = ChainGame::new(10);
    let batch = search.run_trees(&[&state], &[], &[]).unwrap();
    let root = batch.trees[0].root();
    assert_eq!(root.stats().num_visit(), 48);
    assert_no_virtual_loss(&root);
    assert_children_visit_sums(&root);
}

#[test]
fn test_checkpoint_interval_deep_tree() {
    let _guard = serial();
    // Interval 2 forces checkpoint states every couple of edges.
    let actor = Arc::new(FixedActor::new(vec![0.5, 0.5], 0.0));
    let config = MctsConfig {
        store_state_interval: 2,
        ..MctsConfig::default().with_rollouts(80).with_seed(11)
    };
    let mut search = Search::with_threads(actor, config, pool());

    let state = ChainGame::new(20);
    let batch = search.run_trees(&[&state], &[], &[]).unwrap();
    let root = batch.trees[0].root();
    assert_eq!(root.stats().num_visit(), 80);
    assert_children_visit_sums(&root);
}

#[test]
fn test_stochastic_children_dedup_by_hash() {
    let _guard = serial();
    CHANCE_TICKS.store(0, Ordering::Relaxed);
    let actor = Arc::new(FixedActor::new(vec![0.5, 0.5], 0.0));
    let config = MctsConfig::default().with_rollouts(40).with_seed(13);
    let mut search = Search::with_threads(actor, config, pool());

    let state = ChanceGame { outcome: None };
    let batch = search.run_trees(&[&state], &[], &[]).unwrap();
    let root = batch.trees[0].root();

    let per_action = root.children_per_action();
    assert!(!per_action.is_empty());
    let total: usize = per_action.iter().map(|(_, n)| n).sum();
    // Two outcomes per action at most, and the alternating tick guarantees
    // both outcomes of the first explored action were seen.
    for (_, n) in &per_action {
        assert!(*n <= 2);
    }
    assert!(total >= 2);
    assert_children_visit_sums(&root);
}

#[test]
fn test_forced_playouts_are_corrected() {
    let _guard = serial();
    let rollouts = 100;
    let actor = Arc::new(FixedActor::new(vec![0.7, 0.3], 0.0));
    let base = MctsConfig::default().with_rollouts(rollouts).with_seed(17);

    let forced_config = MctsConfig {
        forced_rollouts_multiplier: 2.0,
        ..base.clone()
    };

    let state = OnePlyGame::new();

    let mut plain = Search::with_threads(
        Arc::new(FixedActor::new(vec![0.7, 0.3], 0.0)),
        base,
        pool(),
    );
    let plain_batch = plain.run_trees(&[&state], &[], &[]).unwrap();
    let plain_n1 = plain_batch.trees[0]
        .visit_counts()
        .iter()
        .find(|(a, _)| *a == 1)
        .map_or(0, |(_, v)| *v);

    let mut forced = Search::with_threads(actor, forced_config, pool());
    let forced_batch = forced.run_trees(&[&state], &[], &[]).unwrap();
    let tree = &forced_batch.trees[0];

    assert_eq!(tree.best_action(), 0);
    let counts = tree.visit_counts();
    let n0 = counts.iter().find(|(a, _)| *a == 0).map_or(0, |(_, v)| *v);
    let n1 = counts.iter().find(|(a, _)| *a == 1).map_or(0, |(_, v)| *v);
    assert!(n0 > n1);
    // Correction hands exploration visits back, so the losing arm may not
    // keep more than it would have without forcing plus the threshold.
    let threshold = (2.0f32 * 0.3 * rollouts as f32).sqrt() as i32;
    assert!(n1 <= plain_n1 + threshold, "n1={n1} plain={plain_n1}");
}

#[test]
fn test_sampling_variant_completes() {
    let _guard = serial();
    let actor = Arc::new(FixedActor::new(vec![0.5, 0.5], 0.0));
    let config = MctsConfig {
        sampling_mcts: true,
        ..MctsConfig::default().with_rollouts(32).with_seed(19)
    };
    let mut search = Search::with_threads(actor, config, pool());

    let state = ChainGame::new(6);
    let batch = search.run_trees(&[&state], &[], &[]).unwrap();
    assert_eq!(batch.trees[0].root().stats().num_visit(), 32);
    assert_no_virtual_loss(&batch.trees[0].root());
}

#[test]
fn test_wall_clock_budget() {
    let _guard = serial();
    let actor = Arc::new(FixedActor::new(vec![0.5, 0.5], 0.0));
    let config = MctsConfig {
        max_time_s: 0.05,
        ..MctsConfig::default().with_seed(21)
    };
    let mut search = Search::with_threads(actor, config, pool());

    let state = ChainGame::new(8);
    let batch = search.run_trees(&[&state], &[], &[]).unwrap();
    assert!(batch.trees[0].root().stats().num_visit() >= 2);
}

#[test]
fn test_policy_bias_shifts_visits() {
    let _guard = serial();
    let actor = Arc::new(FixedActor::new(vec![0.6, 0.4], 0.0));
    let config = MctsConfig::default().with_rollouts(60).with_seed(23);
    let mut search = Search::with_threads(actor, config, pool());

    let state = FlatGame { done: false };
    let bias = vec![vec![0.0, 5.0]];
    let batch = search.run_trees(&[&state], &[], &bias).unwrap();
    let counts = batch.trees[0].visit_counts();
    let n0 = counts.iter().find(|(a, _)| *a == 0).map_or(0, |(_, v)| *v);
    let n1 = counts.iter().find(|(a, _)| *a == 1).map_or(0, |(_, v)| *v);
    assert!(n1 > n0, "bias must override the prior: n0={n0} n1={n1}");
}

#[test]
fn test_policy_bias_size_mismatch_is_surfaced() {
    let _guard = serial();
    let actor = Arc::new(FixedActor::new(vec![0.6, 0.4], 0.0));
    let config = MctsConfig::default().with_rollouts(16).with_seed(25);
    let mut search = Search::with_threads(actor, config, pool());

    let state = FlatGame { done: false };
    let bias = vec![vec![0.0, 1.0, 2.0]];
    match search.run_trees(&[&state], &[], &bias) {
        Err(MctsError::PolicyBiasMismatch { expected, got }) => {
            assert_eq!(expected, 2);
            assert_eq!(got, 3);
        }
        other => panic!("expected PolicyBiasMismatch, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_storage_recycled_between_searches() {
    let _guard = serial();
    let threads = pool();
    let actor: Arc<dyn Actor> = Arc::new(FixedActor::new(vec![0.5, 0.5], 0.0));
    let config = MctsConfig::default().with_rollouts(50).with_seed(27);
    let mut rng = ChaCha8Rng::seed_from_u64(99);

    let storage = Storage::acquire();
    let state = ChainGame::new(10);

    let mut run_once = |rng: &mut ChaCha8Rng| {
        let root = storage.new_node();
        root.init(None, None, state.hash());
        let roots = [root];
        let states: [&dyn State; 1] = [&state];
        compute_rollouts(
            &roots,
            &states,
            &[],
            &[],
            &[Arc::clone(&storage)],
            &actor,
            &config,
            0.0,
            rng,
            &threads,
        )
        .unwrap();
        root.free_tree();
    };

    run_once(&mut rng);
    let chunks_after_first = storage.num_chunks();
    assert_eq!(storage.allocated(), 0);

    // Identically-seeded second search must fit in the recycled chunks.
    let mut rng = ChaCha8Rng::seed_from_u64(99);
    run_once(&mut rng);
    assert_eq!(storage.num_chunks(), chunks_after_first);
    assert_eq!(storage.allocated(), 0);
}

#[test]
fn test_rollout_counter_advances() {
    let _guard = serial();
    let before = polyzero_mcts::rollout_count();
    let actor = Arc::new(FixedActor::new(vec![0.5, 0.5], 0.0));
    let config = MctsConfig::default().with_rollouts(10).with_seed(29);
    let mut search = Search::with_threads(actor, config, pool());
    let state = OnePlyGame::new();
    search.run(&[&state]).unwrap();
    assert!(polyzero_mcts::rollout_count() >= before + 10);
}
