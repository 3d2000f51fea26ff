//! Rollout driver
//!
//! `compute_rollouts` runs the batched search: every sweep, per-stride jobs
//! on reserved pool threads settle and backpropagate the previous rollout,
//! then descend again; the orchestrating thread synchronises on the task
//! barrier and runs one batched evaluation per sweep.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

use polyzero_async::{Task, Threads};
use polyzero_core::{Action, Actor, PlayerId, State, INVALID_ACTION};

use crate::node::{Node, NodeRef};
use crate::storage::Storage;
use crate::{MctsConfig, MctsError};

static ROLLOUT_COUNT: AtomicU64 = AtomicU64::new(0);

/// Total rollouts driven by this process.
pub fn rollout_count() -> u64 {
    ROLLOUT_COUNT.load(Ordering::Relaxed)
}

fn forced_rollouts(pi_value: f32, num_visits: i32, config: &MctsConfig) -> i32 {
    (config.forced_rollouts_multiplier * pi_value * num_visits as f32).sqrt() as i32
}

// ============================================================================
// SELECTION
// ============================================================================

/// PUCT score of one root child, for the forced-playout correction.
/// Requires the node lock.
fn puct_value(root_player: PlayerId, puct: f32, node: &Node, action: Action) -> f32 {
    let inner = unsafe { node.inner_ref() };
    let child = node.get_child(action).expect("puct_value on absent child");
    let child_visits = child.stats().num_visit();
    let pi_value = inner.pi_val.policy[action as usize];
    let parent_visits = node.stats().num_visit();
    let prior_score = pi_value / (1 + child_visits) as f32 * (parent_visits as f32).sqrt();
    let flip = if inner.pi_val.player_id == root_player {
        1.0
    } else {
        -1.0
    };
    let value = child.stats().value();
    let vloss = child.stats().virtual_loss();
    let q = (value * flip - vloss) / (child_visits as f32 + vloss);
    prior_score * puct + q
}

/// Choose the next action during descent. Requires the node lock.
///
/// Returns `INVALID_ACTION` for settled terminal nodes (empty policy).
fn pick_best_action(
    root_player: PlayerId,
    node: &Node,
    config: &MctsConfig,
    rng: &mut ChaCha8Rng,
    max_rollouts: i32,
) -> Action {
    let inner = unsafe { node.inner_ref() };
    let pi = &inner.pi_val.policy;

    // At an opponent node we pick the opponent's best action, the one that
    // minimises our value. The exploration term is not flipped.
    let flip = if inner.pi_val.player_id == root_player {
        1.0f32
    } else {
        -1.0
    };
    let prior_value = node.stats().avg_child_v() * flip;
    let parent_visits = node.stats().num_visit();
    let is_root = node.parent().is_none();

    let mut best_score = -1e10f32;
    let mut best_action = INVALID_ACTION;
    for (action, &pi_value) in pi.iter().enumerate() {
        let action = action as Action;

        let mut child_visits = 0i32;
        let mut vloss = 0.0f32;
        let mut value = 0.0f32;
        if let Ok(idx) = inner.children.binary_search_by_key(&action, |e| e.action) {
            for child in &inner.children[idx].nodes {
                let stats = child.stats();
                child_visits += stats.num_visit();
                vloss += stats.virtual_loss();
                value += stats.value();
            }
        }

        let q = if child_visits != 0 {
            if config.forced_rollouts_multiplier > 0.0
                && is_root
                && child_visits < forced_rollouts(pi_value, max_rollouts, config)
            {
                return action;
            }
            (value * flip - vloss) / (child_visits as f32 + vloss)
        } else if config.use_value_prior {
            // No child under this action yet: fall back to the prior
            // estimated from the other settled children.
            prior_value
        } else {
            0.0
        };

        let prior_score = pi_value / (1.0 + child_visits as f32) * (parent_visits as f32).sqrt();
        let mut score = prior_score * config.puct + q;
        if config.sampling_mcts {
            score = rng.gen_range(0.0..(score * 4.0).clamp(-80.0, 80.0).exp());
        }
        if score > best_score {
            best_score = score;
            best_action = action;
        }
    }
    best_action
}

// ============================================================================
// SWEEP STATE
// ============================================================================

/// How the engine advances game state during descent.
#[derive(Clone, Copy, PartialEq)]
enum Advance {
    /// Deterministic fast path: queue actions and replay them from the
    /// nearest checkpoint only when a new node is created.
    Deferred,
    /// Stochastic games: forward the local state at every edge and dedup
    /// children by state hash.
    Forward,
    /// Every node owns a snapshot of its state.
    Stored,
}

struct RolloutSlot {
    root: NodeRef,
    node: Option<NodeRef>,
    root_state: Box<dyn State>,
    local_state: Option<Box<dyn State>>,
    terminated: bool,
    storage: Arc<Storage>,
    rnn_root: Vec<f32>,
    rnn_current: Vec<f32>,
    policy_bias: Vec<f32>,
    queued_actions: Vec<Action>,
}

struct SweepCtx {
    slots: Vec<Mutex<RolloutSlot>>,
    actor: Arc<dyn Actor>,
    config: MctsConfig,
    keep_going: AtomicBool,
    num_rollout: AtomicI32,
    budget: AtomicI32,
    error: Mutex<Option<MctsError>>,
}

fn flush_actions(
    state: &mut dyn State,
    queued: &mut Vec<Action>,
    checkpoint: &mut Option<NodeRef>,
) {
    if let Some(cp) = checkpoint.take() {
        state.copy_from(unsafe { cp.stored_state_unchecked() });
    }
    for &action in queued.iter() {
        state.forward(action);
    }
    queued.clear();
}

/// One sweep step for one root: settle and backpropagate the previous
/// rollout, then (unless the driver is winding down) descend once more and
/// prepare the new leaf for evaluation.
fn run_slot(ctx: &SweepCtx, index: usize, slot: &mut RolloutSlot, rng: &mut ChaCha8Rng) {
    let config = &ctx.config;
    let root = slot.root;
    let advance = if config.store_state_in_node {
        Advance::Stored
    } else if slot.root_state.is_stochastic() {
        Advance::Forward
    } else {
        Advance::Deferred
    };

    // Settle and backpropagate the previous sweep's leaf.
    if ctx.num_rollout.load(Ordering::Relaxed) != 0 {
        if let Some(node) = slot.node {
            if !slot.terminated {
                let state: &dyn State = if advance == Advance::Stored {
                    unsafe { node.stored_state_unchecked() }
                } else {
                    slot.local_state.as_deref().unwrap()
                };
                ctx.actor
                    .batch_result(index, state, unsafe { node.pi_val_mut() });

                if node.parent().is_none() && !slot.policy_bias.is_empty() {
                    let pi = unsafe { node.pi_val_mut() };
                    if pi.policy.len() != slot.policy_bias.len() {
                        let mut error = ctx.error.lock();
                        if error.is_none() {
                            *error = Some(MctsError::PolicyBiasMismatch {
                                expected: pi.policy.len(),
                                got: slot.policy_bias.len(),
                            });
                        }
                    } else {
                        for (p, b) in pi.policy.iter_mut().zip(&slot.policy_bias) {
                            *p += *b;
                        }
                    }
                }
            }

            let root_player = unsafe { root.pi_val_ref() }.player_id;
            node.settle(root_player);
            let (leaf_value, leaf_player) = {
                let pi = unsafe { node.pi_val_ref() };
                (pi.value, pi.player_id)
            };
            node.release();

            // At an opponent leaf we hold the opponent's value; flip once so
            // the whole path accumulates in the root player's frame.
            let flip = if root_player == leaf_player { 1.0 } else { -1.0 };
            let value = leaf_value * flip;
            let mut current = Some(node);
            while let Some(n) = current {
                n.stats().atomic_update(value, config.virtual_loss);
                current = n.parent();
            }
        }
    }

    if !ctx.keep_going.load(Ordering::Relaxed) {
        return;
    }

    // Selection.
    if advance != Advance::Stored {
        let RolloutSlot {
            root_state,
            local_state,
            ..
        } = &mut *slot;
        match local_state {
            Some(local) => local.copy_from(root_state.as_ref()),
            empty => *empty = Some(root_state.clone_state()),
        }
    }
    slot.rnn_current.clear();
    slot.rnn_current.extend_from_slice(&slot.rnn_root);
    slot.queued_actions.clear();
    let mut checkpoint: Option<NodeRef> = None;

    let root_player = if root.visited() {
        unsafe { root.pi_val_ref() }.player_id
    } else {
        0
    };
    let budget = ctx.budget.load(Ordering::Relaxed);

    let mut node = root;
    loop {
        node.acquire();
        node.stats().add_virtual_loss(config.virtual_loss);
        if !node.visited() {
            // Unvisited leaf; keep the lock until next sweep's settle.
            break;
        }

        {
            let pi = unsafe { node.pi_val_ref() };
            slot.rnn_current.clear();
            slot.rnn_current.extend_from_slice(&pi.rnn_state);
        }

        let best = pick_best_action(root_player, &node, config, rng, budget);
        if best == INVALID_ACTION {
            // Settled terminal node; re-settle and backpropagate it again.
            if advance == Advance::Deferred {
                flush_actions(
                    slot.local_state.as_deref_mut().unwrap(),
                    &mut slot.queued_actions,
                    &mut checkpoint,
                );
            }
            break;
        }

        match advance {
            Advance::Stored => {
                let child = node.get_or_add_child(&slot.storage, best, true, false, 0);
                node.release();
                node = child;
            }
            Advance::Forward => {
                let state = slot.local_state.as_deref_mut().unwrap();
                let stochastic_father = state.is_stochastic();
                state.forward(best);
                let hash = state.hash();
                let child =
                    node.get_or_add_child(&slot.storage, best, false, stochastic_father, hash);
                node.release();
                node = child;
            }
            Advance::Deferred => {
                if let Some(child) = node.get_child(best) {
                    if child.has_state() {
                        checkpoint = Some(child);
                        slot.queued_actions.clear();
                    } else {
                        slot.queued_actions.push(best);
                    }
                    node.release();
                    node = child;
                    continue;
                }
                let save = slot.queued_actions.len() >= config.store_state_interval;
                flush_actions(
                    slot.local_state.as_deref_mut().unwrap(),
                    &mut slot.queued_actions,
                    &mut checkpoint,
                );
                let state = slot.local_state.as_deref_mut().unwrap();
                state.forward(best);
                let child = node.new_child(slot.storage.new_node(), best);
                if save {
                    child.store_state_from(slot.local_state.as_deref().unwrap());
                }
                node.release();
                node = child;
            }
        }
    }

    // Expansion: terminal leaves settle with the terminal reward, the rest
    // go to the batched evaluator.
    let terminated = {
        let state: &dyn State = if advance == Advance::Stored {
            unsafe { node.stored_state_unchecked() }
        } else {
            slot.local_state.as_deref().unwrap()
        };
        if state.terminated() {
            let pi = unsafe { node.pi_val_mut() };
            pi.policy.clear();
            pi.rnn_state.clear();
            pi.value = state.get_reward(state.current_player());
            pi.player_id = state.current_player();
            true
        } else {
            false
        }
    };
    slot.terminated = terminated;
    slot.node = Some(node);

    let state: &dyn State = if advance == Advance::Stored {
        unsafe { node.stored_state_unchecked() }
    } else {
        slot.local_state.as_deref().unwrap()
    };
    ctx.actor.batch_prepare(index, state, &slot.rnn_current);
}

// ============================================================================
// DRIVER
// ============================================================================

/// Run the rollout budget over a batch of roots.
///
/// `roots[i]` must be initialised (with a stored state when
/// `store_state_in_node` is set) and allocated from `storages[i]`, which
/// also serves the tree grown under it. Returns the (possibly randomised)
/// rollout budget that was applied.
#[allow(clippy::too_many_arguments)]
pub fn compute_rollouts(
    roots: &[NodeRef],
    root_states: &[&dyn State],
    rnn_state: &[Vec<f32>],
    policy_bias: &[Vec<f32>],
    storages: &[Arc<Storage>],
    actor: &Arc<dyn Actor>,
    config: &MctsConfig,
    max_time: f64,
    rng: &mut ChaCha8Rng,
    threads: &Arc<Threads>,
) -> Result<i32, MctsError> {
    let batch = roots.len();
    if batch == 0 {
        return Err(MctsError::EmptyBatch);
    }
    debug_assert_eq!(root_states.len(), batch);
    debug_assert_eq!(storages.len(), batch);

    let slots = (0..batch)
        .map(|i| {
            Mutex::new(RolloutSlot {
                root: roots[i],
                node: None,
                root_state: root_states[i].clone_state(),
                local_state: None,
                terminated: false,
                storage: Arc::clone(&storages[i]),
                rnn_root: rnn_state.get(i).cloned().unwrap_or_default(),
                rnn_current: Vec::new(),
                policy_bias: policy_bias.get(i).cloned().unwrap_or_default(),
                queued_actions: Vec::new(),
            })
        })
        .collect();

    let ctx = Arc::new(SweepCtx {
        slots,
        actor: Arc::clone(actor),
        config: config.clone(),
        keep_going: AtomicBool::new(false),
        num_rollout: AtomicI32::new(0),
        budget: AtomicI32::new(0),
        error: Mutex::new(None),
    });

    // One job per stride of consecutive roots, each pinned to a reserved
    // thread so re-enqueued sweeps keep their affinity.
    let stride = (batch + threads.len() - 1) / threads.len();
    let task = Task::new(Arc::clone(threads));
    let mut handles = Vec::new();
    for begin in (0..batch).step_by(stride) {
        let end = (begin + stride).min(batch);
        let thread = threads.get_thread();
        let mut task_rng = ChaCha8Rng::seed_from_u64(rng.gen());
        let ctx = Arc::clone(&ctx);
        let handle = task.get_handle(thread, move || {
            for i in begin..end {
                let mut slot = ctx.slots[i].lock();
                run_slot(&ctx, i, &mut slot, &mut task_rng);
            }
        });
        handle.set_priority(polyzero_async::current_thread_index());
        handles.push(handle);
    }

    actor.batch_resize(batch);

    let mut budget = if max_time > 0.0 {
        0
    } else {
        config.num_rollouts
    };
    if config.randomized_rollouts && budget > 1 {
        let mean = if rng.gen_range(0..2) != 0 {
            budget / 8
        } else {
            budget * 2
        };
        let normal = Normal::new(mean as f32, budget as f32 / 4.0).unwrap();
        let max = budget * 4;
        loop {
            let sampled = normal.sample(rng) as i32;
            if sampled >= 1 && sampled <= max {
                budget = sampled;
                break;
            }
        }
    }
    ctx.budget.store(budget, Ordering::Relaxed);

    let begin_time = Instant::now();
    let mut num_rollout = 0i32;
    loop {
        let elapsed = begin_time.elapsed().as_secs_f64();
        let keep_going = (((max_time > 0.0) || (num_rollout < budget))
            && ((elapsed < max_time) || (max_time <= 0.0)))
            || num_rollout < 2;
        ctx.keep_going.store(keep_going, Ordering::Relaxed);

        for handle in &handles {
            task.enqueue(handle);
        }
        task.wait();

        if !keep_going {
            break;
        }

        actor.batch_evaluate(batch);
        ROLLOUT_COUNT.fetch_add(batch as u64, Ordering::Relaxed);

        num_rollout += 1;
        ctx.num_rollout.store(num_rollout, Ordering::Relaxed);
    }

    if let Some(error) = ctx.error.lock().take() {
        return Err(error);
    }

    for &root in roots {
        correct_forced_playouts(root, config, budget);
    }

    Ok(budget)
}

/// Remove the exploration bias of forced playouts from the final visit
/// counts: non-best children give visits back while they still lose the
/// PUCT comparison against the best child.
fn correct_forced_playouts(root: NodeRef, config: &MctsConfig, budget: i32) {
    root.acquire();
    let inner = unsafe { root.inner_ref() };
    let root_player = inner.pi_val.player_id;

    let mut best_action = INVALID_ACTION;
    let mut best_visits = 0;
    for edge in &inner.children {
        let visits: i32 = edge.nodes.iter().map(|n| n.stats().num_visit()).sum();
        if visits > best_visits {
            best_visits = visits;
            best_action = edge.action;
        }
    }

    if best_action != INVALID_ACTION {
        let best_puct = puct_value(root_player, config.puct, &root, best_action);
        for edge in &inner.children {
            if edge.action == best_action {
                continue;
            }
            let child = edge.nodes[0];
            let mut forced =
                forced_rollouts(inner.pi_val.policy[edge.action as usize], budget, config);
            while forced > 0 && child.stats().num_visit() > 0 {
                child.stats().subtract_visit();
                let pv = puct_value(root_player, config.puct, &root, edge.action);
                if pv > best_puct {
                    child.stats().add_visit();
                    break;
                }
                forced -= 1;
            }
        }
    }
    root.release();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forced_rollouts_truncates() {
        let config = MctsConfig {
            forced_rollouts_multiplier: 2.0,
            ..MctsConfig::default()
        };
        // sqrt(2 * 0.5 * 100) = 10
        assert_eq!(forced_rollouts(0.5, 100, &config), 10);
        // sqrt(2 * 0.9 * 100) = 13.41..
        assert_eq!(forced_rollouts(0.9, 100, &config), 13);
        let off = MctsConfig::default();
        assert_eq!(forced_rollouts(0.9, 100, &off), 0);
    }
}
