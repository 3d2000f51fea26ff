//! Batched leaf-evaluator capability
//!
//! The engine accumulates leaves into numbered batch slots, asks for one
//! forward pass per synchronisation point, then collects results per slot.
//! Call order per rollout sweep: `batch_resize` once, then
//! `batch_prepare`* → `batch_evaluate` → `batch_result`*.

use parking_lot::Mutex;

use crate::state::{PlayerId, State};

/// Evaluation output for one state.
///
/// `policy` has one prior per action of the state's action space and is
/// empty for terminal states. `value` is from the perspective of
/// `player_id`, the player whose turn produced the state.
#[derive(Clone, Debug, Default)]
pub struct PiVal {
    pub policy: Vec<f32>,
    pub value: f32,
    pub player_id: PlayerId,
    /// Recurrent evaluator state carried along the descent path, if any.
    pub rnn_state: Vec<f32>,
}

impl PiVal {
    /// Clear all fields, keeping allocations for reuse.
    pub fn reset(&mut self) {
        self.policy.clear();
        self.value = 0.0;
        self.player_id = 0;
        self.rnn_state.clear();
    }
}

/// Batched evaluator contract.
///
/// `batch_prepare` and `batch_result` are called from worker threads on
/// disjoint slot indices; `batch_resize` and `batch_evaluate` are called by
/// the orchestrating thread alone. Implementations therefore need interior
/// mutability.
pub trait Actor: Send + Sync {
    /// Size the batch to `n` slots.
    fn batch_resize(&self, n: usize);

    /// Record the state in slot `index` for the next forward pass.
    fn batch_prepare(&self, index: usize, state: &dyn State, rnn_state: &[f32]);

    /// Run one forward pass over the first `n` slots.
    fn batch_evaluate(&self, n: usize);

    /// Fetch the result for slot `index` into `pi_val`.
    fn batch_result(&self, index: usize, state: &dyn State, pi_val: &mut PiVal);
}

/// Baseline evaluator: uniform priors, zero value.
///
/// Useful as a network-free stand-in for plumbing tests and benchmarks.
pub struct UniformActor {
    slots: Mutex<Vec<(PlayerId, usize)>>,
}

impl UniformActor {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
        }
    }
}

impl Default for UniformActor {
    fn default() -> Self {
        Self::new()
    }
}

impl Actor for UniformActor {
    fn batch_resize(&self, n: usize) {
        self.slots.lock().resize(n, (0, 0));
    }

    fn batch_prepare(&self, index: usize, state: &dyn State, _rnn_state: &[f32]) {
        self.slots.lock()[index] = (state.current_player(), state.action_space());
    }

    fn batch_evaluate(&self, _n: usize) {}

    fn batch_result(&self, index: usize, _state: &dyn State, pi_val: &mut PiVal) {
        let (player, actions) = self.slots.lock()[index];
        pi_val.reset();
        pi_val.policy.resize(actions, 1.0 / actions.max(1) as f32);
        pi_val.value = 0.0;
        pi_val.player_id = player;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;

    #[derive(Clone)]
    struct Stub;

    impl State for Stub {
        fn clone_state(&self) -> Box<dyn State> {
            Box::new(self.clone())
        }
        fn copy_from(&mut self, _other: &dyn State) {}
        fn forward(&mut self, _action: crate::Action) {}
        fn terminated(&self) -> bool {
            false
        }
        fn get_reward(&self, _player: PlayerId) -> f32 {
            0.0
        }
        fn current_player(&self) -> PlayerId {
            1
        }
        fn hash(&self) -> u64 {
            0
        }
        fn is_stochastic(&self) -> bool {
            false
        }
        fn action_space(&self) -> usize {
            4
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_uniform_actor_policy() {
        let actor = UniformActor::new();
        actor.batch_resize(2);
        actor.batch_prepare(1, &Stub, &[]);
        actor.batch_evaluate(2);

        let mut pi = PiVal::default();
        actor.batch_result(1, &Stub, &mut pi);
        assert_eq!(pi.player_id, 1);
        assert_eq!(pi.policy.len(), 4);
        assert!((pi.policy.iter().sum::<f32>() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_pival_reset_keeps_capacity() {
        let mut pi = PiVal {
            policy: Vec::with_capacity(64),
            value: 1.0,
            player_id: 3,
            rnn_state: vec![0.5; 8],
        };
        pi.policy.extend_from_slice(&[0.25; 4]);
        pi.reset();
        assert!(pi.policy.is_empty());
        assert!(pi.policy.capacity() >= 64);
        assert_eq!(pi.value, 0.0);
        assert!(pi.rnn_state.is_empty());
    }
}
