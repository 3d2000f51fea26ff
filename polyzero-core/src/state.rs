//! Game-state capability
//!
//! The search engine never inspects game internals; everything it needs is
//! the operation set below. Implementations live outside this workspace
//! (tests and the CLI carry small fixture games).

use std::any::Any;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Opaque non-negative move identifier, local to a state.
pub type Action = i64;

/// Distinguished sentinel for "no legal action".
pub const INVALID_ACTION: Action = -1;

/// Player identifier as reported by a state.
pub type PlayerId = i32;

/// Capability contract for game states.
///
/// All methods are infallible: a failure inside a state implementation is a
/// programmer error, not a recoverable condition for the search.
pub trait State: Send {
    /// Deep copy into a fresh boxed state.
    fn clone_state(&self) -> Box<dyn State>;

    /// Overwrite `self` with `other`. Both sides must be the same concrete
    /// type (`state_type_id` equal); implementations may panic otherwise.
    fn copy_from(&mut self, other: &dyn State);

    /// Apply an action in place.
    fn forward(&mut self, action: Action);

    /// Whether the game has ended.
    fn terminated(&self) -> bool;

    /// Reward for `player` at this state (terminal states only are
    /// meaningful; typically in [-1, 1]).
    fn get_reward(&self, player: PlayerId) -> f32;

    /// Player to move.
    fn current_player(&self) -> PlayerId;

    /// Position hash, used to deduplicate stochastic transitions.
    fn hash(&self) -> u64;

    /// Whether the *next* transition from this state is a chance event.
    fn is_stochastic(&self) -> bool;

    /// Number of actions in this game's (fixed) action space.
    fn action_space(&self) -> usize;

    /// Concrete-type witness for `copy_from` / stored-state reuse.
    fn as_any(&self) -> &dyn Any;
}

impl dyn State + '_ {
    /// Stable per-concrete-type identifier.
    pub fn state_type_id(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.as_any().type_id().hash(&mut hasher);
        hasher.finish()
    }
}
