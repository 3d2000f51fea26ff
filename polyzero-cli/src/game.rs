//! Built-in fixture game
//!
//! A take-away game: two players alternate removing one or two stones, the
//! player taking the last stone wins. Small enough to verify search
//! behaviour by hand (losing positions are the multiples of three), and a
//! convenient load for benches and the self-play harness.

use std::any::Any;

use polyzero_core::{Action, PlayerId, State};

#[derive(Clone, Debug)]
pub struct TakeStones {
    remaining: u32,
    to_move: PlayerId,
}

impl TakeStones {
    pub fn new(stones: u32) -> Self {
        Self {
            remaining: stones,
            to_move: 0,
        }
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }
}

impl State for TakeStones {
    fn clone_state(&self) -> Box<dyn State> {
        Box::new(self.clone())
    }

    fn copy_from(&mut self, other: &dyn State) {
        *self = other.as_any().downcast_ref::<Self>().unwrap().clone();
    }

    fn forward(&mut self, action: Action) {
        let take = (action as u32 + 1).min(self.remaining);
        self.remaining -= take;
        self.to_move = 1 - self.to_move;
    }

    fn terminated(&self) -> bool {
        self.remaining == 0
    }

    fn get_reward(&self, player: PlayerId) -> f32 {
        // The player who took the last stone is the one not to move now.
        let winner = 1 - self.to_move;
        if player == winner {
            1.0
        } else {
            -1.0
        }
    }

    fn current_player(&self) -> PlayerId {
        self.to_move
    }

    fn hash(&self) -> u64 {
        (u64::from(self.remaining) << 1) | self.to_move as u64
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
