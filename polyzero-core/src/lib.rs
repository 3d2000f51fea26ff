//! POLYZERO Core - Data model and capability contracts
//!
//! This crate provides the shared vocabulary of the self-play system:
//! - Actions, player ids and evaluation outputs (`PiVal`)
//! - The `State` capability (game-specific behaviour stays behind it)
//! - The `Actor` capability (batched leaf evaluation contract)
//! - A framework-free `Tensor` value type for state dicts and replay rows

pub mod actor;
pub mod state;
pub mod tensor;

// Re-exports
pub use actor::{Actor, PiVal, UniformActor};
pub use state::{Action, PlayerId, State, INVALID_ACTION};
pub use tensor::{Dtype, StateDict, Tensor, TensorError};
