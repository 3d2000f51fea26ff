//! POLYZERO CLI - Operational harness
//!
//! Commands:
//! - serve: run the model distribution server
//! - selfplay: play games against served models and ship results
//! - bench: search throughput on the built-in game

pub mod bench;
pub mod game;
pub mod selfplay;
pub mod serve;
