//! POLYZERO Dist - Model distribution over request/reply sockets
//!
//! This crate connects self-play clients to the trainer:
//! - Binary tagged-message protocol and framed TCP transport
//! - Server-side model registry with Elo-style opponent ratings
//! - Rating-weighted tournament opponent sampling
//! - Client-side model adoption, state-dict fetch and result reporting
//!
//! Transport errors are retried (up to a cap); protocol violations are
//! logged and dropped; logical errors surface to the caller.

mod client;
mod message;
mod rating;
mod reqrep;
mod server;
mod wire;

pub use client::{DistributedClient, UpdateModelFn};
pub use message::{GameOutcome, Message};
pub use rating::{elo_adjustment, sample_rating_weighted, ELO_K, ELO_SCALE, SAMPLE_POOL};
pub use reqrep::{ReqRepClient, ReqRepServer, ServerCallback};
pub use server::{DistributedServer, ModelInfo, DEV_MODEL_ID};
pub use wire::{Deserializer, ProtocolError, Serializer};

use thiserror::Error;

/// Error types for distribution operations
#[derive(Debug, Error)]
pub enum DistError {
    #[error("maximum number of retries reached")]
    MaxRetries,

    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("client terminated")]
    Terminated,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
