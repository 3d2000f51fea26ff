//! Selfplay command - drive games against served models
//!
//! The harness plays the built-in game with the search stack, reports
//! results for rating, buffers positions in the replay store and ships
//! sampled batches to the trainer as opaque blobs.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use rustc_hash::FxHashMap;
use serde::Deserialize;

use polyzero_core::{State, Tensor, UniformActor};
use polyzero_dist::{DistributedClient, Serializer};
use polyzero_mcts::{MctsConfig, Search};
use polyzero_replay::ReplayBuffer;

use crate::game::TakeStones;

const REPLAY_CAPACITY: i64 = 4096;
const TRAIN_BATCH: i64 = 32;

#[derive(Args)]
pub struct SelfplayArgs {
    /// Server endpoint (host:port)
    #[arg(long)]
    pub endpoint: Option<String>,

    /// JSON file with an endpoint list, tried round-robin
    #[arg(long)]
    pub endpoints_file: Option<PathBuf>,

    /// Games to play
    #[arg(long, default_value = "16")]
    pub games: usize,

    /// Rollouts per move
    #[arg(long, default_value = "200")]
    pub rollouts: i32,

    /// Stones in the starting position
    #[arg(long, default_value = "22")]
    pub stones: u32,

    /// Ask for tournament opponents instead of staying on the dev model
    #[arg(long)]
    pub tournament: bool,
}

#[derive(Deserialize)]
struct EndpointsFile {
    endpoints: Vec<String>,
}

fn resolve_endpoints(args: &SelfplayArgs) -> Result<Vec<String>> {
    if let Some(path) = &args.endpoints_file {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let file: EndpointsFile = serde_json::from_str(&raw).context("parsing endpoints file")?;
        return Ok(file.endpoints);
    }
    args.endpoint
        .clone()
        .map(|e| vec![e])
        .context("either --endpoint or --endpoints-file is required")
}

pub async fn run(args: SelfplayArgs) -> Result<()> {
    let endpoints = resolve_endpoints(&args)?;
    let client = DistributedClient::new(endpoints);
    client.set_on_update_model(|id, state_dict| {
        tracing::info!("adopted model '{}' ({} tensors)", id, state_dict.len());
    });
    client.connect().await?;

    let replay = ReplayBuffer::new(REPLAY_CAPACITY, rand::random());
    let actor = Arc::new(UniformActor::new());
    let config = MctsConfig::default().with_rollouts(args.rollouts);
    let mut search = Search::new(actor, config);

    for game_index in 0..args.games {
        let mut state = TakeStones::new(args.stones);
        let mut positions = Vec::new();
        let mut players = Vec::new();

        while !state.terminated() {
            let result = search
                .run(&[&state as &dyn State])
                .context("search failed")?;
            positions.push(state.remaining() as f32);
            players.push(state.current_player() as f32);
            state.forward(result.roots[0].best_action);
        }
        let reward = state.get_reward(0);

        let mut ratios = FxHashMap::default();
        ratios.insert(client.model_id(), 1.0f32);
        client.send_result(reward, ratios);

        let rows = positions.len() as i64;
        let mut sample = FxHashMap::default();
        sample.insert(
            "obs".to_string(),
            Tensor::from_f32(vec![rows, 1], &positions)?,
        );
        sample.insert(
            "player".to_string(),
            Tensor::from_f32(vec![rows, 1], &players)?,
        );
        sample.insert(
            "reward".to_string(),
            Tensor::from_f32(vec![rows, 1], &vec![reward; rows as usize])?,
        );
        replay.add(&sample)?;

        if replay.size() >= TRAIN_BATCH {
            let batch = replay.sample(TRAIN_BATCH)?;
            let mut serializer = Serializer::new();
            serializer.write_state_dict(&batch);
            client.send_train_data(&serializer.into_vec()).await?;
        }

        client.request_model(args.tournament).await?;
        tracing::info!(
            "game {}: reward {} for player 0, model '{}'",
            game_index + 1,
            reward,
            client.model_id()
        );
    }

    tracing::info!("played {} games", args.games);
    Ok(())
}
