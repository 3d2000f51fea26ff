//! Bench command - search throughput on the built-in game

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use clap::Args;

use polyzero_async::Threads;
use polyzero_core::{State, UniformActor};
use polyzero_mcts::{MctsConfig, Search};

use crate::game::TakeStones;

#[derive(Args)]
pub struct BenchArgs {
    /// Rollouts per root
    #[arg(long, default_value = "400")]
    pub rollouts: i32,

    /// Number of parallel roots
    #[arg(long, default_value = "32")]
    pub batch: usize,

    /// Worker threads (0 = one per core)
    #[arg(long, default_value = "0")]
    pub threads: usize,

    /// Stones in the starting position
    #[arg(long, default_value = "22")]
    pub stones: u32,
}

pub fn run(args: BenchArgs) -> Result<()> {
    let threads = if args.threads == 0 {
        num_cpus::get()
    } else {
        args.threads
    };
    tracing::info!(
        "Benchmarking search: {} roots x {} rollouts on {} threads",
        args.batch,
        args.rollouts,
        threads
    );

    let pool = Arc::new(Threads::new(threads));
    let actor = Arc::new(UniformActor::new());
    let config = MctsConfig::default().with_rollouts(args.rollouts);
    let mut search = Search::with_threads(actor, config, pool);

    let states: Vec<TakeStones> = (0..args.batch).map(|_| TakeStones::new(args.stones)).collect();
    let refs: Vec<&dyn State> = states.iter().map(|s| s as &dyn State).collect();

    let start = Instant::now();
    let batch = search.run_trees(&refs, &[], &[])?;
    let elapsed = start.elapsed().as_secs_f64();

    let total = batch.rollouts as f64 * args.batch as f64;
    tracing::info!(
        "{} rollouts in {:.3}s ({:.0} rollouts/s)",
        total,
        elapsed,
        total / elapsed
    );
    tracing::info!("best actions: {:?}", batch.best_actions());
    Ok(())
}
