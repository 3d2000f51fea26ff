use clap::{Parser, Subcommand};
use tokio::runtime::Runtime;

use polyzero_cli::{bench, selfplay, serve};

#[derive(Parser)]
#[command(name = "polyzero")]
#[command(about = "POLYZERO self-play system")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the model distribution server
    Serve(serve::ServeArgs),
    /// Play self-play games against served models
    Selfplay(selfplay::SelfplayArgs),
    /// Benchmark search throughput
    Bench(bench::BenchArgs),
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve(args) => Runtime::new()?.block_on(serve::run(args)),
        Commands::Selfplay(args) => Runtime::new()?.block_on(selfplay::run(args)),
        Commands::Bench(args) => bench::run(args),
    }
}
