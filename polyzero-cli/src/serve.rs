//! Serve command - run the model distribution server

use anyhow::Result;
use clap::Args;

use polyzero_core::{StateDict, Tensor};
use polyzero_dist::{DistributedServer, DEV_MODEL_ID};

#[derive(Args)]
pub struct ServeArgs {
    /// Endpoint to bind (host:port); an ephemeral port when omitted
    #[arg(long)]
    pub endpoint: Option<String>,
}

pub async fn run(args: ServeArgs) -> Result<()> {
    let server = DistributedServer::start(args.endpoint.as_deref(), |blob| {
        tracing::info!("received {} bytes of training data", blob.len());
    })
    .await?;

    // Seed the registry so clients have something to adopt.
    let mut dev = StateDict::default();
    dev.insert("marker".to_string(), Tensor::from_f32(vec![1], &[1.0])?);
    server.update_model(DEV_MODEL_ID, dev);

    tracing::info!("distribution server listening on {}", server.endpoint());
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    Ok(())
}
