use std::sync::Arc;

use tokio::select;
use tokio::signal::unix;
use tokio::signal::unix::SignalKind;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{filter::Targets, layer::Layer, prelude::*, util::SubscriberInitExt};

use crate::{
    cli::{arguments, node::Node},
    config::NodeConfig,
};

pub async fn run(args: arguments::Run) -> eyre::Result<()> {
    let config = NodeConfig::from_path(args.config)?;

    let level_filter = config.logger.level;

    let filter = Targets::new()
        .with_target("tessera_p2p", level_filter)
        .with_target("p2p", level_filter)
        .with_target("net", level_filter)
        .with_default(level_filter);

    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(LevelFilter::DEBUG.into())
        .from_env()?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(filter))
        .with(env_filter)
        .try_init()?;

    let node = Arc::new(Node::new(config)?);
    let node_clone = node.clone();

    tokio::spawn(async move {
        if let Err(err) = node_clone.run().await {
            tracing::error!("Node failed: {:?}", err);
        }
        node_clone.task_tracker.close();
    });

    let mut sigterm =
        unix::signal(SignalKind::terminate()).expect("Failed to create SIGTERM signal handler");
    let mut sigint =
        unix::signal(SignalKind::interrupt()).expect("Failed to create SIGINT signal handler");

    select! {
        _ = node.cancelled() => {
            tracing::info!("Node run failed");
        }
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM signal");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT signal");
        }
    }

    node.shutdown().await;

    Ok(())
}
