use std::time::Duration;

use tokio::select;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

use tessera_p2p::client::peer::{JsonPeerStore, PeerPersistence};
use tessera_p2p::client::P2PClient;
use tessera_p2p::net::ReactorTcp;

use crate::config::NodeConfig;
use crate::handler::LogHandler;

/// The limit of time to wait for the node's tasks to finish on shutdown.
/// Stragglers are logged but never block the exit.
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 20;

/// Encapsulates the node services' lifecycle.
pub struct Node {
    config: NodeConfig,
    cancellation: CancellationToken,
    pub(crate) task_tracker: TaskTracker,
}

impl Node {
    pub fn new(config: NodeConfig) -> eyre::Result<Self> {
        Ok(Self {
            config,
            cancellation: CancellationToken::new(),
            task_tracker: TaskTracker::new(),
        })
    }

    /// Wait for the signal from any node service about the cancellation.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    pub async fn run(&self) -> eyre::Result<()> {
        self.spawn_p2p()?;
        self.task_tracker.close();

        Ok(())
    }

    fn spawn_p2p(&self) -> eyre::Result<()> {
        let persistence = self
            .config
            .p2p
            .peers_file()
            .map(|path| Box::new(JsonPeerStore::new(path)) as Box<dyn PeerPersistence>);

        let client = P2PClient::<ReactorTcp, LogHandler>::new(
            self.config.p2p.to_client_config(self.config.network)?,
            LogHandler::default(),
            persistence,
        )?;

        let cancellation = self.cancellation.clone();
        self.task_tracker.spawn(async move {
            if let Err(err) = client.run(cancellation.clone()).await {
                error!("P2P client failed: {err}");
                cancellation.cancel();
            }
        });

        Ok(())
    }

    pub async fn shutdown(&self) {
        info!("Shutting down node, finishing received requests...");

        self.cancellation.cancel();

        let timeout = self
            .config
            .shutdown_timeout
            .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_SECS);

        select! {
            // Wait until all tasks are finished.
            _ = self.task_tracker.wait() => {},
            // Or give up on the stragglers after the deadline.
            _ = sleep(Duration::from_secs(timeout)) => {
                info!(
                    "Shutdown timeout reached with {} task(s) still running, exiting...",
                    self.task_tracker.len()
                );
            },
        }
    }
}
