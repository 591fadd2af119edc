use crate::config::NodeConfig;
use crate::replicator::{HttpTransport, RaftReplicator, Replicator, SledStorage};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

pub struct DocDaemon {
    node_id: String,
    replicator: Arc<RaftReplicator>,
    config: NodeConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl DocDaemon {
    pub fn new(config: NodeConfig) -> Result<Self> {
        config.validate()?;
        let node_id = config.node_id.clone();
        let advertise_addr = config.effective_advertise_addr();

        info!("Initializing DocDaemon node_id={} addr={}", node_id, advertise_addr);

        let raft_dir = config.raft_dir();
        std::fs::create_dir_all(&raft_dir)?;
        let storage = SledStorage::open(&raft_dir)?;
        info!(
            "Opened raft storage at {:?} ({} bytes on disk)",
            raft_dir,
            storage.size_on_disk()?
        );

        let transport = HttpTransport::new(config.raft.rpc_timeout());
        for peer in &config.peers {
            transport.register_peer(peer.node_id.clone(), peer.addr.clone());
        }

        let replicator = RaftReplicator::new(
            node_id.clone(),
            advertise_addr,
            config.peer_infos(),
            config.raft.clone(),
            config.merge.policy,
            Box::new(storage),
            Arc::new(transport),
        )?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            node_id,
            replicator,
            config,
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub async fn run(&self) -> Result<()> {
        info!("Starting DocDaemon...");

        if self.config.peers.is_empty() {
            info!("No peers configured, running as a single-replica cluster");
        }

        let replicator = self.replicator.clone();
        let shutdown_rx = self.shutdown_rx.clone();
        let driver_handle = tokio::spawn(async move {
            replicator.run(shutdown_rx).await;
        });

        info!("DocDaemon running on {}", self.config.listen_addr());

        tokio::select! {
            _ = driver_handle => {
                error!("Raft driver exited unexpectedly");
            }
            _ = self.wait_for_shutdown() => {
                info!("Shutdown signal received");
            }
        }

        let status = self.replicator.status();
        info!(
            "Stopping {} at term {} (commit index {}, applied {})",
            self.node_id, status.term, status.commit_index, status.last_applied
        );
        Ok(())
    }

    async fn wait_for_shutdown(&self) {
        let mut rx = self.shutdown_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn replicator(&self) -> &Arc<RaftReplicator> {
        &self.replicator
    }
}
