use crate::replicator::MergePolicy;
use crate::types::PeerInfo;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: String,

    pub bind_addr: String,
    pub bind_port: u16,

    /// Address peers and clients use to reach this node. Defaults to the listen address.
    pub advertise_addr: Option<String>,

    pub data_dir: PathBuf,

    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    #[serde(default)]
    pub raft: RaftSettings,

    #[serde(default)]
    pub merge: MergeSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub node_id: String,
    pub addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftSettings {
    pub heartbeat_interval_ms: u64,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub rpc_timeout_ms: u64,
    pub propose_timeout_ms: u64,
    pub tick_interval_ms: u64,
    pub max_entries_per_message: usize,
    pub sync_lag_threshold: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MergeSettings {
    pub policy: MergePolicy,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "server-1".to_string(),
            bind_addr: "0.0.0.0".to_string(),
            bind_port: 7000,
            advertise_addr: None,
            data_dir: PathBuf::from("/var/lib/docraft"),
            peers: Vec::new(),
            raft: RaftSettings::default(),
            merge: MergeSettings::default(),
        }
    }
}

impl Default for RaftSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 50,
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            rpc_timeout_ms: 100,
            propose_timeout_ms: 5000,
            tick_interval_ms: 10,
            max_entries_per_message: 256,
            sync_lag_threshold: 512,
        }
    }
}

impl RaftSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn election_timeout_min(&self) -> Duration {
        Duration::from_millis(self.election_timeout_min_ms)
    }

    pub fn election_timeout_max(&self) -> Duration {
        Duration::from_millis(self.election_timeout_max_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn propose_timeout(&self) -> Duration {
        Duration::from_millis(self.propose_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.election_timeout_min_ms > self.election_timeout_max_ms {
            anyhow::bail!(
                "election_timeout_min_ms ({}) exceeds election_timeout_max_ms ({})",
                self.election_timeout_min_ms,
                self.election_timeout_max_ms
            );
        }
        if self.heartbeat_interval_ms >= self.election_timeout_min_ms {
            anyhow::bail!(
                "heartbeat_interval_ms ({}) must be shorter than election_timeout_min_ms ({})",
                self.heartbeat_interval_ms,
                self.election_timeout_min_ms
            );
        }
        if self.rpc_timeout_ms >= self.election_timeout_min_ms {
            anyhow::bail!(
                "rpc_timeout_ms ({}) must be shorter than election_timeout_min_ms ({})",
                self.rpc_timeout_ms,
                self.election_timeout_min_ms
            );
        }
        if self.tick_interval_ms == 0 || self.max_entries_per_message == 0 {
            anyhow::bail!("tick_interval_ms and max_entries_per_message must be non-zero");
        }
        Ok(())
    }
}

impl NodeConfig {
    pub fn load(path: &PathBuf) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &PathBuf) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node_id.is_empty() {
            anyhow::bail!("node_id must be set");
        }
        let mut seen = HashSet::new();
        for peer in &self.peers {
            if peer.node_id == self.node_id {
                anyhow::bail!("peer list contains this node ({})", self.node_id);
            }
            if !seen.insert(peer.node_id.as_str()) {
                anyhow::bail!("duplicate peer node_id {}", peer.node_id);
            }
        }
        self.raft.validate()
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.bind_port)
    }

    pub fn effective_advertise_addr(&self) -> String {
        self.advertise_addr
            .clone()
            .unwrap_or_else(|| self.listen_addr())
    }

    pub fn peer_infos(&self) -> Vec<PeerInfo> {
        self.peers
            .iter()
            .map(|p| PeerInfo {
                node_id: p.node_id.clone(),
                addr: p.addr.clone(),
            })
            .collect()
    }

    pub fn raft_dir(&self) -> PathBuf {
        self.data_dir.join("raft")
    }
}
