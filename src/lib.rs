pub mod api;
pub mod config;
pub mod daemon;
pub mod error;
pub mod raft_api;
pub mod replicator;
pub mod types;

pub use api::create_router;
pub use config::NodeConfig;
pub use daemon::DocDaemon;
pub use error::{RaftError, RaftResult, TransportError};
pub use raft_api::create_raft_router;
pub use replicator::{RaftReplicator, Replicator};
pub use types::*;
