// Consensus core
pub mod raft;

// Hosting
pub mod cluster;
pub mod config;

// Transport
#[cfg(feature = "grpc")]
pub mod network;

// Public exports
pub use cluster::LocalCluster;
pub use config::Config;
pub use raft::{RaftConfig, RaftError, RaftHandle, RaftNode};
