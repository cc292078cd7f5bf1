mod candidate;
mod config;
mod context;
mod endpoint;
mod error;
mod fabric;
mod follower;
mod leader;
mod lock;
mod log;
mod machine;
mod message;
mod node;
mod quorum;
mod role;
mod state;
mod sync;
mod timer;

pub use self::config::RaftConfig;
pub use self::endpoint::RpcEndpoint;
pub use self::error::{LogError, RaftError};
pub use self::fabric::{LocalEndpoint, LocalFabric};
pub use self::lock::StateLock;
pub use self::log::{FileLog, LogEntry, MemLog, RaftLog};
pub use self::machine::{KvCommand, KvMachine, KvResult, NoopMachine, StateMachine};
pub use self::message::{
    PingRequest, PingResponse, PollRequest, PollResponse, SubmitRequest, SubmitResponse,
    SyncRequest, SyncResponse,
};
pub use self::node::{RaftHandle, RaftNode};
pub use self::quorum::{quorum_size, Quorum};
pub use self::state::{NodeRole, NodeState};
pub use self::sync::{append_entries, SyncOutcome};
