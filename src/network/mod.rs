//! gRPC transport between nodes.

mod error;

pub mod client;
pub mod server;

pub use client::{submit, GrpcEndpoint};
pub use error::{raft_to_status, NetworkError};
pub use server::{serve, RaftServer};

pub mod proto {
    tonic::include_proto!("raft");
}

use crate::raft;

impl From<raft::LogEntry> for proto::LogEntry {
    fn from(entry: raft::LogEntry) -> Self {
        Self {
            term: entry.term,
            command: entry.command,
        }
    }
}

impl From<proto::LogEntry> for raft::LogEntry {
    fn from(entry: proto::LogEntry) -> Self {
        raft::LogEntry::new(entry.term, entry.command)
    }
}

impl From<raft::PingRequest> for proto::PingRequest {
    fn from(req: raft::PingRequest) -> Self {
        Self {
            term: req.term,
            leader: req.leader,
        }
    }
}

impl From<proto::PingRequest> for raft::PingRequest {
    fn from(req: proto::PingRequest) -> Self {
        Self {
            term: req.term,
            leader: req.leader,
        }
    }
}

impl From<raft::PollRequest> for proto::PollRequest {
    fn from(req: raft::PollRequest) -> Self {
        Self {
            term: req.term,
            candidate: req.candidate,
            last_log_index: req.last_log_index,
            last_log_term: req.last_log_term,
        }
    }
}

impl From<proto::PollRequest> for raft::PollRequest {
    fn from(req: proto::PollRequest) -> Self {
        Self {
            term: req.term,
            candidate: req.candidate,
            last_log_index: req.last_log_index,
            last_log_term: req.last_log_term,
        }
    }
}

impl From<raft::SyncRequest> for proto::SyncRequest {
    fn from(req: raft::SyncRequest) -> Self {
        Self {
            term: req.term,
            leader: req.leader,
            prev_log_index: req.prev_log_index,
            prev_log_term: req.prev_log_term,
            entries: req.entries.into_iter().map(Into::into).collect(),
            commit_index: req.commit_index,
        }
    }
}

impl From<proto::SyncRequest> for raft::SyncRequest {
    fn from(req: proto::SyncRequest) -> Self {
        Self {
            term: req.term,
            leader: req.leader,
            prev_log_index: req.prev_log_index,
            prev_log_term: req.prev_log_term,
            entries: req.entries.into_iter().map(Into::into).collect(),
            commit_index: req.commit_index,
        }
    }
}
