use thiserror::Error;
use tonic::{Code, Status};

use crate::raft::RaftError;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("gRPC error: {0}")]
    GrpcError(#[from] Status),

    #[error("Transport error: {0}")]
    TransportError(#[from] tonic::transport::Error),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Timeout error")]
    TimeoutError,
}

impl From<NetworkError> for RaftError {
    fn from(err: NetworkError) -> Self {
        match err {
            NetworkError::TimeoutError => RaftError::Timeout,
            NetworkError::GrpcError(status) => status_to_raft(status),
            other => RaftError::NetworkError(other.to_string()),
        }
    }
}

/// Maps a node's answer onto a gRPC status the client side can map back.
pub fn raft_to_status(err: RaftError) -> Status {
    match err {
        RaftError::NotLeader => Status::failed_precondition(err.to_string()),
        RaftError::QuorumUnreachable => Status::unavailable(err.to_string()),
        RaftError::NotRunning => Status::unavailable(err.to_string()),
        RaftError::Timeout => Status::deadline_exceeded(err.to_string()),
        other => Status::internal(other.to_string()),
    }
}

fn status_to_raft(status: Status) -> RaftError {
    match status.code() {
        Code::FailedPrecondition => RaftError::NotLeader,
        Code::Unavailable if status.message() == RaftError::QuorumUnreachable.to_string() => {
            RaftError::QuorumUnreachable
        }
        Code::DeadlineExceeded => RaftError::Timeout,
        _ => RaftError::NetworkError(status.message().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_leader_survives_the_wire() {
        let status = raft_to_status(RaftError::NotLeader);
        assert_eq!(status.message(), "Not a leader.");
        let back: RaftError = NetworkError::from(status).into();
        assert!(matches!(back, RaftError::NotLeader));
    }

    #[test]
    fn quorum_unreachable_survives_the_wire() {
        let status = raft_to_status(RaftError::QuorumUnreachable);
        let back: RaftError = NetworkError::GrpcError(status).into();
        assert!(matches!(back, RaftError::QuorumUnreachable));
    }

    #[test]
    fn other_failures_are_network_errors() {
        let back: RaftError = NetworkError::ConnectionError("refused".into()).into();
        match back {
            RaftError::NetworkError(msg) => assert!(msg.contains("refused")),
            other => panic!("expected NetworkError, got {other:?}"),
        }
    }
}
