use thiserror::Error;

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("Not a leader.")]
    NotLeader,

    #[error("Node is not running")]
    NotRunning,

    #[error("Quorum unreachable")]
    QuorumUnreachable,

    #[error("Log error: {0}")]
    Log(#[from] LogError),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Timeout")]
    Timeout,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("State machine error: {0}")]
    StateMachine(String),
}

#[derive(Error, Debug)]
pub enum LogError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid log index: {0}")]
    InvalidIndex(u64),
}
