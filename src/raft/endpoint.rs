use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use super::{
    PingRequest, PingResponse, PollRequest, PollResponse, RaftError, SyncRequest, SyncResponse,
};

/// Outbound RPCs to peers. Any error is treated by the caller as a
/// transport failure: a "no" for quorum purposes, never fatal.
#[async_trait]
pub trait RpcEndpoint: Send + Sync + 'static {
    async fn ping(&self, address: &str, request: PingRequest) -> Result<PingResponse, RaftError>;

    async fn poll(&self, address: &str, request: PollRequest) -> Result<PollResponse, RaftError>;

    async fn sync(&self, address: &str, request: SyncRequest) -> Result<SyncResponse, RaftError>;
}

/// Bounds an outbound call; an elapsed deadline is a transport failure.
pub(crate) async fn with_timeout<T, F>(timeout: Duration, call: F) -> Result<T, RaftError>
where
    F: Future<Output = Result<T, RaftError>>,
{
    tokio::time::timeout(timeout, call)
        .await
        .unwrap_or(Err(RaftError::Timeout))
}
