use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tonic::transport::{Channel, Endpoint};
use tonic::Request;

use crate::raft::{
    PingRequest, PingResponse, PollRequest, PollResponse, RaftError, RpcEndpoint, SubmitResponse,
    SyncRequest, SyncResponse,
};

use super::proto;
use super::proto::raft_service_client::RaftServiceClient;
use super::NetworkError;

/// Builds a client whose channel connects on first use, so creating one never
/// waits on the peer.
fn connect(address: &str, timeout: Duration) -> Result<RaftServiceClient<Channel>, NetworkError> {
    let endpoint = Endpoint::from_shared(format!("http://{address}"))
        .map_err(|e| NetworkError::ConnectionError(e.to_string()))?;

    let channel = endpoint
        .connect_timeout(timeout)
        .timeout(timeout)
        .connect_lazy();

    Ok(RaftServiceClient::new(channel))
}

/// [`RpcEndpoint`] over gRPC. Channels are opened lazily and cached per peer;
/// a failed call drops the cached channel so the next call reconnects. The
/// cache lock is never held while a peer is being dialled, so one dead peer
/// cannot delay calls to the others.
pub struct GrpcEndpoint {
    timeout: Duration,
    clients: Mutex<HashMap<String, RaftServiceClient<Channel>>>,
}

impl GrpcEndpoint {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            clients: Mutex::new(HashMap::new()),
        }
    }

    async fn client(&self, address: &str) -> Result<RaftServiceClient<Channel>, NetworkError> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(address) {
            return Ok(client.clone());
        }
        let client = connect(address, self.timeout)?;
        clients.insert(address.to_string(), client.clone());
        Ok(client)
    }

    async fn forget(&self, address: &str) {
        self.clients.lock().await.remove(address);
    }

    async fn checked<T>(&self, address: &str, result: Result<T, NetworkError>) -> Result<T, RaftError> {
        if result.is_err() {
            self.forget(address).await;
        }
        result.map_err(Into::into)
    }
}

#[async_trait]
impl RpcEndpoint for GrpcEndpoint {
    async fn ping(&self, address: &str, request: PingRequest) -> Result<PingResponse, RaftError> {
        let result = async {
            let mut client = self.client(address).await?;
            let response = client
                .ping(Request::new(proto::PingRequest::from(request)))
                .await?
                .into_inner();
            Ok::<_, NetworkError>(PingResponse {
                term: response.term,
            })
        }
        .await;
        self.checked(address, result).await
    }

    async fn poll(&self, address: &str, request: PollRequest) -> Result<PollResponse, RaftError> {
        let result = async {
            let mut client = self.client(address).await?;
            let response = client
                .poll(Request::new(proto::PollRequest::from(request)))
                .await?
                .into_inner();
            Ok::<_, NetworkError>(PollResponse {
                term: response.term,
                vote_granted: response.vote_granted,
            })
        }
        .await;
        self.checked(address, result).await
    }

    async fn sync(&self, address: &str, request: SyncRequest) -> Result<SyncResponse, RaftError> {
        let result = async {
            let mut client = self.client(address).await?;
            let response = client
                .sync(Request::new(proto::SyncRequest::from(request)))
                .await?
                .into_inner();
            Ok::<_, NetworkError>(SyncResponse {
                term: response.term,
                success: response.success,
                last_index: response.last_index,
            })
        }
        .await;
        self.checked(address, result).await
    }
}

/// Submits one command to the node at `address`.
pub async fn submit(
    address: &str,
    command: Vec<u8>,
    timeout: Duration,
) -> Result<SubmitResponse, RaftError> {
    let mut client = connect(address, timeout)?;
    let response = client
        .submit(Request::new(proto::SubmitRequest { command }))
        .await
        .map_err(NetworkError::from)?
        .into_inner();

    Ok(SubmitResponse {
        index: response.index,
        result: response.result,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dead_peer_does_not_block_other_peers() {
        let endpoint = GrpcEndpoint::new(Duration::from_secs(5));

        // TEST-NET-3 addresses are never routed; a dial would hang until timeout.
        let blackholed = tokio::time::timeout(
            Duration::from_millis(100),
            endpoint.client("203.0.113.1:7000"),
        )
        .await
        .expect("obtaining a client must not dial");
        assert!(blackholed.is_ok());

        let healthy = tokio::time::timeout(
            Duration::from_millis(100),
            endpoint.client("127.0.0.1:7001"),
        )
        .await
        .expect("cache lock free");
        assert!(healthy.is_ok());
        assert_eq!(endpoint.clients.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn failed_calls_drop_the_cached_client() {
        let endpoint = GrpcEndpoint::new(Duration::from_millis(200));
        let result = endpoint
            .ping(
                "127.0.0.1:1",
                PingRequest {
                    term: 1,
                    leader: "a".into(),
                },
            )
            .await;
        assert!(result.is_err());
        assert!(endpoint.clients.lock().await.is_empty());
    }
}
