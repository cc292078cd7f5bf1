use std::future::Future;
use std::net::SocketAddr;

use ::log::{debug, info};
use tonic::transport::Server;
use tonic::{Request, Response, Status};

use crate::raft::RaftHandle;

use super::proto;
use super::proto::raft_service_server::{RaftService, RaftServiceServer};
use super::{raft_to_status, NetworkError};

/// Serves a node's RPCs by forwarding them to its handle.
pub struct RaftServer {
    node: RaftHandle,
}

impl RaftServer {
    pub fn new(node: RaftHandle) -> Self {
        Self { node }
    }
}

#[tonic::async_trait]
impl RaftService for RaftServer {
    async fn ping(
        &self,
        request: Request<proto::PingRequest>,
    ) -> Result<Response<proto::PingResponse>, Status> {
        let req = request.into_inner();
        debug!("Received Ping: {:?}", req);

        let response = self.node.ping(req.into()).await.map_err(raft_to_status)?;
        Ok(Response::new(proto::PingResponse {
            term: response.term,
        }))
    }

    async fn poll(
        &self,
        request: Request<proto::PollRequest>,
    ) -> Result<Response<proto::PollResponse>, Status> {
        let req = request.into_inner();
        debug!("Received Poll: {:?}", req);

        let response = self.node.poll(req.into()).await.map_err(raft_to_status)?;
        Ok(Response::new(proto::PollResponse {
            term: response.term,
            vote_granted: response.vote_granted,
        }))
    }

    async fn sync(
        &self,
        request: Request<proto::SyncRequest>,
    ) -> Result<Response<proto::SyncResponse>, Status> {
        let req = request.into_inner();
        debug!(
            "Received Sync from {} with {} entries",
            req.leader,
            req.entries.len()
        );

        let response = self.node.sync(req.into()).await.map_err(raft_to_status)?;
        Ok(Response::new(proto::SyncResponse {
            term: response.term,
            success: response.success,
            last_index: response.last_index,
        }))
    }

    async fn submit(
        &self,
        request: Request<proto::SubmitRequest>,
    ) -> Result<Response<proto::SubmitResponse>, Status> {
        let req = request.into_inner();
        let response = self
            .node
            .submit(req.command)
            .await
            .map_err(raft_to_status)?;
        Ok(Response::new(proto::SubmitResponse {
            index: response.index,
            result: response.result,
        }))
    }
}

/// Runs the gRPC server for `node` until `shutdown` resolves.
pub async fn serve<F>(addr: SocketAddr, node: RaftHandle, shutdown: F) -> Result<(), NetworkError>
where
    F: Future<Output = ()>,
{
    info!("Raft gRPC server listening on {}", addr);
    Server::builder()
        .add_service(RaftServiceServer::new(RaftServer::new(node)))
        .serve_with_shutdown(addr, shutdown)
        .await?;
    Ok(())
}
