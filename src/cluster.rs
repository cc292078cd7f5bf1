//! A whole cluster in one process, wired through a [`LocalFabric`].
//!
//! Used by the `simulate` command and by the integration tests.

use std::sync::Arc;
use std::time::Duration;

use ::log::info;
use tokio::time::Instant;

use crate::raft::{
    KvMachine, LocalFabric, MemLog, NodeRole, NodeState, RaftConfig, RaftError, RaftHandle,
    RaftLog, RaftNode,
};

pub struct LocalCluster {
    fabric: LocalFabric,
    nodes: Vec<RaftHandle>,
}

impl LocalCluster {
    /// Starts `size` nodes named `node-1..=node-size` with in-memory logs and
    /// key/value state machines.
    pub fn start(size: usize, template: &RaftConfig) -> Result<Self, RaftError> {
        Self::start_with(size, template, |_| Arc::new(MemLog::new()))
    }

    /// Like [`LocalCluster::start`], with a caller-chosen log per node.
    pub fn start_with<F>(size: usize, template: &RaftConfig, mut open_log: F) -> Result<Self, RaftError>
    where
        F: FnMut(&str) -> Arc<dyn RaftLog>,
    {
        let addresses: Vec<String> = (1..=size).map(|i| format!("node-{i}")).collect();
        let fabric = LocalFabric::new();
        let mut nodes = Vec::with_capacity(size);

        for address in &addresses {
            let mut config = template.clone();
            config.address = address.clone();
            config.members.clear();
            let config = config.with_members(&addresses);

            let handle = RaftNode::spawn(
                config,
                open_log(address),
                Arc::new(fabric.endpoint(address)),
                Box::new(KvMachine::new()),
            )?;
            fabric.register(handle.clone());
            nodes.push(handle);
        }

        info!("started local cluster of {} node(s)", size);
        Ok(Self { fabric, nodes })
    }

    pub fn fabric(&self) -> &LocalFabric {
        &self.fabric
    }

    pub fn nodes(&self) -> &[RaftHandle] {
        &self.nodes
    }

    pub fn node(&self, address: &str) -> Option<&RaftHandle> {
        self.nodes.iter().find(|n| n.address() == address)
    }

    pub fn states(&self) -> Vec<NodeState> {
        self.nodes.iter().map(RaftHandle::status).collect()
    }

    /// The reachable node that currently believes it leads, if any.
    pub fn leader(&self) -> Option<&RaftHandle> {
        self.nodes.iter().find(|n| {
            n.status().role == NodeRole::Leader && !self.fabric.is_isolated(n.address())
        })
    }

    /// Polls until a reachable leader appears.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<RaftHandle, RaftError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(leader) = self.leader() {
                return Ok(leader.clone());
            }
            if Instant::now() >= deadline {
                return Err(RaftError::Timeout);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Submits through whichever node leads, retrying while leadership moves.
    pub async fn submit(&self, command: Vec<u8>, timeout: Duration) -> Result<u64, RaftError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let leader = self.wait_for_leader(remaining).await?;
            match leader.submit(command.clone()).await {
                Ok(response) => return Ok(response.index),
                Err(RaftError::NotLeader) | Err(RaftError::QuorumUnreachable)
                    if Instant::now() < deadline =>
                {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn shutdown(&self) {
        for node in &self.nodes {
            // Already stopped nodes report NotRunning.
            let _ = node.shutdown().await;
        }
    }
}
