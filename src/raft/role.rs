use std::collections::BTreeSet;

use super::candidate::Candidate;
use super::context::NodeContext;
use super::follower::Follower;
use super::leader::{Leader, SubmitReply};
use super::{
    NodeRole, PingRequest, PingResponse, PollRequest, PollResponse, RaftError, SubmitRequest,
    SyncRequest,
};

/// The active role. Exactly one exists per node; a transition shuts the old
/// one down before the new one starts up.
pub enum Role {
    Follower(Follower),
    Candidate(Candidate),
    Leader(Leader),
}

impl Role {
    pub fn new(kind: NodeRole) -> Self {
        match kind {
            NodeRole::Follower => Role::Follower(Follower::new()),
            NodeRole::Candidate => Role::Candidate(Candidate::new()),
            NodeRole::Leader => Role::Leader(Leader::new()),
        }
    }

    pub fn kind(&self) -> NodeRole {
        match self {
            Role::Follower(_) => NodeRole::Follower,
            Role::Candidate(_) => NodeRole::Candidate,
            Role::Leader(_) => NodeRole::Leader,
        }
    }

    /// Returns a follow-up transition when the role decides its own fate
    /// while starting (a lone candidate elects itself immediately).
    pub async fn start_up(&mut self, ctx: &mut NodeContext) -> Option<NodeRole> {
        match self {
            Role::Follower(f) => {
                f.start_up(ctx);
                None
            }
            Role::Candidate(c) => c.start_up(ctx).await,
            Role::Leader(l) => {
                l.start_up(ctx).await;
                None
            }
        }
    }

    pub fn shut_down(&mut self) {
        match self {
            Role::Follower(f) => f.shut_down(),
            Role::Candidate(c) => c.shut_down(),
            Role::Leader(l) => l.shut_down(),
        }
    }

    pub fn configure(&mut self, members: &BTreeSet<String>) {
        if let Role::Leader(l) = self {
            l.configure(members);
        }
    }

    pub fn ping(&mut self, ctx: &mut NodeContext, request: &PingRequest) -> PingResponse {
        match self {
            Role::Follower(f) => f.ping(ctx, request),
            Role::Candidate(c) => c.ping(ctx, request),
            Role::Leader(l) => l.ping(ctx, request),
        }
    }

    pub async fn poll(&mut self, ctx: &mut NodeContext, request: &PollRequest) -> PollResponse {
        match self {
            Role::Follower(f) => f.poll(ctx, request).await,
            Role::Candidate(c) => c.poll(ctx, request),
            Role::Leader(l) => l.poll(ctx, request),
        }
    }

    pub fn admit_sync(&mut self, ctx: &mut NodeContext, request: &SyncRequest) -> bool {
        match self {
            Role::Follower(f) => f.admit_sync(ctx, request),
            Role::Candidate(c) => c.admit_sync(ctx, request),
            Role::Leader(l) => l.admit_sync(ctx, request),
        }
    }

    pub fn submit(&mut self, ctx: &NodeContext, request: SubmitRequest, reply: SubmitReply) {
        match self {
            Role::Leader(l) => l.submit(ctx, request, reply),
            _ => {
                let _ = reply.send(Err(RaftError::NotLeader));
            }
        }
    }

    pub async fn on_timeout(&mut self, ctx: &mut NodeContext, token: u64) -> Option<NodeRole> {
        match self {
            Role::Follower(f) => f.on_timeout(ctx, token),
            Role::Candidate(c) => c.on_timeout(ctx, token).await,
            Role::Leader(l) => {
                l.on_timeout(ctx, token).await;
                None
            }
        }
    }
}
