use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use ::log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot, watch};

use super::context::NodeContext;
use super::leader::SubmitReply;
use super::lock::StateGuard;
use super::role::Role;
use super::sync::{self, ReplicaOutcome, SyncOutcome};
use super::{
    LogError, NodeRole, NodeState, PingRequest, PingResponse, PollRequest, PollResponse,
    RaftConfig, RaftError, RaftLog, RpcEndpoint, StateLock, StateMachine, SubmitRequest,
    SubmitResponse, SyncRequest, SyncResponse,
};

pub(crate) type EventSender = mpsc::UnboundedSender<Event>;
type SyncReply = oneshot::Sender<Result<SyncResponse, RaftError>>;

/// Everything the node reacts to: inbound RPCs from the handle, plus
/// completions reported back by timers and spawned tasks.
pub(crate) enum Event {
    Ping {
        request: PingRequest,
        reply: oneshot::Sender<PingResponse>,
    },
    Poll {
        request: PollRequest,
        reply: oneshot::Sender<PollResponse>,
    },
    Sync {
        request: SyncRequest,
        reply: SyncReply,
    },
    Submit {
        request: SubmitRequest,
        reply: SubmitReply,
    },
    SubmitLocked {
        term: u64,
        request: SubmitRequest,
        guard: StateGuard,
        reply: SubmitReply,
    },
    Configure {
        members: BTreeSet<String>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
    Timeout(u64),
    SyncLocked {
        request: SyncRequest,
        guard: StateGuard,
        reply: SyncReply,
    },
    SyncApplied {
        request: SyncRequest,
        outcome: Result<SyncOutcome, LogError>,
        guard: StateGuard,
        reply: SyncReply,
    },
    PollReply {
        round: u64,
        member: String,
        result: Result<PollResponse, RaftError>,
    },
    PingReply {
        member: String,
        result: Result<PingResponse, RaftError>,
    },
    Replicated {
        term: u64,
        member: String,
        outcome: ReplicaOutcome,
    },
    Appended {
        term: u64,
        result: Result<u64, LogError>,
        reply: SubmitReply,
    },
}

/// One consensus participant.
///
/// The node is an actor: a single task owns the [`NodeContext`] and the
/// active [`Role`] and handles one [`Event`] at a time. RPC fan-out, lock
/// waits and log writes run in spawned tasks and come back as events, so a
/// handler never blocks the others. The node runs until
/// [`RaftHandle::shutdown`] is called.
pub struct RaftNode {
    ctx: NodeContext,
    role: Role,
}

impl RaftNode {
    /// Starts the node as a Follower and returns a handle to it. Must be
    /// called from within a tokio runtime.
    pub fn spawn(
        config: RaftConfig,
        log: Arc<dyn RaftLog>,
        endpoint: Arc<dyn RpcEndpoint>,
        machine: Box<dyn StateMachine>,
    ) -> Result<RaftHandle, RaftError> {
        config.validate()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = NodeContext::new(config, log, endpoint, machine, tx.clone());
        let handle = RaftHandle {
            address: ctx.address().to_string(),
            events: tx,
            state: ctx.subscribe(),
            lock: ctx.lock.clone(),
        };

        let node = RaftNode {
            ctx,
            role: Role::new(NodeRole::Follower),
        };
        tokio::spawn(node.run(rx));

        Ok(handle)
    }

    async fn run(mut self, mut events: mpsc::UnboundedReceiver<Event>) {
        info!(
            "{}: starting with {} member(s)",
            self.ctx.address(),
            self.ctx.members.len()
        );
        if let Some(next) = self.role.start_up(&mut self.ctx).await {
            self.transition(next).await;
        }
        self.ctx.publish(self.role.kind());

        while let Some(event) = events.recv().await {
            if let Event::Shutdown { done } = event {
                self.role.shut_down();
                info!("{}: stopped in term {}", self.ctx.address(), self.ctx.current_term());
                let _ = done.send(());
                break;
            }
            self.handle(event).await;
            self.ctx.publish(self.role.kind());
        }
    }

    async fn handle(&mut self, event: Event) {
        match event {
            Event::Ping { request, reply } => {
                self.observe_term(request.term, Some(&request.leader)).await;
                let response = self.role.ping(&mut self.ctx, &request);
                let _ = reply.send(response);
            }
            Event::Poll { request, reply } => {
                self.observe_term(request.term, None).await;
                let response = self.role.poll(&mut self.ctx, &request).await;
                let _ = reply.send(response);
            }
            Event::Sync { request, reply } => {
                let lock = self.ctx.lock.clone();
                let events = self.ctx.events.clone();
                tokio::spawn(async move {
                    let guard = lock.acquire().await;
                    let _ = events.send(Event::SyncLocked {
                        request,
                        guard,
                        reply,
                    });
                });
            }
            Event::SyncLocked {
                request,
                guard,
                reply,
            } => self.on_sync_locked(request, guard, reply).await,
            Event::SyncApplied {
                request,
                outcome,
                guard,
                reply,
            } => self.on_sync_applied(request, outcome, guard, reply).await,
            Event::Submit { request, reply } => self.role.submit(&self.ctx, request, reply),
            Event::SubmitLocked {
                term,
                request,
                guard,
                reply,
            } => match &mut self.role {
                Role::Leader(l) => l.on_submit_locked(&self.ctx, term, request, guard, reply),
                _ => {
                    drop(guard);
                    let _ = reply.send(Err(RaftError::NotLeader));
                }
            },
            Event::Configure { members } => {
                self.ctx.set_members(members);
                let members = self.ctx.members.clone();
                self.role.configure(&members);
                info!("{}: members are now {:?}", self.ctx.address(), members);
            }
            Event::Timeout(token) => {
                if let Some(next) = self.role.on_timeout(&mut self.ctx, token).await {
                    self.transition(next).await;
                }
            }
            Event::PollReply {
                round,
                member,
                result,
            } => {
                if let Ok(response) = &result {
                    if response.term > self.ctx.current_term() {
                        self.observe_term(response.term, None).await;
                        return;
                    }
                }
                let next = match &mut self.role {
                    Role::Candidate(c) => c.on_poll_reply(&self.ctx, round, &member, result),
                    _ => None,
                };
                if let Some(next) = next {
                    self.transition(next).await;
                }
            }
            Event::PingReply { member, result } => match result {
                Ok(response) => self.observe_term(response.term, None).await,
                Err(e) => debug!("{}: ping to {} failed: {}", self.ctx.address(), member, e),
            },
            Event::Replicated {
                term,
                member,
                outcome,
            } => {
                if let ReplicaOutcome::HigherTerm(higher) = outcome {
                    self.observe_term(higher, None).await;
                } else if let Role::Leader(l) = &mut self.role {
                    l.on_replicated(&mut self.ctx, term, &member, outcome).await;
                }
            }
            Event::Appended {
                term,
                result,
                reply,
            } => match &mut self.role {
                Role::Leader(l) => l.on_appended(&mut self.ctx, term, result, reply).await,
                _ => {
                    let _ = reply.send(Err(RaftError::NotLeader));
                }
            },
            Event::Shutdown { done } => {
                let _ = done.send(());
            }
        }
    }

    /// Applies the term dominance rule: a newer term is adopted, along with
    /// its leader when known, and any non-Follower steps down.
    async fn observe_term(&mut self, term: u64, leader: Option<&str>) {
        if !self.ctx.advance_term(term) {
            return;
        }
        self.ctx.set_leader(leader.map(str::to_string));
        if self.role.kind() != NodeRole::Follower {
            self.transition(NodeRole::Follower).await;
        }
    }

    async fn transition(&mut self, mut next: NodeRole) {
        loop {
            info!(
                "{}: {} -> {} in term {}",
                self.ctx.address(),
                self.role.kind(),
                next,
                self.ctx.current_term()
            );
            self.role.shut_down();
            self.role = Role::new(next);
            match self.role.start_up(&mut self.ctx).await {
                Some(after) => next = after,
                None => break,
            }
        }
    }

    async fn on_sync_locked(&mut self, request: SyncRequest, guard: StateGuard, reply: SyncReply) {
        self.observe_term(request.term, Some(&request.leader)).await;

        if !self.role.admit_sync(&mut self.ctx, &request) {
            let last_index = self.ctx.log.last_index().await;
            drop(guard);
            let _ = reply.send(last_index.map_err(Into::into).map(|last_index| SyncResponse {
                term: self.ctx.current_term(),
                success: false,
                last_index,
            }));
            return;
        }

        if self.role.kind() == NodeRole::Candidate {
            self.transition(NodeRole::Follower).await;
        }

        let log = Arc::clone(&self.ctx.log);
        let events = self.ctx.events.clone();
        tokio::spawn(async move {
            let outcome = sync::append_entries(log.as_ref(), &request).await;
            let _ = events.send(Event::SyncApplied {
                request,
                outcome,
                guard,
                reply,
            });
        });
    }

    async fn on_sync_applied(
        &mut self,
        request: SyncRequest,
        outcome: Result<SyncOutcome, LogError>,
        guard: StateGuard,
        reply: SyncReply,
    ) {
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(
                    "{}: sync from {} failed on the local log: {}",
                    self.ctx.address(),
                    request.leader,
                    e
                );
                drop(guard);
                let _ = reply.send(Err(e.into()));
                return;
            }
        };

        if outcome.success && request.term == self.ctx.current_term() {
            let commit = request.commit_index.min(outcome.last_index);
            if let Err(e) = self.ctx.commit_to(commit).await {
                warn!("{}: cannot apply committed entries: {}", self.ctx.address(), e);
            }
        }
        drop(guard);

        let _ = reply.send(Ok(SyncResponse {
            term: self.ctx.current_term(),
            success: outcome.success,
            last_index: outcome.last_index,
        }));
    }
}

/// Cloneable client side of a running [`RaftNode`].
#[derive(Clone)]
pub struct RaftHandle {
    address: String,
    events: EventSender,
    state: watch::Receiver<NodeState>,
    lock: StateLock,
}

impl RaftHandle {
    pub fn address(&self) -> &str {
        &self.address
    }

    pub async fn ping(&self, request: PingRequest) -> Result<PingResponse, RaftError> {
        let (reply, rx) = oneshot::channel();
        self.send(Event::Ping { request, reply })?;
        rx.await.map_err(|_| RaftError::NotRunning)
    }

    pub async fn poll(&self, request: PollRequest) -> Result<PollResponse, RaftError> {
        let (reply, rx) = oneshot::channel();
        self.send(Event::Poll { request, reply })?;
        rx.await.map_err(|_| RaftError::NotRunning)
    }

    pub async fn sync(&self, request: SyncRequest) -> Result<SyncResponse, RaftError> {
        let (reply, rx) = oneshot::channel();
        self.send(Event::Sync { request, reply })?;
        rx.await.map_err(|_| RaftError::NotRunning)?
    }

    /// Submits a command; resolves once it is committed and applied, with
    /// the state machine's result.
    pub async fn submit(&self, command: impl Into<Vec<u8>>) -> Result<SubmitResponse, RaftError> {
        let (reply, rx) = oneshot::channel();
        let request = SubmitRequest {
            command: command.into(),
        };
        self.send(Event::Submit { request, reply })?;
        rx.await.map_err(|_| RaftError::NotRunning)?
    }

    pub fn configure<I, S>(&self, members: I) -> Result<(), RaftError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let members = members.into_iter().map(Into::into).collect();
        self.send(Event::Configure { members })
    }

    pub fn status(&self) -> NodeState {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<NodeState> {
        self.state.clone()
    }

    /// Waits until the published state satisfies `predicate`.
    pub async fn wait_for<F>(&self, timeout: Duration, predicate: F) -> Result<NodeState, RaftError>
    where
        F: FnMut(&NodeState) -> bool,
    {
        let mut state = self.state.clone();
        let found = match tokio::time::timeout(timeout, state.wait_for(predicate)).await {
            Ok(Ok(found)) => Ok(found.clone()),
            Ok(Err(_)) => Err(RaftError::NotRunning),
            Err(_) => Err(RaftError::Timeout),
        };
        found
    }

    /// The node's state lock, exposed for inspection.
    pub fn lock(&self) -> &StateLock {
        &self.lock
    }

    pub fn is_running(&self) -> bool {
        !self.events.is_closed()
    }

    /// Stops the node after it cancels its timers and in-flight elections.
    pub async fn shutdown(&self) -> Result<(), RaftError> {
        let (done, rx) = oneshot::channel();
        self.send(Event::Shutdown { done })?;
        rx.await.map_err(|_| RaftError::NotRunning)
    }

    fn send(&self, event: Event) -> Result<(), RaftError> {
        self.events.send(event).map_err(|_| RaftError::NotRunning)
    }
}

impl std::fmt::Debug for RaftHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftHandle")
            .field("address", &self.address)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::{KvCommand, KvMachine, MemLog};
    use async_trait::async_trait;

    struct Unreachable;

    #[async_trait]
    impl RpcEndpoint for Unreachable {
        async fn ping(&self, _: &str, _: PingRequest) -> Result<PingResponse, RaftError> {
            Err(RaftError::NetworkError("unreachable".into()))
        }

        async fn poll(&self, _: &str, _: PollRequest) -> Result<PollResponse, RaftError> {
            Err(RaftError::NetworkError("unreachable".into()))
        }

        async fn sync(&self, _: &str, _: SyncRequest) -> Result<SyncResponse, RaftError> {
            Err(RaftError::NetworkError("unreachable".into()))
        }
    }

    fn spawn(config: RaftConfig) -> RaftHandle {
        RaftNode::spawn(
            config,
            Arc::new(MemLog::new()),
            Arc::new(Unreachable),
            Box::new(KvMachine::new()),
        )
        .expect("spawn node")
    }

    #[tokio::test(start_paused = true)]
    async fn lone_node_elects_itself_and_commits() {
        let node = spawn(RaftConfig::new("solo"));

        let state = node
            .wait_for(Duration::from_secs(5), |s| s.is_leader())
            .await
            .expect("leader");
        assert_eq!(state.current_term, 1);
        assert_eq!(state.voted_for.as_deref(), Some("solo"));

        let put = KvCommand::Put {
            key: "a".into(),
            value: "1".into(),
        };
        let response = node.submit(put.encode()).await.expect("submit");
        assert_eq!(response.index, 1);
        node.wait_for(Duration::from_secs(1), |s| s.last_applied == 1)
            .await
            .expect("applied");

        node.shutdown().await.expect("shutdown");
        assert!(node.submit(b"late".to_vec()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn isolated_member_never_leads() {
        let node = spawn(RaftConfig::new("a").with_members(["b", "c"]));

        tokio::time::sleep(Duration::from_secs(3)).await;
        let state = node.status();
        assert_ne!(state.role, NodeRole::Leader);
        assert!(state.current_term >= 1);

        let err = node.submit(b"x".to_vec()).await.unwrap_err();
        assert!(matches!(err, RaftError::NotLeader));
        node.shutdown().await.expect("shutdown");
    }

    #[tokio::test(start_paused = true)]
    async fn higher_term_ping_installs_leader() {
        let node = spawn(RaftConfig::new("a").with_members(["b", "c"]));

        let response = node
            .ping(PingRequest {
                term: 7,
                leader: "b".into(),
            })
            .await
            .expect("ping");
        assert_eq!(response.term, 7);

        let state = node.status();
        assert_eq!(state.role, NodeRole::Follower);
        assert_eq!(state.current_leader.as_deref(), Some("b"));
        assert_eq!(state.voted_for, None);
        node.shutdown().await.expect("shutdown");
    }

    #[test]
    fn node_state_can_cross_tasks() {
        fn assert_send_sync<T: Send + Sync + ?Sized>() {}
        assert_send_sync::<dyn StateMachine>();
        assert_send_sync::<NodeContext>();
        assert_send_sync::<RaftHandle>();

        fn assert_send<T: Send>(_: &T) {}
        let (tx, rx) = mpsc::unbounded_channel();
        let node = RaftNode {
            ctx: NodeContext::new(
                RaftConfig::new("a"),
                Arc::new(MemLog::new()),
                Arc::new(Unreachable),
                Box::new(KvMachine::new()),
                tx,
            ),
            role: Role::new(NodeRole::Follower),
        };
        assert_send(&node.run(rx));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_reports_timeout_and_stopped_nodes() {
        let node = spawn(RaftConfig::new("a").with_members(["b", "c"]));

        let err = node
            .wait_for(Duration::from_millis(50), |s| s.current_term == 99)
            .await
            .unwrap_err();
        assert!(matches!(err, RaftError::Timeout));

        node.shutdown().await.expect("shutdown");
        let err = node
            .wait_for(Duration::from_secs(1), |s| s.current_term == 99)
            .await
            .unwrap_err();
        assert!(matches!(err, RaftError::NotRunning));
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_invalid_config() {
        let result = RaftNode::spawn(
            RaftConfig::new("a").with_members(["b"]).with_timing(300, 150, 50),
            Arc::new(MemLog::new()),
            Arc::new(Unreachable),
            Box::new(KvMachine::new()),
        );
        assert!(matches!(result, Err(RaftError::InvalidConfig(_))));
    }
}
