use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use ::log::{debug, info, warn};
use tokio::sync::oneshot;

use super::context::NodeContext;
use super::endpoint::with_timeout;
use super::lock::StateGuard;
use super::node::Event;
use super::quorum::Quorum;
use super::sync::{self, ReplicaOutcome, Replication};
use super::timer::Timer;
use super::{
    LogEntry, LogError, PingRequest, PingResponse, PollRequest, PollResponse, RaftError,
    SubmitRequest, SubmitResponse, SyncRequest,
};

pub(crate) type SubmitReply = oneshot::Sender<Result<SubmitResponse, RaftError>>;

#[derive(Debug, Clone)]
struct Replica {
    next_index: u64,
    match_index: u64,
    commit_sent: u64,
    in_flight: bool,
}

impl Replica {
    fn new(next_index: u64) -> Self {
        Self {
            next_index,
            match_index: 0,
            commit_sent: 0,
            in_flight: false,
        }
    }

    fn is_behind(&self, last_index: u64, commit_index: u64) -> bool {
        self.match_index < last_index || self.commit_sent < commit_index
    }
}

/// A submitted command waiting for a replication quorum.
struct Pending {
    quorum: Quorum,
    reply: SubmitReply,
}

/// Leading role: heartbeats, replication and client submits.
#[derive(Default)]
pub struct Leader {
    heartbeat: Timer,
    replicas: BTreeMap<String, Replica>,
    pending: BTreeMap<u64, Pending>,
}

impl Leader {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn start_up(&mut self, ctx: &mut NodeContext) {
        let address = ctx.address().to_string();
        ctx.set_leader(Some(address));
        info!("{}: leading term {}", ctx.address(), ctx.current_term());

        let next_index = match ctx.log.last_index().await {
            Ok(last_index) => last_index + 1,
            Err(e) => {
                warn!("{}: cannot read log, replicating from the start: {}", ctx.address(), e);
                1
            }
        };
        self.replicas = ctx
            .members
            .iter()
            .map(|member| (member.clone(), Replica::new(next_index)))
            .collect();

        self.beat(ctx).await;
    }

    /// Fails every waiting submit; the entries stay in the log and may still
    /// be committed by a later leader.
    pub fn shut_down(&mut self) {
        self.heartbeat.cancel();
        for (_, mut pending) in std::mem::take(&mut self.pending) {
            pending.quorum.cancel();
            let _ = pending.reply.send(Err(RaftError::NotLeader));
        }
        self.replicas.clear();
    }

    pub fn configure(&mut self, members: &BTreeSet<String>) {
        self.replicas.retain(|member, _| members.contains(member));
        for member in members {
            self.replicas
                .entry(member.clone())
                .or_insert_with(|| Replica::new(1));
        }
    }

    /// Pings every member and pushes entries or commit progress to members
    /// that are behind.
    async fn beat(&mut self, ctx: &mut NodeContext) {
        let request = PingRequest {
            term: ctx.current_term(),
            leader: ctx.address().to_string(),
        };
        let timeout = ctx.config.rpc_timeout();
        for member in ctx.members.iter() {
            let endpoint = Arc::clone(&ctx.endpoint);
            let events = ctx.events.clone();
            let member = member.clone();
            let request = request.clone();
            tokio::spawn(async move {
                let result = with_timeout(timeout, endpoint.ping(&member, request)).await;
                let _ = events.send(Event::PingReply { member, result });
            });
        }

        match ctx.log.last_index().await {
            Ok(last_index) => {
                let behind: Vec<String> = self
                    .replicas
                    .iter()
                    .filter(|(_, r)| r.is_behind(last_index, ctx.commit_index()))
                    .map(|(m, _)| m.clone())
                    .collect();
                for member in behind {
                    self.replicate(ctx, &member);
                }
            }
            Err(e) => warn!("{}: cannot read log for heartbeat: {}", ctx.address(), e),
        }

        self.heartbeat
            .arm(ctx.config.heartbeat(), &ctx.events, Event::Timeout);
    }

    pub async fn on_timeout(&mut self, ctx: &mut NodeContext, token: u64) {
        if self.heartbeat.fired(token) {
            self.beat(ctx).await;
        }
    }

    fn replicate(&mut self, ctx: &NodeContext, member: &str) {
        let Some(replica) = self.replicas.get_mut(member) else {
            return;
        };
        if replica.in_flight {
            return;
        }
        replica.in_flight = true;

        let replication = Replication {
            member: member.to_string(),
            term: ctx.current_term(),
            leader: ctx.address().to_string(),
            commit_index: ctx.commit_index(),
            next_index: replica.next_index,
            rpc_timeout: ctx.config.rpc_timeout(),
        };
        let log = Arc::clone(&ctx.log);
        let endpoint = Arc::clone(&ctx.endpoint);
        let events = ctx.events.clone();
        tokio::spawn(async move {
            let term = replication.term;
            let member = replication.member.clone();
            let outcome = sync::replicate(log, endpoint, replication).await;
            let _ = events.send(Event::Replicated {
                term,
                member,
                outcome,
            });
        });
    }

    pub async fn on_replicated(
        &mut self,
        ctx: &mut NodeContext,
        term: u64,
        member: &str,
        outcome: ReplicaOutcome,
    ) {
        if term != ctx.current_term() {
            return;
        }
        let Some(replica) = self.replicas.get_mut(member) else {
            return;
        };
        replica.in_flight = false;

        match outcome {
            ReplicaOutcome::Matched {
                match_index,
                commit_index,
            } => {
                replica.match_index = replica.match_index.max(match_index);
                replica.next_index = replica.match_index + 1;
                replica.commit_sent = replica.commit_sent.max(commit_index);
                let acked = replica.match_index;

                let mut committed = 0;
                for (index, pending) in self.pending.range_mut(..=acked) {
                    if pending.quorum.succeed(member) == Some(true) {
                        committed = committed.max(*index);
                    }
                }
                if committed > 0 {
                    self.commit(ctx, committed).await;
                }

                if let Ok(last_index) = ctx.log.last_index().await {
                    let behind = self
                        .replicas
                        .get(member)
                        .is_some_and(|r| r.is_behind(last_index, ctx.commit_index()));
                    if behind {
                        self.replicate(ctx, member);
                    }
                }
            }
            ReplicaOutcome::Failed(e) => {
                debug!("{}: replication to {} failed: {}", ctx.address(), member, e);
                let matched = replica.match_index;
                let lost: Vec<u64> = self
                    .pending
                    .range_mut(matched + 1..)
                    .filter_map(|(index, pending)| {
                        (pending.quorum.fail(member) == Some(false)).then_some(*index)
                    })
                    .collect();
                for index in lost {
                    if let Some(pending) = self.pending.remove(&index) {
                        warn!("{}: entry {} cannot reach a quorum", ctx.address(), index);
                        let _ = pending.reply.send(Err(RaftError::QuorumUnreachable));
                    }
                }
            }
            // Stepping down is decided by the node before this is reached.
            ReplicaOutcome::HigherTerm(_) => {}
        }
    }

    /// Commits through `index`, applies, and answers the submits now decided.
    async fn commit(&mut self, ctx: &mut NodeContext, index: u64) {
        let applied = match ctx.commit_to(index).await {
            Ok(applied) => applied,
            Err(e) => {
                warn!("{}: cannot apply committed entries: {}", ctx.address(), e);
                return;
            }
        };
        info!("{}: committed through index {}", ctx.address(), ctx.commit_index());

        for (index, result) in applied {
            if let Some(mut pending) = self.pending.remove(&index) {
                pending.quorum.cancel();
                let _ = pending
                    .reply
                    .send(result.map(|result| SubmitResponse { index, result }));
            }
        }

        // Push the new commit index out without waiting for the next beat.
        let members: Vec<String> = self.replicas.keys().cloned().collect();
        for member in members {
            self.replicate(ctx, &member);
        }
    }

    /// Queues the command on the state lock. The guard comes back to the node
    /// as [`Event::SubmitLocked`] so leadership is checked again before the
    /// log is touched.
    pub fn submit(&mut self, ctx: &NodeContext, request: SubmitRequest, reply: SubmitReply) {
        let term = ctx.current_term();
        let lock = ctx.lock.clone();
        let events = ctx.events.clone();
        tokio::spawn(async move {
            let guard = lock.acquire().await;
            let _ = events.send(Event::SubmitLocked {
                term,
                request,
                guard,
                reply,
            });
        });
    }

    /// Appends under the guard if we still lead the term the command was
    /// submitted in; replication starts once [`Event::Appended`] arrives.
    pub fn on_submit_locked(
        &mut self,
        ctx: &NodeContext,
        term: u64,
        request: SubmitRequest,
        guard: StateGuard,
        reply: SubmitReply,
    ) {
        if term != ctx.current_term() {
            drop(guard);
            let _ = reply.send(Err(RaftError::NotLeader));
            return;
        }

        let entry = LogEntry::new(term, request.command);
        let log = Arc::clone(&ctx.log);
        let events = ctx.events.clone();
        tokio::spawn(async move {
            let result = log.append(entry).await;
            drop(guard);
            let _ = events.send(Event::Appended {
                term,
                result,
                reply,
            });
        });
    }

    pub async fn on_appended(
        &mut self,
        ctx: &mut NodeContext,
        term: u64,
        result: Result<u64, LogError>,
        reply: SubmitReply,
    ) {
        if term != ctx.current_term() {
            let _ = reply.send(Err(RaftError::NotLeader));
            return;
        }
        let index = match result {
            Ok(index) => index,
            Err(e) => {
                warn!("{}: failed to append submitted command: {}", ctx.address(), e);
                let _ = reply.send(Err(RaftError::Log(e)));
                return;
            }
        };
        debug!("{}: appended entry {} in term {}", ctx.address(), index, term);

        let mut quorum = Quorum::new(ctx.members.iter().cloned());
        let mut contact = Vec::new();
        let outcome = quorum.start(|member| contact.push(member.to_string()));
        self.pending.insert(index, Pending { quorum, reply });

        match outcome {
            Some(true) => self.commit(ctx, index).await,
            _ => {
                for member in contact {
                    self.replicate(ctx, &member);
                }
            }
        }
    }

    pub fn ping(&mut self, ctx: &mut NodeContext, _request: &PingRequest) -> PingResponse {
        PingResponse {
            term: ctx.current_term(),
        }
    }

    pub fn poll(&mut self, ctx: &mut NodeContext, _request: &PollRequest) -> PollResponse {
        PollResponse {
            term: ctx.current_term(),
            vote_granted: false,
        }
    }

    /// A sync at our own term or lower cannot come from a legitimate leader.
    pub fn admit_sync(&mut self, ctx: &mut NodeContext, request: &SyncRequest) -> bool {
        debug!(
            "{}: rejecting sync from {} at term {}",
            ctx.address(),
            request.leader,
            request.term
        );
        false
    }
}
