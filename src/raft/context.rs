use std::collections::BTreeSet;
use std::sync::Arc;

use ::log::{debug, error, info};
use tokio::sync::watch;

use super::node::EventSender;
use super::{NodeRole, NodeState, RaftConfig, RaftError, RaftLog, RpcEndpoint, StateLock, StateMachine};

/// Node state shared by whichever role is active.
///
/// Owned by the node's actor task, so it is only ever touched from one
/// execution context. `current_term` never decreases and advancing it clears
/// `voted_for`.
pub struct NodeContext {
    pub(crate) config: RaftConfig,
    pub(crate) members: BTreeSet<String>,
    pub(crate) log: Arc<dyn RaftLog>,
    pub(crate) endpoint: Arc<dyn RpcEndpoint>,
    pub(crate) lock: StateLock,
    pub(crate) events: EventSender,
    machine: Box<dyn StateMachine>,
    current_term: u64,
    voted_for: Option<String>,
    current_leader: Option<String>,
    commit_index: u64,
    last_applied: u64,
    rounds: u64,
    status: watch::Sender<NodeState>,
}

impl NodeContext {
    pub(crate) fn new(
        config: RaftConfig,
        log: Arc<dyn RaftLog>,
        endpoint: Arc<dyn RpcEndpoint>,
        machine: Box<dyn StateMachine>,
        events: EventSender,
    ) -> Self {
        let members = config.members.clone();
        let (status, _) = watch::channel(NodeState {
            address: config.address.clone(),
            role: NodeRole::Follower,
            current_term: 0,
            voted_for: None,
            current_leader: None,
            commit_index: 0,
            last_applied: 0,
        });

        Self {
            config,
            members,
            log,
            endpoint,
            lock: StateLock::new(),
            events,
            machine,
            current_term: 0,
            voted_for: None,
            current_leader: None,
            commit_index: 0,
            last_applied: 0,
            rounds: 0,
            status,
        }
    }

    pub fn address(&self) -> &str {
        &self.config.address
    }

    pub fn current_term(&self) -> u64 {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<&str> {
        self.voted_for.as_deref()
    }

    pub fn current_leader(&self) -> Option<&str> {
        self.current_leader.as_deref()
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    /// Moves to `term` if it is newer. Returns whether the term advanced.
    pub(crate) fn advance_term(&mut self, term: u64) -> bool {
        if term <= self.current_term {
            return false;
        }
        debug!("{}: term {} -> {}", self.address(), self.current_term, term);
        self.current_term = term;
        self.voted_for = None;
        true
    }

    /// Starts a new election epoch and votes for ourselves.
    pub(crate) fn begin_term(&mut self) -> u64 {
        let term = self.current_term + 1;
        self.advance_term(term);
        self.voted_for = Some(self.config.address.clone());
        self.current_leader = None;
        term
    }

    /// Identifies one fan-out of RPCs so late replies can be told apart.
    pub(crate) fn next_round(&mut self) -> u64 {
        self.rounds += 1;
        self.rounds
    }

    pub(crate) fn vote_for(&mut self, candidate: &str) {
        self.voted_for = Some(candidate.to_string());
    }

    pub(crate) fn set_leader(&mut self, leader: Option<String>) {
        if self.current_leader != leader {
            if let Some(leader) = &leader {
                info!("{}: leader for term {} is {}", self.address(), self.current_term, leader);
            }
            self.current_leader = leader;
        }
    }

    pub(crate) fn set_members(&mut self, members: BTreeSet<String>) {
        let address = self.config.address.clone();
        self.members = members.into_iter().filter(|m| *m != address).collect();
    }

    /// Raises the commit index and applies newly committed entries in order.
    ///
    /// Returns the state machine results keyed by index so a leader can answer
    /// the submits waiting on them.
    pub(crate) async fn commit_to(
        &mut self,
        index: u64,
    ) -> Result<Vec<(u64, Result<Vec<u8>, RaftError>)>, RaftError> {
        if index > self.commit_index {
            let last_index = self.log.last_index().await?;
            self.commit_index = index.min(last_index);
        }

        let mut applied = Vec::new();
        if self.last_applied >= self.commit_index {
            return Ok(applied);
        }

        let entries = self
            .log
            .entries(self.last_applied + 1, Some(self.commit_index + 1))
            .await?;
        for entry in entries {
            self.last_applied += 1;
            let index = self.last_applied;
            debug!("{}: applying log entry {} (term {})", self.address(), index, entry.term);
            let result = self.machine.apply(index, &entry.command);
            if let Err(e) = &result {
                error!("{}: failed to apply entry {}: {}", self.address(), index, e);
            }
            applied.push((index, result));
        }

        Ok(applied)
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<NodeState> {
        self.status.subscribe()
    }

    pub(crate) fn snapshot(&self, role: NodeRole) -> NodeState {
        NodeState {
            address: self.config.address.clone(),
            role,
            current_term: self.current_term,
            voted_for: self.voted_for.clone(),
            current_leader: self.current_leader.clone(),
            commit_index: self.commit_index,
            last_applied: self.last_applied,
        }
    }

    pub(crate) fn publish(&self, role: NodeRole) {
        let state = self.snapshot(role);
        self.status.send_if_modified(|current| {
            if *current != state {
                *current = state;
                true
            } else {
                false
            }
        });
    }
}
