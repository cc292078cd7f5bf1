use ::log::{info, warn};

use super::context::NodeContext;
use super::node::Event;
use super::timer::Timer;
use super::{NodeRole, PingRequest, PingResponse, PollRequest, PollResponse, SyncRequest};

/// Passive role: answers the leader and candidates, and starts an election
/// when the leader goes quiet for a whole election timeout.
#[derive(Debug, Default)]
pub struct Follower {
    timer: Timer,
}

impl Follower {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_up(&mut self, ctx: &mut NodeContext) {
        self.reset_timer(ctx);
    }

    pub fn shut_down(&mut self) {
        self.timer.cancel();
    }

    fn reset_timer(&mut self, ctx: &NodeContext) {
        self.timer
            .arm(ctx.config.election_timeout(), &ctx.events, Event::Timeout);
    }

    pub fn ping(&mut self, ctx: &mut NodeContext, request: &PingRequest) -> PingResponse {
        if request.term >= ctx.current_term() {
            ctx.set_leader(Some(request.leader.clone()));
            self.reset_timer(ctx);
        }
        PingResponse {
            term: ctx.current_term(),
        }
    }

    pub async fn poll(&mut self, ctx: &mut NodeContext, request: &PollRequest) -> PollResponse {
        let vote_granted = if request.term < ctx.current_term() {
            false
        } else if ctx
            .voted_for()
            .is_some_and(|voted| voted != request.candidate)
        {
            false
        } else {
            log_is_current(ctx, request).await
        };

        if vote_granted {
            info!(
                "{}: voting for {} in term {}",
                ctx.address(),
                request.candidate,
                ctx.current_term()
            );
            ctx.vote_for(&request.candidate);
            self.reset_timer(ctx);
        }

        PollResponse {
            term: ctx.current_term(),
            vote_granted,
        }
    }

    /// Decides whether a sync that now holds the state lock may touch the log.
    pub fn admit_sync(&mut self, ctx: &mut NodeContext, request: &SyncRequest) -> bool {
        if request.term < ctx.current_term() {
            return false;
        }
        ctx.set_leader(Some(request.leader.clone()));
        self.reset_timer(ctx);
        true
    }

    pub fn on_timeout(&mut self, ctx: &NodeContext, token: u64) -> Option<NodeRole> {
        if !self.timer.fired(token) {
            return None;
        }
        info!(
            "{}: no heartbeat from {} in term {}",
            ctx.address(),
            ctx.current_leader().unwrap_or("any leader"),
            ctx.current_term()
        );
        Some(NodeRole::Candidate)
    }
}

/// The candidate's log must be at least as up to date as ours.
async fn log_is_current(ctx: &NodeContext, request: &PollRequest) -> bool {
    let ours = async {
        let index = ctx.log.last_index().await?;
        let term = ctx.log.last_term().await?;
        Ok::<_, super::LogError>((index, term))
    };
    match ours.await {
        Ok((last_index, last_term)) => {
            request.last_log_term > last_term
                || (request.last_log_term == last_term && request.last_log_index >= last_index)
        }
        Err(e) => {
            warn!("{}: cannot read log to answer poll: {}", ctx.address(), e);
            false
        }
    }
}
