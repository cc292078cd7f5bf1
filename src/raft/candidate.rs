use std::sync::Arc;

use ::log::{debug, info, warn};

use super::context::NodeContext;
use super::endpoint::with_timeout;
use super::node::Event;
use super::quorum::Quorum;
use super::timer::Timer;
use super::{NodeRole, PingRequest, PingResponse, PollRequest, PollResponse, RaftError, SyncRequest};

/// Campaigning role.
///
/// Holds at most one live election round; a round is cancelled when the
/// election times out (and a new one is polled in the same term) or when the
/// role shuts down. Replies from a round that is no longer current are
/// dropped by their round number.
#[derive(Debug, Default)]
pub struct Candidate {
    timer: Timer,
    election: Option<(u64, Quorum)>,
}

impl Candidate {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn start_up(&mut self, ctx: &mut NodeContext) -> Option<NodeRole> {
        let term = ctx.begin_term();
        info!("{}: starting election for term {}", ctx.address(), term);
        self.reset_timer(ctx);
        self.poll_members(ctx).await
    }

    pub fn shut_down(&mut self) {
        self.timer.cancel();
        if let Some((_, mut quorum)) = self.election.take() {
            quorum.cancel();
        }
    }

    fn reset_timer(&mut self, ctx: &NodeContext) {
        self.timer
            .arm(ctx.config.election_timeout(), &ctx.events, Event::Timeout);
    }

    /// Sends a poll to every member. Our own vote is already counted.
    async fn poll_members(&mut self, ctx: &mut NodeContext) -> Option<NodeRole> {
        if self.election.is_some() {
            return None;
        }

        let last = async {
            let index = ctx.log.last_index().await?;
            let term = ctx.log.last_term().await?;
            Ok::<_, RaftError>((index, term))
        };
        let (last_log_index, last_log_term) = match last.await {
            Ok(last) => last,
            Err(e) => {
                // Retried when the election timer fires again.
                warn!("{}: cannot read log to start election: {}", ctx.address(), e);
                return None;
            }
        };

        let round = ctx.next_round();
        let request = PollRequest {
            term: ctx.current_term(),
            candidate: ctx.address().to_string(),
            last_log_index,
            last_log_term,
        };
        let timeout = ctx.config.rpc_timeout();

        let mut quorum = Quorum::new(ctx.members.iter().cloned());
        let outcome = quorum.start(|member| {
            let endpoint = Arc::clone(&ctx.endpoint);
            let events = ctx.events.clone();
            let member = member.to_string();
            let request = request.clone();
            tokio::spawn(async move {
                let result = with_timeout(timeout, endpoint.poll(&member, request)).await;
                let _ = events.send(Event::PollReply {
                    round,
                    member,
                    result,
                });
            });
        });
        self.election = Some((round, quorum));

        outcome.map(|elected| self.conclude(ctx, elected))
    }

    pub fn on_poll_reply(
        &mut self,
        ctx: &NodeContext,
        round: u64,
        member: &str,
        result: Result<PollResponse, RaftError>,
    ) -> Option<NodeRole> {
        let (current, quorum) = self.election.as_mut()?;
        if *current != round || quorum.is_terminal() {
            return None;
        }

        let outcome = match result {
            Ok(response) if response.vote_granted => {
                debug!("{}: vote granted by {}", ctx.address(), member);
                quorum.succeed(member)
            }
            Ok(_) => quorum.fail(member),
            Err(e) => {
                debug!("{}: poll to {} failed: {}", ctx.address(), member, e);
                quorum.fail(member)
            }
        };

        outcome.map(|elected| self.conclude(ctx, elected))
    }

    fn conclude(&mut self, ctx: &NodeContext, elected: bool) -> NodeRole {
        self.election = None;
        if elected {
            info!("{}: won election for term {}", ctx.address(), ctx.current_term());
            NodeRole::Leader
        } else {
            info!("{}: lost election for term {}", ctx.address(), ctx.current_term());
            NodeRole::Follower
        }
    }

    pub async fn on_timeout(&mut self, ctx: &mut NodeContext, token: u64) -> Option<NodeRole> {
        if !self.timer.fired(token) {
            return None;
        }
        info!("{}: election timed out in term {}", ctx.address(), ctx.current_term());
        if let Some((_, mut quorum)) = self.election.take() {
            quorum.cancel();
        }
        self.reset_timer(ctx);
        self.poll_members(ctx).await
    }

    /// A ping at our own term or lower does not stop the campaign.
    pub fn ping(&mut self, ctx: &mut NodeContext, _request: &PingRequest) -> PingResponse {
        PingResponse {
            term: ctx.current_term(),
        }
    }

    /// Only our own candidacy gets our vote.
    pub fn poll(&mut self, ctx: &mut NodeContext, request: &PollRequest) -> PollResponse {
        let vote_granted = request.candidate == ctx.address();
        if vote_granted {
            let address = ctx.address().to_string();
            ctx.vote_for(&address);
        }
        PollResponse {
            term: ctx.current_term(),
            vote_granted,
        }
    }

    /// A sync at our own term comes from that term's leader. The node steps
    /// down once this returns true.
    pub fn admit_sync(&mut self, ctx: &mut NodeContext, request: &SyncRequest) -> bool {
        if request.term < ctx.current_term() {
            return false;
        }
        ctx.set_leader(Some(request.leader.clone()));
        true
    }
}
