use std::sync::Arc;
use std::time::Duration;

use ::log::debug;

use super::endpoint::with_timeout;
use super::{LogError, RaftError, RaftLog, RpcEndpoint, SyncRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOutcome {
    pub success: bool,
    /// On success the index up to which the log now matches the leader,
    /// otherwise the local last index (a back-off hint for the leader).
    pub last_index: u64,
}

/// Applies a sync request to the local log.
///
/// Must run with the state lock held. Term checks are the caller's job: this
/// only checks that the log contains `prev_log_index` at `prev_log_term`,
/// drops the first conflicting entry and everything after it, and appends
/// entries the log does not already hold.
pub async fn append_entries(log: &dyn RaftLog, request: &SyncRequest) -> Result<SyncOutcome, LogError> {
    let last_index = log.last_index().await?;

    let log_ok = if request.prev_log_index == 0 {
        true
    } else if request.prev_log_index > last_index {
        // Our log is too short
        false
    } else {
        log.term_at(request.prev_log_index).await? == Some(request.prev_log_term)
    };

    if !log_ok {
        return Ok(SyncOutcome {
            success: false,
            last_index,
        });
    }

    let start_idx = request.prev_log_index + 1;
    let mut first_new = 0;
    for (i, entry) in request.entries.iter().enumerate() {
        let index = start_idx + i as u64;
        match log.term_at(index).await? {
            Some(term) if term == entry.term => first_new = i + 1,
            Some(term) => {
                debug!("Log conflict at index {index} (local term {term}, leader term {})", entry.term);
                log.truncate(index - 1).await?;
                break;
            }
            None => break,
        }
    }

    for entry in &request.entries[first_new..] {
        log.append(entry.clone()).await?;
    }

    Ok(SyncOutcome {
        success: true,
        last_index: request.last_index(),
    })
}

/// One leader-to-member replication attempt.
#[derive(Debug, Clone)]
pub struct Replication {
    pub member: String,
    pub term: u64,
    pub leader: String,
    pub commit_index: u64,
    pub next_index: u64,
    pub rpc_timeout: Duration,
}

#[derive(Debug)]
pub enum ReplicaOutcome {
    /// The member's log matches ours up to `match_index` and it has seen
    /// `commit_index`.
    Matched { match_index: u64, commit_index: u64 },
    HigherTerm(u64),
    Failed(RaftError),
}

/// Sends `Sync` to one member, backing `next_index` off until the logs match.
pub async fn replicate(
    log: Arc<dyn RaftLog>,
    endpoint: Arc<dyn RpcEndpoint>,
    replication: Replication,
) -> ReplicaOutcome {
    match try_replicate(log.as_ref(), endpoint.as_ref(), &replication).await {
        Ok(outcome) => outcome,
        Err(e) => ReplicaOutcome::Failed(e),
    }
}

async fn try_replicate(
    log: &dyn RaftLog,
    endpoint: &dyn RpcEndpoint,
    r: &Replication,
) -> Result<ReplicaOutcome, RaftError> {
    let mut next_index = r.next_index.max(1);

    loop {
        let last_index = log.last_index().await?;
        if next_index > last_index + 1 {
            next_index = last_index + 1;
        }

        let prev_log_index = next_index - 1;
        let prev_log_term = log.term_at(prev_log_index).await?.unwrap_or(0);
        let entries = log.entries(next_index, None).await?;

        let request = SyncRequest {
            term: r.term,
            leader: r.leader.clone(),
            prev_log_index,
            prev_log_term,
            entries,
            commit_index: r.commit_index,
        };
        let sent_last = request.last_index();

        let response = with_timeout(r.rpc_timeout, endpoint.sync(&r.member, request)).await?;
        if response.term > r.term {
            return Ok(ReplicaOutcome::HigherTerm(response.term));
        }
        if response.success {
            return Ok(ReplicaOutcome::Matched {
                match_index: sent_last,
                commit_index: r.commit_index.min(sent_last),
            });
        }
        if prev_log_index == 0 {
            return Err(RaftError::NetworkError(format!(
                "{} rejected a sync from the start of the log",
                r.member
            )));
        }

        next_index = prev_log_index.min(response.last_index + 1).max(1);
        debug!("{} rejected sync, retrying from index {next_index}", r.member);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::{LogEntry, MemLog};

    fn sync(prev_log_index: u64, prev_log_term: u64, terms: &[u64]) -> SyncRequest {
        SyncRequest {
            term: 5,
            leader: "leader".into(),
            prev_log_index,
            prev_log_term,
            entries: terms.iter().map(|t| LogEntry::new(*t, vec![*t as u8])).collect(),
            commit_index: 0,
        }
    }

    async fn terms(log: &MemLog) -> Vec<u64> {
        log.entries(1, None).await.unwrap().iter().map(|e| e.term).collect()
    }

    #[tokio::test]
    async fn appends_to_an_empty_log() {
        let log = MemLog::new();
        let outcome = append_entries(&log, &sync(0, 0, &[1, 1, 2])).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.last_index, 3);
        assert_eq!(terms(&log).await, vec![1, 1, 2]);
    }

    #[tokio::test]
    async fn rejects_missing_or_mismatched_prev_entry() {
        let log = MemLog::with_entries([LogEntry::new(1, vec![]), LogEntry::new(1, vec![])]);

        let too_far = append_entries(&log, &sync(5, 1, &[2])).await.unwrap();
        assert!(!too_far.success);
        assert_eq!(too_far.last_index, 2);

        let wrong_term = append_entries(&log, &sync(2, 3, &[3])).await.unwrap();
        assert!(!wrong_term.success);
        assert_eq!(terms(&log).await, vec![1, 1]);
    }

    #[tokio::test]
    async fn truncates_from_first_conflict() {
        let log = MemLog::with_entries([1, 1, 2, 2].map(|t| LogEntry::new(t, vec![])));

        let outcome = append_entries(&log, &sync(1, 1, &[1, 3])).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.last_index, 3);
        assert_eq!(terms(&log).await, vec![1, 1, 3]);
    }

    #[tokio::test]
    async fn keeps_entries_beyond_a_stale_request() {
        let log = MemLog::with_entries([1, 1, 2].map(|t| LogEntry::new(t, vec![])));

        // A delayed request that is a prefix of what we hold must not cut the tail.
        let outcome = append_entries(&log, &sync(0, 0, &[1])).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.last_index, 1);
        assert_eq!(terms(&log).await, vec![1, 1, 2]);
    }
}
