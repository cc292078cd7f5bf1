//! Majority tracking for elections and replication acknowledgements.
//!
//! A [`Quorum`] is created for a fixed member set (excluding this node) and
//! counts this node's own vote from the start. Each member reports at most
//! once. The outcome is returned exactly once, from whichever call made it
//! certain; after that, or after [`Quorum::cancel`], the tracker is inert.

use std::collections::BTreeSet;

/// Votes needed out of `members` peers plus this node.
pub fn quorum_size(members: usize) -> usize {
    // floor((N + 1) / 2) + 1
    members.div_ceil(2) + 1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tally {
    Pending,
    Decided(bool),
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct Quorum {
    members: BTreeSet<String>,
    succeeded: BTreeSet<String>,
    failed: BTreeSet<String>,
    quorum: usize,
    tally: Tally,
}

impl Quorum {
    pub fn new<I, S>(members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let members: BTreeSet<String> = members.into_iter().map(Into::into).collect();
        let quorum = quorum_size(members.len());
        Self {
            members,
            succeeded: BTreeSet::new(),
            failed: BTreeSet::new(),
            quorum,
            tally: Tally::Pending,
        }
    }

    /// Invokes `action` once per member, then reports an outcome if it is
    /// already determined (a node without peers is its own majority).
    pub fn start<F>(&mut self, mut action: F) -> Option<bool>
    where
        F: FnMut(&str),
    {
        if self.tally != Tally::Pending {
            return None;
        }
        for member in &self.members {
            action(member);
        }
        self.evaluate()
    }

    pub fn succeed(&mut self, member: &str) -> Option<bool> {
        if !self.accepts(member) {
            return None;
        }
        self.succeeded.insert(member.to_string());
        self.evaluate()
    }

    pub fn fail(&mut self, member: &str) -> Option<bool> {
        if !self.accepts(member) {
            return None;
        }
        self.failed.insert(member.to_string());
        self.evaluate()
    }

    /// Makes the tracker inert. Idempotent.
    pub fn cancel(&mut self) {
        if self.tally == Tally::Pending {
            self.tally = Tally::Cancelled;
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.tally != Tally::Pending
    }

    pub fn outcome(&self) -> Option<bool> {
        match self.tally {
            Tally::Decided(elected) => Some(elected),
            _ => None,
        }
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    /// Successes so far, counting this node.
    pub fn successes(&self) -> usize {
        self.succeeded.len() + 1
    }

    pub fn failures(&self) -> usize {
        self.failed.len()
    }

    fn has_responded(&self, member: &str) -> bool {
        self.succeeded.contains(member) || self.failed.contains(member)
    }

    fn accepts(&self, member: &str) -> bool {
        self.tally == Tally::Pending && self.members.contains(member) && !self.has_responded(member)
    }

    fn evaluate(&mut self) -> Option<bool> {
        let successes = self.successes();
        if successes >= self.quorum {
            self.tally = Tally::Decided(true);
            return Some(true);
        }
        let responded = self.succeeded.len() + self.failed.len();
        let outstanding = self.members.len() - responded;
        if successes + outstanding < self.quorum {
            self.tally = Tally::Decided(false);
            return Some(false);
        }
        None
    }
}
