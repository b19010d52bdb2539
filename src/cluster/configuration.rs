use crate::cluster::Member;
use crate::consensus::{Position, Term};

/// ClusterConfiguration is the active membership of one partition: an ordered set of
/// members plus the log position/term at which this membership became effective.
///
/// Only the consensus engine mutates it, and only by applying a committed
/// configuration entry. Everything else reads an immutable snapshot of the member
/// list (`members()`) to compute quorum sizes.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterConfiguration {
    members: Vec<Member>,
    log_position: Option<Position>,
    log_term: Term,
}

impl ClusterConfiguration {
    pub fn new(members: Vec<Member>) -> Self {
        let mut deduped = Vec::with_capacity(members.len());
        for member in members {
            if !deduped.contains(&member) {
                deduped.push(member);
            }
        }

        ClusterConfiguration {
            members: deduped,
            log_position: None,
            log_term: Term::new(0),
        }
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn contains(&self, member: &Member) -> bool {
        self.members.contains(member)
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Strict majority of the current membership.
    pub fn quorum(&self) -> usize {
        (self.members.len() / 2) + 1
    }

    /// Position/term of the configuration entry this membership came from. None for
    /// the bootstrap configuration, which precedes the log.
    pub fn log_position(&self) -> Option<Position> {
        self.log_position
    }

    pub fn log_term(&self) -> Term {
        self.log_term
    }

    /// Replace the membership with the one carried by a committed configuration
    /// entry. Insertion order of the new list is preserved; duplicates collapse.
    pub fn apply(&mut self, members: Vec<Member>, position: Position, term: Term) {
        let mut next = ClusterConfiguration::new(members);
        next.log_position = Some(position);
        next.log_term = term;
        *self = next;
    }

    /// Membership with `member` appended, for proposing a join. Returns None if the
    /// member is already part of the configuration.
    pub fn with_member(&self, member: Member) -> Option<Vec<Member>> {
        if self.contains(&member) {
            return None;
        }
        let mut members = self.members.clone();
        members.push(member);
        Some(members)
    }

    /// Membership with `member` removed, for proposing a leave. Returns None if the
    /// member is not part of the configuration.
    pub fn without_member(&self, member: &Member) -> Option<Vec<Member>> {
        if !self.contains(member) {
            return None;
        }
        Some(self.members.iter().filter(|m| *m != member).cloned().collect())
    }
}
