use crate::cluster::Member;
use std::fmt;
use std::sync::Arc;

#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash)]
pub struct Term(u64);

impl Term {
    pub fn new(term: u64) -> Self {
        Term(term)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn incr(&mut self) {
        self.0 += 1;
    }
}

impl fmt::Debug for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// PersistentLocalState holds the algorithm-correctness-critical per-replica state
/// that must survive restarts: the current term and who we voted for in it. Nothing
/// else that touches disk goes through here.
///
/// Store methods are CAS-like and return true iff state was mutated.
pub trait PersistentLocalState {
    /// Set current term to `new_term` atomically, iff it is larger than current term.
    fn store_term_if_increased(&mut self, new_term: Term) -> bool;

    /// Store our vote for the latest term iff the latest internal term equals the
    /// provided one and we have not voted for it yet.
    fn store_vote_for_term_if_unvoted(&mut self, expected_current_term: Term, vote: Member) -> bool;

    /// Returns the new term. Used when transitioning to candidate.
    fn increment_term_and_vote_for_self(&mut self) -> Term;

    fn current_term(&self) -> Term;
    fn voted_for_current_term(&self) -> (Term, Option<Arc<Member>>);
}

/// In-memory implementation. The durable implementation belongs to the storage
/// engine integration that embeds this crate.
pub struct VolatileLocalState {
    current_term: Term,
    voted_for_this_term: Option<Arc<Member>>,
    my_member: Arc<Member>,
}

impl VolatileLocalState {
    pub fn new(my_member: Member) -> Self {
        VolatileLocalState {
            current_term: Term::new(0),
            voted_for_this_term: None,
            my_member: Arc::new(my_member),
        }
    }
}

impl PersistentLocalState for VolatileLocalState {
    fn store_term_if_increased(&mut self, new_term: Term) -> bool {
        if new_term <= self.current_term {
            false
        } else {
            self.current_term = new_term;
            self.voted_for_this_term = None;
            true
        }
    }

    fn store_vote_for_term_if_unvoted(&mut self, expected_term: Term, vote: Member) -> bool {
        if expected_term == self.current_term && self.voted_for_this_term.is_none() {
            self.voted_for_this_term.replace(Arc::new(vote));
            true
        } else {
            false
        }
    }

    fn increment_term_and_vote_for_self(&mut self) -> Term {
        self.current_term.incr();
        self.voted_for_this_term.replace(self.my_member.clone());

        self.current_term
    }

    fn current_term(&self) -> Term {
        self.current_term
    }

    fn voted_for_current_term(&self) -> (Term, Option<Arc<Member>>) {
        (self.current_term, self.voted_for_this_term.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(host: &str) -> Member {
        Member::new(host.to_string(), 26502)
    }

    #[test]
    fn at_most_one_vote_per_term() {
        let mut state = VolatileLocalState::new(member("me"));
        assert!(state.store_term_if_increased(Term::new(3)));

        assert!(state.store_vote_for_term_if_unvoted(Term::new(3), member("a")));
        assert!(!state.store_vote_for_term_if_unvoted(Term::new(3), member("b")));
        assert_eq!(
            state.voted_for_current_term().1.as_deref(),
            Some(&member("a"))
        );
    }

    #[test]
    fn term_increase_clears_vote() {
        let mut state = VolatileLocalState::new(member("me"));
        state.store_term_if_increased(Term::new(1));
        state.store_vote_for_term_if_unvoted(Term::new(1), member("a"));

        assert!(state.store_term_if_increased(Term::new(2)));
        assert_eq!(state.voted_for_current_term(), (Term::new(2), None));

        // Stale and equal terms are rejected.
        assert!(!state.store_term_if_increased(Term::new(2)));
        assert!(!state.store_term_if_increased(Term::new(1)));
    }

    #[test]
    fn candidate_votes_for_self() {
        let mut state = VolatileLocalState::new(member("me"));
        let term = state.increment_term_and_vote_for_self();
        assert_eq!(term, Term::new(1));
        assert_eq!(
            state.voted_for_current_term().1.as_deref(),
            Some(&member("me"))
        );
        // Someone else's vote request for the same term must lose.
        assert!(!state.store_vote_for_term_if_unvoted(Term::new(1), member("other")));
    }
}
