use crate::actor::WeakActorClient;
use crate::cluster::Member;
use crate::consensus::election::state_change_listener;
use crate::consensus::election::state_change_listener::{RoleChangeListener, RoleChangeNotifier, RoleSnapshot};
use crate::consensus::election::timers::{ElectionTimerHandle, HeartbeatTimerHandle};
use crate::consensus::election::{LeaderStateTracker, PeerState};
use crate::consensus::local_state::Term;
use crate::consensus::log::Position;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

#[derive(Clone)]
pub(crate) struct ElectionConfig {
    pub my_member: Member,
    pub leader_heartbeat_duration: Duration,
    pub election_min_timeout: Duration,
    pub election_max_timeout: Duration,
}

/// ElectionState holds the state specific to the replica's current role. Its methods
/// are responsible for "what" to do on a role change. It is NOT responsible for
/// validating anything about logs, terms, or peers, or for knowing "when" to act.
pub(crate) struct ElectionState {
    state: State,
    config: ElectionConfig,
    actor_client: WeakActorClient,
    state_change_notifier: RoleChangeNotifier,
}

/// CurrentLeader, from a single replica's point of view.
#[derive(Debug, PartialEq)]
pub(crate) enum CurrentLeader {
    Me,
    Other(Member),
    Unknown,
}

impl ElectionState {
    /// Creates a new ElectionState that starts out as a follower with no known leader.
    pub(crate) fn new_follower(config: ElectionConfig, actor_client: WeakActorClient) -> (Self, RoleChangeListener) {
        let initial_state = State::Follower(FollowerState::new(
            config.election_min_timeout,
            config.election_max_timeout,
            actor_client.clone(),
        ));
        let (notifier, listener) = state_change_listener::new(Self::current_state_impl(&initial_state));

        let election_state = Self {
            state: initial_state,
            config,
            actor_client,
            state_change_notifier: notifier,
        };

        (election_state, listener)
    }

    pub(crate) fn transition_to_follower(&mut self, new_leader: Option<Member>) {
        self.state = State::Follower(FollowerState::with_leader(
            new_leader,
            self.config.election_min_timeout,
            self.config.election_max_timeout,
            self.actor_client.clone(),
        ));
        self.notify_new_state();
    }

    pub(crate) fn transition_to_candidate_and_vote_for_self(&mut self) {
        let mut cs = CandidateState::new(
            self.config.election_min_timeout,
            self.config.election_max_timeout,
            self.actor_client.clone(),
        );

        // Vote for self
        cs.add_received_vote(self.config.my_member.clone());

        self.state = State::Candidate(cs);
        self.notify_new_state();
    }

    pub(crate) fn transition_to_leader(
        &mut self,
        term: Term,
        peers: HashSet<Member>,
        previous_log_position: Option<Position>,
    ) {
        self.state = State::Leader(LeaderState::new(
            peers,
            previous_log_position,
            self.config.leader_heartbeat_duration,
            self.actor_client.clone(),
            term,
        ));
        self.notify_new_state();
    }

    pub(crate) fn current_leader(&self) -> CurrentLeader {
        match &self.state {
            State::Leader(_) => CurrentLeader::Me,
            State::Candidate(_) => CurrentLeader::Unknown,
            State::Follower(FollowerState {
                leader: Some(leader), ..
            }) => CurrentLeader::Other(leader.clone()),
            State::Follower(FollowerState { leader: None, .. }) => CurrentLeader::Unknown,
        }
    }

    fn current_state_impl(state: &State) -> RoleSnapshot {
        match state {
            State::Leader(_) => RoleSnapshot::Leader,
            State::Candidate(_) => RoleSnapshot::Candidate,
            State::Follower(FollowerState { leader: None, .. }) => RoleSnapshot::FollowerNoLeader,
            State::Follower(FollowerState {
                leader: Some(leader), ..
            }) => RoleSnapshot::Follower(leader.clone()),
        }
    }

    fn notify_new_state(&self) {
        self.state_change_notifier
            .notify_new_state(Self::current_state_impl(&self.state));
    }

    pub(crate) fn reset_timeout_if_follower(&self) {
        if let State::Follower(fs) = &self.state {
            fs.reset_timeout();
        }
    }

    pub(crate) fn set_leader_if_unknown(&mut self, leader: &Member) {
        if let State::Follower(fs) = &mut self.state {
            if fs.leader.is_none() {
                fs.leader.replace(leader.clone());
                self.notify_new_state();
            }
        }
    }

    /// Return number of votes received if candidate, or None if no longer Candidate.
    pub(crate) fn add_vote_if_candidate(&mut self, vote_from: Member) -> Option<usize> {
        if let State::Candidate(cs) = &mut self.state {
            Some(cs.add_received_vote(vote_from))
        } else {
            None
        }
    }

    pub(crate) fn is_leader(&self) -> bool {
        matches!(self.state, State::Leader(_))
    }

    pub(crate) fn is_follower(&self) -> bool {
        matches!(self.state, State::Follower(_))
    }

    pub(crate) fn leader_state_mut(&mut self) -> Option<&mut LeaderStateTracker> {
        if let State::Leader(ls) = &mut self.state {
            Some(&mut ls.tracker)
        } else {
            None
        }
    }

    /// Build a per-peer tracker for a member added to the configuration while we are
    /// leader.
    pub(crate) fn new_peer_state(&self, term: Term, member: &Member, previous_log_position: Option<Position>) -> PeerState {
        let handle = HeartbeatTimerHandle::spawn_timer_task(
            self.config.leader_heartbeat_duration,
            self.actor_client.clone(),
            member.clone(),
            term,
        );
        PeerState::new(handle, previous_log_position)
    }
}

impl fmt::Debug for ElectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            State::Leader(_) => write!(f, "Leader"),
            State::Candidate(_) => write!(f, "Candidate"),
            State::Follower(FollowerState {
                leader: Some(leader), ..
            }) => write!(f, "Follower(Leader={:?})", leader),
            State::Follower(FollowerState { leader: None, .. }) => write!(f, "Follower(Leader=None)"),
        }
    }
}

// Each variant carries only the data valid for that role; transition methods replace
// the whole value, so stale role data cannot leak across transitions.
enum State {
    Leader(LeaderState),
    Candidate(CandidateState),
    Follower(FollowerState),
}

struct LeaderState {
    tracker: LeaderStateTracker,
}

struct CandidateState {
    received_votes_from: HashSet<Member>,
    _election_timeout_tracker: ElectionTimerHandle,
}

struct FollowerState {
    leader: Option<Member>,
    election_timeout_tracker: ElectionTimerHandle,
}

impl LeaderState {
    fn new(
        peers: HashSet<Member>,
        previous_log_position: Option<Position>,
        heartbeat_duration: Duration,
        actor_client: WeakActorClient,
        term: Term,
    ) -> Self {
        let mut peer_state = HashMap::with_capacity(peers.len());
        for member in peers {
            let heartbeat_timer_handle =
                HeartbeatTimerHandle::spawn_timer_task(heartbeat_duration, actor_client.clone(), member.clone(), term);
            peer_state.insert(member, PeerState::new(heartbeat_timer_handle, previous_log_position));
        }

        Self {
            tracker: LeaderStateTracker::new(peer_state),
        }
    }
}

impl CandidateState {
    fn new(min_timeout: Duration, max_timeout: Duration, actor_client: WeakActorClient) -> Self {
        Self {
            received_votes_from: HashSet::with_capacity(3),
            _election_timeout_tracker: ElectionTimerHandle::spawn_timer_task(min_timeout, max_timeout, actor_client),
        }
    }

    /// Returns the number of unique votes received after adding `vote_from`.
    fn add_received_vote(&mut self, vote_from: Member) -> usize {
        self.received_votes_from.insert(vote_from);
        self.received_votes_from.len()
    }
}

impl FollowerState {
    fn new(min_timeout: Duration, max_timeout: Duration, actor_client: WeakActorClient) -> Self {
        Self::with_leader(None, min_timeout, max_timeout, actor_client)
    }

    fn with_leader(
        leader: Option<Member>,
        min_timeout: Duration,
        max_timeout: Duration,
        actor_client: WeakActorClient,
    ) -> Self {
        Self {
            leader,
            election_timeout_tracker: ElectionTimerHandle::spawn_timer_task(min_timeout, max_timeout, actor_client),
        }
    }

    fn reset_timeout(&self) {
        self.election_timeout_tracker.reset_timeout();
    }
}
