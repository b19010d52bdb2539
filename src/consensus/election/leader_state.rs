use crate::cluster::Member;
use crate::consensus::election::timers::HeartbeatTimerHandle;
use crate::consensus::log::Position;
use std::collections::{HashMap, HashSet};

pub(crate) struct LeaderStateTracker {
    peer_state: HashMap<Member, PeerState>,
}

impl LeaderStateTracker {
    pub(super) fn new(peer_state: HashMap<Member, PeerState>) -> Self {
        LeaderStateTracker { peer_state }
    }

    pub(crate) fn peer_state_mut(&mut self, member: &Member) -> Option<&mut PeerState> {
        self.peer_state.get_mut(member)
    }

    pub(crate) fn peer_ids(&self) -> HashSet<Member> {
        self.peer_state.keys().cloned().collect()
    }

    pub(crate) fn peers_iter(&self) -> impl Iterator<Item = &PeerState> {
        self.peer_state.values()
    }

    /// Membership changed while leader: add trackers for new peers, drop removed ones.
    pub(crate) fn reconcile_peers(
        &mut self,
        members: HashSet<Member>,
        mut new_peer_state: impl FnMut(&Member) -> PeerState,
    ) {
        self.peer_state.retain(|member, _| members.contains(member));
        for member in members {
            if !self.peer_state.contains_key(&member) {
                let state = new_peer_state(&member);
                self.peer_state.insert(member, state);
            }
        }
    }
}

/// How the leader is currently bringing one peer up to date.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum ReplicationMode {
    /// Normal log replication via AppendEntries.
    Replicating,
    /// The peer's next entry is compacted away; a chunked snapshot transfer is in
    /// flight and AppendEntries is suspended until it completes.
    InstallingSnapshot { snapshot_position: Position },
}

pub(crate) struct PeerState {
    // Held to send heartbeats for this peer
    heartbeat_timer_handle: HeartbeatTimerHandle,

    // Position of the next log entry to send to this peer
    // (initialized to leader last log position + 1)
    next: Position,
    // Highest log position known to be replicated on this peer
    // (initialized to None, increases monotonically). After initial reconciliation
    // this converges to always trail `next` by one.
    matched: Option<Position>,

    mode: ReplicationMode,

    // SeqNo is a logical clock over this term leader's interactions with the peer.
    // Each request increments the last sent SeqNo; a reply carrying a SeqNo at or
    // below the last received one is discarded as late/duplicate.
    last_sent_seq_no: u64,
    last_received_seq_no: u64,
}

impl PeerState {
    pub(super) fn new(heartbeat_timer_handle: HeartbeatTimerHandle, previous_log_position: Option<Position>) -> Self {
        PeerState {
            heartbeat_timer_handle,
            next: previous_log_position
                .map(|p| p.plus(1))
                .unwrap_or_else(Position::start_position),
            matched: None,
            mode: ReplicationMode::Replicating,
            last_sent_seq_no: 0,
            last_received_seq_no: 0,
        }
    }

    pub(crate) fn next_and_previous_log_position(&self) -> (Position, Option<Position>) {
        (self.next, self.next.checked_minus(1))
    }

    pub(crate) fn matched(&self) -> Option<Position> {
        self.matched
    }

    pub(crate) fn mode(&self) -> ReplicationMode {
        self.mode
    }

    pub(crate) fn begin_snapshot_install(&mut self, snapshot_position: Position) {
        self.mode = ReplicationMode::InstallingSnapshot { snapshot_position };
    }

    /// Transfer finished: resume AppendEntries right after the snapshot on success,
    /// or retry from the same place on failure.
    pub(crate) fn finish_snapshot_install(&mut self, succeeded: bool, snapshot_position: Position) {
        if succeeded {
            self.next = snapshot_position.plus(1);
            self.matched.replace(snapshot_position);
        }
        self.mode = ReplicationMode::Replicating;
    }

    pub(crate) fn handle_append_reply(&mut self, logger: &slog::Logger, received_seq_no: u64, update: PeerStateUpdate) {
        if !self.ratchet_fwd_received_seq_no(received_seq_no) {
            slog::warn!(logger, "Dropping out of date seq-no({:?}): {:?}", received_seq_no, update);
            return;
        }

        match update {
            PeerStateUpdate::OtherError => { /* No action */ }
            PeerStateUpdate::Success {
                previous_entry,
                num_entries_replicated,
            } => {
                self.update_log(previous_entry, num_entries_replicated);
            }
            PeerStateUpdate::PeerLogBehind { peer_last_position } => {
                self.rewind_log(logger, peer_last_position);
            }
        }
    }

    fn update_log(&mut self, previous_entry: Option<Position>, num_entries_replicated: usize) {
        let new_matched = match (previous_entry, num_entries_replicated) {
            (_, 0) => {
                // Heartbeat only, nothing appended.
                return;
            }
            (None, n) => Position::new(n as u64),
            (Some(prev), n) => prev.plus(n as u64),
        };
        let new_next = new_matched.plus(1);

        // Panic here: as leader, we either sent something wrong or track state wrong.
        assert!(
            new_next > self.next,
            "Next can only ratchet forward. CurrentNext={:?}, NewNext={:?}",
            self.next,
            new_next
        );
        if let Some(matched) = self.matched {
            assert!(
                new_matched > matched,
                "Matched can only ratchet forward. CurrentMatched={:?}, NewMatched={:?}",
                matched,
                new_matched
            )
        }

        self.next = new_next;
        self.matched.replace(new_matched);
    }

    fn rewind_log(&mut self, logger: &slog::Logger, peer_last_position: Option<Position>) {
        // Don't panic here, the peer could return garbage data.
        if self.matched.is_some() {
            slog::warn!(
                logger,
                "Illegal state: Can't rewind AppendEntries cursor after any success. Not mutating state."
            );
            return;
        }

        // The peer reported its last known position; jump there directly instead of
        // probing backwards one entry at a time.
        let rewound = match peer_last_position {
            Some(last) => Some(last.plus(1)),
            None => Some(Position::start_position()),
        }
        .filter(|new_next| *new_next < self.next);

        match rewound.or_else(|| self.next.checked_minus(1)) {
            Some(new_next) => self.next = new_next,
            None => slog::warn!(logger, "Can't rewind peer cursor, already at start of log."),
        }
    }

    pub(crate) fn has_outstanding_request(&self) -> bool {
        self.last_received_seq_no < self.last_sent_seq_no
    }

    pub(crate) fn next_seq_no(&mut self) -> u64 {
        self.last_sent_seq_no += 1;
        self.last_sent_seq_no
    }

    /// returns true if the state was mutated.
    fn ratchet_fwd_received_seq_no(&mut self, received_seq_no: u64) -> bool {
        if self.last_received_seq_no < received_seq_no && received_seq_no <= self.last_sent_seq_no {
            self.last_received_seq_no = received_seq_no;
            true
        } else {
            false
        }
    }

    pub(crate) fn reset_heartbeat_timer(&self) {
        self.heartbeat_timer_handle.reset_heartbeat_timer();
    }
}

#[derive(Debug)]
pub(crate) enum PeerStateUpdate {
    Success {
        previous_entry: Option<Position>,
        num_entries_replicated: usize,
    },
    PeerLogBehind {
        peer_last_position: Option<Position>,
    },
    OtherError,
}
