use crate::actor::{Callback, WeakActorClient};
use crate::cluster::{ClusterConfiguration, Member};
use crate::consensus::api::{
    AppendReplyDescriptor, AppendReplyError, AppendReplyFromPeer, HeartbeatTick, JoinInput, LeaveInput,
    MembershipChangeError, MembershipChangeOutput, SnapshotInstalled, SnapshotTransferResult, StartReplicationError,
    StartReplicationInput, StartReplicationOutput, VoteReplyFromPeer, VoteResult,
};
use crate::consensus::commit_stream::CommitStreamPublisher;
use crate::consensus::election::{
    CurrentLeader, ElectionConfig, ElectionState, PeerState, PeerStateUpdate, ReplicationMode, RoleChangeListener,
};
use crate::consensus::local_state::{PersistentLocalState, Term};
use crate::consensus::log::{
    CommittedConfiguration, EntryPayload, LogStorage, Position, ReplicatedEntry, ReplicatedLog,
};
use crate::consensus::transport::PeerTransport;
use crate::protocol;
use crate::snapshot::{sender, SnapshotChunk, SnapshotStoreClient, SnapshotStoreError};
use std::collections::HashSet;
use std::sync::Arc;
use std::{cmp, io};
use tokio::time::Duration;

pub(crate) struct ReplicaConfig<L, S>
where
    L: LogStorage,
    S: PersistentLocalState,
{
    pub logger: slog::Logger,
    pub partition_id: u16,
    pub topic_name: String,
    pub my_member: Member,
    pub cluster_members: Vec<Member>,
    pub log_storage: L,
    pub local_state: S,
    pub commit_stream_publisher: CommitStreamPublisher,
    pub transport: Arc<dyn PeerTransport>,
    pub snapshot_store: SnapshotStoreClient,
    pub actor_client: WeakActorClient,
    pub leader_heartbeat_duration: Duration,
    pub election_min_timeout: Duration,
    pub election_max_timeout: Duration,
    pub append_timeout: Duration,
}

/// Replica drives one partition's participation in the consensus protocol: leader
/// election, log replication, membership change, and the hand-off to the snapshot
/// store when a follower is too far behind for log replay.
///
/// All methods run on the single-threaded replica actor; a transition either fully
/// completes against in-memory state or fails atomically. Remote I/O always happens
/// on spawned tasks that report back as actor events.
pub(crate) struct Replica<L, S>
where
    L: LogStorage,
    S: PersistentLocalState,
{
    logger: slog::Logger,
    partition_id: u16,
    topic_name: String,
    my_member: Member,
    configuration: ClusterConfiguration,
    local_state: S,
    election_state: ElectionState,
    log: ReplicatedLog<L>,
    transport: Arc<dyn PeerTransport>,
    snapshot_store: SnapshotStoreClient,
    actor_client: WeakActorClient,
    append_timeout: Duration,
    pending_configuration: Option<PendingConfiguration>,
}

// An uncommitted Configure entry proposed by us as leader, plus the caller waiting
// for it to commit.
struct PendingConfiguration {
    position: Position,
    responder: Callback<MembershipChangeOutput, MembershipChangeError>,
}

impl<L, S> Replica<L, S>
where
    L: LogStorage + 'static,
    S: PersistentLocalState + 'static,
{
    pub(crate) fn new(config: ReplicaConfig<L, S>) -> (Self, RoleChangeListener) {
        let (election_state, role_listener) = ElectionState::new_follower(
            ElectionConfig {
                my_member: config.my_member.clone(),
                leader_heartbeat_duration: config.leader_heartbeat_duration,
                election_min_timeout: config.election_min_timeout,
                election_max_timeout: config.election_max_timeout,
            },
            config.actor_client.clone(),
        );
        let log = ReplicatedLog::new(config.logger.clone(), config.log_storage, config.commit_stream_publisher);

        let replica = Replica {
            logger: config.logger,
            partition_id: config.partition_id,
            topic_name: config.topic_name,
            my_member: config.my_member,
            configuration: ClusterConfiguration::new(config.cluster_members),
            local_state: config.local_state,
            election_state,
            log,
            transport: config.transport,
            snapshot_store: config.snapshot_store,
            actor_client: config.actor_client,
            append_timeout: config.append_timeout,
            pending_configuration: None,
        };

        (replica, role_listener)
    }

    // ------------------------------------------------------------------
    // Client writes
    // ------------------------------------------------------------------

    pub(crate) fn handle_start_replication(
        &mut self,
        input: StartReplicationInput,
    ) -> Result<StartReplicationOutput, StartReplicationError> {
        match self.election_state.current_leader() {
            CurrentLeader::Me => { /* carry on */ }
            CurrentLeader::Other(leader) => {
                return Err(StartReplicationError::LeaderRedirect(leader));
            }
            CurrentLeader::Unknown => {
                return Err(StartReplicationError::NoLeader);
            }
        }

        // > If command received from client: append entry to local log,
        // > respond after entry applied to state machine (§5.3)
        let term = self.local_state.current_term();
        let position = self
            .log
            .append(ReplicatedEntry {
                term,
                payload: EntryPayload::Data(input.data),
            })
            .map_err(StartReplicationError::LocalIoError)?;

        self.advance_commit_if_single_member();

        Ok(StartReplicationOutput { term, position })
    }

    // ------------------------------------------------------------------
    // Vote / Poll
    // ------------------------------------------------------------------

    pub(crate) fn handle_vote_request(&mut self, request: protocol::VoteRequest) -> protocol::VoteResponse {
        let not_granted = |term: Term| protocol::VoteResponse { term, granted: false };

        // Only known members get votes.
        if !self.configuration.contains(&request.candidate) {
            slog::info!(
                self.logger,
                "Not granting vote. {:?} is not in the cluster.",
                request.candidate
            );
            return not_granted(self.local_state.current_term());
        }

        // Read our local term/vote state as 1 atomic action.
        let (current_term, mut opt_voted_for) = self.local_state.voted_for_current_term();

        // 1. Reply false if term < currentTerm (§5.1)
        if request.term < current_term {
            slog::info!(self.logger, "Not granting vote. Candidate term is out of date.");
            return not_granted(current_term);
        }

        // > If RPC request or response contains term T > currentTerm:
        // > set currentTerm = T, convert to follower (§5.1)
        let increased = self.local_state.store_term_if_increased(request.term);
        if increased {
            self.election_state.transition_to_follower(None);
            slog::info!(
                self.logger,
                "Observed increased term in vote request. Election state: {:?}",
                self.election_state
            );
            // New term means we haven't voted in it yet.
            opt_voted_for = None;
        }
        let current_term = self.local_state.current_term();

        // 2. If votedFor is null or candidateId, and candidate's log is at
        // least as up-to-date as receiver's log, grant vote (§5.2, §5.4).
        if let Some(voted_for) = opt_voted_for {
            if *voted_for != request.candidate {
                slog::info!(self.logger, "Not granting vote. We already voted for {:?}.", voted_for);
                return not_granted(current_term);
            }
        }

        if !self.is_candidate_log_gte_mine(request.last_entry_term, request.last_entry_position) {
            slog::info!(self.logger, "Not granting vote. Candidate log is out of date.");
            return not_granted(current_term);
        }

        slog::info!(self.logger, "Voting for {:?}.", request.candidate);
        let cas_success = self
            .local_state
            .store_vote_for_term_if_unvoted(current_term, request.candidate.clone());

        if cas_success {
            // Granting a vote means we consider an election in progress; don't
            // start a competing one right away.
            self.election_state.reset_timeout_if_follower();
            return protocol::VoteResponse {
                term: current_term,
                granted: true,
            };
        }

        // We lost the CAS race. Re-read and grant only if the stored vote already
        // matches this candidate (i.e. a concurrent retry of the same request).
        if let (reread_term, Some(reread_voted_for)) = self.local_state.voted_for_current_term() {
            if reread_term == current_term && *reread_voted_for == request.candidate {
                return protocol::VoteResponse {
                    term: current_term,
                    granted: true,
                };
            }
        }

        not_granted(current_term)
    }

    /// Pre-vote probe: same up-to-date-log comparison as a vote, but with no side
    /// effects at all. Used to avoid disrupting a working cluster with speculative
    /// elections.
    pub(crate) fn handle_poll_request(&self, request: protocol::PollRequest) -> protocol::PollResponse {
        let current_term = self.local_state.current_term();
        let granted = request.term >= current_term
            && self.is_candidate_log_gte_mine(request.last_entry_term, request.last_entry_position);

        protocol::PollResponse {
            term: current_term,
            granted,
        }
    }

    fn is_candidate_log_gte_mine(
        &self,
        candidate_last_term: Option<Term>,
        candidate_last_position: Option<Position>,
    ) -> bool {
        // > Raft determines which of two logs is more up-to-date
        // > by comparing the index and term of the last entries in the
        // > logs. If the logs have last entries with different terms, then
        // > the log with the later term is more up-to-date. If the logs
        // > end with the same term, then whichever log is longer is
        // > more up-to-date.
        let candidate_last = match (candidate_last_term, candidate_last_position) {
            (Some(term), Some(position)) => Some((term, position)),
            _ => None,
        };

        match (self.log.latest_entry(), candidate_last) {
            (None, None) => true,
            (Some(_), None) => false,
            (None, Some(_)) => true,
            (Some((my_term, my_position)), Some((candidate_term, candidate_position))) => {
                if candidate_term > my_term {
                    return true;
                } else if candidate_term < my_term {
                    return false;
                }

                candidate_position >= my_position
            }
        }
    }

    pub(crate) fn handle_vote_reply_from_peer(&mut self, reply: VoteReplyFromPeer) {
        let current_term = self.local_state.current_term();
        if current_term != reply.term {
            slog::info!(
                self.logger,
                "Received vote for outdated term {:?}, current term: {:?}.",
                reply.term,
                current_term,
            );
            return;
        }

        match reply.result {
            VoteResult::Granted => {
                let num_votes_received = match self.election_state.add_vote_if_candidate(reply.member) {
                    Some(v) => v,
                    None => {
                        slog::info!(
                            self.logger,
                            "Received vote for term {:?} after leaving candidate state: {:?}",
                            reply.term,
                            self.election_state,
                        );
                        return;
                    }
                };

                let num_members = self.configuration.member_count();
                slog::info!(
                    self.logger,
                    "Received {}/{} votes for term {:?}",
                    num_votes_received,
                    num_members,
                    reply.term,
                );

                self.become_leader_if_quorum(num_votes_received, reply.term);
            }
            VoteResult::NotGranted => {
                // No action
                slog::info!(self.logger, "Vote not granted for term {:?}", reply.term);
            }
            VoteResult::RetryableFailure | VoteResult::MalformedReply => {
                let target = reply.member.clone();
                if self.configuration.contains(&target) {
                    tokio::task::spawn(Self::call_peer_vote(
                        self.logger.clone(),
                        self.transport.clone(),
                        target,
                        self.new_vote_request(reply.term),
                        self.actor_client.clone(),
                        reply.term,
                    ));
                }
            }
        }
    }

    fn become_leader_if_quorum(&mut self, num_votes_received: usize, term: Term) {
        if num_votes_received < self.configuration.quorum() {
            return;
        }

        let peers = self.peer_members();
        let previous_log_position = self.log.latest_entry().map(|(_, position)| position);
        self.election_state.transition_to_leader(term, peers, previous_log_position);
        slog::info!(self.logger, "Won election for term {:?}. {:?}", term, self.election_state);

        // Assert leadership by appending a configuration entry for the new term.
        // Entries from older terms can then commit implicitly underneath it, and
        // membership is re-sealed under our term. An uncommitted configuration
        // entry inherited from the previous leader wins over our active one, so a
        // half-replicated membership change isn't silently rolled back.
        let members = self
            .latest_logged_configuration()
            .unwrap_or_else(|| self.configuration.members().to_vec());
        if let Err(e) = self.log.append(ReplicatedEntry {
            term,
            payload: EntryPayload::Configuration(members),
        }) {
            slog::error!(self.logger, "Failed to append initial entry for new term: {:?}", e);
        }
        self.advance_commit_if_single_member();
    }

    // Newest configuration entry still sitting uncommitted in our log, if any.
    fn latest_logged_configuration(&self) -> Option<Vec<Member>> {
        let latest_position = self.log.latest_entry().map(|(_, position)| position)?;
        let mut position = match self.log.commit_position() {
            Some(committed) => committed.plus(1),
            None => self.log.first_position()?,
        };

        let mut found = None;
        while position <= latest_position {
            if let Ok(Some(entry)) = self.log.read(position) {
                if let EntryPayload::Configuration(members) = entry.payload {
                    found = Some(members);
                }
            }
            position = position.plus(1);
        }

        found
    }

    // ------------------------------------------------------------------
    // AppendEntries, server side
    // ------------------------------------------------------------------

    pub(crate) fn handle_append_request(&mut self, request: protocol::AppendRequest) -> protocol::AppendResponse {
        let current_term = self.local_state.current_term();

        // 1. Reply false if term < currentTerm (§5.1)
        if request.term < current_term {
            return self.append_rejection(current_term);
        }

        let leader = request.leader.clone();

        // > If RPC request or response contains term T > currentTerm:
        // > set currentTerm = T, convert to follower (§5.1)
        let increased = self.local_state.store_term_if_increased(request.term);
        if !increased && self.election_state.is_leader() {
            // Two leaders for one term would mean the election safety invariant is
            // broken on the sender's side. Don't yield.
            slog::error!(
                self.logger,
                "Append request from {:?} for my own term {:?} while leader. Rejecting.",
                leader,
                current_term,
            );
            return self.append_rejection(current_term);
        }
        if increased || !self.election_state.is_follower() {
            self.election_state.transition_to_follower(leader.clone());
            self.fail_pending_configuration(MembershipChangeError::Superseded);
        } else if let Some(leader) = &leader {
            self.election_state.set_leader_if_unknown(leader);
        }
        let current_term = self.local_state.current_term();

        // Heard from the leader; hold off on elections.
        self.election_state.reset_timeout_if_follower();

        // 2. Reply false if [my] log doesn't contain an entry at [leader's]
        // prevLogPosition whose term matches [leader's] prevLogTerm (§5.3)
        if let (Some(previous_position), Some(previous_term)) =
            (request.previous_entry_position, request.previous_entry_term)
        {
            match self.log.contains_entry(previous_term, previous_position) {
                Ok(true) => {}
                Ok(false) => return self.append_rejection(current_term),
                Err(e) => {
                    slog::error!(self.logger, "I/O failure during consistency check: {:?}", e);
                    return self.append_rejection(current_term);
                }
            }
        }

        // 3. If [my] existing entry conflicts with [leader's new entry]
        // (same position but different terms), delete [my] existing entry and
        // all that follow it (§5.3)
        // 4. Append any new entry not already in the log
        if let Some(entry) = &request.entry {
            let expected_position = match request.previous_entry_position {
                None => Position::start_position(),
                Some(previous) => previous.plus(1),
            };
            if entry.position != expected_position {
                slog::warn!(
                    self.logger,
                    "Rejecting append: entry at {:?} does not follow previous {:?}",
                    entry.position,
                    request.previous_entry_position,
                );
                return self.append_rejection(current_term);
            }

            if let Err(e) = self.store_entry(entry) {
                slog::error!(self.logger, "I/O failure while appending {:?}: {:?}", entry.position, e);
                return self.append_rejection(current_term);
            }
        }

        // 5. If leaderCommit > commitIndex,
        // set commitIndex = min(leaderCommit, index of last new entry)
        if let Some(leader_commit) = request.commit_position {
            if let Some((_, my_latest_position)) = self.log.latest_entry() {
                let new_commit_position = cmp::min(leader_commit, my_latest_position);
                self.log.ratchet_fwd_commit_position_if_changed(new_commit_position);
                let configurations = self.log.publish_committed_entries();
                self.apply_committed_configurations(configurations);
            }
        }

        protocol::AppendResponse {
            partition_id: self.partition_id,
            term: current_term,
            succeeded: true,
            entry_position: self.log.latest_entry().map(|(_, position)| position),
            member: Some(self.my_member.clone()),
        }
    }

    fn store_entry(&mut self, entry: &protocol::WireEntry) -> Result<(), io::Error> {
        // Already holding the same entry: no-op (§5.3 item 4).
        if self.log.contains_entry(entry.term, entry.position)? {
            return Ok(());
        }

        // Conflicting suffix: ours diverges from the leader's at this position.
        if self.log.read(entry.position)?.is_some() {
            self.log.truncate_from(entry.position)?;
        }

        let payload = EntryPayload::decode(&entry.payload)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        let appended_position = self.log.append(ReplicatedEntry {
            term: entry.term,
            payload,
        })?;
        assert_eq!(
            appended_position, entry.position,
            "Appended log entry to unexpected position."
        );

        Ok(())
    }

    fn append_rejection(&self, term: Term) -> protocol::AppendResponse {
        protocol::AppendResponse {
            partition_id: self.partition_id,
            term,
            succeeded: false,
            // Our last known position, so the leader can retry further back.
            entry_position: self.log.latest_entry().map(|(_, position)| position),
            member: Some(self.my_member.clone()),
        }
    }

    // ------------------------------------------------------------------
    // AppendEntries, leader side
    // ------------------------------------------------------------------

    pub(crate) fn handle_append_reply_from_peer(&mut self, reply: AppendReplyFromPeer) {
        let logger = self.logger.new(slog::o!(
            "Peer" => format!("{:?}", reply.descriptor.member),
            "SeqNo" => reply.descriptor.seq_no,
        ));
        slog::debug!(logger, "Append reply from peer: {:?}", reply.result);

        if self.local_state.current_term() != reply.descriptor.term {
            slog::info!(
                logger,
                "Received append reply for outdated term {:?}, current term is {:?}",
                reply.descriptor.term,
                self.local_state.current_term()
            );
            return;
        }

        if self.election_state.leader_state_mut().is_none() {
            slog::info!(logger, "No longer leader");
            return;
        }

        // 1. Check for stale term rejection.
        let peer_log_update = match reply.result {
            Err(AppendReplyError::StaleTerm { new_term }) => {
                slog::warn!(logger, "Rejected by peer because my term is stale.");
                let increased = self.local_state.store_term_if_increased(new_term);
                if increased {
                    self.election_state.transition_to_follower(None);
                    self.fail_pending_configuration(MembershipChangeError::Superseded);
                    slog::info!(logger, "Transitioned to follower.");
                    return;
                } else {
                    slog::warn!(logger, "Peer reported stale term without incrementing ours. Treating as generic failure.");
                    PeerStateUpdate::OtherError
                }
            }
            Err(AppendReplyError::PeerMissingPreviousEntry { peer_last_position }) => {
                slog::info!(logger, "Peer is missing previous log entry");
                PeerStateUpdate::PeerLogBehind { peer_last_position }
            }
            Err(AppendReplyError::RetryableFailure(err_msg)) => {
                slog::error!(logger, "Append failure: {:?}", err_msg);
                PeerStateUpdate::OtherError
            }
            Ok(()) => PeerStateUpdate::Success {
                previous_entry: reply.descriptor.previous_entry_position,
                num_entries_replicated: reply.descriptor.num_entries,
            },
        };

        // 2. Update the peer's replication cursor.
        let leader_state = self
            .election_state
            .leader_state_mut()
            .expect("leader state checked above");
        let peer_state = match leader_state.peer_state_mut(&reply.descriptor.member) {
            None => {
                slog::warn!(logger, "Peer {:?} not tracked, ignoring reply", reply.descriptor.member);
                return;
            }
            Some(peer_state) => peer_state,
        };
        peer_state.handle_append_reply(&logger, reply.descriptor.seq_no, peer_log_update);
        let (next_position, _) = peer_state.next_and_previous_log_position();

        // 3. Check for majority replication and advance the commit position.
        // > If there exists an N such that N > commitIndex, a majority
        // > of matchIndex[i] >= N, and log[N].term == currentTerm:
        // > set commitIndex = N (§5.3, §5.4).
        let peers_matched: Vec<_> = leader_state.peers_iter().map(|peer| peer.matched()).collect();
        if let Some(tentative_commit_position) = Self::get_cluster_commit_position(peers_matched) {
            match self
                .log
                .ratchet_fwd_commit_position_if_valid(tentative_commit_position, self.local_state.current_term())
            {
                Ok(_) => {
                    let configurations = self.log.publish_committed_entries();
                    self.apply_committed_configurations(configurations);
                }
                Err(ioe) => slog::warn!(
                    logger,
                    "I/O failure while confirming new commit position {:?}: {:?}",
                    tentative_commit_position,
                    ioe
                ),
            }
        }

        // 4. Keep pushing if the peer still trails the log.
        // > If last log index >= nextIndex for a follower: send
        // > AppendEntries RPC with log entries starting at nextIndex
        let mut do_immediate_call = false;
        if let Some((_, last_log_position)) = self.log.latest_entry() {
            if last_log_position >= next_position {
                do_immediate_call = true;
            }
        }

        if do_immediate_call {
            let actor_client = self.actor_client.clone();
            let tick = HeartbeatTick {
                member: reply.descriptor.member,
                term: reply.descriptor.term,
            };
            tokio::task::spawn(async move {
                let _ = actor_client.heartbeat_timer(tick).await;
            });
        }
    }

    fn get_cluster_commit_position(mut peers_matched: Vec<Option<Position>>) -> Option<Position> {
        peers_matched.sort_by_key(|matched| match matched {
            None => 0u64,
            Some(m) => m.as_u64(),
        });

        // We are always at the tail of the array, because our log is same/longest:
        // add "me", compute majority, subtract "me", and take the i-th from the
        // right. Simplifies to the middle index. When in doubt, read the unit tests.
        let quorum_idx = peers_matched.len() / 2;

        peers_matched.remove(quorum_idx)
    }

    // ------------------------------------------------------------------
    // Heartbeat / replication driving
    // ------------------------------------------------------------------

    pub(crate) fn handle_heartbeat_timer(&mut self, input: HeartbeatTick) {
        let current_term = self.local_state.current_term();
        if current_term != input.term {
            slog::warn!(
                self.logger,
                "Received heartbeat tick for outdated term {:?}, current term: {:?}",
                input.term,
                current_term
            );
            return;
        }

        if !self.configuration.contains(&input.member) {
            slog::info!(self.logger, "Dropping heartbeat tick for removed member {:?}", input.member);
            return;
        }

        match self.try_handle_heartbeat_for_peer(input.member.clone(), current_term) {
            Ok(_) => {}
            Err(HandleHeartbeatError::NoLongerLeader) => {
                slog::info!(self.logger, "Received heartbeat tick but no longer leader.")
            }
            Err(HandleHeartbeatError::PeerConcurrencyThrottle) => {
                slog::debug!(self.logger, "Outstanding request to peer {:?}, skipping", input.member)
            }
            Err(HandleHeartbeatError::SnapshotInstallInFlight) => {
                slog::debug!(
                    self.logger,
                    "Snapshot transfer to {:?} in flight, append suspended",
                    input.member
                )
            }
            Err(HandleHeartbeatError::DiskRead(position, ioe)) => {
                slog::error!(self.logger, "Failed to read log entry at {:?}: {:?}", position, ioe);
            }
            Err(HandleHeartbeatError::LeaderStateMissingPeer) => {
                slog::error!(
                    self.logger,
                    "Peer {:?} is in the configuration but not tracked by leader state",
                    input.member,
                )
            }
        }
    }

    fn try_handle_heartbeat_for_peer(&mut self, member: Member, current_term: Term) -> Result<(), HandleHeartbeatError> {
        // Does this peer need a snapshot instead of log replay? Decide before
        // borrowing leader state mutably.
        let snapshot_bound = self.log.snapshot_bound();

        let leader_state = match self.election_state.leader_state_mut() {
            None => return Err(HandleHeartbeatError::NoLongerLeader),
            Some(leader_state) => leader_state,
        };
        let peer_state = leader_state
            .peer_state_mut(&member)
            .ok_or(HandleHeartbeatError::LeaderStateMissingPeer)?;

        if let ReplicationMode::InstallingSnapshot { .. } = peer_state.mode() {
            return Err(HandleHeartbeatError::SnapshotInstallInFlight);
        }

        let (next_position, _) = peer_state.next_and_previous_log_position();
        if let Some((_, snapshot_position)) = snapshot_bound {
            if next_position <= snapshot_position {
                // The entries this peer needs are compacted away. Hand the peer to
                // the snapshot transfer path and suspend AppendEntries until done.
                peer_state.begin_snapshot_install(snapshot_position);
                peer_state.reset_heartbeat_timer();

                slog::info!(
                    self.logger,
                    "Peer {:?} needs {:?} but log starts after snapshot {:?}; starting snapshot transfer",
                    member,
                    next_position,
                    snapshot_position,
                );

                let logger = self.logger.clone();
                let store = self.snapshot_store.clone();
                let transport = self.transport.clone();
                let actor_client = self.actor_client.clone();
                let target = member;
                tokio::task::spawn(async move {
                    let transferred = sender::transfer_snapshot_to_follower(
                        logger,
                        store,
                        transport,
                        target.clone(),
                    )
                    .await;
                    let _ = actor_client
                        .snapshot_transfer_completed(SnapshotTransferResult {
                            member: target,
                            term: current_term,
                            snapshot_position: transferred.unwrap_or(snapshot_position),
                            succeeded: transferred.is_some(),
                        })
                        .await;
                });
                return Ok(());
            }
        }

        // Simplicity vs throughput tradeoff: one outstanding request per peer, no
        // pipelining. Entries still flow back-to-back via the immediate re-send on
        // each reply.
        if peer_state.has_outstanding_request() {
            return Err(HandleHeartbeatError::PeerConcurrencyThrottle);
        }
        let seq_no = peer_state.next_seq_no();
        let (next_position, opt_previous_position) = peer_state.next_and_previous_log_position();

        let opt_previous_entry = match opt_previous_position {
            None => None,
            Some(previous_position) => match self.previous_entry_metadata(previous_position) {
                Ok(metadata) => Some(metadata),
                Err(e) => return Err(HandleHeartbeatError::DiskRead(previous_position, e)),
            },
        };

        let entry = match self.log.read(next_position) {
            Ok(Some(entry)) => Some(protocol::WireEntry {
                position: next_position,
                term: entry.term,
                payload: entry.payload.encode(),
            }),
            Ok(None) => None,
            Err(e) => return Err(HandleHeartbeatError::DiskRead(next_position, e)),
        };

        let descriptor = AppendReplyDescriptor {
            member: member.clone(),
            term: current_term,
            seq_no,
            previous_entry_position: opt_previous_entry.map(|(_, position)| position),
            num_entries: entry.iter().count(),
        };

        let request = protocol::AppendRequest {
            partition_id: self.partition_id,
            term: current_term,
            previous_entry_position: opt_previous_entry.map(|(_, position)| position),
            previous_entry_term: opt_previous_entry.map(|(term, _)| term),
            commit_position: self.log.commit_position(),
            leader: Some(self.my_member.clone()),
            entry,
        };

        tokio::task::spawn(Self::call_peer_append(
            self.logger.clone(),
            self.transport.clone(),
            member.clone(),
            request,
            self.append_timeout,
            self.actor_client.clone(),
            descriptor,
        ));

        let leader_state = self
            .election_state
            .leader_state_mut()
            .expect("leader state checked above");
        if let Some(peer_state) = leader_state.peer_state_mut(&member) {
            peer_state.reset_heartbeat_timer();
        }

        Ok(())
    }

    // Term/position of the entry right before what we're sending. Falls back to the
    // snapshot bound when the entry is compacted away.
    fn previous_entry_metadata(&self, previous_position: Position) -> Result<(Term, Position), io::Error> {
        if let Some(entry) = self.log.read(previous_position)? {
            return Ok((entry.term, previous_position));
        }

        if let Some((snapshot_term, snapshot_position)) = self.log.snapshot_bound() {
            if snapshot_position == previous_position {
                return Ok((snapshot_term, snapshot_position));
            }
        }

        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no entry at position {:?}", previous_position),
        ))
    }

    // ------------------------------------------------------------------
    // Election timeout
    // ------------------------------------------------------------------

    pub(crate) fn handle_election_timeout(&mut self) {
        if !self.configuration.contains(&self.my_member) {
            // Removed from the cluster; don't disrupt it with elections.
            return;
        }

        // Write-ahead style: vote for self in local state before transitioning.
        let new_term = self.local_state.increment_term_and_vote_for_self();
        self.election_state.transition_to_candidate_and_vote_for_self();
        self.fail_pending_configuration(MembershipChangeError::Superseded);
        slog::info!(
            self.logger,
            "Election timed out. Changed to candidate. Election state: {:?}",
            self.election_state,
        );

        for member in self.peer_members() {
            tokio::task::spawn(Self::call_peer_vote(
                self.logger.clone(),
                self.transport.clone(),
                member,
                self.new_vote_request(new_term),
                self.actor_client.clone(),
                new_term,
            ));
        }

        // Single-member cluster: our own vote is already a majority.
        self.become_leader_if_quorum(1, new_term);
    }

    fn new_vote_request(&self, term: Term) -> protocol::VoteRequest {
        let (last_entry_term, last_entry_position) = match self.log.latest_entry() {
            None => (None, None),
            Some((term, position)) => (Some(term), Some(position)),
        };

        protocol::VoteRequest {
            partition_id: self.partition_id,
            term,
            last_entry_position,
            last_entry_term,
            candidate: self.my_member.clone(),
        }
    }

    // ------------------------------------------------------------------
    // Membership change
    // ------------------------------------------------------------------

    pub(crate) fn handle_join(
        &mut self,
        input: JoinInput,
        responder: Callback<MembershipChangeOutput, MembershipChangeError>,
    ) {
        if let Err(e) = self.ensure_leader() {
            responder.send(Err(e));
            return;
        }

        let new_members = match self.configuration.with_member(input.member.clone()) {
            Some(members) => members,
            None => {
                responder.send(Err(MembershipChangeError::AlreadyMember(input.member)));
                return;
            }
        };

        self.propose_configuration(new_members, responder);
    }

    pub(crate) fn handle_leave(
        &mut self,
        input: LeaveInput,
        responder: Callback<MembershipChangeOutput, MembershipChangeError>,
    ) {
        if let Err(e) = self.ensure_leader() {
            responder.send(Err(e));
            return;
        }

        let new_members = match self.configuration.without_member(&input.member) {
            Some(members) => members,
            None => {
                responder.send(Err(MembershipChangeError::NotMember(input.member)));
                return;
            }
        };

        self.propose_configuration(new_members, responder);
    }

    fn ensure_leader(&self) -> Result<(), MembershipChangeError> {
        match self.election_state.current_leader() {
            CurrentLeader::Me => Ok(()),
            CurrentLeader::Other(leader) => Err(MembershipChangeError::NotLeader(Some(leader))),
            CurrentLeader::Unknown => Err(MembershipChangeError::NotLeader(None)),
        }
    }

    // Membership changes are linearized with data replication: the new member list
    // is itself a log entry, and takes effect for quorum computation only once that
    // entry commits (single-step switch-on-commit, no joint consensus).
    fn propose_configuration(
        &mut self,
        new_members: Vec<Member>,
        responder: Callback<MembershipChangeOutput, MembershipChangeError>,
    ) {
        if self.pending_configuration.is_some() {
            responder.send(Err(MembershipChangeError::ChangeInProgress));
            return;
        }

        let term = self.local_state.current_term();
        let position = match self.log.append(ReplicatedEntry {
            term,
            payload: EntryPayload::Configuration(new_members),
        }) {
            Ok(position) => position,
            Err(e) => {
                responder.send(Err(MembershipChangeError::LocalIoError(e)));
                return;
            }
        };

        slog::info!(self.logger, "Proposed configuration entry at {:?}", position);
        self.pending_configuration = Some(PendingConfiguration { position, responder });
        self.advance_commit_if_single_member();
    }

    /// A Configure broadcast from the current leader informing us of a committed
    /// membership change.
    pub(crate) fn handle_configure_request(&mut self, request: protocol::ConfigureRequest) -> protocol::ConfigureResponse {
        let current_term = self.local_state.current_term();
        if request.term < current_term {
            return protocol::ConfigureResponse { term: current_term };
        }

        let increased = self.local_state.store_term_if_increased(request.term);
        if increased {
            self.election_state.transition_to_follower(None);
            self.fail_pending_configuration(MembershipChangeError::Superseded);
        }
        let current_term = self.local_state.current_term();

        self.configuration.apply(
            request.members,
            request.configuration_entry_position,
            request.configuration_entry_term,
        );
        slog::info!(
            self.logger,
            "Adopted configuration from {:?}: {:?} members",
            request.configuration_entry_position,
            self.configuration.member_count(),
        );

        protocol::ConfigureResponse { term: current_term }
    }

    fn apply_committed_configurations(&mut self, configurations: Vec<CommittedConfiguration>) {
        for committed in configurations {
            self.configuration
                .apply(committed.members.clone(), committed.position, committed.term);
            slog::info!(
                self.logger,
                "Configuration committed at {:?}: {:?} members",
                committed.position,
                self.configuration.member_count(),
            );

            // Complete the caller that proposed this change.
            if matches!(&self.pending_configuration, Some(pending) if pending.position == committed.position) {
                let pending = self.pending_configuration.take().expect("matched above");
                pending.responder.send(Ok(MembershipChangeOutput {
                    term: self.local_state.current_term(),
                    configuration_entry_position: committed.position,
                    configuration_entry_term: committed.term,
                    members: committed.members.clone(),
                }));
            }

            if self.election_state.is_leader() {
                // Heartbeat timers for new peers must carry the current term, not
                // the (possibly older) term of the committed entry.
                let current_term = self.local_state.current_term();
                self.reconcile_leader_peers(current_term);
                self.broadcast_configuration(&committed);
            }
        }
    }

    fn reconcile_leader_peers(&mut self, term: Term) {
        let peers = self.peer_members();
        let previous_log_position = self.log.latest_entry().map(|(_, position)| position);

        // Build trackers only for genuinely new peers, before the tracker itself is
        // mutably borrowed.
        let existing = match self.election_state.leader_state_mut() {
            None => return,
            Some(leader_state) => leader_state.peer_ids(),
        };
        let mut new_states: std::collections::HashMap<Member, PeerState> = peers
            .iter()
            .filter(|member| !existing.contains(*member))
            .map(|member| {
                (
                    member.clone(),
                    self.election_state.new_peer_state(term, member, previous_log_position),
                )
            })
            .collect();

        if let Some(leader_state) = self.election_state.leader_state_mut() {
            leader_state.reconcile_peers(peers, |member| {
                new_states
                    .remove(member)
                    .expect("peer state prepared for every new member")
            });
        }
    }

    fn broadcast_configuration(&self, committed: &CommittedConfiguration) {
        let request = protocol::ConfigureRequest {
            partition_id: self.partition_id,
            term: self.local_state.current_term(),
            configuration_entry_position: committed.position,
            configuration_entry_term: committed.term,
            topic_name: self.topic_name.clone(),
            members: committed.members.clone(),
        };

        for member in self.peer_members() {
            let logger = self.logger.clone();
            let transport = self.transport.clone();
            let request = request.clone();
            tokio::task::spawn(async move {
                if let Err(e) = transport.configure(&member, request).await {
                    slog::info!(logger, "Configure broadcast to {:?} failed: {}", member, e);
                }
            });
        }
    }

    fn fail_pending_configuration(&mut self, error: MembershipChangeError) {
        if let Some(pending) = self.pending_configuration.take() {
            pending.responder.send(Err(error));
        }
    }

    // ------------------------------------------------------------------
    // Snapshot integration
    // ------------------------------------------------------------------

    /// A chunk arrived from the leader. Validation and disk writes run on the
    /// snapshot store actor; completion is reported back here and to the caller.
    pub(crate) fn handle_install_snapshot_chunk(
        &mut self,
        chunk: SnapshotChunk,
        responder: Callback<bool, SnapshotStoreError>,
    ) {
        if self.election_state.current_leader() == CurrentLeader::Me {
            slog::warn!(self.logger, "Ignoring snapshot chunk while leader: {:?}", chunk);
            responder.send(Ok(false));
            return;
        }

        self.election_state.reset_timeout_if_follower();

        let store = self.snapshot_store.clone();
        let actor_client = self.actor_client.clone();
        let logger = self.logger.clone();
        let is_final_chunk = chunk.chunk_ordinal == chunk.total_chunk_count;
        let snapshot_id = chunk.snapshot_id;

        tokio::task::spawn(async move {
            let result = async {
                let received = store.new_received_snapshot(snapshot_id).await?;
                let applied = store.apply_chunk(received, chunk).await?;

                if applied && is_final_chunk {
                    match store.persist_received(received).await {
                        Ok(persisted) => {
                            let _ = actor_client
                                .snapshot_installed(SnapshotInstalled {
                                    position: persisted.id.index,
                                    term: persisted.id.term,
                                })
                                .await;
                        }
                        Err(SnapshotStoreError::MissingChunks { id, applied, total }) => {
                            // Earlier chunks were rejected; the leader will retry.
                            slog::info!(logger, "Snapshot {:?} incomplete ({}/{})", id, applied, total);
                            return Ok(false);
                        }
                        Err(e) => return Err(e),
                    }
                }

                Ok(applied)
            }
            .await;

            responder.send(result);
        });
    }

    /// The received snapshot was persisted; adopt it as the new log base.
    pub(crate) fn handle_snapshot_installed(&mut self, installed: SnapshotInstalled) {
        slog::info!(
            self.logger,
            "Installed snapshot at {:?} (term {:?}); resetting log",
            installed.position,
            installed.term,
        );
        self.log.reset_to_snapshot(installed.term, installed.position);
        self.election_state.reset_timeout_if_follower();
    }

    /// Leader-side transfer to one follower finished (or failed).
    pub(crate) fn handle_snapshot_transfer_completed(&mut self, result: SnapshotTransferResult) {
        if self.local_state.current_term() != result.term {
            slog::info!(self.logger, "Ignoring snapshot transfer result for old term {:?}", result.term);
            return;
        }

        let leader_state = match self.election_state.leader_state_mut() {
            None => return,
            Some(leader_state) => leader_state,
        };
        let peer_state = match leader_state.peer_state_mut(&result.member) {
            None => return,
            Some(peer_state) => peer_state,
        };

        slog::info!(
            self.logger,
            "Snapshot transfer to {:?} {} at {:?}",
            result.member,
            if result.succeeded { "completed" } else { "failed" },
            result.snapshot_position,
        );
        peer_state.finish_snapshot_install(result.succeeded, result.snapshot_position);

        if result.succeeded {
            // Resume AppendEntries right after the snapshot.
            let actor_client = self.actor_client.clone();
            let tick = HeartbeatTick {
                member: result.member,
                term: result.term,
            };
            tokio::task::spawn(async move {
                let _ = actor_client.heartbeat_timer(tick).await;
            });
        }
    }

    // ------------------------------------------------------------------
    // Shared helpers
    // ------------------------------------------------------------------

    fn peer_members(&self) -> HashSet<Member> {
        self.configuration
            .members()
            .iter()
            .filter(|m| **m != self.my_member)
            .cloned()
            .collect()
    }

    fn advance_commit_if_single_member(&mut self) {
        if self.configuration.member_count() != 1 {
            return;
        }

        if let Some((_, latest_position)) = self.log.latest_entry() {
            if let Err(e) = self
                .log
                .ratchet_fwd_commit_position_if_valid(latest_position, self.local_state.current_term())
            {
                slog::warn!(self.logger, "I/O failure while committing as sole member: {:?}", e);
                return;
            }
            let configurations = self.log.publish_committed_entries();
            self.apply_committed_configurations(configurations);
        }
    }

    async fn call_peer_vote(
        logger: slog::Logger,
        transport: Arc<dyn PeerTransport>,
        target: Member,
        request: protocol::VoteRequest,
        callback: WeakActorClient,
        term: Term,
    ) {
        slog::debug!(logger, "ClientWire - {:?}", request);
        let reply = transport.vote(&target, request).await;
        slog::debug!(logger, "ClientWire - {:?}", reply);

        let result = match reply {
            Ok(response) => {
                if response.granted {
                    VoteResult::Granted
                } else {
                    VoteResult::NotGranted
                }
            }
            Err(e) => {
                slog::warn!(logger, "Vote call to {:?} failed: {}", target, e);
                VoteResult::RetryableFailure
            }
        };

        let _ = callback
            .vote_reply_from_peer(VoteReplyFromPeer {
                member: target,
                term,
                result,
            })
            .await;
    }

    async fn call_peer_append(
        logger: slog::Logger,
        transport: Arc<dyn PeerTransport>,
        target: Member,
        request: protocol::AppendRequest,
        rpc_timeout: Duration,
        callback: WeakActorClient,
        descriptor: AppendReplyDescriptor,
    ) {
        slog::debug!(logger, "ClientWire - {:?}", request);
        let request_term = request.term;
        let reply = tokio::time::timeout(rpc_timeout, transport.append(&target, request)).await;
        slog::debug!(logger, "ClientWire - {:?}", reply);

        let result = match reply {
            Ok(Ok(response)) => {
                if response.succeeded {
                    Ok(())
                } else if response.term > request_term {
                    Err(AppendReplyError::StaleTerm {
                        new_term: response.term,
                    })
                } else {
                    Err(AppendReplyError::PeerMissingPreviousEntry {
                        peer_last_position: response.entry_position,
                    })
                }
            }
            Ok(Err(e)) => Err(AppendReplyError::RetryableFailure(format!(
                "Append call failed: {}",
                e
            ))),
            Err(_timeout) => Err(AppendReplyError::RetryableFailure("Timed out calling append".into())),
        };

        let _ = callback
            .append_reply_from_peer(AppendReplyFromPeer { descriptor, result })
            .await;
    }
}

enum HandleHeartbeatError {
    NoLongerLeader,
    PeerConcurrencyThrottle,
    SnapshotInstallInFlight,
    DiskRead(Position, io::Error),
    LeaderStateMissingPeer,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{ActorClient, Event};
    use crate::consensus::commit_stream::{self, CommitStream};
    use crate::consensus::local_state::VolatileLocalState;
    use crate::consensus::log::InMemoryLogStorage;
    use crate::snapshot::{SnapshotId, SnapshotStore};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tokio::sync::{mpsc, oneshot};

    type Repl = Replica<InMemoryLogStorage, VolatileLocalState>;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn member(host: &str) -> Member {
        Member::new(host.to_string(), 26502)
    }

    // Transport double: votes are granted, appends succeed or get rejected per the
    // `reject_appends` switch, snapshot chunks are recorded and acked.
    struct MockTransport {
        reject_appends: AtomicBool,
        append_calls: Mutex<Vec<protocol::AppendRequest>>,
        configure_calls: Mutex<Vec<protocol::ConfigureRequest>>,
        chunks_sent: Mutex<Vec<SnapshotChunk>>,
    }

    impl MockTransport {
        fn new() -> Arc<Self> {
            Arc::new(MockTransport {
                reject_appends: AtomicBool::new(false),
                append_calls: Mutex::new(Vec::new()),
                configure_calls: Mutex::new(Vec::new()),
                chunks_sent: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl PeerTransport for MockTransport {
        async fn vote(
            &self,
            _target: &Member,
            request: protocol::VoteRequest,
        ) -> Result<protocol::VoteResponse, crate::consensus::transport::TransportError> {
            Ok(protocol::VoteResponse {
                term: request.term,
                granted: true,
            })
        }

        async fn poll(
            &self,
            _target: &Member,
            request: protocol::PollRequest,
        ) -> Result<protocol::PollResponse, crate::consensus::transport::TransportError> {
            Ok(protocol::PollResponse {
                term: request.term,
                granted: false,
            })
        }

        async fn append(
            &self,
            _target: &Member,
            request: protocol::AppendRequest,
        ) -> Result<protocol::AppendResponse, crate::consensus::transport::TransportError> {
            let reject = self.reject_appends.load(Ordering::Acquire);
            let response = protocol::AppendResponse {
                partition_id: request.partition_id,
                term: request.term,
                succeeded: !reject,
                entry_position: if reject {
                    None
                } else {
                    request.entry.as_ref().map(|e| e.position)
                },
                member: None,
            };
            self.append_calls.lock().unwrap().push(request);
            Ok(response)
        }

        async fn configure(
            &self,
            _target: &Member,
            request: protocol::ConfigureRequest,
        ) -> Result<protocol::ConfigureResponse, crate::consensus::transport::TransportError> {
            let term = request.term;
            self.configure_calls.lock().unwrap().push(request);
            Ok(protocol::ConfigureResponse { term })
        }

        async fn install_snapshot_chunk(
            &self,
            _target: &Member,
            chunk: SnapshotChunk,
        ) -> Result<bool, crate::consensus::transport::TransportError> {
            self.chunks_sent.lock().unwrap().push(chunk);
            Ok(true)
        }
    }

    struct Harness {
        replica: Repl,
        events: mpsc::Receiver<Event>,
        transport: Arc<MockTransport>,
        commit_stream: CommitStream,
        // Keeps the actor channel (and thus the weak client) alive.
        _actor_client: ActorClient,
        _snapshot_root: tempfile::TempDir,
    }

    async fn harness(members: Vec<Member>) -> Harness {
        harness_with_store(members, |_store| {}).await
    }

    async fn harness_with_store(members: Vec<Member>, prepare_store: impl FnOnce(&mut SnapshotStore)) -> Harness {
        let snapshot_root = tempfile::tempdir().unwrap();
        let mut store = SnapshotStore::open(test_logger(), snapshot_root.path()).unwrap();
        prepare_store(&mut store);
        let snapshot_store = SnapshotStoreClient::spawn(store);

        let (actor_client, events) = ActorClient::new(64);
        let (commit_publisher, commit_stream) = commit_stream::new();
        let transport = MockTransport::new();

        let (replica, _role_listener) = Replica::new(ReplicaConfig {
            logger: test_logger(),
            partition_id: 1,
            topic_name: "orders".to_string(),
            my_member: member("me"),
            cluster_members: members,
            log_storage: InMemoryLogStorage::new(),
            local_state: VolatileLocalState::new(member("me")),
            commit_stream_publisher: commit_publisher,
            transport: transport.clone(),
            snapshot_store,
            actor_client: actor_client.weak(),
            // Huge timeouts: tests drive every transition by hand.
            leader_heartbeat_duration: Duration::from_secs(60),
            election_min_timeout: Duration::from_secs(300),
            election_max_timeout: Duration::from_secs(600),
            append_timeout: Duration::from_secs(5),
        });

        Harness {
            replica,
            events,
            transport,
            commit_stream,
            _actor_client: actor_client,
            _snapshot_root: snapshot_root,
        }
    }

    fn dispatch(replica: &mut Repl, event: Event) {
        match event {
            Event::VoteReplyFromPeer(reply) => replica.handle_vote_reply_from_peer(reply),
            Event::AppendReplyFromPeer(reply) => replica.handle_append_reply_from_peer(reply),
            Event::HeartbeatTimer(tick) => replica.handle_heartbeat_timer(tick),
            Event::SnapshotTransferCompleted(result) => replica.handle_snapshot_transfer_completed(result),
            Event::SnapshotInstalled(installed) => replica.handle_snapshot_installed(installed),
            Event::ElectionTimeout => replica.handle_election_timeout(),
            other => panic!("unexpected event in test: {:?}", other),
        }
    }

    /// Pump actor events into the replica until `done` holds.
    async fn pump_until(replica: &mut Repl, events: &mut mpsc::Receiver<Event>, mut done: impl FnMut(&Repl) -> bool) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !done(replica) {
                let event = events.recv().await.expect("event channel closed");
                dispatch(replica, event);
            }
        })
        .await
        .expect("test timed out pumping events");
    }

    fn vote_request(candidate: Member, term: u64, last: Option<(u64, u64)>) -> protocol::VoteRequest {
        protocol::VoteRequest {
            partition_id: 1,
            term: Term::new(term),
            last_entry_position: last.map(|(_, p)| Position::new(p)),
            last_entry_term: last.map(|(t, _)| Term::new(t)),
            candidate,
        }
    }

    fn heartbeat(term: u64, prev: Option<(u64, u64)>, commit: Option<u64>) -> protocol::AppendRequest {
        protocol::AppendRequest {
            partition_id: 1,
            term: Term::new(term),
            previous_entry_position: prev.map(|(_, p)| Position::new(p)),
            previous_entry_term: prev.map(|(t, _)| Term::new(t)),
            commit_position: commit.map(Position::new),
            leader: Some(member("leader")),
            entry: None,
        }
    }

    fn entry_request(term: u64, prev: Option<(u64, u64)>, position: u64, payload: &'static [u8]) -> protocol::AppendRequest {
        protocol::AppendRequest {
            partition_id: 1,
            term: Term::new(term),
            previous_entry_position: prev.map(|(_, p)| Position::new(p)),
            previous_entry_term: prev.map(|(t, _)| Term::new(t)),
            commit_position: None,
            leader: Some(member("leader")),
            entry: Some(protocol::WireEntry {
                position: Position::new(position),
                term: Term::new(term),
                payload: EntryPayload::Data(Bytes::from_static(payload)).encode(),
            }),
        }
    }

    async fn become_leader(harness: &mut Harness) -> Term {
        harness.replica.handle_election_timeout();
        pump_until(&mut harness.replica, &mut harness.events, |replica| {
            replica.election_state.is_leader()
        })
        .await;
        harness.replica.local_state.current_term()
    }

    #[tokio::test]
    async fn grants_at_most_one_vote_per_term() {
        let mut harness = harness(vec![member("me"), member("a"), member("b")]).await;

        let first = harness.replica.handle_vote_request(vote_request(member("a"), 1, None));
        assert!(first.granted);

        // Different candidate, same term: denied.
        let second = harness.replica.handle_vote_request(vote_request(member("b"), 1, None));
        assert!(!second.granted);
        assert_eq!(second.term, Term::new(1));

        // Same candidate retrying the same term: still granted.
        let retry = harness.replica.handle_vote_request(vote_request(member("a"), 1, None));
        assert!(retry.granted);

        // Higher term clears the vote.
        let next_term = harness.replica.handle_vote_request(vote_request(member("b"), 2, None));
        assert!(next_term.granted);
    }

    #[tokio::test]
    async fn vote_denied_to_unknown_member_and_stale_term() {
        let mut harness = harness(vec![member("me"), member("a")]).await;

        let stranger = harness.replica.handle_vote_request(vote_request(member("zzz"), 5, None));
        assert!(!stranger.granted);

        // Get our term up to 3.
        harness.replica.handle_vote_request(vote_request(member("a"), 3, None));

        let stale = harness.replica.handle_vote_request(vote_request(member("a"), 2, None));
        assert!(!stale.granted);
        assert_eq!(stale.term, Term::new(3));
    }

    #[tokio::test]
    async fn vote_denied_for_out_of_date_log() {
        let mut harness = harness(vec![member("me"), member("a")]).await;

        // Our log: one entry at term 2.
        harness
            .replica
            .handle_append_request(entry_request(2, None, 1, b"x"));

        // Candidate with older last-entry term loses, despite the higher term.
        let older_term = harness
            .replica
            .handle_vote_request(vote_request(member("a"), 3, Some((1, 5))));
        assert!(!older_term.granted);

        // Same last term but shorter log loses too.
        let shorter = harness
            .replica
            .handle_vote_request(vote_request(member("a"), 4, None));
        assert!(!shorter.granted);

        // Same last term, same length: grant.
        let equal = harness
            .replica
            .handle_vote_request(vote_request(member("a"), 5, Some((2, 1))));
        assert!(equal.granted);
    }

    #[tokio::test]
    async fn split_vote_cannot_elect_two_leaders_per_term() {
        // Both of a 2-member cluster time out simultaneously: each votes for itself
        // at term 1, so neither grants the other's request for term 1.
        let mut harness = harness(vec![member("me"), member("a")]).await;

        harness.replica.handle_election_timeout();
        assert_eq!(harness.replica.local_state.current_term(), Term::new(1));

        let response = harness.replica.handle_vote_request(vote_request(member("a"), 1, None));
        assert!(!response.granted);
    }

    #[tokio::test]
    async fn poll_has_no_side_effects() {
        let mut harness = harness(vec![member("me"), member("a")]).await;

        let poll = protocol::PollRequest {
            partition_id: 1,
            term: Term::new(7),
            last_entry_position: None,
            last_entry_term: None,
            candidate: member("a"),
            topic_name: "orders".to_string(),
        };
        let response = harness.replica.handle_poll_request(poll);

        // Granted (log is up to date), but term and vote state are untouched.
        assert!(response.granted);
        assert_eq!(response.term, Term::new(0));
        assert_eq!(harness.replica.local_state.current_term(), Term::new(0));
        assert_eq!(harness.replica.local_state.voted_for_current_term().1, None);
    }

    #[tokio::test]
    async fn append_with_missing_previous_entry_leaves_log_unchanged() {
        let mut harness = harness(vec![member("me"), member("a")]).await;

        harness.replica.handle_append_request(entry_request(1, None, 1, b"x"));
        let before = harness.replica.log.latest_entry();

        // Previous entry (term 1, position 9) does not exist locally.
        let response = harness
            .replica
            .handle_append_request(entry_request(1, Some((1, 9)), 10, b"y"));

        assert!(!response.succeeded);
        assert_eq!(response.entry_position, Some(Position::new(1)));
        assert_eq!(harness.replica.log.latest_entry(), before);
        assert_eq!(harness.replica.log.next_position(), Position::new(2));
    }

    #[tokio::test]
    async fn append_with_mismatched_previous_term_is_rejected() {
        let mut harness = harness(vec![member("me"), member("a")]).await;

        harness.replica.handle_append_request(entry_request(1, None, 1, b"x"));

        let response = harness
            .replica
            .handle_append_request(entry_request(2, Some((2, 1)), 2, b"y"));

        assert!(!response.succeeded);
        assert_eq!(harness.replica.log.next_position(), Position::new(2));
    }

    #[tokio::test]
    async fn append_from_stale_leader_is_rejected() {
        let mut harness = harness(vec![member("me"), member("a")]).await;

        // Move to term 3 via a vote.
        harness.replica.handle_vote_request(vote_request(member("a"), 3, None));

        let response = harness.replica.handle_append_request(heartbeat(2, None, None));
        assert!(!response.succeeded);
        assert_eq!(response.term, Term::new(3));
    }

    #[tokio::test]
    async fn appends_replicate_and_commit_on_follower() {
        let mut harness = harness(vec![member("me"), member("a")]).await;

        let first = harness.replica.handle_append_request(entry_request(1, None, 1, b"one"));
        assert!(first.succeeded);
        let second = harness
            .replica
            .handle_append_request(entry_request(1, Some((1, 1)), 2, b"two"));
        assert!(second.succeeded);

        // Leader advertises commit up to 2.
        let heartbeat_response = harness
            .replica
            .handle_append_request(heartbeat(1, Some((1, 2)), Some(2)));
        assert!(heartbeat_response.succeeded);

        let committed = harness.commit_stream.try_recv().expect("first commit");
        assert_eq!(committed.position, Position::new(1));
        assert_eq!(committed.payload, Bytes::from_static(b"one"));
        let committed = harness.commit_stream.try_recv().expect("second commit");
        assert_eq!(committed.position, Position::new(2));
    }

    #[tokio::test]
    async fn conflicting_suffix_is_truncated_before_append() {
        let mut harness = harness(vec![member("me"), member("a")]).await;

        harness.replica.handle_append_request(entry_request(1, None, 1, b"a1"));
        harness
            .replica
            .handle_append_request(entry_request(1, Some((1, 1)), 2, b"a2"));

        // New leader at term 2 overwrites position 2.
        let response = harness
            .replica
            .handle_append_request(entry_request(2, Some((1, 1)), 2, b"b2"));
        assert!(response.succeeded);

        let entry = harness.replica.log.read(Position::new(2)).unwrap().unwrap();
        assert_eq!(entry.term, Term::new(2));
        assert_eq!(entry.payload, EntryPayload::Data(Bytes::from_static(b"b2")));
        assert_eq!(harness.replica.log.next_position(), Position::new(3));
    }

    #[tokio::test]
    async fn candidate_becomes_leader_on_majority_and_serves_writes() {
        let mut harness = harness(vec![member("me"), member("a"), member("b")]).await;

        let term = become_leader(&mut harness).await;
        assert_eq!(term, Term::new(1));

        // Position 1 is the leadership-assertion configuration entry.
        let output = harness
            .replica
            .handle_start_replication(StartReplicationInput {
                data: Bytes::from_static(b"payload"),
            })
            .expect("leader must accept writes");
        assert_eq!(output.term, Term::new(1));
        assert_eq!(output.position, Position::new(2));
    }

    #[tokio::test]
    async fn non_leader_redirects_writes() {
        let mut harness = harness(vec![member("me"), member("a")]).await;

        // No leader yet.
        match harness.replica.handle_start_replication(StartReplicationInput {
            data: Bytes::from_static(b"payload"),
        }) {
            Err(StartReplicationError::NoLeader) => {}
            other => panic!("expected NoLeader, got {:?}", other),
        }

        // A leader introduces itself.
        harness.replica.handle_append_request(heartbeat(1, None, None));
        match harness.replica.handle_start_replication(StartReplicationInput {
            data: Bytes::from_static(b"payload"),
        }) {
            Err(StartReplicationError::LeaderRedirect(leader)) => assert_eq!(leader, member("leader")),
            other => panic!("expected redirect, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn join_commits_new_configuration_and_broadcasts_it() {
        let mut harness = harness(vec![member("me"), member("a"), member("b")]).await;
        become_leader(&mut harness).await;

        let (tx, mut join_result) = oneshot::channel();
        harness.replica.handle_join(
            JoinInput {
                member: member("new"),
            },
            Callback::new(tx),
        );

        // Pump replication until the configuration entry commits and the join
        // completes.
        pump_until(&mut harness.replica, &mut harness.events, |replica| {
            replica.configuration.member_count() == 4
        })
        .await;

        let output = join_result.try_recv().expect("join must have completed").unwrap();
        assert_eq!(output.members.len(), 4);
        assert!(output.members.contains(&member("new")));
        assert_eq!(harness.replica.configuration.quorum(), 3);

        // Followers were informed of the committed configuration.
        assert!(!harness.transport.configure_calls.lock().unwrap().is_empty());

        // Configuration entries never reach the commit stream.
        assert!(harness.commit_stream.try_recv().is_none());
    }

    #[tokio::test]
    async fn join_rejected_while_another_change_pending() {
        let mut harness = harness(vec![member("me"), member("a"), member("b")]).await;
        become_leader(&mut harness).await;

        let (tx1, _keep1) = oneshot::channel();
        harness.replica.handle_join(
            JoinInput {
                member: member("n1"),
            },
            Callback::new(tx1),
        );

        let (tx2, mut second_result) = oneshot::channel();
        harness.replica.handle_join(
            JoinInput {
                member: member("n2"),
            },
            Callback::new(tx2),
        );

        match second_result.try_recv().unwrap() {
            Err(MembershipChangeError::ChangeInProgress) => {}
            other => panic!("expected ChangeInProgress, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn leave_of_unknown_member_is_rejected() {
        let mut harness = harness(vec![member("me"), member("a")]).await;
        become_leader(&mut harness).await;

        let (tx, mut result) = oneshot::channel();
        harness.replica.handle_leave(
            LeaveInput {
                member: member("stranger"),
            },
            Callback::new(tx),
        );

        match result.try_recv().unwrap() {
            Err(MembershipChangeError::NotMember(m)) => assert_eq!(m, member("stranger")),
            other => panic!("expected NotMember, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn configure_request_adopts_committed_membership() {
        let mut harness = harness(vec![member("me"), member("a")]).await;

        let response = harness.replica.handle_configure_request(protocol::ConfigureRequest {
            partition_id: 1,
            term: Term::new(2),
            configuration_entry_position: Position::new(4),
            configuration_entry_term: Term::new(2),
            topic_name: "orders".to_string(),
            members: vec![member("me"), member("a"), member("c")],
        });

        assert_eq!(response.term, Term::new(2));
        assert_eq!(harness.replica.configuration.member_count(), 3);
        assert!(harness.replica.configuration.contains(&member("c")));
        assert_eq!(
            harness.replica.configuration.log_position(),
            Some(Position::new(4))
        );
    }

    #[tokio::test]
    async fn lagging_follower_is_caught_up_via_snapshot_transfer() {
        let snapshot_id = SnapshotId::new(Position::new(5), Term::new(0), 50, 50);
        let mut harness = harness_with_store(vec![member("me"), member("a")], |store| {
            let transient = store.new_transient_snapshot(snapshot_id).unwrap();
            store
                .take_transient(transient, |dir| {
                    std::fs::write(dir.join("state"), b"compacted-state")?;
                    std::fs::write(dir.join("manifest"), b"{}")
                })
                .unwrap();
            store.persist_transient(transient).unwrap();
        })
        .await;

        // Local log: entries 1..=5, committed and compacted into the snapshot.
        for i in 1..=5u64 {
            harness
                .replica
                .log
                .append(ReplicatedEntry {
                    term: Term::new(0),
                    payload: EntryPayload::Data(Bytes::from_static(b"old")),
                })
                .unwrap();
            assert_eq!(harness.replica.log.next_position(), Position::new(i + 1));
        }
        harness.replica.log.ratchet_fwd_commit_position_if_changed(Position::new(5));
        harness.replica.log.compact_up_to(Term::new(0), Position::new(5));

        become_leader(&mut harness).await;

        // The peer rejects the first append because its log is empty; the leader
        // rewinds to the start of the log, discovers it is compacted away, and
        // switches the peer to the snapshot transfer path.
        harness.transport.reject_appends.store(true, Ordering::Release);

        let transport = harness.transport.clone();
        pump_until(&mut harness.replica, &mut harness.events, move |_| {
            transport.chunks_sent.lock().unwrap().len() == 2
        })
        .await;

        {
            let chunks = harness.transport.chunks_sent.lock().unwrap();
            assert!(chunks.iter().all(|c| c.snapshot_id == snapshot_id));
            assert!(chunks.iter().all(|c| c.total_chunk_count == 2));
            let names: Vec<&str> = chunks.iter().map(|c| c.chunk_name.as_str()).collect();
            assert_eq!(names, vec!["manifest", "state"]);
        }

        // Once the transfer completes, AppendEntries resumes right after the
        // snapshot: previous entry is the snapshot bound (term 0, position 5).
        harness.transport.reject_appends.store(false, Ordering::Release);
        let baseline = harness.transport.append_calls.lock().unwrap().len();
        let transport = harness.transport.clone();
        pump_until(&mut harness.replica, &mut harness.events, move |_| {
            transport
                .append_calls
                .lock()
                .unwrap()
                .iter()
                .skip(baseline)
                .any(|request| {
                    request.previous_entry_position == Some(Position::new(5))
                        && matches!(&request.entry, Some(entry) if entry.position == Position::new(6))
                })
        })
        .await;
    }
}
