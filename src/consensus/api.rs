use crate::cluster::Member;
use crate::consensus::local_state::Term;
use crate::consensus::log::Position;
use bytes::Bytes;
use std::io;

/// The replica actor's event loop is gone; nothing can be submitted any more.
#[derive(Debug, thiserror::Error)]
#[error("replica actor is dead")]
pub struct ActorExited;

#[derive(Debug)]
pub struct StartReplicationInput {
    pub data: Bytes,
}

#[derive(Debug, PartialEq)]
pub struct StartReplicationOutput {
    pub term: Term,
    pub position: Position,
}

#[derive(Debug, thiserror::Error)]
pub enum StartReplicationError {
    #[error("not leader, redirect to {0:?}")]
    LeaderRedirect(Member),

    // Can be retried with backoff; an election is likely in progress.
    #[error("no leader for this partition")]
    NoLeader,

    #[error("failed to persist log entry")]
    LocalIoError(io::Error),

    #[error("replica actor is dead")]
    ActorExited,
}

#[derive(Debug)]
pub struct JoinInput {
    pub member: Member,
}

#[derive(Debug)]
pub struct LeaveInput {
    pub member: Member,
}

/// Outcome of a committed membership change. Carries everything the serving layer
/// needs to build a LeaveResponse or answer a joining member.
#[derive(Debug)]
pub struct MembershipChangeOutput {
    pub term: Term,
    pub configuration_entry_position: Position,
    pub configuration_entry_term: Term,
    pub members: Vec<Member>,
}

#[derive(Debug, thiserror::Error)]
pub enum MembershipChangeError {
    #[error("not leader, redirect to {0:?}")]
    NotLeader(Option<Member>),

    #[error("{0:?} is already a member")]
    AlreadyMember(Member),

    #[error("{0:?} is not a member")]
    NotMember(Member),

    // One membership change at a time; the previous Configure entry must commit
    // before the next can be proposed.
    #[error("another membership change is in progress")]
    ChangeInProgress,

    #[error("membership change was superseded before commit")]
    Superseded,

    #[error("failed to persist configuration entry")]
    LocalIoError(io::Error),

    #[error("replica actor is dead")]
    ActorExited,
}

#[derive(Debug)]
pub struct VoteReplyFromPeer {
    pub member: Member,
    pub term: Term,
    pub result: VoteResult,
}

#[derive(Debug)]
pub enum VoteResult {
    Granted,
    NotGranted,
    RetryableFailure,
    MalformedReply,
}

#[derive(Debug)]
pub struct AppendReplyFromPeer {
    pub descriptor: AppendReplyDescriptor,
    pub result: Result<(), AppendReplyError>,
}

// Info about the original request the reply belongs to.
#[derive(Debug)]
pub struct AppendReplyDescriptor {
    pub member: Member,
    pub term: Term,
    pub seq_no: u64,
    pub previous_entry_position: Option<Position>,
    pub num_entries: usize,
}

#[derive(Debug)]
pub enum AppendReplyError {
    StaleTerm { new_term: Term },
    PeerMissingPreviousEntry { peer_last_position: Option<Position> },
    RetryableFailure(String),
}

/// One tick of a leader's per-peer heartbeat timer.
#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatTick {
    pub member: Member,
    pub term: Term,
}

/// Completion of a leader-side chunked snapshot transfer to one follower.
#[derive(Debug)]
pub struct SnapshotTransferResult {
    pub member: Member,
    pub term: Term,
    pub snapshot_position: Position,
    pub succeeded: bool,
}

/// Follower-side notification that a received snapshot was persisted and the log was
/// reset to it.
#[derive(Debug)]
pub struct SnapshotInstalled {
    pub position: Position,
    pub term: Term,
}
