use crate::cluster::Member;
use crate::consensus::{Position, Term};
use bytes::Bytes;

/// The fixed set of consensus RPC messages carried on the wire.
///
/// These are owned value structs produced by `decode()` and consumed by `encode()`.
/// Scratch buffers are an implementation detail of the codec, never shared state.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    VoteRequest(VoteRequest),
    VoteResponse(VoteResponse),
    PollRequest(PollRequest),
    PollResponse(PollResponse),
    AppendRequest(AppendRequest),
    AppendResponse(AppendResponse),
    ConfigureRequest(ConfigureRequest),
    ConfigureResponse(ConfigureResponse),
    JoinRequest(JoinRequest),
    LeaveResponse(LeaveResponse),
}

#[derive(Debug, Clone, PartialEq)]
pub struct VoteRequest {
    pub partition_id: u16,
    pub term: Term,
    pub last_entry_position: Option<Position>,
    pub last_entry_term: Option<Term>,
    pub candidate: Member,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VoteResponse {
    pub term: Term,
    pub granted: bool,
}

/// Pre-vote probe. Same log comparison as [VoteRequest], but answering it must not
/// mutate term or vote state on the receiver.
#[derive(Debug, Clone, PartialEq)]
pub struct PollRequest {
    pub partition_id: u16,
    pub term: Term,
    pub last_entry_position: Option<Position>,
    pub last_entry_term: Option<Term>,
    pub candidate: Member,
    pub topic_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollResponse {
    pub term: Term,
    pub granted: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppendRequest {
    pub partition_id: u16,
    pub term: Term,
    pub previous_entry_position: Option<Position>,
    pub previous_entry_term: Option<Term>,
    pub commit_position: Option<Position>,
    /// Absent while a fresh leader hasn't introduced itself yet; encoded as a
    /// zero-length host.
    pub leader: Option<Member>,
    /// Absent for pure heartbeats. Presence is signaled by the entry position field,
    /// not by payload length (an entry may legitimately carry an empty payload).
    pub entry: Option<WireEntry>,
}

/// One replicated log entry as it travels inside an [AppendRequest].
#[derive(Debug, Clone, PartialEq)]
pub struct WireEntry {
    pub position: Position,
    pub term: Term,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppendResponse {
    pub partition_id: u16,
    pub term: Term,
    pub succeeded: bool,
    /// On success: the confirmed entry position. On rejection: the responder's last
    /// known position so the leader can retry further back. Absent when the
    /// responder's log is empty.
    pub entry_position: Option<Position>,
    /// Responding member's endpoint, so responses arriving over a connectionless
    /// transport can be attributed.
    pub member: Option<Member>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigureRequest {
    pub partition_id: u16,
    pub term: Term,
    pub configuration_entry_position: Position,
    pub configuration_entry_term: Term,
    pub topic_name: String,
    pub members: Vec<Member>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigureResponse {
    pub term: Term,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinRequest {
    pub partition_id: u16,
    pub member: Member,
    pub topic_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LeaveResponse {
    pub term: Term,
    pub succeeded: bool,
    pub configuration_entry_position: Option<Position>,
    pub configuration_entry_term: Option<Term>,
    pub members: Vec<Member>,
}
