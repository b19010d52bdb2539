mod actor;
mod api;
mod cluster;
mod consensus;
mod protocol;
mod snapshot;

pub use actor::ActorClient;
pub use api::try_create_replication_client;
pub use api::ClientCreationError;
pub use api::ReplicationClient;
pub use api::ReplicationClientConfig;
pub use api::ReplicationOptions;
pub use cluster::ClusterConfiguration;
pub use cluster::Member;
pub use consensus::ActorExited;
pub use consensus::CommitStream;
pub use consensus::CommittedEntry;
pub use consensus::EntryPayload;
pub use consensus::InMemoryLogStorage;
pub use consensus::JoinInput;
pub use consensus::LeaveInput;
pub use consensus::LogStorage;
pub use consensus::MembershipChangeError;
pub use consensus::MembershipChangeOutput;
pub use consensus::PeerTransport;
pub use consensus::PersistentLocalState;
pub use consensus::Position;
pub use consensus::ReplicatedEntry;
pub use consensus::RoleChangeListener;
pub use consensus::RoleSnapshot;
pub use consensus::StartReplicationError;
pub use consensus::StartReplicationInput;
pub use consensus::StartReplicationOutput;
pub use consensus::Term;
pub use consensus::TransportError;
pub use consensus::VolatileLocalState;
pub use protocol::decode;
pub use protocol::decode_membership;
pub use protocol::encode;
pub use protocol::encode_membership;
pub use protocol::AppendRequest;
pub use protocol::AppendResponse;
pub use protocol::ConfigureRequest;
pub use protocol::ConfigureResponse;
pub use protocol::DecodeError;
pub use protocol::JoinRequest;
pub use protocol::LeaveResponse;
pub use protocol::Message;
pub use protocol::MessageHeader;
pub use protocol::PollRequest;
pub use protocol::PollResponse;
pub use protocol::VoteRequest;
pub use protocol::VoteResponse;
pub use protocol::WireEntry;
pub use snapshot::content_checksum;
pub use snapshot::InvalidSnapshotId;
pub use snapshot::PersistedSnapshot;
pub use snapshot::ReceivedSnapshot;
pub use snapshot::Reservation;
pub use snapshot::SnapshotChunk;
pub use snapshot::SnapshotId;
pub use snapshot::SnapshotListener;
pub use snapshot::SnapshotStore;
pub use snapshot::SnapshotStoreClient;
pub use snapshot::SnapshotStoreError;
pub use snapshot::TransientSnapshot;

// The `crate::{root_mod}` modules only export types via `pub use`; all `mod`
// statements stay private so each root_mod can organize its impl freely.
