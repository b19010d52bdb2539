pub(crate) mod api;
pub(crate) mod commit_stream;
mod election;
mod local_state;
mod log;
mod replica;
mod transport;

pub use api::ActorExited;
pub use api::JoinInput;
pub use api::LeaveInput;
pub use api::MembershipChangeError;
pub use api::MembershipChangeOutput;
pub use api::StartReplicationError;
pub use api::StartReplicationInput;
pub use api::StartReplicationOutput;
pub use commit_stream::CommitStream;
pub use commit_stream::CommittedEntry;
pub use election::RoleChangeListener;
pub use election::RoleSnapshot;
pub use local_state::PersistentLocalState;
pub use local_state::Term;
pub use local_state::VolatileLocalState;
pub use log::EntryPayload;
pub use log::InMemoryLogStorage;
pub use log::LogStorage;
pub use log::Position;
pub use log::ReplicatedEntry;
pub use transport::PeerTransport;
pub use transport::TransportError;

pub(crate) use replica::Replica;
pub(crate) use replica::ReplicaConfig;
