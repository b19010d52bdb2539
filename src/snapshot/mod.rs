mod actor;
mod checksum;
mod chunk;
mod id;
pub(crate) mod sender;
mod store;

pub use actor::Reservation;
pub use actor::SnapshotStoreClient;
pub use checksum::content_checksum;
pub use checksum::SnapshotChecksum;
pub use chunk::SnapshotChunk;
pub use id::InvalidSnapshotId;
pub use id::SnapshotId;
pub use store::PersistedSnapshot;
pub use store::ReceivedSnapshot;
pub use store::SnapshotListener;
pub use store::SnapshotStore;
pub use store::SnapshotStoreError;
pub use store::TransientSnapshot;
