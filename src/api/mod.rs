//! This mod holds the library's client-facing wiring.
mod options;
mod wiring;

pub use options::ReplicationOptions;
pub use wiring::try_create_replication_client;
pub use wiring::ClientCreationError;
pub use wiring::ReplicationClient;
pub use wiring::ReplicationClientConfig;
