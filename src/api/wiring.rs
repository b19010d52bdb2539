use crate::actor::{ActorClient, ReplicaActor};
use crate::api::options::{ReplicationOptions, ReplicationOptionsValidated};
use crate::cluster::Member;
use crate::consensus::{
    commit_stream, CommitStream, InMemoryLogStorage, PeerTransport, Replica, ReplicaConfig, RoleChangeListener,
    VolatileLocalState,
};
use crate::snapshot::{SnapshotStore, SnapshotStoreClient};
use std::convert::TryFrom;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

pub struct ReplicationClientConfig {
    pub logger: slog::Logger,
    pub partition_id: u16,
    pub topic_name: String,
    pub my_member: Member,
    pub cluster_members: Vec<Member>,
    /// Root directory for this partition's snapshot state (`pending/`, `snapshots/`).
    pub snapshot_root: PathBuf,
    pub transport: Arc<dyn PeerTransport>,
    pub options: ReplicationOptions,
}

/// Handles to one partition's running replication core.
pub struct ReplicationClient {
    /// Submit writes and membership changes, serve inbound consensus RPCs.
    pub replication: ActorClient,
    /// Committed data entries, in position order.
    pub commit_stream: CommitStream,
    /// Leadership changes, for services that must only run on the leader.
    pub role_change_listener: RoleChangeListener,
    /// The partition's snapshot store, for compaction and inspection.
    pub snapshot_store: SnapshotStoreClient,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientCreationError {
    #[error("invalid options: {0}")]
    InvalidOptions(&'static str),

    #[error("my member endpoint is not in the cluster configuration")]
    MeNotInCluster,

    #[error("snapshot store initialization failure")]
    SnapshotStoreInitialization(io::Error),
}

/// Wire up one partition: snapshot store actor, replica, and the replica actor's
/// event loop. The replica starts as follower and elects a leader with its peers.
pub async fn try_create_replication_client(
    config: ReplicationClientConfig,
) -> Result<ReplicationClient, ClientCreationError> {
    let options =
        ReplicationOptionsValidated::try_from(config.options).map_err(ClientCreationError::InvalidOptions)?;

    if !config.cluster_members.contains(&config.my_member) {
        return Err(ClientCreationError::MeNotInCluster);
    }

    let store = SnapshotStore::open(
        config.logger.new(slog::o!("Component" => "SnapshotStore")),
        &config.snapshot_root,
    )
    .map_err(ClientCreationError::SnapshotStoreInitialization)?;
    let snapshot_store = SnapshotStoreClient::spawn(store);

    let (actor_client, event_receiver) = ActorClient::new(64);
    let (commit_stream_publisher, commit_stream) = commit_stream::new();

    let my_member = config.my_member.clone();
    let (replica, role_change_listener) = Replica::new(ReplicaConfig {
        logger: config.logger,
        partition_id: config.partition_id,
        topic_name: config.topic_name,
        my_member: config.my_member,
        cluster_members: config.cluster_members,
        log_storage: InMemoryLogStorage::new(),
        local_state: VolatileLocalState::new(my_member),
        commit_stream_publisher,
        transport: config.transport,
        snapshot_store: snapshot_store.clone(),
        actor_client: actor_client.weak(),
        leader_heartbeat_duration: options.leader_heartbeat_duration,
        election_min_timeout: options.election_min_timeout,
        election_max_timeout: options.election_max_timeout,
        append_timeout: options.append_timeout,
    });

    tokio::task::spawn(ReplicaActor::new(event_receiver, replica).run_event_loop());

    Ok(ReplicationClient {
        replication: actor_client,
        commit_stream,
        role_change_listener,
        snapshot_store,
    })
}
