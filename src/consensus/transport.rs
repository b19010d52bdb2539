use crate::cluster::Member;
use crate::protocol::{
    AppendRequest, AppendResponse, ConfigureRequest, ConfigureResponse, PollRequest, PollResponse, VoteRequest,
    VoteResponse,
};
use crate::snapshot::SnapshotChunk;

/// PeerTransport is the seam to the connection layer carrying wire messages between
/// replicas. The connection layer encodes/decodes via [crate::protocol] on the wire;
/// this trait trades in the decoded message structs.
///
/// Implementations must be safe to call from many spawned tasks at once. A slow or
/// dead peer surfaces as an error; the engine treats every error as retryable.
#[async_trait::async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    async fn vote(&self, target: &Member, request: VoteRequest) -> Result<VoteResponse, TransportError>;

    async fn poll(&self, target: &Member, request: PollRequest) -> Result<PollResponse, TransportError>;

    async fn append(&self, target: &Member, request: AppendRequest) -> Result<AppendResponse, TransportError>;

    async fn configure(&self, target: &Member, request: ConfigureRequest)
        -> Result<ConfigureResponse, TransportError>;

    /// Send one snapshot chunk. `Ok(true)` means the follower accepted and stored the
    /// chunk; `Ok(false)` means it rejected the chunk (bad checksum, unknown id).
    async fn install_snapshot_chunk(&self, target: &Member, chunk: SnapshotChunk) -> Result<bool, TransportError>;
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("peer unreachable: {0}")]
    Unreachable(String),

    #[error("timed out waiting for peer reply")]
    Timeout,

    #[error("malformed reply from peer")]
    MalformedReply,
}
