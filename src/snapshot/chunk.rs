use crate::snapshot::id::SnapshotId;
use bytes::Bytes;
use std::fmt;

/// One named file of a snapshot, as transferred to a catching-up follower. Chunks
/// exist only in flight; the receiver reassembles them into a pending snapshot
/// directory and they are never persisted in this form.
#[derive(Clone, PartialEq)]
pub struct SnapshotChunk {
    pub snapshot_id: SnapshotId,
    pub chunk_name: String,
    /// Ordinal of this chunk within the transfer, 1-based.
    pub chunk_ordinal: u32,
    /// Total number of chunks the whole snapshot consists of. Identical across all
    /// chunks of one transfer.
    pub total_chunk_count: u32,
    /// crc32 of `content`.
    pub content_checksum: u32,
    /// Combined checksum of the complete snapshot. Identical across all chunks of
    /// one transfer; verified against the reassembled directory before persist.
    pub combined_checksum: u64,
    pub content: Bytes,
}

impl fmt::Debug for SnapshotChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Content can be large; log metadata only.
        f.debug_struct("SnapshotChunk")
            .field("snapshot_id", &self.snapshot_id)
            .field("chunk_name", &self.chunk_name)
            .field("chunk_ordinal", &self.chunk_ordinal)
            .field("total_chunk_count", &self.total_chunk_count)
            .field("content_checksum", &self.content_checksum)
            .field("combined_checksum", &self.combined_checksum)
            .field("content_length", &self.content.len())
            .finish()
    }
}
