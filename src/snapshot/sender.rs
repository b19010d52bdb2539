use crate::cluster::Member;
use crate::consensus::{PeerTransport, Position};
use crate::snapshot::actor::SnapshotStoreClient;
use std::sync::Arc;

/// Stream the current persisted snapshot to one follower, chunk by chunk. The
/// snapshot is reserved for the whole transfer so supersession can't delete it
/// underneath us; the reservation is released when this returns.
///
/// Returns the transferred snapshot's index on success, None on any failure. There
/// is no built-in timeout: a stalled transfer is abandoned by the leader starting a
/// fresh one for a newer snapshot.
pub(crate) async fn transfer_snapshot_to_follower(
    logger: slog::Logger,
    store: SnapshotStoreClient,
    transport: Arc<dyn PeerTransport>,
    target: Member,
) -> Option<Position> {
    let reservation = match store.reserve().await {
        Ok(reservation) => reservation,
        Err(e) => {
            slog::warn!(logger, "No snapshot to transfer to {:?}: {}", target, e);
            return None;
        }
    };
    let snapshot_id = reservation.snapshot().id;

    let chunks = match store.chunks(snapshot_id).await {
        Ok(chunks) => chunks,
        Err(e) => {
            slog::error!(logger, "Can't read snapshot {:?} for transfer: {}", snapshot_id, e);
            return None;
        }
    };

    slog::info!(
        logger,
        "Transferring snapshot {:?} to {:?} in {} chunks",
        snapshot_id,
        target,
        chunks.len()
    );

    for chunk in chunks {
        let chunk_name = chunk.chunk_name.clone();
        match transport.install_snapshot_chunk(&target, chunk).await {
            Ok(true) => {}
            Ok(false) => {
                slog::warn!(
                    logger,
                    "Follower {:?} rejected chunk {} of {:?}",
                    target,
                    chunk_name,
                    snapshot_id
                );
                return None;
            }
            Err(e) => {
                slog::warn!(
                    logger,
                    "Failed to send chunk {} of {:?} to {:?}: {}",
                    chunk_name,
                    snapshot_id,
                    target,
                    e
                );
                return None;
            }
        }
    }

    slog::info!(logger, "Snapshot {:?} transferred to {:?}", snapshot_id, target);
    Some(snapshot_id.index)
    // Reservation drops here, releasing the ref-count.
}
