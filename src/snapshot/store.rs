use crate::snapshot::checksum::{self, SnapshotChecksum};
use crate::snapshot::chunk::SnapshotChunk;
use crate::snapshot::id::SnapshotId;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::sync::mpsc;

const PENDING_DIR: &str = "pending";
const SNAPSHOTS_DIR: &str = "snapshots";
const CHECKSUM_SUFFIX: &str = "checksum";

/// A sealed, checksum-verified snapshot in the committed area. At most one exists
/// per store, plus superseded ones kept alive by reservations.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedSnapshot {
    pub id: SnapshotId,
    pub path: PathBuf,
    pub checksum: u64,
}

/// Handle to a snapshot being built locally in the pending area. Directory state
/// lives in the store; the handle only names it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransientSnapshot {
    pub id: SnapshotId,
}

/// Handle to a snapshot being reassembled from remote chunks in the pending area.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReceivedSnapshot {
    pub id: SnapshotId,
}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotStoreError {
    #[error("nothing to persist for snapshot {0}")]
    NothingToPersist(SnapshotId),

    #[error("no persisted snapshot available")]
    NoSnapshot,

    #[error("snapshot {0} is no longer available")]
    SnapshotGone(SnapshotId),

    #[error("snapshot {id} failed checksum verification")]
    ChecksumMismatch { id: SnapshotId },

    // Protocol-level inconsistency, not transient corruption: surfaced as a hard
    // error, unlike content/combined checksum mismatches.
    #[error("chunk declares {declared} total chunks, previously declared {expected}")]
    ChunkCountMismatch { declared: u32, expected: u32 },

    #[error("chunk ordinal {ordinal} out of range 1..={total}")]
    ChunkOrdinalOutOfRange { ordinal: u32, total: u32 },

    #[error("illegal chunk name: {0}")]
    InvalidChunkName(String),

    #[error("snapshot {id} incomplete: {applied}/{total} chunks applied")]
    MissingChunks { id: SnapshotId, applied: u32, total: u32 },

    #[error("target directory already exists: {0}")]
    TargetExists(PathBuf),

    #[error("snapshot store I/O failure: {0}")]
    Io(#[from] io::Error),

    #[error("snapshot store actor is dead")]
    ActorExited,
}

/// Receives a notification for every successfully persisted snapshot, local or
/// received. Dropping the listener unregisters it.
pub struct SnapshotListener {
    receiver: mpsc::UnboundedReceiver<PersistedSnapshot>,
}

impl SnapshotListener {
    pub async fn recv(&mut self) -> Option<PersistedSnapshot> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<PersistedSnapshot> {
        self.receiver.try_recv().ok()
    }
}

#[derive(Default)]
struct ReceivedState {
    total_chunk_count: Option<u32>,
    combined_checksum: Option<u64>,
    // chunk name -> content crc32 of every chunk applied so far
    applied: BTreeMap<String, u32>,
}

/// SnapshotStore owns the on-disk snapshot state of one partition: transient
/// snapshots being built, the single current persisted snapshot, and in-flight
/// received snapshots reassembled from remote chunks.
///
/// Layout under the store root:
///   pending/<id>/...          transient and in-flight received snapshots
///   snapshots/<id>/...        the persisted snapshot
///   snapshots/<id>.checksum   its checksum file
///
/// All methods are synchronous and do file I/O; the store is driven by its own
/// single-threaded actor (see [crate::snapshot::actor]) so directory mutations are
/// serialized and never block the consensus actor.
pub struct SnapshotStore {
    logger: slog::Logger,
    pending_dir: PathBuf,
    snapshots_dir: PathBuf,

    latest: Option<PersistedSnapshot>,
    // Superseded snapshots still on disk because a reservation pins them.
    retained: Vec<PersistedSnapshot>,
    reservations: HashMap<SnapshotId, usize>,

    transients: HashMap<SnapshotId, ()>,
    received: HashMap<SnapshotId, ReceivedState>,

    listeners: Vec<mpsc::UnboundedSender<PersistedSnapshot>>,
}

impl SnapshotStore {
    /// Open the store rooted at `root`, creating the layout if absent and running
    /// load-time validation: every persisted snapshot found on disk is verified
    /// against its checksum file; corrupt or checksumless ones are deleted, and of
    /// the valid ones only the highest index survives.
    pub fn open(logger: slog::Logger, root: &Path) -> io::Result<Self> {
        let pending_dir = root.join(PENDING_DIR);
        let snapshots_dir = root.join(SNAPSHOTS_DIR);
        fs::create_dir_all(&pending_dir)?;
        fs::create_dir_all(&snapshots_dir)?;

        let mut store = SnapshotStore {
            logger,
            pending_dir,
            snapshots_dir,
            latest: None,
            retained: Vec::new(),
            reservations: HashMap::new(),
            transients: HashMap::new(),
            received: HashMap::new(),
            listeners: Vec::new(),
        };
        store.load_persisted_snapshots()?;

        Ok(store)
    }

    fn load_persisted_snapshots(&mut self) -> io::Result<()> {
        let mut valid: Vec<PersistedSnapshot> = Vec::new();

        for dir_entry in fs::read_dir(&self.snapshots_dir)? {
            let dir_entry = dir_entry?;
            let path = dir_entry.path();
            let name = dir_entry.file_name().to_string_lossy().into_owned();

            if !dir_entry.file_type()?.is_dir() {
                // Checksum files are handled with their directory; orphans are
                // removed below.
                continue;
            }

            let id = match SnapshotId::from_str(&name) {
                Ok(id) => id,
                Err(_) => {
                    slog::warn!(self.logger, "Ignoring unrecognized directory {:?}", path);
                    continue;
                }
            };

            match self.verify_persisted_snapshot(id, &path) {
                Ok(snapshot) => valid.push(snapshot),
                Err(reason) => {
                    slog::warn!(self.logger, "Deleting invalid snapshot {:?}: {}", id, reason);
                    let _ = fs::remove_dir_all(&path);
                    let _ = fs::remove_file(self.checksum_path(id));
                }
            }
        }

        // Only the newest valid snapshot is retained.
        valid.sort_by_key(|s| s.id.index);
        if let Some(latest) = valid.pop() {
            for superseded in valid {
                slog::info!(self.logger, "Deleting superseded snapshot {:?}", superseded.id);
                let _ = fs::remove_dir_all(&superseded.path);
                let _ = fs::remove_file(self.checksum_path(superseded.id));
            }
            slog::info!(self.logger, "Loaded persisted snapshot {:?}", latest.id);
            self.latest = Some(latest);
        }

        self.delete_orphan_checksum_files()?;
        Ok(())
    }

    fn verify_persisted_snapshot(&self, id: SnapshotId, path: &Path) -> Result<PersistedSnapshot, String> {
        let checksum_path = self.checksum_path(id);
        let stored = match checksum::read_checksum_file(&checksum_path) {
            Ok(stored) => stored,
            Err(e) => return Err(format!("checksum file unreadable: {}", e)),
        };

        let actual = match checksum::checksum_directory(path) {
            Ok(actual) => actual,
            Err(e) => return Err(format!("directory unreadable: {}", e)),
        };

        if actual.combined() != stored.combined {
            return Err(format!(
                "combined checksum mismatch: stored {:016x}, actual {:016x}",
                stored.combined,
                actual.combined()
            ));
        }

        Ok(PersistedSnapshot {
            id,
            path: path.to_path_buf(),
            checksum: stored.combined,
        })
    }

    fn delete_orphan_checksum_files(&self) -> io::Result<()> {
        for dir_entry in fs::read_dir(&self.snapshots_dir)? {
            let dir_entry = dir_entry?;
            if !dir_entry.file_type()?.is_file() {
                continue;
            }
            let name = dir_entry.file_name().to_string_lossy().into_owned();
            let stem = match name.strip_suffix(&format!(".{}", CHECKSUM_SUFFIX)) {
                Some(stem) => stem,
                None => continue,
            };
            let has_snapshot = matches!(
                (SnapshotId::from_str(stem), &self.latest),
                (Ok(id), Some(latest)) if id == latest.id
            ) || self.retained.iter().any(|s| s.id.to_string() == stem);
            if !has_snapshot {
                let _ = fs::remove_file(dir_entry.path());
            }
        }
        Ok(())
    }

    pub fn latest_snapshot(&self) -> Option<PersistedSnapshot> {
        self.latest.clone()
    }

    fn pending_path(&self, id: SnapshotId) -> PathBuf {
        self.pending_dir.join(id.to_string())
    }

    fn persisted_path(&self, id: SnapshotId) -> PathBuf {
        self.snapshots_dir.join(id.to_string())
    }

    fn checksum_path(&self, id: SnapshotId) -> PathBuf {
        self.snapshots_dir.join(format!("{}.{}", id, CHECKSUM_SUFFIX))
    }

    /// Start building a local snapshot. Idempotent by index: if an equal-or-newer
    /// snapshot already exists (transient or persisted), no new directory is started;
    /// the existing transient's handle is returned, or None when a persisted
    /// snapshot already covers the index.
    pub fn new_transient_snapshot(&mut self, id: SnapshotId) -> Option<TransientSnapshot> {
        if let Some(latest) = &self.latest {
            if latest.id.index >= id.index {
                slog::debug!(
                    self.logger,
                    "Not creating transient snapshot {:?}, persisted {:?} is equal or newer",
                    id,
                    latest.id
                );
                return None;
            }
        }

        if let Some(existing) = self.transients.keys().find(|t| t.index >= id.index).copied() {
            return Some(TransientSnapshot { id: existing });
        }

        self.transients.insert(id, ());
        Some(TransientSnapshot { id })
    }

    /// Run the caller's file-writing routine against a freshly created pending
    /// directory. On failure the directory is deleted entirely; no partial artifact
    /// survives. Taking into an already-non-empty directory is a no-op re-take.
    pub fn take_transient(
        &mut self,
        transient: TransientSnapshot,
        writer: impl FnOnce(&Path) -> io::Result<()>,
    ) -> Result<(), SnapshotStoreError> {
        let dir = self.pending_path(transient.id);

        if dir.exists() && fs::read_dir(&dir)?.next().is_some() {
            slog::debug!(self.logger, "Re-take of {:?} is a no-op", transient.id);
            return Ok(());
        }

        fs::create_dir_all(&dir)?;
        if let Err(e) = writer(&dir) {
            let _ = fs::remove_dir_all(&dir);
            return Err(SnapshotStoreError::Io(e));
        }

        Ok(())
    }

    /// Seal a transient snapshot: checksum it, write the checksum file, atomically
    /// move the directory into the committed area, then delete whatever it
    /// supersedes. Persisting the same snapshot twice returns the same result.
    pub fn persist_transient(&mut self, transient: TransientSnapshot) -> Result<PersistedSnapshot, SnapshotStoreError> {
        if let Some(latest) = &self.latest {
            if latest.id == transient.id {
                return Ok(latest.clone());
            }
        }

        let dir = self.pending_path(transient.id);
        if !dir.exists() || fs::read_dir(&dir)?.next().is_none() {
            return Err(SnapshotStoreError::NothingToPersist(transient.id));
        }

        let computed = checksum::checksum_directory(&dir)?;
        let persisted = self.finalize_persist(transient.id, &computed)?;
        self.transients.remove(&transient.id);

        Ok(persisted)
    }

    /// Delete the pending directory. Safe to call even if nothing was ever written.
    pub fn abort_transient(&mut self, transient: TransientSnapshot) -> Result<(), SnapshotStoreError> {
        self.transients.remove(&transient.id);
        let dir = self.pending_path(transient.id);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Pin the current persisted snapshot against deletion. Released by
    /// [SnapshotStore::release].
    pub fn reserve(&mut self) -> Result<PersistedSnapshot, SnapshotStoreError> {
        let latest = self.latest.clone().ok_or(SnapshotStoreError::NoSnapshot)?;
        *self.reservations.entry(latest.id).or_insert(0) += 1;
        Ok(latest)
    }

    pub fn release(&mut self, id: SnapshotId) {
        match self.reservations.get_mut(&id) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                self.reservations.remove(&id);
            }
            None => slog::warn!(self.logger, "Release of {:?} without reservation", id),
        }
    }

    fn is_reserved(&self, id: SnapshotId) -> bool {
        self.reservations.get(&id).copied().unwrap_or(0) > 0
    }

    /// Start (or continue) reassembling a remote snapshot. No directory is created
    /// until the first chunk is applied.
    pub fn new_received_snapshot(&mut self, id: SnapshotId) -> ReceivedSnapshot {
        self.received.entry(id).or_insert_with(ReceivedState::default);
        ReceivedSnapshot { id }
    }

    /// Apply one chunk to a received snapshot.
    ///
    /// Ok(true): chunk validated and stored (or was already stored).
    /// Ok(false): soft failure (wrong snapshot id, inconsistent combined checksum,
    ///   or corrupt content); previously applied chunks are untouched and the
    ///   transfer can be retried from this chunk onward.
    /// Err: hard failure (protocol violation or I/O).
    pub fn apply_chunk(
        &mut self,
        received: ReceivedSnapshot,
        chunk: &SnapshotChunk,
    ) -> Result<bool, SnapshotStoreError> {
        if chunk.snapshot_id != received.id {
            slog::warn!(
                self.logger,
                "Rejecting chunk of {:?}, expected {:?}",
                chunk.snapshot_id,
                received.id
            );
            return Ok(false);
        }

        if chunk.chunk_name.contains('/') || chunk.chunk_name.contains('\\') || chunk.chunk_name.is_empty() {
            return Err(SnapshotStoreError::InvalidChunkName(chunk.chunk_name.clone()));
        }

        let state = self
            .received
            .entry(received.id)
            .or_insert_with(ReceivedState::default);

        if let Some(expected) = state.total_chunk_count {
            if expected != chunk.total_chunk_count {
                return Err(SnapshotStoreError::ChunkCountMismatch {
                    declared: chunk.total_chunk_count,
                    expected,
                });
            }
        }
        if chunk.chunk_ordinal == 0 || chunk.chunk_ordinal > chunk.total_chunk_count {
            return Err(SnapshotStoreError::ChunkOrdinalOutOfRange {
                ordinal: chunk.chunk_ordinal,
                total: chunk.total_chunk_count,
            });
        }

        if let Some(expected) = state.combined_checksum {
            if expected != chunk.combined_checksum {
                slog::warn!(
                    self.logger,
                    "Rejecting chunk {} of {:?}: combined checksum {:016x} does not match {:016x}",
                    chunk.chunk_name,
                    received.id,
                    chunk.combined_checksum,
                    expected
                );
                return Ok(false);
            }
        }

        if checksum::content_checksum(&chunk.content) != chunk.content_checksum {
            slog::warn!(
                self.logger,
                "Rejecting chunk {} of {:?}: content checksum mismatch",
                chunk.chunk_name,
                received.id
            );
            return Ok(false);
        }

        if state.applied.contains_key(&chunk.chunk_name) {
            // Duplicate delivery, e.g. a retried send.
            return Ok(true);
        }

        let dir = self.pending_path(received.id);
        fs::create_dir_all(&dir)?;
        let file_path = dir.join(&chunk.chunk_name);
        if let Err(e) = write_file_fsynced(&file_path, &chunk.content) {
            // Don't leave a partial file behind for a chunk we didn't account.
            let _ = fs::remove_file(&file_path);
            return Err(SnapshotStoreError::Io(e));
        }

        let state = self
            .received
            .get_mut(&received.id)
            .expect("received state vanished mid-apply");
        state.total_chunk_count.get_or_insert(chunk.total_chunk_count);
        state.combined_checksum.get_or_insert(chunk.combined_checksum);
        state.applied.insert(chunk.chunk_name.clone(), chunk.content_checksum);

        Ok(true)
    }

    /// Promote a fully received snapshot to persisted. Fails while chunks are
    /// missing; verifies the reassembled directory against the combined checksum
    /// the chunks declared before sealing it.
    pub fn persist_received(&mut self, received: ReceivedSnapshot) -> Result<PersistedSnapshot, SnapshotStoreError> {
        if let Some(latest) = &self.latest {
            if latest.id == received.id {
                return Ok(latest.clone());
            }
        }

        let (declared_total, declared_combined, applied_count) = match self.received.get(&received.id) {
            Some(state) => (
                state.total_chunk_count,
                state.combined_checksum,
                state.applied.len() as u32,
            ),
            None => return Err(SnapshotStoreError::NothingToPersist(received.id)),
        };

        let total = match declared_total {
            Some(total) => total,
            None => return Err(SnapshotStoreError::NothingToPersist(received.id)),
        };
        if applied_count < total {
            return Err(SnapshotStoreError::MissingChunks {
                id: received.id,
                applied: applied_count,
                total,
            });
        }

        let dir = self.pending_path(received.id);
        let computed = checksum::checksum_directory(&dir)?;
        if Some(computed.combined()) != declared_combined {
            slog::warn!(
                self.logger,
                "Received snapshot {:?} failed verification, discarding",
                received.id
            );
            let _ = fs::remove_dir_all(&dir);
            self.received.remove(&received.id);
            return Err(SnapshotStoreError::ChecksumMismatch { id: received.id });
        }

        let persisted = self.finalize_persist(received.id, &computed)?;
        self.received.remove(&received.id);

        Ok(persisted)
    }

    /// Abandon an in-flight received snapshot and its directory.
    pub fn abort_received(&mut self, received: ReceivedSnapshot) -> Result<(), SnapshotStoreError> {
        self.received.remove(&received.id);
        let dir = self.pending_path(received.id);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    fn finalize_persist(
        &mut self,
        id: SnapshotId,
        computed: &SnapshotChecksum,
    ) -> Result<PersistedSnapshot, SnapshotStoreError> {
        let pending = self.pending_path(id);
        let target = self.persisted_path(id);

        checksum::write_checksum_file(&self.checksum_path(id), computed, Some(&target))?;
        fs::rename(&pending, &target)?;

        let persisted = PersistedSnapshot {
            id,
            path: target,
            checksum: computed.combined(),
        };

        let superseded = self.latest.replace(persisted.clone());
        self.delete_superseded(superseded, id);
        self.notify_listeners(&persisted);

        slog::info!(self.logger, "Persisted snapshot {:?}", id);
        Ok(persisted)
    }

    fn delete_superseded(&mut self, superseded: Option<PersistedSnapshot>, new_id: SnapshotId) {
        // Strictly-older persisted snapshots go, unless a reservation pins them.
        if let Some(old) = superseded {
            if self.is_reserved(old.id) {
                slog::info!(self.logger, "Keeping superseded-but-reserved snapshot {:?}", old.id);
                self.retained.push(old);
            } else {
                self.delete_persisted_files(&old);
            }
        }

        let reservations = std::mem::take(&mut self.reservations);
        let mut still_retained = Vec::new();
        for old in std::mem::take(&mut self.retained) {
            if reservations.get(&old.id).copied().unwrap_or(0) > 0 {
                still_retained.push(old);
            } else {
                self.delete_persisted_files(&old);
            }
        }
        self.retained = still_retained;
        self.reservations = reservations;

        // Strictly-older pending work is pointless now; a newer pending snapshot is
        // left untouched even if an older one was just persisted.
        self.delete_stale_pending(new_id);
    }

    fn delete_persisted_files(&self, snapshot: &PersistedSnapshot) {
        slog::info!(self.logger, "Deleting superseded snapshot {:?}", snapshot.id);
        let _ = fs::remove_dir_all(&snapshot.path);
        let _ = fs::remove_file(self.checksum_path(snapshot.id));
    }

    fn delete_stale_pending(&mut self, new_id: SnapshotId) {
        let stale_dirs = match fs::read_dir(&self.pending_dir) {
            Ok(entries) => entries,
            Err(e) => {
                slog::warn!(self.logger, "Can't scan pending directory: {}", e);
                return;
            }
        };

        for dir_entry in stale_dirs.flatten() {
            let name = dir_entry.file_name().to_string_lossy().into_owned();
            if let Ok(id) = SnapshotId::from_str(&name) {
                if id.index < new_id.index {
                    let _ = fs::remove_dir_all(dir_entry.path());
                }
            }
        }

        self.transients.retain(|id, _| id.index >= new_id.index);
        self.received.retain(|id, _| id.index >= new_id.index);
    }

    fn notify_listeners(&mut self, persisted: &PersistedSnapshot) {
        self.listeners.retain(|listener| listener.send(persisted.clone()).is_ok());
    }

    pub fn add_listener(&mut self) -> SnapshotListener {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.push(tx);
        SnapshotListener { receiver: rx }
    }

    /// Delete all transient/in-progress directories without touching the persisted
    /// snapshot. Disk reclamation only; never invoked automatically.
    pub fn purge_pending_snapshots(&mut self) -> Result<(), SnapshotStoreError> {
        for dir_entry in fs::read_dir(&self.pending_dir)? {
            let dir_entry = dir_entry?;
            if dir_entry.file_type()?.is_dir() {
                fs::remove_dir_all(dir_entry.path())?;
            }
        }
        self.transients.clear();
        self.received.clear();
        Ok(())
    }

    /// Byte-for-byte copy of a persisted snapshot's files into `target_dir`. Fails
    /// if the target already exists or the snapshot has since been deleted.
    pub fn copy_snapshot(&self, id: SnapshotId, target_dir: &Path) -> Result<(), SnapshotStoreError> {
        let source = self
            .find_persisted(id)
            .ok_or(SnapshotStoreError::SnapshotGone(id))?;

        if target_dir.exists() {
            return Err(SnapshotStoreError::TargetExists(target_dir.to_path_buf()));
        }
        fs::create_dir_all(target_dir)?;

        for dir_entry in fs::read_dir(&source.path)? {
            let dir_entry = dir_entry?;
            if dir_entry.file_type()?.is_file() {
                fs::copy(dir_entry.path(), target_dir.join(dir_entry.file_name()))?;
            }
        }
        Ok(())
    }

    /// Cut a persisted snapshot into transfer chunks, one per file, in sorted-name
    /// order. The caller should hold a reservation while streaming them.
    pub fn chunks(&self, id: SnapshotId) -> Result<Vec<SnapshotChunk>, SnapshotStoreError> {
        let source = self
            .find_persisted(id)
            .ok_or(SnapshotStoreError::SnapshotGone(id))?;

        let mut names: Vec<String> = Vec::new();
        for dir_entry in fs::read_dir(&source.path)? {
            let dir_entry = dir_entry?;
            if dir_entry.file_type()?.is_file() {
                names.push(dir_entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();

        let total = names.len() as u32;
        let mut chunks = Vec::with_capacity(names.len());
        for (i, name) in names.into_iter().enumerate() {
            let content = fs::read(source.path.join(&name))?;
            let content_checksum = checksum::content_checksum(&content);
            chunks.push(SnapshotChunk {
                snapshot_id: id,
                chunk_name: name,
                chunk_ordinal: (i + 1) as u32,
                total_chunk_count: total,
                content_checksum,
                combined_checksum: source.checksum,
                content: Bytes::from(content),
            });
        }

        Ok(chunks)
    }

    fn find_persisted(&self, id: SnapshotId) -> Option<&PersistedSnapshot> {
        self.latest
            .as_ref()
            .filter(|s| s.id == id)
            .or_else(|| self.retained.iter().find(|s| s.id == id))
    }
}

fn write_file_fsynced(path: &Path, content: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(content)?;
    file.sync_all()
}
