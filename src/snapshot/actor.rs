use crate::snapshot::chunk::SnapshotChunk;
use crate::snapshot::id::SnapshotId;
use crate::snapshot::store::{
    PersistedSnapshot, ReceivedSnapshot, SnapshotListener, SnapshotStore, SnapshotStoreError, TransientSnapshot,
};
use std::io;
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, oneshot};

type Completion<T> = oneshot::Sender<T>;
type TakeWriter = Box<dyn FnOnce(&Path) -> io::Result<()> + Send>;

// Every store operation is one message; the actor handles them strictly in order,
// which serializes all directory mutations. Completions are delivered through
// oneshot channels, never by blocking the caller's task.
enum Op {
    NewTransient(SnapshotId, Completion<Option<TransientSnapshot>>),
    Take(TransientSnapshot, TakeWriter, Completion<Result<(), SnapshotStoreError>>),
    PersistTransient(TransientSnapshot, Completion<Result<PersistedSnapshot, SnapshotStoreError>>),
    AbortTransient(TransientSnapshot, Completion<Result<(), SnapshotStoreError>>),
    LatestSnapshot(Completion<Option<PersistedSnapshot>>),
    Reserve(Completion<Result<PersistedSnapshot, SnapshotStoreError>>),
    Release(SnapshotId),
    NewReceived(SnapshotId, Completion<ReceivedSnapshot>),
    ApplyChunk(ReceivedSnapshot, SnapshotChunk, Completion<Result<bool, SnapshotStoreError>>),
    PersistReceived(ReceivedSnapshot, Completion<Result<PersistedSnapshot, SnapshotStoreError>>),
    AbortReceived(ReceivedSnapshot, Completion<Result<(), SnapshotStoreError>>),
    PurgePending(Completion<Result<(), SnapshotStoreError>>),
    CopySnapshot(SnapshotId, PathBuf, Completion<Result<(), SnapshotStoreError>>),
    Chunks(SnapshotId, Completion<Result<Vec<SnapshotChunk>, SnapshotStoreError>>),
    AddListener(Completion<SnapshotListener>),
}

/// Async facade over one partition's [SnapshotStore]. Cheap to clone; all clones
/// feed the same single-threaded store actor.
#[derive(Clone)]
pub struct SnapshotStoreClient {
    sender: mpsc::UnboundedSender<Op>,
}

/// Holds a ref-count against a persisted snapshot, preventing its deletion while a
/// consumer (e.g. an in-progress transfer to a follower) still needs it. Dropping
/// the reservation releases it.
pub struct Reservation {
    client: SnapshotStoreClient,
    snapshot: PersistedSnapshot,
    released: bool,
}

impl Reservation {
    pub fn snapshot(&self) -> &PersistedSnapshot {
        &self.snapshot
    }

    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            let _ = self.client.sender.send(Op::Release(self.snapshot.id));
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.release_once();
    }
}

impl SnapshotStoreClient {
    /// Spawn the store actor on the blocking pool (every operation does file I/O)
    /// and return its client.
    pub fn spawn(store: SnapshotStore) -> SnapshotStoreClient {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::task::spawn_blocking(move || run_store_actor(store, rx));

        SnapshotStoreClient { sender: tx }
    }
}

fn run_store_actor(mut store: SnapshotStore, mut receiver: mpsc::UnboundedReceiver<Op>) {
    while let Some(op) = receiver.blocking_recv() {
        match op {
            Op::NewTransient(id, completion) => {
                let _ = completion.send(store.new_transient_snapshot(id));
            }
            Op::Take(transient, writer, completion) => {
                let _ = completion.send(store.take_transient(transient, writer));
            }
            Op::PersistTransient(transient, completion) => {
                let _ = completion.send(store.persist_transient(transient));
            }
            Op::AbortTransient(transient, completion) => {
                let _ = completion.send(store.abort_transient(transient));
            }
            Op::LatestSnapshot(completion) => {
                let _ = completion.send(store.latest_snapshot());
            }
            Op::Reserve(completion) => {
                let _ = completion.send(store.reserve());
            }
            Op::Release(id) => {
                store.release(id);
            }
            Op::NewReceived(id, completion) => {
                let _ = completion.send(store.new_received_snapshot(id));
            }
            Op::ApplyChunk(received, chunk, completion) => {
                let _ = completion.send(store.apply_chunk(received, &chunk));
            }
            Op::PersistReceived(received, completion) => {
                let _ = completion.send(store.persist_received(received));
            }
            Op::AbortReceived(received, completion) => {
                let _ = completion.send(store.abort_received(received));
            }
            Op::PurgePending(completion) => {
                let _ = completion.send(store.purge_pending_snapshots());
            }
            Op::CopySnapshot(id, target, completion) => {
                let _ = completion.send(store.copy_snapshot(id, &target));
            }
            Op::Chunks(id, completion) => {
                let _ = completion.send(store.chunks(id));
            }
            Op::AddListener(completion) => {
                let _ = completion.send(store.add_listener());
            }
        }
    }
}

impl SnapshotStoreClient {
    pub async fn new_transient_snapshot(
        &self,
        id: SnapshotId,
    ) -> Result<Option<TransientSnapshot>, SnapshotStoreError> {
        self.call(|tx| Op::NewTransient(id, tx)).await
    }

    pub async fn take(
        &self,
        transient: TransientSnapshot,
        writer: impl FnOnce(&Path) -> io::Result<()> + Send + 'static,
    ) -> Result<(), SnapshotStoreError> {
        self.call(|tx| Op::Take(transient, Box::new(writer), tx)).await?
    }

    pub async fn persist_transient(
        &self,
        transient: TransientSnapshot,
    ) -> Result<PersistedSnapshot, SnapshotStoreError> {
        self.call(|tx| Op::PersistTransient(transient, tx)).await?
    }

    pub async fn abort_transient(&self, transient: TransientSnapshot) -> Result<(), SnapshotStoreError> {
        self.call(|tx| Op::AbortTransient(transient, tx)).await?
    }

    pub async fn latest_snapshot(&self) -> Result<Option<PersistedSnapshot>, SnapshotStoreError> {
        self.call(Op::LatestSnapshot).await
    }

    pub async fn reserve(&self) -> Result<Reservation, SnapshotStoreError> {
        let snapshot = self.call(Op::Reserve).await??;
        Ok(Reservation {
            client: self.clone(),
            snapshot,
            released: false,
        })
    }

    pub async fn new_received_snapshot(&self, id: SnapshotId) -> Result<ReceivedSnapshot, SnapshotStoreError> {
        self.call(|tx| Op::NewReceived(id, tx)).await
    }

    pub async fn apply_chunk(
        &self,
        received: ReceivedSnapshot,
        chunk: SnapshotChunk,
    ) -> Result<bool, SnapshotStoreError> {
        self.call(|tx| Op::ApplyChunk(received, chunk, tx)).await?
    }

    pub async fn persist_received(
        &self,
        received: ReceivedSnapshot,
    ) -> Result<PersistedSnapshot, SnapshotStoreError> {
        self.call(|tx| Op::PersistReceived(received, tx)).await?
    }

    pub async fn abort_received(&self, received: ReceivedSnapshot) -> Result<(), SnapshotStoreError> {
        self.call(|tx| Op::AbortReceived(received, tx)).await?
    }

    pub async fn purge_pending_snapshots(&self) -> Result<(), SnapshotStoreError> {
        self.call(Op::PurgePending).await?
    }

    pub async fn copy_snapshot(&self, id: SnapshotId, target_dir: PathBuf) -> Result<(), SnapshotStoreError> {
        self.call(|tx| Op::CopySnapshot(id, target_dir, tx)).await?
    }

    pub async fn chunks(&self, id: SnapshotId) -> Result<Vec<SnapshotChunk>, SnapshotStoreError> {
        self.call(|tx| Op::Chunks(id, tx)).await?
    }

    pub async fn add_listener(&self) -> Result<SnapshotListener, SnapshotStoreError> {
        self.call(Op::AddListener).await
    }

    async fn call<T>(&self, make_op: impl FnOnce(Completion<T>) -> Op) -> Result<T, SnapshotStoreError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(make_op(tx))
            .map_err(|_| SnapshotStoreError::ActorExited)?;

        rx.await.map_err(|_| SnapshotStoreError::ActorExited)
    }
}
