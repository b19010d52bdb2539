use replication::{Position, SnapshotId, SnapshotStore, SnapshotStoreClient, SnapshotStoreError, Term};
use std::fs;
use std::path::{Path, PathBuf};

fn test_logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}

fn snapshot_id(index: u64) -> SnapshotId {
    SnapshotId::new(Position::new(index), Term::new(1), index * 100, index * 100)
}

fn open_client(root: &Path) -> SnapshotStoreClient {
    let store = SnapshotStore::open(test_logger(), root).unwrap();
    SnapshotStoreClient::spawn(store)
}

async fn persist_snapshot_with_files(
    client: &SnapshotStoreClient,
    id: SnapshotId,
    files: &[(&str, &str)],
) -> replication::PersistedSnapshot {
    let transient = client
        .new_transient_snapshot(id)
        .await
        .unwrap()
        .expect("no newer snapshot may exist yet");
    let files: Vec<(String, String)> = files.iter().map(|(n, c)| (n.to_string(), c.to_string())).collect();
    client
        .take(transient, move |dir| {
            for (name, content) in &files {
                fs::write(dir.join(name), content)?;
            }
            Ok(())
        })
        .await
        .unwrap();

    client.persist_transient(transient).await.unwrap()
}

fn dir_names(path: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(path)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn newer_persist_supersedes_older_snapshot() {
    let root = tempfile::tempdir().unwrap();
    let client = open_client(root.path());

    persist_snapshot_with_files(&client, snapshot_id(1), &[("file1", "a"), ("file2", "b")]).await;
    persist_snapshot_with_files(&client, snapshot_id(2), &[("file1", "c")]).await;

    // Exactly index 2's directory and checksum file remain.
    let names = dir_names(&root.path().join("snapshots"));
    assert_eq!(names, vec!["2-1-200-200".to_string(), "2-1-200-200.checksum".to_string()]);

    let latest = client.latest_snapshot().await.unwrap().unwrap();
    assert_eq!(latest.id, snapshot_id(2));
    assert_eq!(fs::read_to_string(latest.path.join("file1")).unwrap(), "c");
}

#[tokio::test]
async fn persist_is_idempotent() {
    let root = tempfile::tempdir().unwrap();
    let client = open_client(root.path());

    let transient = client
        .new_transient_snapshot(snapshot_id(1))
        .await
        .unwrap()
        .unwrap();
    client
        .take(transient, |dir| fs::write(dir.join("file1"), "a"))
        .await
        .unwrap();

    let first = client.persist_transient(transient).await.unwrap();
    let second = client.persist_transient(transient).await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(first.checksum, second.checksum);
    assert_eq!(first.path, second.path);
}

#[tokio::test]
async fn reserved_snapshot_survives_supersession_until_released() {
    let root = tempfile::tempdir().unwrap();
    let client = open_client(root.path());

    let first = persist_snapshot_with_files(&client, snapshot_id(1), &[("file1", "a")]).await;

    let reservation = client.reserve().await.unwrap();
    assert_eq!(reservation.snapshot().id, snapshot_id(1));

    persist_snapshot_with_files(&client, snapshot_id(2), &[("file1", "b")]).await;

    // Superseded but reserved: still on disk.
    assert!(first.path.exists());

    reservation.release();

    // Released and superseded: removed by the next persist.
    persist_snapshot_with_files(&client, snapshot_id(3), &[("file1", "c")]).await;
    assert!(!first.path.exists());
}

#[tokio::test]
async fn chunked_transfer_between_stores() {
    let source_root = tempfile::tempdir().unwrap();
    let source = open_client(source_root.path());
    let receiver_root = tempfile::tempdir().unwrap();
    let receiver = open_client(receiver_root.path());

    let id = snapshot_id(7);
    let persisted =
        persist_snapshot_with_files(&source, id, &[("file1", "contents-1"), ("file2", "contents-2")]).await;

    let chunks = source.chunks(id).await.unwrap();
    assert_eq!(chunks.len(), 2);

    let received = receiver.new_received_snapshot(id).await.unwrap();
    for chunk in chunks {
        assert!(receiver.apply_chunk(received, chunk).await.unwrap());
    }

    let reassembled = receiver.persist_received(received).await.unwrap();
    assert_eq!(reassembled.id, id);
    assert_eq!(reassembled.checksum, persisted.checksum);
    assert_eq!(
        fs::read_to_string(reassembled.path.join("file1")).unwrap(),
        "contents-1"
    );
}

#[tokio::test]
async fn corrupted_chunk_is_rejected_and_prior_chunks_survive() {
    let source_root = tempfile::tempdir().unwrap();
    let source = open_client(source_root.path());
    let receiver_root = tempfile::tempdir().unwrap();
    let receiver = open_client(receiver_root.path());

    let id = snapshot_id(7);
    persist_snapshot_with_files(&source, id, &[("file1", "contents-1"), ("file2", "contents-2")]).await;
    let chunks = source.chunks(id).await.unwrap();

    let received = receiver.new_received_snapshot(id).await.unwrap();

    // Chunk 1/2 applies cleanly.
    assert!(receiver.apply_chunk(received, chunks[0].clone()).await.unwrap());

    // Chunk 2/2 arrives corrupted: soft failure, nothing written.
    let mut corrupted = chunks[1].clone();
    corrupted.content = bytes::Bytes::from_static(b"bit-flipped");
    assert!(!receiver.apply_chunk(received, corrupted).await.unwrap());

    // The received snapshot directory holds only chunk 1's file.
    let pending_dir = receiver_root.path().join("pending").join(id.to_string());
    assert_eq!(dir_names(&pending_dir), vec!["file1".to_string()]);

    // Persisting now fails; retrying the failed chunk completes the transfer.
    match receiver.persist_received(received).await {
        Err(SnapshotStoreError::MissingChunks { applied, total, .. }) => {
            assert_eq!((applied, total), (1, 2));
        }
        other => panic!("expected MissingChunks, got {:?}", other),
    }

    assert!(receiver.apply_chunk(received, chunks[1].clone()).await.unwrap());
    receiver.persist_received(received).await.unwrap();
}

#[tokio::test]
async fn corrupt_persisted_snapshot_is_deleted_at_startup() {
    let root = tempfile::tempdir().unwrap();
    {
        let client = open_client(root.path());
        persist_snapshot_with_files(&client, snapshot_id(1), &[("file1", "a")]).await;
    }

    // Flip bits behind the store's back.
    fs::write(
        root.path().join("snapshots").join("1-1-100-100").join("file1"),
        "tampered",
    )
    .unwrap();

    let client = open_client(root.path());
    assert!(client.latest_snapshot().await.unwrap().is_none());
    assert!(!root.path().join("snapshots").join("1-1-100-100").exists());
}

#[tokio::test]
async fn purge_pending_reclaims_disk_but_keeps_persisted_state() {
    let root = tempfile::tempdir().unwrap();
    let client = open_client(root.path());

    persist_snapshot_with_files(&client, snapshot_id(1), &[("file1", "a")]).await;

    // A half-built transient and a half-received snapshot sit in pending.
    let transient = client
        .new_transient_snapshot(snapshot_id(2))
        .await
        .unwrap()
        .unwrap();
    client
        .take(transient, |dir| fs::write(dir.join("file1"), "b"))
        .await
        .unwrap();

    client.purge_pending_snapshots().await.unwrap();

    assert_eq!(dir_names(&root.path().join("pending")), Vec::<String>::new());
    assert_eq!(
        client.latest_snapshot().await.unwrap().unwrap().id,
        snapshot_id(1)
    );
}

#[tokio::test]
async fn copy_snapshot_to_fresh_directory() {
    let root = tempfile::tempdir().unwrap();
    let client = open_client(root.path());

    persist_snapshot_with_files(&client, snapshot_id(1), &[("file1", "a"), ("file2", "b")]).await;

    let target: PathBuf = root.path().join("backup");
    client.copy_snapshot(snapshot_id(1), target.clone()).await.unwrap();
    assert_eq!(fs::read_to_string(target.join("file1")).unwrap(), "a");
    assert_eq!(fs::read_to_string(target.join("file2")).unwrap(), "b");

    // Copying onto an existing directory is refused.
    match client.copy_snapshot(snapshot_id(1), target).await {
        Err(SnapshotStoreError::TargetExists(_)) => {}
        other => panic!("expected TargetExists, got {:?}", other),
    }
}

#[tokio::test]
async fn listeners_observe_every_persist() {
    let root = tempfile::tempdir().unwrap();
    let client = open_client(root.path());

    let mut listener = client.add_listener().await.unwrap();

    persist_snapshot_with_files(&client, snapshot_id(1), &[("file1", "a")]).await;
    let notified = listener.recv().await.unwrap();
    assert_eq!(notified.id, snapshot_id(1));

    persist_snapshot_with_files(&client, snapshot_id(2), &[("file1", "b")]).await;
    let notified = listener.recv().await.unwrap();
    assert_eq!(notified.id, snapshot_id(2));
}
