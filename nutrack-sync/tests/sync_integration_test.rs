//! End-to-end sync scenarios against the in-memory remote.

mod common;

use async_trait::async_trait;
use bytes::Bytes;
use common::{harness, test_config, unauthenticated, ScriptedEndpoint, REMOTE_PATH};
use nutrack_sync::hasher::content_hash_bytes;
use nutrack_sync::{
    Action, ChannelBroadcaster, ConflictSide, Entity, Error, Event, InjectedFailure,
    MemoryRemote, RemoteMetadata, RemoteStore, Result, SqliteStore, SyncCheck, SyncEngine,
    SyncEngineBuilder, TransferStatus,
};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock, Weak};
use tempfile::TempDir;

fn download_events() -> Vec<Event> {
    vec![
        Event::RemoteFileUpdated,
        Event::Invalidated(Entity::ConsumedFoodItems),
        Event::Invalidated(Entity::FoodItems),
        Event::Invalidated(Entity::Profiles),
        Event::Invalidated(Entity::UserSettings),
    ]
}

#[tokio::test]
async fn test_fresh_install_downloads_remote() {
    let mut h = harness(b"empty schema").await;
    h.remote.put_file(REMOTE_PATH, &b"remote v1"[..]);
    let h1 = content_hash_bytes(b"remote v1");

    let check = h.engine.sync_if_due(true).await.unwrap();

    assert_eq!(check, SyncCheck::Completed(Action::AwaitInitialDownload));
    assert_eq!(h.local(), b"remote v1");
    let state = h.engine.state();
    assert_eq!(state.stored_hash, h1);
    assert!(state.synced);
    assert!(state.last_hash_check_millis > 0);
    assert_eq!(h.drain_events(), download_events());
}

#[tokio::test]
async fn test_local_only_edit_uploads() {
    let mut h = harness(b"v1").await;
    h.remote.put_file(REMOTE_PATH, &b"v1"[..]);
    h.engine.ledger().mark_synced(&content_hash_bytes(b"v1")).unwrap();

    h.write_local(b"v2");
    h.engine.mark_local_change(Entity::FoodItems).unwrap();
    assert!(!h.engine.state().synced);

    let check = h.engine.sync_if_due(true).await.unwrap();

    assert_eq!(check, SyncCheck::Completed(Action::Upload));
    assert_eq!(h.remote.file(REMOTE_PATH).unwrap(), &b"v2"[..]);
    let state = h.engine.state();
    assert_eq!(state.stored_hash, content_hash_bytes(b"v2"));
    assert!(state.synced);
    assert_eq!(h.drain_events(), vec![Event::Invalidated(Entity::FoodItems)]);
}

#[tokio::test]
async fn test_upload_twice_is_up_to_date() {
    let h = harness(b"local data").await;

    let first = h.engine.upload_database().await.unwrap();
    let second = h.engine.upload_database().await.unwrap();

    assert_eq!(first.status, TransferStatus::Uploaded);
    assert_eq!(second.status, TransferStatus::UpToDate);
    assert!(first.success && second.success);
    assert_eq!(h.remote.upload_count(), 1);
    assert!(h.engine.state().synced);
}

#[tokio::test]
async fn test_up_to_date_upload_still_marks_synced() {
    let h = harness(b"same").await;
    h.remote.put_file(REMOTE_PATH, &b"same"[..]);
    h.engine.ledger().mark_unsynced().unwrap();

    let outcome = h.engine.upload_database().await.unwrap();

    assert_eq!(outcome.status, TransferStatus::UpToDate);
    assert_eq!(h.remote.upload_count(), 0);
    let state = h.engine.state();
    assert!(state.synced);
    assert_eq!(state.stored_hash, content_hash_bytes(b"same"));
}

#[tokio::test]
async fn test_conflict_never_auto_downloads() {
    let mut h = harness(b"v1").await;
    h.engine.ledger().mark_synced(&content_hash_bytes(b"v1")).unwrap();

    // Both sides move on independently
    h.remote.put_file(REMOTE_PATH, &b"remote v2"[..]);
    h.write_local(b"local v2");
    h.engine.mark_local_change(Entity::ConsumedFoodItems).unwrap();
    h.drain_events();

    let err = h.engine.download_database().await.unwrap_err();
    assert!(matches!(err, Error::Conflict));
    assert_eq!(h.drain_events(), vec![Event::ShowSyncConflict]);

    let polled = h.engine.poll_remote().await.unwrap();
    assert_eq!(polled, SyncCheck::Completed(Action::Conflict));
    assert_eq!(h.drain_events(), vec![Event::ShowSyncConflict]);

    let err = h.engine.sync_if_due(true).await.unwrap_err();
    assert_eq!(err.code(), "CONFLICT");

    assert_eq!(h.local(), b"local v2");
    assert_eq!(h.remote.download_count(), 0);
    assert_eq!(h.remote.upload_count(), 0);
    assert!(!h.engine.state().synced);
}

#[tokio::test]
async fn test_poll_downloads_remote_change_when_synced() {
    let mut h = harness(b"v1").await;
    h.engine.ledger().mark_synced(&content_hash_bytes(b"v1")).unwrap();
    h.remote.put_file(REMOTE_PATH, &b"v2 from another device"[..]);

    let polled = h.engine.poll_remote().await.unwrap();

    assert_eq!(polled, SyncCheck::Completed(Action::Download));
    assert_eq!(h.local(), b"v2 from another device");
    assert_eq!(h.engine.state().stored_hash, content_hash_bytes(b"v2 from another device"));
    assert_eq!(h.drain_events(), download_events());
}

#[tokio::test]
async fn test_poll_ignores_local_only_changes() {
    let h = harness(b"v1").await;
    h.remote.put_file(REMOTE_PATH, &b"v1"[..]);
    h.engine.ledger().mark_synced(&content_hash_bytes(b"v1")).unwrap();
    h.engine.ledger().mark_unsynced().unwrap();

    let polled = h.engine.poll_remote().await.unwrap();

    assert_eq!(polled, SyncCheck::Completed(Action::Upload));
    assert_eq!(h.remote.upload_count(), 0);
    assert_eq!(h.remote.download_count(), 0);
}

#[tokio::test]
async fn test_download_not_found_has_no_side_effects() {
    let h = harness(b"local").await;
    let before = h.engine.state();

    let outcome = h.engine.download_database().await.unwrap();

    assert!(!outcome.success);
    assert_eq!(outcome.status, TransferStatus::NotFound);
    assert_eq!(h.engine.state(), before);
    assert_eq!(h.local(), b"local");
}

#[tokio::test]
async fn test_download_when_local_matches_is_up_to_date() {
    let mut h = harness(b"same bytes").await;
    h.remote.put_file(REMOTE_PATH, &b"same bytes"[..]);

    let outcome = h.engine.download_database().await.unwrap();

    assert_eq!(outcome.status, TransferStatus::UpToDate);
    assert_eq!(h.remote.download_count(), 0);
    assert!(h.engine.state().synced);
    assert!(h.drain_events().is_empty());
}

#[tokio::test]
async fn test_sync_uploads_when_remote_absent() {
    let h = harness(b"first upload").await;

    let check = h.engine.sync_if_due(true).await.unwrap();

    assert_eq!(check, SyncCheck::Completed(Action::Upload));
    assert_eq!(h.remote.file(REMOTE_PATH).unwrap(), &b"first upload"[..]);
    assert_eq!(h.engine.state().stored_hash, content_hash_bytes(b"first upload"));
}

#[tokio::test]
async fn test_sync_if_due_gating() {
    let h = harness(b"data").await;
    h.remote.put_file(REMOTE_PATH, &b"data"[..]);

    h.engine.set_auto_sync(false).unwrap();
    assert_eq!(h.engine.sync_if_due(true).await.unwrap(), SyncCheck::Disabled);
    assert_eq!(h.remote.metadata_count(), 0);

    h.engine.set_auto_sync(true).unwrap();
    assert!(matches!(h.engine.sync_if_due(false).await.unwrap(), SyncCheck::Completed(_)));
    let calls = h.remote.metadata_count();

    // Checked a moment ago
    assert_eq!(h.engine.sync_if_due(false).await.unwrap(), SyncCheck::NotDue);
    assert_eq!(h.remote.metadata_count(), calls);

    assert!(matches!(h.engine.sync_if_due(true).await.unwrap(), SyncCheck::Completed(_)));
}

#[tokio::test]
async fn test_network_errors_are_retryable_and_swallowed_before_reads() {
    let h = harness(b"data").await;
    h.remote.set_failure(Some(InjectedFailure::Network));

    let err = h.engine.sync_if_due(true).await.unwrap_err();
    assert!(err.is_retryable());
    assert!(!err.is_rate_limited());

    // Must not propagate
    h.engine.sync_before_read().await;
    assert_eq!(h.local(), b"data");
}

#[tokio::test]
async fn test_remote_rejection_is_not_retryable() {
    let h = harness(b"data").await;
    h.remote.set_failure(Some(InjectedFailure::Rejected(507)));

    let err = h.engine.upload_database().await.unwrap_err();
    assert!(matches!(err, Error::RemoteRejected { status: 507, .. }));
    assert!(!err.is_retryable());
    assert!(!h.engine.state().synced);
}

#[tokio::test]
async fn test_resolve_conflict_either_side() {
    let h = harness(b"v1").await;
    h.engine.ledger().mark_synced(&content_hash_bytes(b"v1")).unwrap();
    h.remote.put_file(REMOTE_PATH, &b"remote v2"[..]);
    h.write_local(b"local v2");
    h.engine.ledger().mark_unsynced().unwrap();

    let outcome = h.engine.resolve_conflict(ConflictSide::KeepRemote).await.unwrap();
    assert_eq!(outcome.status, TransferStatus::Downloaded);
    assert_eq!(h.local(), b"remote v2");
    assert!(h.engine.state().synced);

    h.write_local(b"local v3");
    h.engine.ledger().mark_unsynced().unwrap();
    h.remote.put_file(REMOTE_PATH, &b"remote v3"[..]);

    let outcome = h.engine.resolve_conflict(ConflictSide::KeepLocal).await.unwrap();
    assert_eq!(outcome.status, TransferStatus::Uploaded);
    assert_eq!(h.remote.file(REMOTE_PATH).unwrap(), &b"local v3"[..]);
    assert_eq!(h.engine.state().stored_hash, content_hash_bytes(b"local v3"));
}

#[tokio::test]
async fn test_unauthenticated_and_logout() {
    let h = unauthenticated(b"data");
    h.engine.set_auto_sync(true).unwrap();

    assert!(!h.engine.is_authenticated().await);
    let err = h.engine.upload_database().await.unwrap_err();
    assert_eq!(err.code(), "UNAUTHENTICATED");

    h.engine.exchange_code("abc", "verifier").await.unwrap();
    assert!(h.engine.is_authenticated().await);

    h.engine.logout().unwrap();
    assert!(!h.engine.is_authenticated().await);
    assert!(!h.engine.auto_sync());
    assert_eq!(h.remote.upload_count(), 0);
}

#[tokio::test]
async fn test_cleanup_deletes_old_rows_and_marks_unsynced() {
    let mut h = harness(b"").await;
    std::fs::remove_file(&h.db_path).unwrap();
    {
        let conn = rusqlite::Connection::open(&h.db_path).unwrap();
        conn.execute_batch(
            "CREATE TABLE consumedFoodItems (id INTEGER PRIMARY KEY, date TEXT NOT NULL);
             INSERT INTO consumedFoodItems (date) VALUES ('2024-01-15'), ('2024-02-29'), ('2024-05-01');",
        )
        .unwrap();
    }
    h.engine.ledger().mark_synced("whatever").unwrap();

    let today = chrono::NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
    let deleted = h.engine.cleanup_consumed(today).await.unwrap();

    assert_eq!(deleted, 2);
    assert!(!h.engine.state().synced);
    assert_eq!(h.drain_events(), vec![Event::Invalidated(Entity::ConsumedFoodItems)]);

    assert_eq!(h.engine.cleanup_consumed(today).await.unwrap(), 0);
}

/// Remote whose download lets a local write land before the bytes arrive.
struct WriteDuringDownload {
    inner: MemoryRemote,
    db_path: PathBuf,
    engine: OnceLock<Weak<SyncEngine>>,
}

#[async_trait]
impl RemoteStore for WriteDuringDownload {
    async fn metadata(&self, access_token: &str, path: &str) -> Result<Option<RemoteMetadata>> {
        self.inner.metadata(access_token, path).await
    }

    async fn upload(&self, access_token: &str, path: &str, body: Bytes) -> Result<()> {
        self.inner.upload(access_token, path, body).await
    }

    async fn download(&self, access_token: &str, path: &str) -> Result<Bytes> {
        let data = self.inner.download(access_token, path).await?;
        std::fs::write(&self.db_path, b"local write during download")?;
        if let Some(engine) = self.engine.get().and_then(Weak::upgrade) {
            engine.mark_local_change(Entity::FoodItems)?;
        }
        Ok(data)
    }
}

#[tokio::test]
async fn test_local_write_during_download_is_kept() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("nutrack.db");
    std::fs::write(&db_path, b"v1").unwrap();

    let remote = Arc::new(WriteDuringDownload {
        inner: MemoryRemote::new(),
        db_path: db_path.clone(),
        engine: OnceLock::new(),
    });
    remote.inner.put_file(REMOTE_PATH, &b"remote v2"[..]);
    let bus = Arc::new(ChannelBroadcaster::new(64));
    let mut events = bus.subscribe();

    let engine = SyncEngineBuilder::new(test_config(&dir))
        .with_store(Arc::new(SqliteStore::new(&db_path)))
        .with_remote(remote.clone())
        .with_token_endpoint(Arc::new(ScriptedEndpoint))
        .with_broadcaster(bus.clone())
        .build()
        .unwrap();
    let engine = Arc::new(engine);
    remote.engine.set(Arc::downgrade(&engine)).unwrap();

    engine.exchange_code("code", "verifier").await.unwrap();
    engine.set_auto_sync(true).unwrap();
    engine.ledger().mark_synced(&content_hash_bytes(b"v1")).unwrap();

    let err = engine.poll_remote().await.unwrap_err();
    assert!(matches!(err, Error::Conflict));

    assert_eq!(std::fs::read(&db_path).unwrap(), b"local write during download");
    let state = engine.state();
    assert!(!state.synced);
    assert_eq!(state.stored_hash, content_hash_bytes(b"v1"));

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert_eq!(
        seen,
        vec![Event::Invalidated(Entity::FoodItems), Event::ShowSyncConflict]
    );

    // Keeping the remote copy is still possible on request
    let outcome = engine.resolve_conflict(ConflictSide::KeepRemote).await.unwrap();
    assert_eq!(outcome.status, TransferStatus::Downloaded);
}
