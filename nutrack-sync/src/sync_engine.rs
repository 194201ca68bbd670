//! Transfers and reconciliation passes
//!
//! Every operation here runs to completion once started. Concurrent calls
//! are allowed: each one compares hashes before moving bytes, so a race
//! degrades to a redundant transfer. A local write that races an automatic
//! download turns it into a conflict instead. The only serialization point
//! is the settings ledger's own lock.

use bytes::Bytes;
use chrono::{Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::hasher;
use crate::ledger::{SettingsLedger, SyncState};
use crate::notify::{Broadcaster, Entity, Event};
use crate::reconcile::{reconcile, Action};
use crate::remote::{RemoteMetadata, RemoteStore};
use crate::store::LocalStore;
use crate::token::TokenManager;
use crate::vault::Credentials;
use crate::{Error, Result};

/// Result status of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferStatus {
    Uploaded,
    UpToDate,
    Downloaded,
    NotFound,
}

/// Outcome returned to callers of the transfer operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOutcome {
    pub success: bool,
    pub status: TransferStatus,
}

impl TransferOutcome {
    fn ok(status: TransferStatus) -> Self {
        Self { success: true, status }
    }

    fn not_found() -> Self {
        Self {
            success: false,
            status: TransferStatus::NotFound,
        }
    }
}

/// Result of a sync check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncCheck {
    /// Auto-sync is switched off
    Disabled,
    /// Last check is more recent than the check interval
    NotDue,
    /// The remote was consulted and `Action` was taken
    Completed(Action),
}

/// Which side wins when resolving a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictSide {
    KeepLocal,
    KeepRemote,
}

/// Sync engine for one local database file and its remote copy
pub struct SyncEngine {
    config: SyncConfig,
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    tokens: TokenManager,
    ledger: Arc<SettingsLedger>,
    notifier: Arc<dyn Broadcaster>,
}

impl SyncEngine {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        tokens: TokenManager,
        ledger: Arc<SettingsLedger>,
        notifier: Arc<dyn Broadcaster>,
    ) -> Self {
        Self {
            config,
            store,
            remote,
            tokens,
            ledger,
            notifier,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<SettingsLedger> {
        &self.ledger
    }

    pub fn state(&self) -> SyncState {
        self.ledger.snapshot()
    }

    pub fn publish(&self, event: Event) {
        self.notifier.publish(event);
    }

    /// Upload the local database unless the remote already has the same content.
    pub async fn upload_database(&self) -> Result<TransferOutcome> {
        let creds = self.tokens.get_valid().await?;
        self.push(&creds).await
    }

    async fn push(&self, creds: &Credentials) -> Result<TransferOutcome> {
        // Writes after this point keep the ledger unsynced.
        let generation = self.ledger.generation();
        let data = Bytes::from(tokio::fs::read(self.store.path()).await?);
        let local_hash = hasher::content_hash_bytes(&data);
        debug!("Local hash before upload: {}", local_hash);

        let remote = self
            .remote
            .metadata(&creds.access_token, &self.config.remote_path)
            .await?;

        if remote.as_ref().map(|m| m.content_hash == local_hash).unwrap_or(false) {
            info!("Remote already matches local content, skipping upload");
            self.ledger.mark_synced_since(&local_hash, generation)?;
            return Ok(TransferOutcome::ok(TransferStatus::UpToDate));
        }

        self.remote
            .upload(&creds.access_token, &self.config.remote_path, data)
            .await?;
        self.ledger.mark_synced_since(&local_hash, generation)?;

        info!("Uploaded database to {}", self.config.remote_path);
        Ok(TransferOutcome::ok(TransferStatus::Uploaded))
    }

    /// Download the remote database. Refuses with [`Error::Conflict`] when
    /// local has unsynced changes and the remote changed too.
    pub async fn download_database(&self) -> Result<TransferOutcome> {
        let creds = self.tokens.get_valid().await?;
        let generation = self.ledger.generation();
        let Some(remote) = self.fetch_metadata(&creds).await? else {
            info!("No remote database at {}", self.config.remote_path);
            return Ok(TransferOutcome::not_found());
        };

        if self.local_matches(&remote).await? {
            return Ok(TransferOutcome::ok(TransferStatus::UpToDate));
        }

        let state = self.ledger.snapshot();
        if !state.synced && !state.stored_hash.is_empty() && state.stored_hash != remote.content_hash {
            return Err(self.surface_conflict());
        }

        self.replace_local(&creds, &remote, Some(generation)).await
    }

    /// Force one side to win after a conflict.
    pub async fn resolve_conflict(&self, side: ConflictSide) -> Result<TransferOutcome> {
        info!("Resolving conflict: {:?}", side);
        match side {
            ConflictSide::KeepLocal => self.upload_database().await,
            ConflictSide::KeepRemote => {
                let creds = self.tokens.get_valid().await?;
                match self.fetch_metadata(&creds).await? {
                    Some(remote) => self.pull(&creds, &remote, None).await,
                    None => Ok(TransferOutcome::not_found()),
                }
            }
        }
    }

    /// Run one reconciliation pass if auto-sync is on and the last check is
    /// older than the check interval, or unconditionally with `force`.
    pub async fn sync_if_due(&self, force: bool) -> Result<SyncCheck> {
        let state = self.ledger.snapshot();
        if !state.auto_sync_enabled {
            debug!("Auto-sync disabled, skipping sync check");
            return Ok(SyncCheck::Disabled);
        }

        let now = Utc::now().timestamp_millis();
        let elapsed = now.saturating_sub(state.last_hash_check_millis);
        if !force && elapsed >= 0 && (elapsed as u128) < self.config.check_interval.as_millis() {
            debug!("Last sync check {}ms ago, not due", elapsed);
            return Ok(SyncCheck::NotDue);
        }

        let creds = self.tokens.get_valid().await?;
        let remote = self.fetch_metadata(&creds).await?;
        self.ledger.record_poll(now)?;

        let generation = self.ledger.generation();
        let action = reconcile(remote.as_ref(), &self.ledger.snapshot());
        info!("Sync check decided {:?}", action);

        match (action, remote) {
            (Action::NoOp, _) => {}
            (Action::Upload, _) => {
                self.push(&creds).await?;
            }
            (Action::Conflict, _) => return Err(self.surface_conflict()),
            (_, Some(remote)) => {
                self.pull(&creds, &remote, Some(generation)).await?;
            }
            (_, None) => {}
        }

        Ok(SyncCheck::Completed(action))
    }

    /// Non-forced sync ahead of a read. Errors are logged and dropped.
    pub async fn sync_before_read(&self) {
        if let Err(e) = self.sync_if_due(false).await {
            warn!("Sync before read failed, continuing with local data: {}", e);
        }
    }

    /// One iteration of the background poll. Only remote-side changes are
    /// acted on; a conflict is surfaced and the download skipped.
    pub async fn poll_remote(&self) -> Result<SyncCheck> {
        if !self.ledger.auto_sync() {
            return Ok(SyncCheck::Disabled);
        }

        let creds = self.tokens.get_valid().await?;
        let remote = self.fetch_metadata(&creds).await?;
        let generation = self.ledger.generation();
        let action = reconcile(remote.as_ref(), &self.ledger.snapshot());
        debug!("Poll decided {:?}", action);

        match (action, &remote) {
            (Action::Conflict, _) => {
                warn!("Remote changed while local has unsynced changes, skipping download");
                self.notifier.publish(Event::ShowSyncConflict);
            }
            (action, Some(remote)) if action.is_download() => {
                info!("Remote database changed, downloading");
                self.pull(&creds, remote, Some(generation)).await?;
            }
            _ => {}
        }

        self.ledger.record_poll(Utc::now().timestamp_millis())?;
        Ok(SyncCheck::Completed(action))
    }

    /// Record a local write to `entity` and tell subscribers.
    pub fn mark_local_change(&self, entity: Entity) -> Result<()> {
        self.ledger.mark_unsynced()?;
        self.notifier.publish(Event::Invalidated(entity));
        Ok(())
    }

    /// Delete consumption records older than the retention window counted
    /// back from `today`. Returns the number of rows removed.
    pub async fn cleanup_consumed(&self, today: NaiveDate) -> Result<u64> {
        let cutoff = today
            .checked_sub_months(Months::new(self.config.retention_months))
            .ok_or_else(|| Error::InvalidConfig("retention window out of range".to_string()))?;

        let store = self.store.clone();
        let deleted = blocking(move || store.delete_consumed_before(cutoff)).await?;

        if deleted > 0 {
            info!("Deleted {} consumed food items before {}", deleted, cutoff);
            self.mark_local_change(Entity::ConsumedFoodItems)?;
        } else {
            debug!("No consumed food items before {}", cutoff);
        }
        Ok(deleted)
    }

    pub fn set_auto_sync(&self, enabled: bool) -> Result<()> {
        self.ledger.set_auto_sync(enabled)
    }

    pub fn auto_sync(&self) -> bool {
        self.ledger.auto_sync()
    }

    /// Finish the OAuth flow with the code the user pasted back.
    pub async fn exchange_code(&self, code: &str, code_verifier: &str) -> Result<()> {
        self.tokens.exchange_code(code, code_verifier).await?;
        Ok(())
    }

    pub async fn is_authenticated(&self) -> bool {
        self.tokens.is_authenticated().await
    }

    /// Disable auto-sync and forget the stored credentials.
    pub fn logout(&self) -> Result<()> {
        self.ledger.set_auto_sync(false)?;
        self.tokens.clear()?;
        info!("Logged out of remote store");
        Ok(())
    }

    async fn fetch_metadata(&self, creds: &Credentials) -> Result<Option<RemoteMetadata>> {
        self.remote
            .metadata(&creds.access_token, &self.config.remote_path)
            .await
    }

    /// True if the local file already has the remote content. Marks the
    /// ledger synced in that case.
    async fn local_matches(&self, remote: &RemoteMetadata) -> Result<bool> {
        let generation = self.ledger.generation();
        let path = self.store.path().to_path_buf();

        let local_hash = match blocking(move || hasher::content_hash(&path)).await {
            Ok(hash) => hash,
            Err(Error::Io(e)) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        };

        if local_hash != remote.content_hash {
            return Ok(false);
        }

        info!("Local database already matches remote");
        self.ledger.mark_synced_since(&local_hash, generation)?;
        Ok(true)
    }

    /// Bring the local file up to the remote content. With `guard`, a local
    /// mutation after that generation aborts the pull as a conflict.
    async fn pull(
        &self,
        creds: &Credentials,
        remote: &RemoteMetadata,
        guard: Option<u64>,
    ) -> Result<TransferOutcome> {
        if self.local_matches(remote).await? {
            return Ok(TransferOutcome::ok(TransferStatus::UpToDate));
        }
        self.replace_local(creds, remote, guard).await
    }

    async fn replace_local(
        &self,
        creds: &Credentials,
        remote: &RemoteMetadata,
        guard: Option<u64>,
    ) -> Result<TransferOutcome> {
        let data = self
            .remote
            .download(&creds.access_token, &self.config.remote_path)
            .await?;
        let hash = hasher::content_hash_bytes(&data);
        if hash != remote.content_hash {
            warn!(
                "Downloaded content hash {} differs from metadata hash {}",
                hash, remote.content_hash
            );
        }

        // Last check before the local file is overwritten.
        let generation = self.ledger.generation();
        if matches!(guard, Some(expected) if expected != generation) {
            warn!("Local write during download, keeping local database");
            return Err(self.surface_conflict());
        }

        let target = self.store.path().to_path_buf();
        blocking(move || replace_file_contents(&target, &data)).await?;
        self.ledger.mark_synced_since(&hash, generation)?;

        info!("Replaced local database with remote copy");
        self.announce_remote_update().await;
        Ok(TransferOutcome::ok(TransferStatus::Downloaded))
    }

    async fn announce_remote_update(&self) {
        self.notifier.publish(Event::RemoteFileUpdated);
        for entity in Entity::ALL {
            tokio::time::sleep(self.config.invalidation_stagger).await;
            self.notifier.publish(Event::Invalidated(entity));
        }
    }

    fn surface_conflict(&self) -> Error {
        warn!("Sync conflict: local and remote both changed since last sync");
        self.notifier.publish(Event::ShowSyncConflict);
        Error::Conflict
    }
}

/// Stage `data` in a temp file, then copy it over `target`. Copying instead
/// of renaming works across filesystems.
fn replace_file_contents(target: &Path, data: &[u8]) -> Result<()> {
    let mut staged = tempfile::NamedTempFile::new()?;
    staged.write_all(data)?;
    staged.as_file().sync_all()?;

    std::fs::copy(staged.path(), target)?;
    std::fs::OpenOptions::new().write(true).open(target)?.sync_all()?;
    Ok(())
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::Other, e)))?
}
