//! Durable sync state shared by every component
//!
//! The ledger is the single source of truth for "are we synced". Every
//! mutation is applied to a copy, written through to disk, and only then
//! published in memory, all under one lock. A failed write leaves both the
//! file and the in-memory state untouched.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::Result;

const SETTINGS_FILE: &str = "settings.json";

/// Sync-relevant fields of the application settings file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    /// Content hash of the database as of the last successful transfer.
    /// Empty means never synced.
    #[serde(default)]
    pub stored_hash: String,
    /// True iff the local file is believed to match `stored_hash`.
    #[serde(default)]
    pub synced: bool,
    /// Wall-clock millis of the last remote metadata poll
    #[serde(default, rename = "last_hash_check")]
    pub last_hash_check_millis: i64,
    /// Master switch for all automatic transfers
    #[serde(default, rename = "auto_sync_dropbox")]
    pub auto_sync_enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SettingsFile {
    #[serde(flatten)]
    sync: SyncState,
    /// Keys owned by the rest of the application
    #[serde(flatten)]
    other: serde_json::Map<String, serde_json::Value>,
}

struct Inner {
    settings: SettingsFile,
    /// Bumped on every local mutation, never persisted
    generation: u64,
}

/// Write-through store for [`SyncState`]
pub struct SettingsLedger {
    file_path: PathBuf,
    inner: Mutex<Inner>,
}

impl SettingsLedger {
    /// Open the settings file in `dir`, creating it with defaults on first run.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let file_path = dir.join(SETTINGS_FILE);

        let settings = match fs::read(&file_path) {
            Ok(bytes) => {
                let settings: SettingsFile = serde_json::from_slice(&bytes)?;
                debug!("Loaded sync state from {}: {:?}", file_path.display(), settings.sync);
                settings
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let settings = SettingsFile::default();
                write_settings(&file_path, &settings)?;
                info!("Created default settings at {}", file_path.display());
                settings
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            file_path,
            inner: Mutex::new(Inner { settings, generation: 0 }),
        })
    }

    /// Copy of the current state
    pub fn snapshot(&self) -> SyncState {
        self.inner.lock().settings.sync.clone()
    }

    pub fn auto_sync(&self) -> bool {
        self.inner.lock().settings.sync.auto_sync_enabled
    }

    /// Counter of local mutations seen so far. Pass it to
    /// [`mark_synced_since`](Self::mark_synced_since) to detect writes that
    /// raced with a transfer.
    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// Record that the local database changed since the last transfer.
    pub fn mark_unsynced(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.generation += 1;

        if inner.settings.sync.synced {
            info!("Sync status changed: SYNCED -> UNSYNCED");
        }
        self.update(&mut inner, |state| state.synced = false)
    }

    /// Record a completed transfer of content with hash `hash`.
    pub fn mark_synced(&self, hash: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        info!("Sync status changed: -> SYNCED (hash: {})", hash);
        self.update(&mut inner, |state| {
            state.stored_hash = hash.to_string();
            state.synced = true;
        })
    }

    /// Like [`mark_synced`](Self::mark_synced), but if a local mutation
    /// happened after `generation` was read, only the hash is recorded and
    /// the ledger stays unsynced so the newer write still gets uploaded.
    pub fn mark_synced_since(&self, hash: &str, generation: u64) -> Result<bool> {
        let mut inner = self.inner.lock();
        let clean = inner.generation == generation;

        if clean {
            info!("Sync status changed: -> SYNCED (hash: {})", hash);
        } else {
            info!("Local write during transfer, keeping UNSYNCED (hash: {})", hash);
        }
        self.update(&mut inner, |state| {
            state.stored_hash = hash.to_string();
            state.synced = clean;
        })?;
        Ok(clean)
    }

    pub fn record_poll(&self, now_millis: i64) -> Result<()> {
        let mut inner = self.inner.lock();
        self.update(&mut inner, |state| state.last_hash_check_millis = now_millis)
    }

    pub fn set_auto_sync(&self, enabled: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        info!("Auto-sync {}", if enabled { "enabled" } else { "disabled" });
        self.update(&mut inner, |state| state.auto_sync_enabled = enabled)
    }

    fn update(&self, inner: &mut Inner, apply: impl FnOnce(&mut SyncState)) -> Result<()> {
        let mut next = inner.settings.clone();
        apply(&mut next.sync);
        write_settings(&self.file_path, &next)?;
        inner.settings = next;
        Ok(())
    }
}

/// Replace the settings file atomically and durably: write a sibling temp
/// file, fsync it, rename it over the target, then fsync the directory.
fn write_settings(path: &Path, settings: &SettingsFile) -> Result<()> {
    let data = serde_json::to_vec_pretty(settings)?;
    let tmp = path.with_extension("json.tmp");

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp)?;
    file.write_all(&data)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp, path)?;
    sync_parent_dir(path)?;
    Ok(())
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(dir) => fs::File::open(dir)?.sync_all(),
        None => Ok(()),
    }
}

// Directory handles cannot be fsynced on this platform.
#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}
