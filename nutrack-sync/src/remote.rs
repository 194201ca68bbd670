//! Remote object store abstraction
//!
//! The engine only needs three calls against the cloud file store: metadata
//! lookup, whole-file upload with overwrite semantics, and whole-file
//! download. A missing remote file is a normal `None`, not an error.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::time::Instant;

use crate::{hasher, Error, Result};

#[cfg(feature = "dropbox")]
pub mod dropbox;

/// Metadata of the remote database file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMetadata {
    pub content_hash: String,
    pub path: String,
    pub size: u64,
    pub server_modified: Option<DateTime<Utc>>,
}

/// Trait for remote store implementations
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Look up the file at `path`. `Ok(None)` means the file does not exist.
    async fn metadata(&self, access_token: &str, path: &str) -> Result<Option<RemoteMetadata>>;

    /// Replace the file at `path` with `body`.
    async fn upload(&self, access_token: &str, path: &str, body: Bytes) -> Result<()>;

    /// Fetch the full contents of the file at `path`.
    async fn download(&self, access_token: &str, path: &str) -> Result<Bytes>;
}

/// Failure injected into [`MemoryRemote`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    Network,
    RateLimited,
    Rejected(u16),
}

impl InjectedFailure {
    fn to_error(self) -> Error {
        match self {
            Self::Network => Error::Network("connection reset".to_string()),
            Self::RateLimited => Error::RateLimited("too many requests".to_string()),
            Self::Rejected(status) => Error::RemoteRejected {
                status,
                body: "rejected".to_string(),
            },
        }
    }
}

#[derive(Default)]
struct MemoryState {
    files: HashMap<String, Bytes>,
    failure: Option<InjectedFailure>,
    uploads: Vec<Instant>,
    downloads: usize,
    metadata_calls: usize,
}

/// In-memory remote store for tests and offline runs
#[derive(Default)]
pub struct MemoryRemote {
    state: Mutex<MemoryState>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place a file on the remote side without counting it as an upload.
    pub fn put_file(&self, path: &str, data: impl Into<Bytes>) {
        self.state.lock().files.insert(path.to_string(), data.into());
    }

    pub fn file(&self, path: &str) -> Option<Bytes> {
        self.state.lock().files.get(path).cloned()
    }

    /// Make every call fail with `failure` until cleared with `None`.
    pub fn set_failure(&self, failure: Option<InjectedFailure>) {
        self.state.lock().failure = failure;
    }

    pub fn upload_count(&self) -> usize {
        self.state.lock().uploads.len()
    }

    /// Times at which uploads completed
    pub fn upload_times(&self) -> Vec<Instant> {
        self.state.lock().uploads.clone()
    }

    pub fn download_count(&self) -> usize {
        self.state.lock().downloads
    }

    pub fn metadata_count(&self) -> usize {
        self.state.lock().metadata_calls
    }

    fn check_failure(state: &MemoryState) -> Result<()> {
        match state.failure {
            Some(failure) => Err(failure.to_error()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn metadata(&self, _access_token: &str, path: &str) -> Result<Option<RemoteMetadata>> {
        let mut state = self.state.lock();
        state.metadata_calls += 1;
        Self::check_failure(&state)?;

        Ok(state.files.get(path).map(|data| RemoteMetadata {
            content_hash: hasher::content_hash_bytes(data),
            path: path.to_string(),
            size: data.len() as u64,
            server_modified: Some(Utc::now()),
        }))
    }

    async fn upload(&self, _access_token: &str, path: &str, body: Bytes) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_failure(&state)?;

        state.files.insert(path.to_string(), body);
        state.uploads.push(Instant::now());
        Ok(())
    }

    async fn download(&self, _access_token: &str, path: &str) -> Result<Bytes> {
        let mut state = self.state.lock();
        Self::check_failure(&state)?;

        let data = state.files.get(path).cloned().ok_or_else(|| Error::RemoteRejected {
            status: 409,
            body: format!("path/not_found: {}", path),
        })?;
        state.downloads += 1;
        Ok(data)
    }
}
