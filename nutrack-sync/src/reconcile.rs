//! Reconciliation decision table

use serde::{Deserialize, Serialize};

use crate::ledger::SyncState;
use crate::remote::RemoteMetadata;

/// What a sync pass should do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Action {
    NoOp,
    Upload,
    Download,
    /// Both sides changed since the last transfer
    Conflict,
    /// Never synced on this install but a remote copy exists
    AwaitInitialDownload,
}

impl Action {
    /// True for actions that replace the local file.
    pub fn is_download(self) -> bool {
        matches!(self, Action::Download | Action::AwaitInitialDownload)
    }
}

/// Decide the action from the remote metadata and the ledger.
///
/// Rows are evaluated in order. The local content hash is not consulted:
/// `synced` already says whether local changed since `stored_hash`, and the
/// transfers compare hashes again before moving any bytes.
pub fn reconcile(remote: Option<&RemoteMetadata>, state: &SyncState) -> Action {
    let Some(remote) = remote else {
        return Action::Upload;
    };

    if state.stored_hash.is_empty() {
        return Action::AwaitInitialDownload;
    }

    match (state.stored_hash == remote.content_hash, state.synced) {
        (true, true) => Action::NoOp,
        (true, false) => Action::Upload,
        (false, true) => Action::Download,
        (false, false) => Action::Conflict,
    }
}
