//! Remote synchronization for the Nutrack database
//!
//! Keeps a local single-file SQLite database consistent with one remote copy
//! in a cloud file store. Remote changes are found by polling and compared by
//! content hash. Local writes are debounced into a single delayed upload, and
//! the one unsafe case, both sides changed since the last transfer, is
//! surfaced as a conflict and never resolved automatically.
//!
//! ```no_run
//! use std::sync::Arc;
//! use nutrack_sync::{ChannelBroadcaster, MemoryRemote, SqliteStore, SyncConfig, SyncEngineBuilder};
//! # use nutrack_sync::{TokenEndpoint, TokenResponse};
//! # struct NoEndpoint;
//! # #[async_trait::async_trait]
//! # impl TokenEndpoint for NoEndpoint {
//! #     async fn exchange(&self, _: &str, _: &str) -> nutrack_sync::Result<TokenResponse> { unimplemented!() }
//! #     async fn refresh(&self, _: &str) -> nutrack_sync::Result<TokenResponse> { unimplemented!() }
//! # }
//!
//! # async fn run() -> nutrack_sync::Result<()> {
//! let engine = SyncEngineBuilder::new(SyncConfig::new("data"))
//!     .with_store(Arc::new(SqliteStore::new("data/nutrack.db")))
//!     .with_remote(Arc::new(MemoryRemote::new()))
//!     .with_token_endpoint(Arc::new(NoEndpoint))
//!     .with_broadcaster(Arc::new(ChannelBroadcaster::default()))
//!     .build()?;
//!
//! engine.sync_if_due(true).await?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod config;
pub mod error;
pub mod hasher;
pub mod ledger;
pub mod notify;
pub mod reconcile;
pub mod remote;
pub mod scheduler;
pub mod store;
pub mod sync_engine;
pub mod token;
pub mod vault;

pub use backoff::{BackoffPolicy, BackoffState, Outcome};
pub use config::{read_secret, SyncConfig};
pub use error::{Error, Result};
pub use hasher::content_hash;
pub use ledger::{SettingsLedger, SyncState};
pub use notify::{Broadcaster, ChannelBroadcaster, Entity, Event, StdioBroadcaster, Transport};
pub use reconcile::{reconcile, Action};
pub use remote::{InjectedFailure, MemoryRemote, RemoteMetadata, RemoteStore};
pub use scheduler::Scheduler;
pub use store::{LocalStore, SqliteStore};
pub use sync_engine::{ConflictSide, SyncCheck, SyncEngine, TransferOutcome, TransferStatus};
pub use token::{PkceChallenge, TokenEndpoint, TokenManager, TokenResponse};
pub use vault::{CredentialVault, Credentials};

#[cfg(feature = "dropbox")]
pub use remote::dropbox::{authorize_url, DropboxOAuth, DropboxRemote};

use std::sync::Arc;
use tracing::info;

/// Builder for wiring a [`SyncEngine`] to its collaborators
pub struct SyncEngineBuilder {
    config: SyncConfig,
    store: Option<Arc<dyn LocalStore>>,
    remote: Option<Arc<dyn RemoteStore>>,
    token_endpoint: Option<Arc<dyn TokenEndpoint>>,
    broadcaster: Option<Arc<dyn Broadcaster>>,
}

impl SyncEngineBuilder {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            store: None,
            remote: None,
            token_endpoint: None,
            broadcaster: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn LocalStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteStore>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_token_endpoint(mut self, endpoint: Arc<dyn TokenEndpoint>) -> Self {
        self.token_endpoint = Some(endpoint);
        self
    }

    pub fn with_broadcaster(mut self, broadcaster: Arc<dyn Broadcaster>) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    /// Validate the configuration, open the ledger and vault in the data
    /// directory and assemble the engine.
    pub fn build(self) -> Result<SyncEngine> {
        self.config.validate()?;

        let store = self
            .store
            .ok_or_else(|| Error::InvalidConfig("Local store is required".to_string()))?;
        let remote = self
            .remote
            .ok_or_else(|| Error::InvalidConfig("Remote store is required".to_string()))?;
        let endpoint = self
            .token_endpoint
            .ok_or_else(|| Error::InvalidConfig("Token endpoint is required".to_string()))?;
        let broadcaster = self
            .broadcaster
            .ok_or_else(|| Error::InvalidConfig("Broadcaster is required".to_string()))?;

        let ledger = Arc::new(SettingsLedger::open(&self.config.data_dir)?);
        let vault = Arc::new(CredentialVault::open(self.config.data_dir.join("tokens"))?);
        let tokens = TokenManager::new(vault, endpoint, self.config.refresh_window);

        info!(
            "Sync engine ready for {} (remote {})",
            store.path().display(),
            self.config.remote_path
        );
        Ok(SyncEngine::new(self.config, store, remote, tokens, ledger, broadcaster))
    }
}
