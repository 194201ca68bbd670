//! Shared harness: an engine over a scratch directory, an in-memory remote
//! and a token endpoint that hands out long-lived tokens.

#![allow(dead_code)]

use async_trait::async_trait;
use nutrack_sync::{
    ChannelBroadcaster, Error, Event, MemoryRemote, Result, SqliteStore, SyncConfig, SyncEngine,
    SyncEngineBuilder, TokenEndpoint, TokenResponse,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;

pub const REMOTE_PATH: &str = "/nutrack.db";

/// Token endpoint that grants every exchange and rejects every refresh
pub struct ScriptedEndpoint;

#[async_trait]
impl TokenEndpoint for ScriptedEndpoint {
    async fn exchange(&self, code: &str, _code_verifier: &str) -> Result<TokenResponse> {
        Ok(TokenResponse {
            access_token: format!("access-for-{}", code),
            refresh_token: Some("refresh".to_string()),
            expires_in: 4 * 60 * 60,
        })
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<TokenResponse> {
        Err(Error::RemoteRejected {
            status: 400,
            body: "invalid_grant".to_string(),
        })
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub db_path: PathBuf,
    pub engine: Arc<SyncEngine>,
    pub remote: Arc<MemoryRemote>,
    pub bus: Arc<ChannelBroadcaster>,
    pub events: broadcast::Receiver<Event>,
}

pub fn test_config(dir: &TempDir) -> SyncConfig {
    SyncConfig::new(dir.path().join("data"))
        .with_remote_path(REMOTE_PATH)
        .with_invalidation_stagger(Duration::from_millis(1))
}

/// Engine with `local` as the database file, not yet logged in.
pub fn unauthenticated(local: &[u8]) -> Harness {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("nutrack.db");
    std::fs::write(&db_path, local).unwrap();

    let remote = Arc::new(MemoryRemote::new());
    let bus = Arc::new(ChannelBroadcaster::new(256));
    let events = bus.subscribe();

    let engine = SyncEngineBuilder::new(test_config(&dir))
        .with_store(Arc::new(SqliteStore::new(&db_path)))
        .with_remote(remote.clone())
        .with_token_endpoint(Arc::new(ScriptedEndpoint))
        .with_broadcaster(bus.clone())
        .build()
        .unwrap();

    Harness {
        dir,
        db_path,
        engine: Arc::new(engine),
        remote,
        bus,
        events,
    }
}

/// Logged-in engine with auto-sync on.
pub async fn harness(local: &[u8]) -> Harness {
    let h = unauthenticated(local);
    h.engine.exchange_code("code", "verifier").await.unwrap();
    h.engine.set_auto_sync(true).unwrap();
    h
}

impl Harness {
    pub fn local(&self) -> Vec<u8> {
        std::fs::read(&self.db_path).unwrap()
    }

    pub fn write_local(&self, data: &[u8]) {
        std::fs::write(&self.db_path, data).unwrap();
    }

    /// Events published so far, oldest first.
    pub fn drain_events(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}
