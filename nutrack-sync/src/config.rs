//! Engine configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backoff::BackoffPolicy;
use crate::{Error, Result};

/// Directory where container secrets are mounted
pub const SECRETS_DIR: &str = "/run/secrets";

/// Sync engine configuration
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Directory holding the settings and credential files
    pub data_dir: PathBuf,
    /// Path of the database file on the remote store
    pub remote_path: String,
    /// Delay before the first poll after start
    pub first_poll_delay: Duration,
    /// Minimum time between two non-forced sync checks
    pub check_interval: Duration,
    /// Debounce window for uploads after local writes
    pub upload_delay: Duration,
    /// Consumption records older than this many months are deleted
    pub retention_months: u32,
    /// Tokens expiring within this window are refreshed
    pub refresh_window: Duration,
    /// Pause between invalidation events after a download
    pub invalidation_stagger: Duration,
    /// Poll interval and backoff
    pub backoff: BackoffPolicy,
    pub client_id: String,
    pub client_secret: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            remote_path: "/nutrack.db".to_string(),
            first_poll_delay: Duration::from_secs(5),
            check_interval: Duration::from_secs(5 * 60),
            upload_delay: Duration::from_secs(10),
            retention_months: 3,
            refresh_window: Duration::from_secs(30 * 60),
            invalidation_stagger: Duration::from_millis(50),
            backoff: BackoffPolicy::default(),
            client_id: String::new(),
            client_secret: None,
        }
    }
}

impl SyncConfig {
    /// Create a configuration with defaults rooted at `data_dir`
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Fill the OAuth client from `DROPBOX_CLIENT_ID` and `DROPBOX_CLIENT_SECRET`
    pub fn with_secrets_from_env(mut self) -> Self {
        if let Some(id) = read_secret("DROPBOX_CLIENT_ID") {
            self.client_id = id;
        }
        self.client_secret = read_secret("DROPBOX_CLIENT_SECRET");
        self
    }

    pub fn with_remote_path(mut self, path: impl Into<String>) -> Self {
        self.remote_path = path.into();
        self
    }

    /// Regular poll interval, also the floor for backoff recovery
    pub fn poll_interval(&self) -> Duration {
        self.backoff.regular
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.backoff.regular = interval;
        self
    }

    pub fn with_first_poll_delay(mut self, delay: Duration) -> Self {
        self.first_poll_delay = delay;
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_upload_delay(mut self, delay: Duration) -> Self {
        self.upload_delay = delay;
        self
    }

    pub fn with_retention_months(mut self, months: u32) -> Self {
        self.retention_months = months;
        self
    }

    pub fn with_refresh_window(mut self, window: Duration) -> Self {
        self.refresh_window = window;
        self
    }

    pub fn with_invalidation_stagger(mut self, stagger: Duration) -> Self {
        self.invalidation_stagger = stagger;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_client(mut self, client_id: impl Into<String>, client_secret: Option<String>) -> Self {
        self.client_id = client_id.into();
        self.client_secret = client_secret;
        self
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.remote_path.is_empty() {
            return invalid("remote_path must not be empty");
        }
        if !self.remote_path.starts_with('/') {
            return invalid("remote_path must start with '/'");
        }

        let intervals = [
            ("poll_interval", self.backoff.regular),
            ("check_interval", self.check_interval),
            ("upload_delay", self.upload_delay),
            ("backoff.initial", self.backoff.initial),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                return invalid(&format!("{} must be greater than 0", name));
            }
        }

        if self.backoff.ceiling < self.backoff.regular {
            return invalid("backoff.ceiling must not be below poll_interval");
        }
        if self.backoff.factor <= 1.0 || self.backoff.mild_factor <= 1.0 {
            return invalid("backoff factors must be greater than 1");
        }
        if !(0.0..1.0).contains(&self.backoff.jitter) {
            return invalid("backoff.jitter must be in [0, 1)");
        }

        Ok(())
    }
}

fn invalid(message: &str) -> Result<()> {
    Err(Error::InvalidConfig(message.to_string()))
}

/// Read a secret from `/run/secrets/<name lowercased>`, falling back to the
/// environment variable `name`. Empty values count as unset.
pub fn read_secret(name: &str) -> Option<String> {
    read_secret_from(Path::new(SECRETS_DIR), name)
}

pub(crate) fn read_secret_from(dir: &Path, name: &str) -> Option<String> {
    let from_file = std::fs::read_to_string(dir.join(name.to_lowercase()))
        .ok()
        .map(|s| s.trim().to_string());

    from_file
        .or_else(|| std::env::var(name).ok())
        .filter(|s| !s.is_empty())
}
