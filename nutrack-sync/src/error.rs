use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Not authenticated: {0}")]
    Unauthenticated(String),

    #[error("Token refresh failed: {0}")]
    RefreshFailed(#[source] Box<Error>),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limited by remote store: {0}")]
    RateLimited(String),

    #[error("Remote store rejected request with status {status}: {body}")]
    RemoteRejected { status: u16, body: String },

    #[error("Sync conflict: remote file changed but local is not synced")]
    Conflict,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Local store error: {0}")]
    Store(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Returns a stable error code for this error variant.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Unauthenticated(_) => "UNAUTHENTICATED",
            Error::RefreshFailed(_) => "REFRESH_FAILED",
            Error::Network(_) => "NETWORK_ERROR",
            Error::RateLimited(_) => "RATE_LIMITED",
            Error::RemoteRejected { .. } => "REMOTE_REJECTED",
            Error::Conflict => "CONFLICT",
            Error::Io(_) => "IO_ERROR",
            Error::Encryption(_) => "ENCRYPTION_ERROR",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
            Error::Store(_) => "STORE_ERROR",
            Error::InvalidConfig(_) => "INVALID_CONFIG",
        }
    }

    /// Returns true if a later attempt may succeed without user action.
    ///
    /// Nothing retries synchronously inside a call. The scheduler backs off
    /// on every failure but logs non-retryable ones as errors.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Network(_) => true,
            Error::RateLimited(_) => true,
            Error::RefreshFailed(cause) => cause.is_retryable(),

            Error::Unauthenticated(_) => false,
            Error::RemoteRejected { .. } => false,
            Error::Conflict => false,
            Error::Io(_) => false,
            Error::Encryption(_) => false,
            Error::Serialization(_) => false,
            Error::Store(_) => false,
            Error::InvalidConfig(_) => false,
        }
    }

    /// Returns true if the remote side answered with HTTP 429, including a
    /// 429 hit while refreshing the access token.
    pub fn is_rate_limited(&self) -> bool {
        match self {
            Error::RateLimited(_) => true,
            Error::RefreshFailed(cause) => cause.is_rate_limited(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
