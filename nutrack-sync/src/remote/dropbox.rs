//! Dropbox HTTP backend
//!
//! Implements [`RemoteStore`] against the Dropbox v2 API and
//! [`TokenEndpoint`] against its OAuth2 token endpoint.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use super::{RemoteMetadata, RemoteStore};
use crate::token::{PkceChallenge, TokenEndpoint, TokenResponse};
use crate::{Error, Result};

pub const API_BASE: &str = "https://api.dropboxapi.com";
pub const CONTENT_BASE: &str = "https://content.dropboxapi.com";
pub const AUTHORIZE_URL: &str = "https://www.dropbox.com/oauth2/authorize";

/// Build the URL the user opens to grant access.
pub fn authorize_url(client_id: &str, pkce: &PkceChallenge) -> Result<String> {
    let url = reqwest::Url::parse_with_params(
        AUTHORIZE_URL,
        &[
            ("client_id", client_id),
            ("response_type", "code"),
            ("code_challenge", pkce.challenge.as_str()),
            ("code_challenge_method", "S256"),
            ("token_access_type", "offline"),
        ],
    )
    .map_err(|e| Error::InvalidConfig(format!("Invalid authorize URL: {}", e)))?;
    Ok(url.into())
}

#[derive(Debug, Deserialize)]
struct FileMetadata {
    #[serde(default)]
    content_hash: String,
    #[serde(default)]
    path_display: Option<String>,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    server_modified: Option<DateTime<Utc>>,
}

impl FileMetadata {
    /// Folders and deleted entries carry no content hash and cannot be
    /// compared with the local file.
    fn into_remote(self, requested: &str) -> Result<RemoteMetadata> {
        if self.content_hash.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "Remote path {} is not a file",
                requested
            )));
        }
        Ok(RemoteMetadata {
            content_hash: self.content_hash,
            path: self.path_display.unwrap_or_else(|| requested.to_string()),
            size: self.size,
            server_modified: self.server_modified,
        })
    }
}

#[derive(Debug, Deserialize)]
struct Tagged {
    #[serde(rename = ".tag")]
    tag: String,
}

#[derive(Debug, Deserialize)]
struct LookupError {
    #[serde(rename = ".tag")]
    tag: String,
    #[serde(default)]
    path: Option<Tagged>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: LookupError,
}

fn is_not_found(body: &str) -> bool {
    match serde_json::from_str::<ApiError>(body) {
        Ok(e) => {
            e.error.tag == "path"
                && e.error.path.map(|p| p.tag == "not_found").unwrap_or(false)
        }
        Err(_) => false,
    }
}

fn network_error(e: reqwest::Error) -> Error {
    Error::Network(e.to_string())
}

/// Turn a non-success response into the matching error.
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(Error::RateLimited(body));
    }
    Err(Error::RemoteRejected {
        status: status.as_u16(),
        body,
    })
}

/// Dropbox files API client
#[derive(Debug, Clone)]
pub struct DropboxRemote {
    client: Client,
    api_base: String,
    content_base: String,
}

impl DropboxRemote {
    pub fn new() -> Self {
        Self::with_base_urls(API_BASE, CONTENT_BASE)
    }

    /// Point the client at different hosts, e.g. a local stub server.
    pub fn with_base_urls(api_base: impl Into<String>, content_base: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_base: api_base.into(),
            content_base: content_base.into(),
        }
    }
}

impl Default for DropboxRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for DropboxRemote {
    async fn metadata(&self, access_token: &str, path: &str) -> Result<Option<RemoteMetadata>> {
        let response = self
            .client
            .post(format!("{}/2/files/get_metadata", self.api_base))
            .bearer_auth(access_token)
            .json(&json!({ "path": path }))
            .send()
            .await
            .map_err(network_error)?;

        if response.status() == StatusCode::CONFLICT {
            let body = response.text().await.map_err(network_error)?;
            if is_not_found(&body) {
                debug!("Remote file {} does not exist", path);
                return Ok(None);
            }
            return Err(Error::RemoteRejected { status: 409, body });
        }

        let metadata: FileMetadata = check_status(response)
            .await?
            .json()
            .await
            .map_err(network_error)?;

        debug!("Remote hash for {}: {}", path, metadata.content_hash);
        metadata.into_remote(path).map(Some)
    }

    async fn upload(&self, access_token: &str, path: &str, body: Bytes) -> Result<()> {
        let size = body.len();
        let arg = json!({ "path": path, "mode": "overwrite" }).to_string();

        let response = self
            .client
            .post(format!("{}/2/files/upload", self.content_base))
            .bearer_auth(access_token)
            .header("Dropbox-API-Arg", arg)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await
            .map_err(network_error)?;

        check_status(response).await?;
        info!("Uploaded {} bytes to {}", size, path);
        Ok(())
    }

    async fn download(&self, access_token: &str, path: &str) -> Result<Bytes> {
        let arg = json!({ "path": path }).to_string();

        let response = self
            .client
            .post(format!("{}/2/files/download", self.content_base))
            .bearer_auth(access_token)
            .header("Dropbox-API-Arg", arg)
            .send()
            .await
            .map_err(network_error)?;

        let data = check_status(response)
            .await?
            .bytes()
            .await
            .map_err(network_error)?;

        info!("Downloaded {} bytes from {}", data.len(), path);
        Ok(data)
    }
}

/// Dropbox OAuth2 token endpoint client
#[derive(Debug, Clone)]
pub struct DropboxOAuth {
    client: Client,
    token_url: String,
    client_id: String,
    client_secret: Option<String>,
}

impl DropboxOAuth {
    pub fn new(client_id: impl Into<String>, client_secret: Option<String>) -> Self {
        Self {
            client: Client::new(),
            token_url: format!("{}/oauth2/token", API_BASE),
            client_id: client_id.into(),
            client_secret: client_secret.filter(|s| !s.is_empty()),
        }
    }

    pub fn with_token_url(mut self, token_url: impl Into<String>) -> Self {
        self.token_url = token_url.into();
        self
    }

    async fn request(&self, form: &[(&str, &str)]) -> Result<TokenResponse> {
        let response = self
            .client
            .post(self.token_url.as_str())
            .form(form)
            .send()
            .await
            .map_err(network_error)?;

        check_status(response)
            .await?
            .json()
            .await
            .map_err(network_error)
    }
}

#[async_trait]
impl TokenEndpoint for DropboxOAuth {
    async fn exchange(&self, code: &str, code_verifier: &str) -> Result<TokenResponse> {
        self.request(&[
            ("code", code),
            ("grant_type", "authorization_code"),
            ("client_id", self.client_id.as_str()),
            ("code_verifier", code_verifier),
        ])
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse> {
        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
        ];
        if let Some(secret) = &self.client_secret {
            form.push(("client_secret", secret.as_str()));
        }
        self.request(&form).await
    }
}
