//! GitHub snapshot fetcher.
//!
//! Authenticates as a GitHub App installation and streams the branch tarball.
//! Installation tokens are cached until shortly before they expire so every
//! refresh does not mint a new one. Token and key material never reach logs
//! or error messages.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::io::StreamReader;

use super::{SnapshotArchive, SnapshotFetcher};
use crate::config::GitHubAppCredentials;
use crate::error::FetchError;
use crate::models::RepositoryCoordinate;

const USER_AGENT: &str = "firmware-compiler/snapshot-fetcher";
const API_VERSION: &str = "2022-11-28";
/// Refresh a cached token this long before GitHub says it expires.
const TOKEN_REFRESH_MARGIN_SECS: i64 = 60;

/// An installation access token with its expiry (unix seconds).
#[derive(Clone)]
pub struct InstallationToken {
    pub token: SecretString,
    pub expires_at: i64,
}

impl InstallationToken {
    fn is_fresh(&self, now: i64) -> bool {
        now + TOKEN_REFRESH_MARGIN_SECS < self.expires_at
    }
}

/// Source of installation tokens.
#[async_trait]
pub trait InstallationTokenSource: Send + Sync {
    async fn mint(&self) -> Result<InstallationToken, FetchError>;
}

/// Mints installation tokens by exchanging an RS256 app JWT.
pub struct AppJwtTokenSource {
    http: reqwest::Client,
    api_base_url: String,
    credentials: GitHubAppCredentials,
}

impl AppJwtTokenSource {
    pub fn new(http: reqwest::Client, api_base_url: impl Into<String>, credentials: GitHubAppCredentials) -> Self {
        AppJwtTokenSource {
            http,
            api_base_url: api_base_url.into(),
            credentials,
        }
    }

    fn generate_jwt(&self, now: i64) -> Result<String, FetchError> {
        #[derive(Debug, Serialize)]
        struct Claims {
            iat: i64,
            exp: i64,
            iss: String,
        }

        let claims = Claims {
            iat: now - 60,
            exp: now + 600,
            iss: self.credentials.app_id.clone(),
        };
        let key = EncodingKey::from_rsa_pem(self.credentials.private_key.expose_secret().as_bytes())
            .map_err(|e| FetchError::AuthFailure(format!("invalid app private key: {}", e)))?;

        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| FetchError::AuthFailure(format!("failed to sign app JWT: {}", e)))
    }
}

#[async_trait]
impl InstallationTokenSource for AppJwtTokenSource {
    async fn mint(&self) -> Result<InstallationToken, FetchError> {
        #[derive(Debug, Deserialize)]
        struct InstallationTokenResponse {
            token: String,
            expires_at: String,
        }

        let jwt = self.generate_jwt(Utc::now().timestamp())?;
        let endpoint = format!(
            "{}/app/installations/{}/access_tokens",
            self.api_base_url.trim_end_matches('/'),
            self.credentials.installation_id
        );

        let response = self
            .http
            .post(endpoint)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT)
            .header("X-GitHub-Api-Version", API_VERSION)
            .bearer_auth(jwt)
            .send()
            .await
            .map_err(|e| FetchError::TransportFailure(format!("token request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, "installation token request"));
        }

        let payload: InstallationTokenResponse = response
            .json()
            .await
            .map_err(|e| FetchError::TransportFailure(format!("malformed token response: {}", e)))?;
        let expires_at = DateTime::parse_from_rfc3339(&payload.expires_at)
            .map_err(|e| FetchError::TransportFailure(format!("malformed token expiry: {}", e)))?
            .with_timezone(&Utc)
            .timestamp();

        Ok(InstallationToken {
            token: SecretString::from(payload.token),
            expires_at,
        })
    }
}

/// Map a non-success HTTP status onto the fetch taxonomy.
fn classify_status(status: StatusCode, what: &str) -> FetchError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            FetchError::AuthFailure(format!("{} returned {}", what, status))
        }
        StatusCode::NOT_FOUND => FetchError::NotFound(format!("{} returned {}", what, status)),
        _ => FetchError::TransportFailure(format!("{} returned {}", what, status)),
    }
}

/// Downloads branch tarballs from the GitHub REST API.
pub struct GitHubSnapshotFetcher {
    http: reqwest::Client,
    api_base_url: String,
    tokens: Arc<dyn InstallationTokenSource>,
    cached: Mutex<Option<InstallationToken>>,
}

impl GitHubSnapshotFetcher {
    pub fn new(http: reqwest::Client, api_base_url: impl Into<String>, tokens: Arc<dyn InstallationTokenSource>) -> Self {
        GitHubSnapshotFetcher {
            http,
            api_base_url: api_base_url.into(),
            tokens,
            cached: Mutex::new(None),
        }
    }

    /// Fetcher authenticating with the app credentials from configuration.
    pub fn from_credentials(api_base_url: &str, credentials: GitHubAppCredentials) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| FetchError::TransportFailure(format!("failed to build HTTP client: {}", e)))?;
        let tokens = Arc::new(AppJwtTokenSource::new(http.clone(), api_base_url, credentials));
        Ok(GitHubSnapshotFetcher::new(http, api_base_url, tokens))
    }

    async fn installation_token(&self) -> Result<SecretString, FetchError> {
        let mut cached = self.cached.lock().await;
        let now = Utc::now().timestamp();
        if let Some(token) = cached.as_ref() {
            if token.is_fresh(now) {
                return Ok(token.token.clone());
            }
            log::debug!("[Fetch] Installation token near expiry, minting a new one");
        }

        let token = self.tokens.mint().await?;
        let secret = token.token.clone();
        *cached = Some(token);
        Ok(secret)
    }

    async fn invalidate_token(&self) {
        *self.cached.lock().await = None;
    }
}

#[async_trait]
impl SnapshotFetcher for GitHubSnapshotFetcher {
    async fn fetch(&self, coordinate: &RepositoryCoordinate) -> Result<SnapshotArchive, FetchError> {
        let token = self.installation_token().await?;
        let url = format!(
            "{}/repos/{}/{}/tarball/{}",
            self.api_base_url.trim_end_matches('/'),
            coordinate.owner,
            coordinate.repo,
            coordinate.branch
        );
        log::info!("[Fetch] Downloading snapshot {}", coordinate);

        let response = self
            .http
            .get(&url)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT)
            .header("X-GitHub-Api-Version", API_VERSION)
            .bearer_auth(token.expose_secret())
            .send()
            .await
            .map_err(|e| FetchError::TransportFailure(format!("tarball request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
                self.invalidate_token().await;
            }
            return Err(classify_status(status, &format!("tarball for {}", coordinate)));
        }

        let body = response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        Ok(SnapshotArchive::new(
            format!("github:{}", coordinate),
            StreamReader::new(body),
        ))
    }

    fn name(&self) -> &'static str {
        "github"
    }
}
