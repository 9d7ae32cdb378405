//! REST client for the server's maintenance and backup endpoints.
//!

use core::{fmt, time::Duration};

use reqwest::{
    Method, Url,
    blocking::{Client, RequestBuilder},
    header::{ACCEPT, CONTENT_TYPE},
};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::Settings;

/// Header carrying the maintenance lock token on privileged calls.
pub const MAINTENANCE_TOKEN_HEADER: &str = "X-Atlassian-Maintenance-Token";

const LOCK_PATH: &str = "mvc/maintenance/lock";
const MAINTENANCE_PATH: &str = "mvc/maintenance";
const BACKUPS_PATH: &str = "mvc/admin/backups";
const PROGRESS_PATH: &str = "mvc/admin/backups/progress/client";

/// The token issued when the maintenance lock is acquired.
#[derive(Clone, PartialEq, Eq)]
pub struct LockToken(String);

impl LockToken {
    /// Wrap a raw token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Only a prefix is ever printed, the token unlocks the server.
impl fmt::Debug for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LockToken({self})")
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix: String = self.0.chars().take(6).collect();
        write!(f, "{prefix}…")
    }
}

/// The identifier of a started backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupToken(String);

impl BackupToken {
    /// Wrap a raw backup id.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw backup id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackupToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The maintenance REST contract the backup is driven through.
pub trait MaintenanceApi {
    /// Check the server can be reached at all. Any HTTP response counts as connected.
    fn connectivity_check(&self) -> Result<(), ApiError>;

    /// Lock the server for maintenance.
    fn lock_acquire(&self) -> Result<LockToken, ApiError>;

    /// Tell the server a backup has started.
    fn backup_start(&self, lock: &LockToken) -> Result<BackupToken, ApiError>;

    /// Fetch the raw maintenance status document.
    fn maintenance_status(&self, lock: &LockToken) -> Result<Value, ApiError>;

    /// Report the backup's progress as a percentage.
    fn progress_report(&self, lock: &LockToken, percentage: u8) -> Result<(), ApiError>;

    /// Release the maintenance lock.
    fn lock_release(&self, lock: &LockToken) -> Result<(), ApiError>;
}

/// Blocking HTTP implementation of [`MaintenanceApi`].
#[derive(Clone)]
pub struct RestClient {
    client: Client,
    base_url: Url,
    user: String,
    password: String,
}

impl fmt::Debug for RestClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestClient")
            .field("base_url", &self.base_url.as_str())
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

impl RestClient {
    /// Create a client for the server in `settings`.
    pub fn new(settings: &Settings, timeout: Duration) -> Result<Self, ApiError> {
        let base_url = parse_base_url(&settings.server_url)?;

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Request(e, "build the HTTP client"))?;

        Ok(Self {
            client,
            base_url,
            user: settings.server_user.clone(),
            password: settings.server_password.clone(),
        })
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, ApiError> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| ApiError::InvalidUrl(path.to_string(), e.to_string()))?;

        debug!("{method} {url}");

        Ok(self
            .client
            .request(method, url)
            .basic_auth(&self.user, Some(&self.password))
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/json"))
    }

    fn privileged(
        &self,
        method: Method,
        path: &str,
        lock: &LockToken,
    ) -> Result<RequestBuilder, ApiError> {
        Ok(self
            .request(method, path)?
            .header(MAINTENANCE_TOKEN_HEADER, lock.as_str()))
    }
}

impl MaintenanceApi for RestClient {
    fn connectivity_check(&self) -> Result<(), ApiError> {
        let response = self
            .request(Method::GET, MAINTENANCE_PATH)?
            .send()
            .map_err(|e| ApiError::Connect(self.base_url.to_string(), e))?;

        debug!("Connected, server answered {}", response.status());
        Ok(())
    }

    fn lock_acquire(&self) -> Result<LockToken, ApiError> {
        let body = self
            .request(Method::POST, LOCK_PATH)?
            .send()
            .and_then(|response| response.error_for_status())
            .and_then(|response| response.text())
            .map_err(|e| ApiError::Request(e, "acquire the maintenance lock"))?;

        parse_unlock_token(&body)
    }

    fn backup_start(&self, lock: &LockToken) -> Result<BackupToken, ApiError> {
        let body = self
            .privileged(Method::POST, BACKUPS_PATH, lock)?
            .send()
            .and_then(|response| response.error_for_status())
            .and_then(|response| response.text())
            .map_err(|e| ApiError::Request(e, "start the backup"))?;

        parse_backup_id(&body)
    }

    fn maintenance_status(&self, lock: &LockToken) -> Result<Value, ApiError> {
        self.privileged(Method::GET, MAINTENANCE_PATH, lock)?
            .send()
            .and_then(|response| response.error_for_status())
            .and_then(|response| response.json())
            .map_err(|e| ApiError::Request(e, "fetch the maintenance status"))
    }

    fn progress_report(&self, lock: &LockToken, percentage: u8) -> Result<(), ApiError> {
        let percentage = percentage.to_string();

        self.request(Method::POST, PROGRESS_PATH)?
            .query(&[("token", lock.as_str()), ("percentage", percentage.as_str())])
            .send()
            .and_then(|response| response.error_for_status())
            .map_err(|e| ApiError::Request(e, "report progress"))?;

        Ok(())
    }

    fn lock_release(&self, lock: &LockToken) -> Result<(), ApiError> {
        let body = self
            .request(Method::DELETE, LOCK_PATH)?
            .query(&[("token", lock.as_str())])
            .send()
            .and_then(|response| response.text())
            .map_err(|e| ApiError::Request(e, "release the maintenance lock"))?;

        check_release_body(&body)
    }
}

/// Parse the server's base URL, ensuring relative paths join beneath it.
pub fn parse_base_url(url: &str) -> Result<Url, ApiError> {
    let mut url = url.trim().to_string();
    if !url.ends_with('/') {
        url.push('/');
    }

    Url::parse(&url).map_err(|e| ApiError::InvalidUrl(url, e.to_string()))
}

#[derive(Deserialize)]
struct LockResponse {
    #[serde(rename = "unlockToken")]
    unlock_token: Option<String>,
}

#[derive(Deserialize)]
struct BackupResponse {
    id: Option<String>,
}

/// Extract the `unlockToken` from a lock response.
pub fn parse_unlock_token(body: &str) -> Result<LockToken, ApiError> {
    let response: LockResponse = serde_json::from_str(body)?;

    match response.unlock_token {
        Some(token) if !token.trim().is_empty() => Ok(LockToken::new(token)),
        _ => Err(ApiError::MissingField("unlockToken")),
    }
}

/// Extract the `id` from a backup start response.
pub fn parse_backup_id(body: &str) -> Result<BackupToken, ApiError> {
    let response: BackupResponse = serde_json::from_str(body)?;

    match response.id {
        Some(id) if !id.trim().is_empty() => Ok(BackupToken::new(id)),
        _ => Err(ApiError::MissingField("id")),
    }
}

/// The server answers a successful unlock with an empty body; anything else is an error.
pub fn check_release_body(body: &str) -> Result<(), ApiError> {
    let body = body.trim();
    if body.is_empty() {
        Ok(())
    } else {
        Err(ApiError::UnexpectedBody(body.to_string()))
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid URL '{0}': {1}")]
    InvalidUrl(String, String),

    #[error("Failed to connect to {0}: {1}")]
    Connect(String, #[source] reqwest::Error),

    #[error("Failed to {1}: {0}")]
    Request(#[source] reqwest::Error, &'static str),

    #[error("Failed to decode the response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Response did not contain a '{0}' value")]
    MissingField(&'static str),

    #[error("Expected an empty response but received: {0}")]
    UnexpectedBody(String),
}

#[cfg(test)]
mod test {
    use super::{
        ApiError, LockToken, check_release_body, parse_backup_id, parse_base_url,
        parse_unlock_token,
    };

    #[test]
    fn unlock_token_is_extracted() {
        let token = parse_unlock_token(r#"{"unlockToken":"T1","owner":{}}"#).unwrap();
        assert_eq!(token.as_str(), "T1");
    }

    #[test]
    fn empty_unlock_token_is_an_error() {
        let result = parse_unlock_token(r#"{"unlockToken":""}"#);
        assert!(matches!(result, Err(ApiError::MissingField("unlockToken"))));

        let result = parse_unlock_token("{}");
        assert!(matches!(result, Err(ApiError::MissingField("unlockToken"))));
    }

    #[test]
    fn backup_id_is_extracted() {
        let token = parse_backup_id(r#"{"id":"B1","progress":{"percentage":0}}"#).unwrap();
        assert_eq!(token.as_str(), "B1");
    }

    #[test]
    fn non_json_backup_response_is_an_error() {
        assert!(matches!(
            parse_backup_id("<html>"),
            Err(ApiError::Decode(_))
        ));
    }

    #[test]
    fn empty_release_body_is_success() {
        assert!(check_release_body("").is_ok());
        assert!(check_release_body(" \n").is_ok());
    }

    #[test]
    fn release_body_with_content_is_an_error() {
        let result = check_release_body(r#"{"errors":[{"message":"Invalid token"}]}"#);
        assert!(matches!(result, Err(ApiError::UnexpectedBody(_))));
    }

    #[test]
    fn base_url_gains_trailing_slash() {
        let url = parse_base_url("http://stash:7990/context").unwrap();
        assert_eq!(
            url.join("mvc/maintenance").unwrap().as_str(),
            "http://stash:7990/context/mvc/maintenance"
        );
    }

    #[test]
    fn token_display_is_truncated() {
        let token = LockToken::new("0123456789abcdef");
        assert_eq!(token.to_string(), "012345…");
        assert!(!format!("{token:?}").contains("abcdef"));
    }
}
