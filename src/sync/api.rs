//! Sync API Client - HTTP implementation of `RemoteBackend`
//!
//! REST endpoints on the sync server:
//! - `POST /sync/batch` - atomic multi-entity write
//! - `POST /sync/write` - single entity write
//! - `GET /sync/changes` - change feed (owner, excludeDevice, since)
//!
//! Requests carry the bearer token of the current `AuthSession`.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use super::auth::AuthSession;
use super::models::{EntityType, SyncConfig};
use super::remote::{
    BatchWriteResult, ChangeQuery, RemoteBackend, RemoteChange, RemoteError, RemoteWrite, WriteOutcome,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client for the sync server
pub struct HttpRemoteBackend {
    client: Client,
    base_url: Url,
    auth: Arc<AuthSession>,
}

impl HttpRemoteBackend {
    pub fn new(base_url: &str, auth: Arc<AuthSession>) -> Result<Self, RemoteError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;

        Ok(Self {
            client,
            base_url: Url::parse(base_url)?,
            auth,
        })
    }

    pub fn from_config(config: &SyncConfig, auth: Arc<AuthSession>) -> Result<Self, RemoteError> {
        Self::new(&config.api_base_url, auth)
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// `{base}/{path}`, keeping any path prefix of the base URL
    fn endpoint(&self, path: &str) -> Result<Url, RemoteError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| RemoteError::Network(format!("Base URL cannot be a base: {}", self.base_url)))?
            .pop_if_empty()
            .extend(path.split('/'));
        Ok(url)
    }

    fn token(&self) -> Result<String, RemoteError> {
        self.auth.access_token().ok_or(RemoteError::Unauthorized)
    }
}

#[async_trait]
impl RemoteBackend for HttpRemoteBackend {
    async fn batch_write(&self, writes: &[RemoteWrite]) -> Result<BatchWriteResult, RemoteError> {
        let token = self.token()?;

        let response = self
            .client
            .post(self.endpoint("sync/batch")?)
            .bearer_auth(token)
            .json(&BatchRequest { writes })
            .send()
            .await?;

        let body: BatchResponse = handle_response(response).await?;
        log::debug!("Batch write: {} entities, {} results", writes.len(), body.results.len());

        Ok(BatchWriteResult {
            outcomes: body.results.into_iter().map(BatchResultItem::into_outcome).collect(),
        })
    }

    async fn write(&self, write: &RemoteWrite) -> Result<DateTime<Utc>, RemoteError> {
        let token = self.token()?;

        let response = self
            .client
            .post(self.endpoint("sync/write")?)
            .bearer_auth(token)
            .json(write)
            .send()
            .await?;

        let body: WriteResponse = handle_response(response).await?;
        Ok(body.updated_at)
    }

    async fn fetch_changes(&self, query: &ChangeQuery) -> Result<Vec<RemoteChange>, RemoteError> {
        let token = self.token()?;

        let mut params = vec![
            ("owner", query.owner_id.clone()),
            ("excludeDevice", query.exclude_device_id.clone()),
        ];
        if let Some(since) = query.since {
            params.push(("since", since.to_rfc3339_opts(SecondsFormat::Millis, true)));
        }

        let response = self
            .client
            .get(self.endpoint("sync/changes")?)
            .bearer_auth(token)
            .query(&params)
            .send()
            .await?;

        let body: ChangesResponse = handle_response(response).await?;
        Ok(body.changes)
    }
}

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Serialize)]
struct BatchRequest<'a> {
    writes: &'a [RemoteWrite],
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    #[serde(default)]
    results: Vec<BatchResultItem>,
}

/// Per-entity batch result: `updatedAt` on success, `error` otherwise
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchResultItem {
    entity_type: EntityType,
    entity_id: String,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    error: Option<String>,
}

impl BatchResultItem {
    fn into_outcome(self) -> WriteOutcome {
        let result = match (self.updated_at, self.error) {
            (Some(updated_at), None) => Ok(updated_at),
            (_, Some(error)) => Err(error),
            (None, None) => Err("Write rejected without reason".to_string()),
        };

        WriteOutcome {
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            result,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WriteResponse {
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct ChangesResponse {
    #[serde(default)]
    changes: Vec<RemoteChange>,
}

#[derive(Debug, Clone, Deserialize)]
struct ErrorResponse {
    error: String,
}

/// Handle successful JSON response
async fn handle_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, RemoteError> {
    let status = response.status();

    if status.is_success() {
        response.json::<T>().await.map_err(|e| {
            log::warn!("Failed to decode sync server response: {}", e);
            RemoteError::InvalidResponse
        })
    } else {
        Err(handle_error(response).await)
    }
}

/// Convert error response to RemoteError
async fn handle_error(response: reqwest::Response) -> RemoteError {
    let status = response.status();
    let text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
    let msg = serde_json::from_str::<ErrorResponse>(&text)
        .map(|body| body.error)
        .unwrap_or(text);

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::Unauthorized,
        StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY | StatusCode::BAD_REQUEST => {
            RemoteError::Rejected(msg)
        }
        s if s.is_server_error() => RemoteError::Server(msg),
        _ => RemoteError::Network(format!("{}: {}", status, msg)),
    }
}

// ============================================================================
// Tests
// ============================================================================
