//! HTTP client for the remote sync service.
//!
//! Every request carries the `X-Device-ID` header and, once set, a bearer
//! token. Non-2xx responses become [`SyncError::Api`].

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::types::SyncItem;
use reqwest::{Client, Method, RequestBuilder};
use serde_json::{Value, json};
use std::sync::{PoisonError, RwLock};
use tracing::debug;

pub const DEVICE_ID_HEADER: &str = "X-Device-ID";

/// HTTP client for the sync service and the storage endpoints.
pub struct SyncApiClient {
    client: Client,
    base_url: String,
    device_id: String,
    access_token: RwLock<Option<String>>,
}

impl SyncApiClient {
    pub fn new(config: &SyncConfig, device_id: impl Into<String>) -> SyncResult<Self> {
        if config.api_base_url.trim().is_empty() {
            return Err(SyncError::Config("api_base_url is empty".to_string()));
        }
        let client = Client::builder().timeout(config.request_timeout()).build()?;

        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            device_id: device_id.into(),
            access_token: RwLock::new(None),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Sets or clears the bearer token sent with every request.
    pub fn set_access_token(&self, token: Option<String>) {
        *self
            .access_token
            .write()
            .unwrap_or_else(PoisonError::into_inner) = token;
    }

    pub fn has_access_token(&self) -> bool {
        self.access_token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let req = self
            .client
            .request(method, url)
            .header(DEVICE_ID_HEADER, &self.device_id);
        let token = self
            .access_token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    // ── Sync ──

    pub async fn upload_item(&self, item: &SyncItem) -> SyncResult<()> {
        self.request(Method::POST, "/sync")
            .json(item)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| SyncError::Api(e.to_string()))?;

        debug!("uploaded sync item {}", item.id);
        Ok(())
    }

    /// Changes recorded by the service since `since`.
    ///
    /// Elements are returned unparsed so one malformed change does not
    /// reject the whole batch.
    pub async fn fetch_changes(&self, since: i64) -> SyncResult<Vec<Value>> {
        let changes: Vec<Value> = self
            .request(Method::GET, "/sync/changes")
            .query(&[
                ("since", since.to_string()),
                ("deviceId", self.device_id.clone()),
            ])
            .send()
            .await?
            .error_for_status()
            .map_err(|e| SyncError::Api(e.to_string()))?
            .json()
            .await?;

        Ok(changes)
    }

    /// Bulk delivery of the whole queue at teardown.
    pub async fn send_emergency(&self, queue: &[SyncItem]) -> SyncResult<()> {
        self.request(Method::POST, "/sync/emergency")
            .json(&json!({ "deviceId": self.device_id, "queue": queue }))
            .send()
            .await?
            .error_for_status()
            .map_err(|e| SyncError::Api(e.to_string()))?;
        Ok(())
    }

    // ── Storage ──

    /// Posts a storage policy write to `endpoint`. Returns the response
    /// body, or `Value::Null` when it is empty.
    pub async fn save_value(&self, endpoint: &str, payload: &Value) -> SyncResult<Value> {
        let body = self
            .request(Method::POST, endpoint)
            .json(payload)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| SyncError::Api(e.to_string()))?
            .bytes()
            .await?;

        if body.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&body)?)
    }

    // ── Health ──

    /// True when `GET /health` answers with a success status.
    pub async fn health(&self) -> bool {
        match self.request(Method::GET, "/health").send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!("health probe failed: {e}");
                false
            }
        }
    }
}

/// Remote endpoint for a storage key.
pub fn endpoint_for_key(key: &str) -> &'static str {
    if key.contains("user") || key.contains("auth") {
        "/users"
    } else if key.contains("pattern") {
        "/patterns"
    } else if key.contains("session") {
        "/sessions"
    } else {
        "/storage"
    }
}
