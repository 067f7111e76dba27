//! HTTP implementation of the store client.
//!
//! Create and patch calls are sent exactly once; a failed write is a failed
//! write. Only the idempotent GETs get retried, with exponential backoff.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::client::{
    AssetHandle, CreateResource, SchemaContext, StoreClient, StoreError, StoredResource,
    ValuePatch,
};
use crate::config::Config;
use crate::error::UploadError;

/// Remote store driven over HTTP.
pub struct HttpStoreClient {
    http_client: reqwest::Client,
    store_base: String,
    asset_base: String,
    token: Option<String>,
    get_retries: u32,
}

#[derive(Deserialize)]
struct CreatedResponse {
    id: String,
}

impl HttpStoreClient {
    pub fn new(config: &Config) -> Result<Self, UploadError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .expect("Failed to create HTTP client");
        Ok(Self {
            http_client,
            store_base: parse_base(&config.store_url)?,
            asset_base: parse_base(config.asset_base())?,
            token: config.token.clone(),
            get_retries: config.get_retries,
        })
    }

    fn authed(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// GET with bounded retries. Server errors and transport failures are
    /// retried; anything else is returned as-is.
    async fn get_with_retry(&self, url: &str) -> Result<reqwest::Response, StoreError> {
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            let request = self.authed(self.http_client.get(url));
            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    if !status.is_server_error() || attempts > self.get_retries {
                        return Err(error_from(response).await);
                    }
                    warn!(url, status = status.as_u16(), attempt = attempts, "GET failed; retrying");
                }
                Err(e) => {
                    if attempts > self.get_retries {
                        return Err(StoreError::Transport(e.to_string()));
                    }
                    warn!(url, error = %e, attempt = attempts, "GET failed; retrying");
                }
            }
            let delay = Duration::from_millis(100 * 2u64.pow(attempts - 1));
            tokio::time::sleep(delay).await;
        }
    }

    async fn send_write(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, StoreError> {
        let response = self
            .authed(request)
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(error_from(response).await)
        }
    }
}

#[async_trait::async_trait]
impl StoreClient for HttpStoreClient {
    async fn fetch_schema(&self) -> Result<SchemaContext, StoreError> {
        let url = format!("{}/schema", self.store_base);
        debug!(url, "Fetching schema context");
        let response = self.get_with_retry(&url).await?;
        response
            .json::<SchemaContext>()
            .await
            .map_err(|e| StoreError::InvalidResponse(e.to_string()))
    }

    async fn upload_asset(&self, path: &Path) -> Result<AssetHandle, StoreError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| StoreError::Asset(format!("could not read '{}': {e}", path.display())))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let url = format!("{}/assets", self.asset_base);
        debug!(url, file = %name, bytes = bytes.len(), "Uploading asset");
        let request = self
            .http_client
            .post(&url)
            .query(&[("filename", name.as_str())])
            .body(bytes);
        let response = self.send_write(request).await?;
        response
            .json::<AssetHandle>()
            .await
            .map_err(|e| StoreError::InvalidResponse(e.to_string()))
    }

    async fn create_resource(&self, payload: &CreateResource) -> Result<String, StoreError> {
        let url = format!("{}/resources", self.store_base);
        let request = self.http_client.post(&url).json(payload);
        let response = self.send_write(request).await?;
        let created = response
            .json::<CreatedResponse>()
            .await
            .map_err(|e| StoreError::InvalidResponse(e.to_string()))?;
        Ok(created.id)
    }

    async fn get_resource(&self, remote_id: &str) -> Result<StoredResource, StoreError> {
        let url = format!("{}/resources/{remote_id}", self.store_base);
        let response = self.get_with_retry(&url).await?;
        response
            .json::<StoredResource>()
            .await
            .map_err(|e| StoreError::InvalidResponse(e.to_string()))
    }

    async fn patch_value(&self, patch: &ValuePatch) -> Result<(), StoreError> {
        let url = format!("{}/values", self.store_base);
        let request = match patch {
            ValuePatch::Add { .. } => self.http_client.post(&url),
            ValuePatch::Replace { .. } => self.http_client.put(&url),
        };
        self.send_write(request.json(patch)).await?;
        Ok(())
    }
}

/// Turn an error response into a `StoreError`, pulling the server's own
/// diagnostic out of a JSON error body when there is one.
async fn error_from(response: reqwest::Response) -> StoreError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| {
            v.get("message")
                .or_else(|| v.get("detail"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .or_else(|| (!body.is_empty()).then(|| body.clone()));
    StoreError::Http {
        status: status.as_u16(),
        message: status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string(),
        detail,
    }
}

fn parse_base(raw: &str) -> Result<String, UploadError> {
    let url = url::Url::parse(raw)
        .map_err(|e| UploadError::Config(format!("invalid store URL '{raw}': {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(UploadError::Config(format!(
            "unsupported URL scheme '{}' in '{raw}'",
            url.scheme()
        )));
    }
    Ok(raw.trim_end_matches('/').to_string())
}
