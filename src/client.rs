//! Store client seam: the trait the pipeline drives, its wire types, and an
//! in-memory implementation for tests and dry runs.
//!
//! The remote store is a black box behind [`StoreClient`]; the production
//! implementation lives in [`crate::http`]. Keeping the seam a trait lets
//! the pipeline run unchanged against [`MemoryStoreClient`], which also
//! backs `--dry-run`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

/// Errors surfaced by store calls.
///
/// `Http` carries the server's own diagnostic text when the response body
/// provided one; the driver copies it into failure reports so operators see
/// what the store actually said.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("HTTP {status}: {message}")]
    Http {
        status: u16,
        message: String,
        detail: Option<String>,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Asset error: {0}")]
    Asset(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl StoreError {
    /// Full human-readable reason, including the server diagnostic.
    pub fn reason(&self) -> String {
        match self {
            StoreError::Http {
                detail: Some(detail),
                ..
            } => format!("{self} ({detail})"),
            _ => self.to_string(),
        }
    }
}

/// Lookup context fetched from the store once at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaContext {
    /// List node label -> remote node id.
    #[serde(default)]
    pub list_nodes: HashMap<String, String>,
}

/// Handle assigned by the asset endpoint for an uploaded binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetHandle {
    pub handle: String,
}

/// Body of a resource create call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateResource {
    #[serde(rename = "type")]
    pub type_name: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legacy_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, Vec<serde_json::Value>>,
}

/// One value as the store returns it on a resource read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredValue {
    pub id: String,
    pub kind: String,
    pub value: serde_json::Value,
}

/// A resource as the store returns it on read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredResource {
    pub id: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub label: String,
    #[serde(default)]
    pub properties: BTreeMap<String, Vec<StoredValue>>,
}

/// The two patch shapes the reapply phase issues.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ValuePatch {
    /// Attach a new value to a property (link reapply).
    Add {
        resource_id: String,
        resource_type: String,
        property: String,
        value: serde_json::Value,
    },
    /// Replace an existing value's content (text reapply).
    Replace {
        resource_id: String,
        resource_type: String,
        property: String,
        value_id: String,
        value: serde_json::Value,
    },
}

impl ValuePatch {
    pub fn property(&self) -> &str {
        match self {
            ValuePatch::Add { property, .. } | ValuePatch::Replace { property, .. } => property,
        }
    }
}

/// Calls the pipeline makes against the remote store (mockable seam).
#[async_trait::async_trait]
pub trait StoreClient: Send + Sync {
    /// Fetch the schema-derived lookup context, once at startup.
    async fn fetch_schema(&self) -> Result<SchemaContext, StoreError>;

    /// Upload a binary payload, returning the handle to reference it by.
    async fn upload_asset(&self, path: &Path) -> Result<AssetHandle, StoreError>;

    /// Create a resource; returns the server-assigned id.
    async fn create_resource(&self, payload: &CreateResource) -> Result<String, StoreError>;

    /// Read the current representation of a resource.
    async fn get_resource(&self, remote_id: &str) -> Result<StoredResource, StoreError>;

    /// Attach or replace one property value.
    async fn patch_value(&self, patch: &ValuePatch) -> Result<(), StoreError>;
}

// ============================================================================
// In-Memory Store (for testing/dry runs)
// ============================================================================

#[derive(Default)]
struct MemoryState {
    next_resource: u64,
    next_value: u64,
    next_asset: u64,
    resources: BTreeMap<String, StoredResource>,
    calls: u64,
}

/// In-memory store with the same validation a real store performs on link
/// targets, plus scriptable failures for exercising the recovery paths.
#[derive(Default)]
pub struct MemoryStoreClient {
    schema: SchemaContext,
    fail_create_labels: HashSet<String>,
    fail_asset_names: HashSet<String>,
    fail_patch_properties: HashSet<String>,
    state: RwLock<MemoryState>,
}

impl MemoryStoreClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_schema(schema: SchemaContext) -> Self {
        Self {
            schema,
            ..Self::default()
        }
    }

    /// Make creation fail for every resource with this label.
    pub fn fail_create_for(mut self, label: &str) -> Self {
        self.fail_create_labels.insert(label.to_string());
        self
    }

    /// Make asset upload fail for this file name.
    pub fn fail_asset_for(mut self, file_name: &str) -> Self {
        self.fail_asset_names.insert(file_name.to_string());
        self
    }

    /// Make every patch touching this property fail.
    pub fn fail_patch_on(mut self, property: &str) -> Self {
        self.fail_patch_properties.insert(property.to_string());
        self
    }

    /// Total store calls made, schema fetch included.
    pub async fn call_count(&self) -> u64 {
        self.state.read().await.calls
    }

    pub async fn resource_count(&self) -> usize {
        self.state.read().await.resources.len()
    }

    pub async fn stored(&self, remote_id: &str) -> Option<StoredResource> {
        self.state.read().await.resources.get(remote_id).cloned()
    }

    pub async fn find_by_label(&self, label: &str) -> Option<StoredResource> {
        self.state
            .read()
            .await
            .resources
            .values()
            .find(|r| r.label == label)
            .cloned()
    }

    fn link_target_exists(state: &MemoryState, value: &serde_json::Value) -> Result<(), String> {
        let target = value.get("value").and_then(|v| v.as_str()).unwrap_or("");
        if state.resources.contains_key(target) {
            Ok(())
        } else {
            Err(target.to_string())
        }
    }
}

#[async_trait::async_trait]
impl StoreClient for MemoryStoreClient {
    async fn fetch_schema(&self) -> Result<SchemaContext, StoreError> {
        self.state.write().await.calls += 1;
        Ok(self.schema.clone())
    }

    async fn upload_asset(&self, path: &Path) -> Result<AssetHandle, StoreError> {
        let mut state = self.state.write().await;
        state.calls += 1;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if self.fail_asset_names.contains(&name) {
            return Err(StoreError::Asset(format!("transfer failed for '{name}'")));
        }
        state.next_asset += 1;
        Ok(AssetHandle {
            handle: format!("asset_{:04}_{name}", state.next_asset),
        })
    }

    async fn create_resource(&self, payload: &CreateResource) -> Result<String, StoreError> {
        let mut state = self.state.write().await;
        state.calls += 1;
        if self.fail_create_labels.contains(&payload.label) {
            return Err(StoreError::Http {
                status: 500,
                message: "create rejected".to_string(),
                detail: Some(format!("scripted failure for '{}'", payload.label)),
            });
        }
        // A real store refuses link values whose target does not exist yet.
        for values in payload.properties.values() {
            for value in values {
                if value.get("kind").and_then(|k| k.as_str()) == Some("link") {
                    if let Err(target) = Self::link_target_exists(&state, value) {
                        return Err(StoreError::Http {
                            status: 400,
                            message: "unknown link target".to_string(),
                            detail: Some(format!("no resource with id '{target}'")),
                        });
                    }
                }
            }
        }

        state.next_resource += 1;
        let remote_id = format!("res_{:04}", state.next_resource);
        let mut properties: BTreeMap<String, Vec<StoredValue>> = BTreeMap::new();
        for (name, values) in &payload.properties {
            let mut stored = Vec::with_capacity(values.len());
            for value in values {
                state.next_value += 1;
                stored.push(StoredValue {
                    id: format!("val_{:05}", state.next_value),
                    kind: value
                        .get("kind")
                        .and_then(|k| k.as_str())
                        .unwrap_or("unknown")
                        .to_string(),
                    value: value.get("value").cloned().unwrap_or(serde_json::Value::Null),
                });
            }
            properties.insert(name.clone(), stored);
        }
        state.resources.insert(
            remote_id.clone(),
            StoredResource {
                id: remote_id.clone(),
                type_name: payload.type_name.clone(),
                label: payload.label.clone(),
                properties,
            },
        );
        Ok(remote_id)
    }

    async fn get_resource(&self, remote_id: &str) -> Result<StoredResource, StoreError> {
        let mut state = self.state.write().await;
        state.calls += 1;
        state
            .resources
            .get(remote_id)
            .cloned()
            .ok_or_else(|| StoreError::Http {
                status: 404,
                message: format!("resource '{remote_id}' not found"),
                detail: None,
            })
    }

    async fn patch_value(&self, patch: &ValuePatch) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.calls += 1;
        if self.fail_patch_properties.contains(patch.property()) {
            return Err(StoreError::Http {
                status: 500,
                message: "patch rejected".to_string(),
                detail: Some(format!("scripted failure for '{}'", patch.property())),
            });
        }
        match patch {
            ValuePatch::Add {
                resource_id,
                property,
                value,
                ..
            } => {
                if value.get("kind").and_then(|k| k.as_str()) == Some("link") {
                    if let Err(target) = Self::link_target_exists(&state, value) {
                        return Err(StoreError::Http {
                            status: 400,
                            message: "unknown link target".to_string(),
                            detail: Some(format!("no resource with id '{target}'")),
                        });
                    }
                }
                state.next_value += 1;
                let stored = StoredValue {
                    id: format!("val_{:05}", state.next_value),
                    kind: value
                        .get("kind")
                        .and_then(|k| k.as_str())
                        .unwrap_or("unknown")
                        .to_string(),
                    value: value.get("value").cloned().unwrap_or(serde_json::Value::Null),
                };
                let resource = state.resources.get_mut(resource_id).ok_or_else(|| {
                    StoreError::Http {
                        status: 404,
                        message: format!("resource '{resource_id}' not found"),
                        detail: None,
                    }
                })?;
                resource.properties.entry(property.clone()).or_default().push(stored);
                Ok(())
            }
            ValuePatch::Replace {
                resource_id,
                property,
                value_id,
                value,
                ..
            } => {
                let resource = state.resources.get_mut(resource_id).ok_or_else(|| {
                    StoreError::Http {
                        status: 404,
                        message: format!("resource '{resource_id}' not found"),
                        detail: None,
                    }
                })?;
                let values = resource.properties.get_mut(property).ok_or_else(|| {
                    StoreError::Http {
                        status: 400,
                        message: format!("property '{property}' not present"),
                        detail: None,
                    }
                })?;
                match values.iter_mut().find(|v| v.id == *value_id) {
                    Some(stored) => {
                        stored.value =
                            value.get("value").cloned().unwrap_or(serde_json::Value::Null);
                        Ok(())
                    }
                    None => Err(StoreError::Http {
                        status: 400,
                        message: format!("value '{value_id}' not present"),
                        detail: None,
                    }),
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(label: &str) -> CreateResource {
        CreateResource {
            type_name: "Thing".to_string(),
            label: label.to_string(),
            permissions: None,
            created_at: None,
            legacy_id: None,
            asset: None,
            properties: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_create_and_read_round_trip() {
        let store = MemoryStoreClient::new();
        let id = store.create_resource(&payload("one")).await.unwrap();
        let read = store.get_resource(&id).await.unwrap();
        assert_eq!(read.label, "one");
        assert_eq!(store.resource_count().await, 1);
    }

    #[tokio::test]
    async fn test_create_rejects_unknown_link_target() {
        let store = MemoryStoreClient::new();
        let mut body = payload("one");
        body.properties.insert(
            "points_to".to_string(),
            vec![serde_json::json!({"kind": "link", "value": "res_9999"})],
        );
        let err = store.create_resource(&body).await.unwrap_err();
        match err {
            StoreError::Http { status, detail, .. } => {
                assert_eq!(status, 400);
                assert!(detail.unwrap().contains("res_9999"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_patch_add_appends_value() {
        let store = MemoryStoreClient::new();
        let a = store.create_resource(&payload("a")).await.unwrap();
        let b = store.create_resource(&payload("b")).await.unwrap();
        store
            .patch_value(&ValuePatch::Add {
                resource_id: a.clone(),
                resource_type: "Thing".to_string(),
                property: "points_to".to_string(),
                value: serde_json::json!({"kind": "link", "value": b}),
            })
            .await
            .unwrap();
        let read = store.get_resource(&a).await.unwrap();
        assert_eq!(read.properties["points_to"].len(), 1);
    }

    #[tokio::test]
    async fn test_scripted_create_failure() {
        let store = MemoryStoreClient::new().fail_create_for("bad");
        assert!(store.create_resource(&payload("bad")).await.is_err());
        assert!(store.create_resource(&payload("good")).await.is_ok());
        assert_eq!(store.resource_count().await, 1);
    }

    #[tokio::test]
    async fn test_error_reason_includes_detail() {
        let err = StoreError::Http {
            status: 400,
            message: "unknown link target".to_string(),
            detail: Some("no resource with id 'x'".to_string()),
        };
        let reason = err.reason();
        assert!(reason.contains("400"));
        assert!(reason.contains("'x'"));
    }
}
