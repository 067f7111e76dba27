//! Batch document loading and up-front validation.
//!
//! The document is JSON: a permissions table (name -> permission spec string)
//! plus the resources in file order. Everything that can be checked without
//! the store is checked here, before a single byte goes over the wire; a
//! batch that fails validation uploads nothing.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::Deserialize;
use tracing::info;

use crate::error::UploadError;
use crate::model::Resource;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Batch {
    #[serde(default)]
    pub permissions: HashMap<String, String>,
    #[serde(default)]
    pub resources: Vec<Resource>,
}

impl Batch {
    /// Read and validate a batch document.
    pub fn load(path: &Path) -> Result<Self, UploadError> {
        let raw = std::fs::read_to_string(path)?;
        let batch: Batch = serde_json::from_str(&raw)?;
        batch.validate()?;
        info!(
            path = %path.display(),
            resources = batch.resources.len(),
            permissions = batch.permissions.len(),
            "Loaded batch document"
        );
        Ok(batch)
    }

    /// Document-level checks: unique non-empty local ids, known permissions
    /// names, well-shaped values, parseable migration metadata. Link targets
    /// are the orderer's business and are not checked here.
    pub fn validate(&self) -> Result<(), UploadError> {
        let mut seen: HashSet<&str> = HashSet::new();
        for resource in &self.resources {
            let context = |detail: String| {
                UploadError::Batch(format!("resource '{}': {detail}", resource.local_id))
            };

            if resource.local_id.is_empty() {
                return Err(UploadError::Batch(
                    "resource with empty local id".to_string(),
                ));
            }
            if !seen.insert(resource.local_id.as_str()) {
                return Err(UploadError::Batch(format!(
                    "duplicate local id '{}'",
                    resource.local_id
                )));
            }
            if resource.label.is_empty() {
                return Err(context("empty label".to_string()));
            }
            if resource.type_name.is_empty() {
                return Err(context("empty type".to_string()));
            }
            if let Some(name) = &resource.permissions {
                self.check_permissions_name(name).map_err(&context)?;
            }
            if let Err(e) = resource.legacy_id() {
                let detail = match e {
                    UploadError::Batch(msg) => msg,
                    other => other.to_string(),
                };
                return Err(context(detail));
            }

            for property in &resource.properties {
                for value in &property.values {
                    value
                        .body
                        .check_shape()
                        .map_err(|reason| context(format!("property '{}': {reason}", property.name)))?;
                    if let Some(name) = &value.permissions {
                        self.check_permissions_name(name).map_err(&context)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn check_permissions_name(&self, name: &str) -> Result<(), String> {
        if self.permissions.contains_key(name) {
            Ok(())
        } else {
            Err(format!("unknown permissions name '{name}'"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Result<(), UploadError> {
        let batch: Batch = serde_json::from_str(json).unwrap();
        batch.validate()
    }

    #[test]
    fn test_valid_document_passes() {
        let result = parse(
            r#"{
                "permissions": {"open": "V:all"},
                "resources": [
                    {
                        "local_id": "a",
                        "label": "A",
                        "type": "Thing",
                        "permissions": "open",
                        "properties": [
                            {"name": "p", "values": [
                                {"kind": "int", "value": 3},
                                {"kind": "link", "value": "b"}
                            ]}
                        ]
                    },
                    {"local_id": "b", "label": "B", "type": "Thing"}
                ]
            }"#,
        );
        assert!(result.is_ok());
    }

    #[test]
    fn test_duplicate_local_id_rejected() {
        let result = parse(
            r#"{"resources": [
                {"local_id": "a", "label": "A", "type": "T"},
                {"local_id": "a", "label": "A2", "type": "T"}
            ]}"#,
        );
        assert!(matches!(result, Err(UploadError::Batch(msg)) if msg.contains("duplicate")));
    }

    #[test]
    fn test_unknown_permissions_name_rejected() {
        let result = parse(
            r#"{"resources": [
                {"local_id": "a", "label": "A", "type": "T", "permissions": "secret"}
            ]}"#,
        );
        assert!(matches!(result, Err(UploadError::Batch(msg)) if msg.contains("secret")));
    }

    #[test]
    fn test_malformed_value_shape_rejected() {
        let result = parse(
            r#"{"resources": [
                {"local_id": "a", "label": "A", "type": "T", "properties": [
                    {"name": "p", "values": [{"kind": "color", "value": "blue"}]}
                ]}
            ]}"#,
        );
        assert!(matches!(result, Err(UploadError::Batch(msg)) if msg.contains("color")));
    }

    #[test]
    fn test_bad_ark_rejected() {
        let result = parse(
            r#"{"resources": [
                {"local_id": "a", "label": "A", "type": "T", "legacy_ark": "not-an-ark"}
            ]}"#,
        );
        assert!(result.is_err());

        let result = parse(
            r#"{"resources": [
                {"local_id": "a", "label": "A", "type": "T",
                 "legacy_ark": "ark:/83497/0002-779b-extra-6e"}
            ]}"#,
        );
        assert!(matches!(result, Err(UploadError::Batch(msg)) if msg.contains("ARK")));
    }
}
