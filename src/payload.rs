//! Wire payload construction.
//!
//! [`ValueCodec`] is the closed per-kind registry: built once per run from
//! the fetched schema context and the batch permissions table, it validates
//! value shapes and turns them into the JSON the store accepts, translating
//! batch-local identifiers on the way. The driver uses it for create
//! payloads, the reapplier for the two patch shapes.

use std::collections::{BTreeMap, HashMap};

use serde_json::json;
use tracing::warn;

use crate::client::{CreateResource, SchemaContext};
use crate::idmap::IdMap;
use crate::model::{PropertyValue, Resource, ValueBody};
use crate::stash::{LinkStashItem, TextStashItem};

/// Why a payload could not be built. Always a per-resource condition: the
/// driver records it as that resource's failure and keeps going.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("property '{property}': {reason}")]
    InvalidValue { property: String, reason: String },

    #[error("property '{property}': link target '{target}' was never created")]
    UncreatedTarget { property: String, target: String },

    #[error("unknown permissions name '{0}'")]
    UnknownPermissions(String),

    #[error("unknown list node '{0}'")]
    UnknownListNode(String),

    #[error("invalid migration metadata: {0}")]
    Metadata(String),
}

/// Per-kind validate + serialize registry.
pub struct ValueCodec {
    list_nodes: HashMap<String, String>,
    permissions: HashMap<String, String>,
}

impl ValueCodec {
    pub fn new(schema: &SchemaContext, permissions: &HashMap<String, String>) -> Self {
        Self {
            list_nodes: schema.list_nodes.clone(),
            permissions: permissions.clone(),
        }
    }

    /// Build the create body for one resource, resolving every surviving
    /// link and inline reference through the identifier map.
    pub fn create_payload(
        &self,
        resource: &Resource,
        ids: &IdMap,
        asset: Option<String>,
    ) -> Result<CreateResource, PayloadError> {
        let mut properties: BTreeMap<String, Vec<serde_json::Value>> = BTreeMap::new();
        for property in &resource.properties {
            let mut values = Vec::with_capacity(property.values.len());
            for value in &property.values {
                values.push(self.wire_value(&property.name, value, ids)?);
            }
            properties.entry(property.name.clone()).or_default().extend(values);
        }

        let permissions = match &resource.permissions {
            Some(name) => Some(self.permission_spec(name)?),
            None => None,
        };
        let legacy_id = resource
            .legacy_id()
            .map_err(|e| PayloadError::Metadata(e.to_string()))?;

        Ok(CreateResource {
            type_name: resource.type_name.clone(),
            label: resource.label.clone(),
            permissions,
            created_at: resource.created_at.map(|t| t.to_rfc3339()),
            legacy_id,
            asset,
            properties,
        })
    }

    /// Patch value for a stashed link. A target missing from the map (its
    /// upload failed) is sent as the raw local id, so the store's own error
    /// names the actual problem instead of this tool masking it.
    pub fn link_patch_value(
        &self,
        item: &LinkStashItem,
        ids: &IdMap,
    ) -> Result<serde_json::Value, PayloadError> {
        let target = ids.resolve(&item.target_id).unwrap_or(&item.target_id);
        let mut object = json!({ "kind": "link", "value": target });
        if let Some(comment) = &item.comment {
            object["comment"] = json!(comment);
        }
        if let Some(name) = &item.permissions {
            object["permissions"] = json!(self.permission_spec(name)?);
        }
        Ok(object)
    }

    /// Patch value for a stashed text: substitute the placeholder token
    /// inside the fetched current content with the original markup, its
    /// references rewritten. Unresolvable references stay in their local
    /// form; the returned list names them for the report.
    pub fn text_patch_value(
        &self,
        item: &TextStashItem,
        current_content: &str,
        ids: &IdMap,
    ) -> (serde_json::Value, Vec<String>) {
        let (restored, unresolved) = item
            .content
            .resolve_refs(|id| ids.resolve(id).map(str::to_string));
        let content = current_content.replace(&item.token, &restored);
        let mut object = json!({ "kind": "markup", "value": content });
        if let Some(comment) = &item.comment {
            object["comment"] = json!(comment);
        }
        (object, unresolved)
    }

    fn permission_spec(&self, name: &str) -> Result<String, PayloadError> {
        self.permissions
            .get(name)
            .cloned()
            .ok_or_else(|| PayloadError::UnknownPermissions(name.to_string()))
    }

    fn wire_value(
        &self,
        property: &str,
        value: &PropertyValue,
        ids: &IdMap,
    ) -> Result<serde_json::Value, PayloadError> {
        let body = self.wire_body(property, &value.body, ids)?;
        let mut object = json!({ "kind": value.body.kind_name(), "value": body });
        if let Some(comment) = &value.comment {
            object["comment"] = json!(comment);
        }
        if let Some(name) = &value.permissions {
            object["permissions"] = json!(self.permission_spec(name)?);
        }
        Ok(object)
    }

    fn wire_body(
        &self,
        property: &str,
        body: &ValueBody,
        ids: &IdMap,
    ) -> Result<serde_json::Value, PayloadError> {
        body.check_shape().map_err(|reason| PayloadError::InvalidValue {
            property: property.to_string(),
            reason,
        })?;
        match body {
            ValueBody::Text(text) => Ok(json!(text)),
            ValueBody::Markup(markup) => {
                let (content, unresolved) =
                    markup.resolve_refs(|id| ids.resolve(id).map(str::to_string));
                if !unresolved.is_empty() {
                    warn!(
                        property = %property,
                        unresolved = ?unresolved,
                        "Markup references stay unresolved in create payload"
                    );
                }
                Ok(json!(content))
            }
            ValueBody::Bool(b) => Ok(json!(b)),
            ValueBody::Int(i) => Ok(json!(i)),
            ValueBody::Decimal(d) => Ok(json!(d)),
            ValueBody::Date(date) => Ok(json!(date)),
            ValueBody::Timestamp(ts) => Ok(json!(ts)),
            ValueBody::Uri(uri) => Ok(json!(uri)),
            ValueBody::Color(color) => Ok(json!(color)),
            ValueBody::Geoname(code) => Ok(json!(code)),
            ValueBody::Interval { start, end } => Ok(json!({ "start": start, "end": end })),
            ValueBody::List(label) => match self.list_nodes.get(label) {
                Some(node_id) => Ok(json!(node_id)),
                None => Err(PayloadError::UnknownListNode(label.clone())),
            },
            ValueBody::Link(target) => match ids.resolve(target) {
                Some(remote_id) => Ok(json!(remote_id)),
                None => Err(PayloadError::UncreatedTarget {
                    property: property.to_string(),
                    target: target.clone(),
                }),
            },
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Markup, Property};

    fn codec() -> ValueCodec {
        let mut schema = SchemaContext::default();
        schema
            .list_nodes
            .insert("colors/red".to_string(), "node_0007".to_string());
        let mut permissions = HashMap::new();
        permissions.insert("open".to_string(), "V:all;M:staff".to_string());
        ValueCodec::new(&schema, &permissions)
    }

    fn value(body: ValueBody) -> PropertyValue {
        PropertyValue {
            body,
            comment: None,
            permissions: None,
        }
    }

    fn resource_with(values: Vec<PropertyValue>) -> Resource {
        Resource {
            local_id: "a".to_string(),
            label: "A".to_string(),
            type_name: "Thing".to_string(),
            bitstream: None,
            permissions: None,
            created_at: None,
            legacy_iri: None,
            legacy_ark: None,
            properties: vec![Property {
                name: "p".to_string(),
                values,
            }],
        }
    }

    #[test]
    fn test_scalar_wire_shapes() {
        let codec = codec();
        let ids = IdMap::new();
        let payload = codec
            .create_payload(
                &resource_with(vec![
                    value(ValueBody::Int(42)),
                    value(ValueBody::Text("hello".to_string())),
                    value(ValueBody::Bool(true)),
                ]),
                &ids,
                None,
            )
            .unwrap();
        let values = &payload.properties["p"];
        assert_eq!(values[0], json!({"kind": "int", "value": 42}));
        assert_eq!(values[1], json!({"kind": "text", "value": "hello"}));
        assert_eq!(values[2], json!({"kind": "bool", "value": true}));
    }

    #[test]
    fn test_link_resolves_through_map() {
        let codec = codec();
        let mut ids = IdMap::new();
        ids.record("b", "res_0002");
        let payload = codec
            .create_payload(
                &resource_with(vec![value(ValueBody::Link("b".to_string()))]),
                &ids,
                None,
            )
            .unwrap();
        assert_eq!(
            payload.properties["p"][0],
            json!({"kind": "link", "value": "res_0002"})
        );
    }

    #[test]
    fn test_link_to_uncreated_target_fails_payload() {
        let codec = codec();
        let ids = IdMap::new();
        let err = codec
            .create_payload(
                &resource_with(vec![value(ValueBody::Link("b".to_string()))]),
                &ids,
                None,
            )
            .unwrap_err();
        match err {
            PayloadError::UncreatedTarget { target, .. } => assert_eq!(target, "b"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_markup_rewrites_resolved_refs_only() {
        let codec = codec();
        let mut ids = IdMap::new();
        ids.record("b", "res_0002");
        let markup = Markup::new("<a href=\"local:b\">b</a> <a href=\"local:ghost\">?</a>");
        let payload = codec
            .create_payload(&resource_with(vec![value(ValueBody::Markup(markup))]), &ids, None)
            .unwrap();
        let content = payload.properties["p"][0]["value"].as_str().unwrap();
        assert!(content.contains("href=\"res_0002\""));
        assert!(content.contains("href=\"local:ghost\""));
    }

    #[test]
    fn test_kind_validation() {
        let codec = codec();
        let ids = IdMap::new();
        let bad = |body: ValueBody| {
            codec
                .create_payload(&resource_with(vec![value(body)]), &ids, None)
                .is_err()
        };
        assert!(bad(ValueBody::Color("red".to_string())));
        assert!(bad(ValueBody::Color("#12345g".to_string())));
        assert!(bad(ValueBody::Interval {
            start: 2.0,
            end: 1.0
        }));
        assert!(bad(ValueBody::Timestamp("yesterday".to_string())));
        assert!(bad(ValueBody::Uri("not a uri".to_string())));
        assert!(bad(ValueBody::Geoname("12a4".to_string())));
        assert!(bad(ValueBody::Decimal(f64::NAN)));
        assert!(bad(ValueBody::List("colors/blue".to_string())));
        assert!(!bad(ValueBody::Color("#A1b2C3".to_string())));
        assert!(!bad(ValueBody::Timestamp(
            "2024-05-01T12:00:00+00:00".to_string()
        )));
    }

    #[test]
    fn test_list_node_resolves_to_remote_id() {
        let codec = codec();
        let ids = IdMap::new();
        let payload = codec
            .create_payload(
                &resource_with(vec![value(ValueBody::List("colors/red".to_string()))]),
                &ids,
                None,
            )
            .unwrap();
        assert_eq!(
            payload.properties["p"][0],
            json!({"kind": "list", "value": "node_0007"})
        );
    }

    #[test]
    fn test_permissions_resolved_on_resource_and_value() {
        let codec = codec();
        let ids = IdMap::new();
        let mut resource = resource_with(vec![PropertyValue {
            body: ValueBody::Int(1),
            comment: None,
            permissions: Some("open".to_string()),
        }]);
        resource.permissions = Some("open".to_string());
        let payload = codec.create_payload(&resource, &ids, None).unwrap();
        assert_eq!(payload.permissions.as_deref(), Some("V:all;M:staff"));
        assert_eq!(
            payload.properties["p"][0]["permissions"],
            json!("V:all;M:staff")
        );

        resource.permissions = Some("nope".to_string());
        assert!(codec.create_payload(&resource, &ids, None).is_err());
    }

    #[test]
    fn test_migration_metadata_carried() {
        let codec = codec();
        let ids = IdMap::new();
        let mut resource = resource_with(vec![]);
        resource.created_at =
            Some(chrono::DateTime::parse_from_rfc3339("1999-12-31T23:00:00+01:00").unwrap());
        resource.legacy_ark = Some("ark:/83497/0002-779b9990a0c3f-6e".to_string());
        let payload = codec.create_payload(&resource, &ids, None).unwrap();
        assert_eq!(
            payload.created_at.as_deref(),
            Some("1999-12-31T23:00:00+01:00")
        );
        assert!(payload.legacy_id.unwrap().starts_with("0002/"));
    }

    #[test]
    fn test_link_patch_falls_back_to_raw_local_id() {
        let codec = codec();
        let ids = IdMap::new();
        let item = LinkStashItem {
            resource_id: "a".to_string(),
            resource_type: "Thing".to_string(),
            property: "p".to_string(),
            target_id: "never-created".to_string(),
            comment: None,
            permissions: None,
        };
        let wire = codec.link_patch_value(&item, &ids).unwrap();
        assert_eq!(wire["value"], json!("never-created"));
    }

    #[test]
    fn test_text_patch_substitutes_token() {
        let codec = codec();
        let mut ids = IdMap::new();
        ids.record("b", "res_0002");
        let item = TextStashItem {
            resource_id: "a".to_string(),
            resource_type: "Thing".to_string(),
            property: "p".to_string(),
            token: "11111111-2222-3333-4444-555555555555".to_string(),
            content: Markup::new("<p><a href=\"local:b\">b</a></p>"),
            comment: None,
            permissions: None,
        };
        let (wire, unresolved) =
            codec.text_patch_value(&item, "11111111-2222-3333-4444-555555555555", &ids);
        assert!(unresolved.is_empty());
        assert_eq!(
            wire["value"],
            json!("<p><a href=\"res_0002\">b</a></p>")
        );
    }
}
