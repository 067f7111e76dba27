//! In-memory batch model: resources, properties, typed values.
//!
//! A batch is a list of [`Resource`]s, each carrying ordered [`Property`]
//! lists of typed [`PropertyValue`]s. Values that point at other resources
//! in the same batch do so through batch-local ids, either as a dedicated
//! link value or as an inline `href="local:<id>"` reference embedded in
//! markup content. The uploader replaces those with server-assigned ids as
//! resources get created.

use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

use crate::error::UploadError;

/// Scheme marking a batch-local reference inside markup content.
pub const LOCAL_REF_SCHEME: &str = "local:";

/// One entity to be created in the remote store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    /// Batch-scoped identifier, unique within the document.
    pub local_id: String,
    pub label: String,
    #[serde(rename = "type")]
    pub type_name: String,
    /// Path to an associated binary payload, relative to the assets dir.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitstream: Option<PathBuf>,
    /// Name into the batch permissions table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<String>,
    /// Migration metadata: original creation timestamp, carried through.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<FixedOffset>>,
    /// Migration metadata: identifier in the system being migrated from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legacy_iri: Option<String>,
    /// Migration metadata: ARK v0 identifier, converted to a legacy id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legacy_ark: Option<String>,
    #[serde(default)]
    pub properties: Vec<Property>,
}

impl Resource {
    /// The legacy identifier to send with the create payload, if any.
    /// An explicit `legacy_iri` wins over an ARK-derived one.
    pub fn legacy_id(&self) -> Result<Option<String>, UploadError> {
        if let Some(iri) = &self.legacy_iri {
            return Ok(Some(iri.clone()));
        }
        match &self.legacy_ark {
            Some(ark) => ark_v0_to_legacy_id(ark).map(Some),
            None => Ok(None),
        }
    }
}

/// A named property holding one or more values of a single kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Property {
    pub name: String,
    pub values: Vec<PropertyValue>,
}

/// One typed value with optional comment and permissions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyValue {
    #[serde(flatten)]
    pub body: ValueBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<String>,
}

impl PropertyValue {
    /// The batch-local target if this is a link value.
    pub fn link_target(&self) -> Option<&str> {
        match &self.body {
            ValueBody::Link(target) => Some(target.as_str()),
            _ => None,
        }
    }
}

/// Closed set of value kinds the store accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ValueBody {
    Text(String),
    Markup(Markup),
    Bool(bool),
    Int(i64),
    Decimal(f64),
    /// Store-native date literal, e.g. `GREGORIAN:1900-01-01`.
    Date(String),
    /// RFC 3339 timestamp literal.
    Timestamp(String),
    Uri(String),
    /// `#rrggbb`.
    Color(String),
    /// Gazetteer code.
    Geoname(String),
    Interval {
        start: f64,
        end: f64,
    },
    /// Label of a list node, resolved through the store schema.
    List(String),
    /// Batch-local id of the target resource.
    Link(String),
}

impl ValueBody {
    /// Stable kind name, matching the wire `kind` tag.
    pub fn kind_name(&self) -> &'static str {
        match self {
            ValueBody::Text(_) => "text",
            ValueBody::Markup(_) => "markup",
            ValueBody::Bool(_) => "bool",
            ValueBody::Int(_) => "int",
            ValueBody::Decimal(_) => "decimal",
            ValueBody::Date(_) => "date",
            ValueBody::Timestamp(_) => "timestamp",
            ValueBody::Uri(_) => "uri",
            ValueBody::Color(_) => "color",
            ValueBody::Geoname(_) => "geoname",
            ValueBody::Interval { .. } => "interval",
            ValueBody::List(_) => "list",
            ValueBody::Link(_) => "link",
        }
    }

    /// Kind-specific shape check needing no schema context. List nodes,
    /// permissions names, and link targets are checked elsewhere; everything
    /// here is decidable from the value alone.
    pub fn check_shape(&self) -> Result<(), String> {
        match self {
            ValueBody::Decimal(d) if !d.is_finite() => Err("decimal must be finite".to_string()),
            ValueBody::Date(date)
                if date.is_empty()
                    || !date.is_ascii()
                    || date.contains(char::is_whitespace) =>
            {
                Err(format!("malformed date literal '{date}'"))
            }
            ValueBody::Timestamp(ts) => match chrono::DateTime::parse_from_rfc3339(ts) {
                Ok(_) => Ok(()),
                Err(e) => Err(format!("timestamp '{ts}' is not RFC 3339: {e}")),
            },
            ValueBody::Uri(uri) => match url::Url::parse(uri) {
                Ok(_) => Ok(()),
                Err(e) => Err(format!("'{uri}' is not a valid URI: {e}")),
            },
            ValueBody::Color(color) => {
                let hex_ok = color.len() == 7
                    && color.starts_with('#')
                    && color[1..].bytes().all(|b| b.is_ascii_hexdigit());
                if hex_ok {
                    Ok(())
                } else {
                    Err(format!("color '{color}' is not #rrggbb"))
                }
            }
            ValueBody::Geoname(code)
                if code.is_empty() || !code.bytes().all(|b| b.is_ascii_digit()) =>
            {
                Err(format!("geoname code '{code}' must be numeric"))
            }
            ValueBody::Interval { start, end }
                if !start.is_finite() || !end.is_finite() || start > end =>
            {
                Err(format!("interval {start}..{end} is not ordered"))
            }
            ValueBody::Link(target) if target.is_empty() => {
                Err("link target must not be empty".to_string())
            }
            _ => Ok(()),
        }
    }
}

/// Rich-text content with its extracted inline references.
///
/// Serializes as the bare content string; references are re-extracted on
/// deserialization, so documents and resume files never carry them twice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Markup {
    content: String,
    refs: BTreeSet<String>,
}

impl Markup {
    pub fn new(content: impl Into<String>) -> Self {
        let content = content.into();
        let refs = extract_local_refs(&content);
        Self { content, refs }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Batch-local ids referenced inline, in sorted order.
    pub fn refs(&self) -> &BTreeSet<String> {
        &self.refs
    }

    pub fn has_refs(&self) -> bool {
        !self.refs.is_empty()
    }

    /// Rewrite inline references through `resolve`, leaving references it
    /// cannot resolve in their `local:` form. Returns the rewritten content
    /// and the ids that stayed unresolved.
    pub fn resolve_refs<F>(&self, resolve: F) -> (String, Vec<String>)
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut content = self.content.clone();
        let mut unresolved = Vec::new();
        for local_id in &self.refs {
            let needle = format!("href=\"{}{}\"", LOCAL_REF_SCHEME, local_id);
            match resolve(local_id) {
                Some(remote_id) => {
                    let replacement = format!("href=\"{}\"", remote_id);
                    content = content.replace(&needle, &replacement);
                }
                None => unresolved.push(local_id.clone()),
            }
        }
        (content, unresolved)
    }
}

impl From<String> for Markup {
    fn from(content: String) -> Self {
        Markup::new(content)
    }
}

impl From<Markup> for String {
    fn from(markup: Markup) -> Self {
        markup.content
    }
}

/// Scan markup for `href="local:<id>"` attributes and collect the ids.
fn extract_local_refs(content: &str) -> BTreeSet<String> {
    let mut refs = BTreeSet::new();
    let needle = format!("href=\"{}", LOCAL_REF_SCHEME);
    let mut rest = content;
    while let Some(pos) = rest.find(&needle) {
        let after = &rest[pos + needle.len()..];
        match after.find('"') {
            Some(end) => {
                let id = &after[..end];
                if !id.is_empty() {
                    refs.insert(id.to_string());
                }
                rest = &after[end..];
            }
            None => break,
        }
    }
    refs
}

/// Convert an ARK v0 identifier into a deterministic legacy id.
///
/// Input shape: `ark:/<naan>/<shortcode>-<resource id>-<check digit>`, with
/// an optional `.<timestamp>` suffix. Exactly those three hyphen-separated
/// parts are allowed; the shortcode must be four hex digits and the resource
/// id alphanumeric. The resource id is hashed with UUID v5 and
/// base64url-encoded; the result is `<SHORTCODE>/<encoded>` with the
/// shortcode uppercased.
pub fn ark_v0_to_legacy_id(ark: &str) -> Result<String, UploadError> {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};

    let bad = || UploadError::Batch(format!("invalid ARK v0 identifier: '{ark}'"));

    if !ark.starts_with("ark:/") {
        return Err(bad());
    }
    // Strip a trailing version timestamp like ".20190129".
    let stripped = match ark.rsplit_once('.') {
        Some((head, tail)) if !tail.is_empty() && tail.bytes().all(|b| b.is_ascii_digit()) => head,
        _ => ark,
    };
    let mut parts = stripped.split('-');
    let head = parts.next().ok_or_else(bad)?;
    let resource_part = parts.next().ok_or_else(bad)?;
    // The check digit is required even though it does not enter the hash.
    parts.next().ok_or_else(bad)?;
    if parts.next().is_some() {
        return Err(bad());
    }
    let (_, shortcode) = head.rsplit_once('/').ok_or_else(bad)?;
    if shortcode.len() != 4 || !shortcode.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(bad());
    }
    if resource_part.is_empty() || !resource_part.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return Err(bad());
    }

    let derived = uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_URL, resource_part.as_bytes());
    let encoded = URL_SAFE_NO_PAD.encode(derived.as_bytes());
    Ok(format!("{}/{encoded}", shortcode.to_ascii_uppercase()))
}

// ============================================================================
// Tests
// ============================================================================
