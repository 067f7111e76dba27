//! Deferred cross-references: stash bookkeeping and the mutation pass.
//!
//! The orderer decides WHICH values to defer; this module actually takes
//! them out of the resources. Link values are removed outright (and their
//! property with them once empty). Markup values stay in place with their
//! content swapped for a fresh placeholder token, so the token is stored by
//! the server at create time and can be found again when patching.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::graph::UploadPlan;
use crate::model::{Markup, Resource, ValueBody};

/// Groups stash entries by owning resource and property.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StashKey {
    pub resource_id: String,
    pub property: String,
}

/// A link value removed from its property to break a cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkStashItem {
    pub resource_id: String,
    pub resource_type: String,
    pub property: String,
    pub target_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<String>,
}

/// A markup value whose content was swapped for a placeholder token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextStashItem {
    pub resource_id: String,
    pub resource_type: String,
    pub property: String,
    /// The token now stored in the live value (and server-side after create).
    pub token: String,
    /// Original content; inline references are re-extracted on load.
    pub content: Markup,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<String>,
}

/// The two owned stash maps, threaded through the pipeline by reference.
#[derive(Debug, Clone, Default)]
pub struct Stash {
    pub links: BTreeMap<StashKey, Vec<LinkStashItem>>,
    pub texts: BTreeMap<StashKey, Vec<TextStashItem>>,
}

impl Stash {
    pub fn is_empty(&self) -> bool {
        self.links.is_empty() && self.texts.is_empty()
    }

    /// Total number of stashed values, both kinds.
    pub fn len(&self) -> usize {
        self.link_count() + self.text_count()
    }

    pub fn link_count(&self) -> usize {
        self.links.values().map(Vec::len).sum()
    }

    pub fn text_count(&self) -> usize {
        self.texts.values().map(Vec::len).sum()
    }

    pub fn push_link(&mut self, item: LinkStashItem) {
        let key = StashKey {
            resource_id: item.resource_id.clone(),
            property: item.property.clone(),
        };
        self.links.entry(key).or_default().push(item);
    }

    pub fn push_text(&mut self, item: TextStashItem) {
        let key = StashKey {
            resource_id: item.resource_id.clone(),
            property: item.property.clone(),
        };
        self.texts.entry(key).or_default().push(item);
    }

    /// Local ids of every resource owning at least one entry, sorted.
    pub fn owners(&self) -> BTreeSet<String> {
        self.links
            .keys()
            .chain(self.texts.keys())
            .map(|k| k.resource_id.clone())
            .collect()
    }

    /// Flat, self-contained view for resume files.
    pub fn to_saved(&self) -> SavedStash {
        SavedStash {
            links: self.links.values().flatten().cloned().collect(),
            texts: self.texts.values().flatten().cloned().collect(),
        }
    }
}

/// Flat serialization of a stash, written by the resume writer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SavedStash {
    pub links: Vec<LinkStashItem>,
    pub texts: Vec<TextStashItem>,
}

/// Carry out an upload plan's deferrals against the resource list.
///
/// This is one of the two sanctioned mutation points of the batch (the
/// other being identifier substitution at payload build). Texts are swapped
/// in place first; link values are then removed in descending handle order
/// so earlier indices stay valid; properties left without values disappear.
pub fn apply_plan(resources: &mut [Resource], plan: &UploadPlan) -> Stash {
    let mut stash = Stash::default();

    for handle in &plan.stash_texts {
        let resource = &mut resources[handle.resource];
        let resource_id = resource.local_id.clone();
        let resource_type = resource.type_name.clone();
        let property = &mut resource.properties[handle.property];
        let property_name = property.name.clone();
        let value = &mut property.values[handle.value];
        if let ValueBody::Markup(markup) = &mut value.body {
            let token = Uuid::new_v4().to_string();
            let original = std::mem::replace(markup, Markup::new(token.clone()));
            stash.push_text(TextStashItem {
                resource_id,
                resource_type,
                property: property_name,
                token,
                content: original,
                comment: value.comment.clone(),
                permissions: value.permissions.clone(),
            });
        }
    }

    let mut removed = Vec::new();
    for handle in plan.stash_links.iter().rev() {
        let resource = &mut resources[handle.resource];
        let resource_id = resource.local_id.clone();
        let resource_type = resource.type_name.clone();
        let property = &mut resource.properties[handle.property];
        let property_name = property.name.clone();
        let value = property.values.remove(handle.value);
        if let ValueBody::Link(target_id) = value.body {
            removed.push(LinkStashItem {
                resource_id,
                resource_type,
                property: property_name,
                target_id,
                comment: value.comment,
                permissions: value.permissions,
            });
        }
    }
    // Restore batch order after the reverse removal walk.
    for item in removed.into_iter().rev() {
        stash.push_link(item);
    }

    for resource in resources.iter_mut() {
        resource.properties.retain(|p| !p.values.is_empty());
    }

    debug!(
        links = stash.link_count(),
        texts = stash.text_count(),
        owners = stash.owners().len(),
        "Stash applied to batch"
    );
    stash
}

// ============================================================================
// Tests
// ============================================================================
