//! Second pass: put stashed values back onto the created resources.
//!
//! Works owner by owner, links before texts. Every group starts with a
//! fresh read of the owner's server-side representation; patches are issued
//! against what the store actually holds, not against what this run thinks
//! it sent. Entries leave the pending stash only on confirmed success, so
//! whatever remains in it at the end is exactly the outstanding set.

use std::collections::BTreeMap;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::client::{StoreClient, StoredResource, ValuePatch};
use crate::error::UploadError;
use crate::idmap::IdMap;
use crate::payload::ValueCodec;
use crate::report::{OutstandingEntry, RunReport, StepKind};
use crate::stash::{LinkStashItem, StashKey, TextStashItem};
use crate::upload::{cancel_requested, RunState};

/// Outcome of the read-before-write step for one owning resource.
enum OwnerRead {
    Found {
        remote_id: String,
        resource: StoredResource,
    },
    /// Nothing of this owner's group can be patched; the detail goes on
    /// every one of its outstanding entries.
    Skipped { detail: String },
}

pub(crate) async fn reapply_stash<C: StoreClient>(
    client: &C,
    codec: &ValueCodec,
    state: &mut RunState,
    shutdown: &mut broadcast::Receiver<()>,
) -> Result<(), UploadError> {
    if state.stash.is_empty() {
        return Ok(());
    }
    info!(
        links = state.stash.link_count(),
        texts = state.stash.text_count(),
        "Reapplying stashed values"
    );
    let RunState { id_map, stash, report } = state;
    reapply_links(client, codec, id_map, &mut stash.links, report, shutdown).await?;
    reapply_texts(client, codec, id_map, &mut stash.texts, report, shutdown).await?;
    Ok(())
}

async fn read_owner<C: StoreClient>(client: &C, ids: &IdMap, owner: &str) -> OwnerRead {
    let Some(remote_id) = ids.resolve(owner) else {
        return OwnerRead::Skipped {
            detail: format!("owner '{owner}' was never created"),
        };
    };
    match client.get_resource(remote_id).await {
        Ok(resource) => OwnerRead::Found {
            remote_id: remote_id.to_string(),
            resource,
        },
        Err(e) => OwnerRead::Skipped {
            detail: format!("could not fetch owner '{owner}': {}", e.reason()),
        },
    }
}

fn keys_by_owner<T>(groups: &BTreeMap<StashKey, Vec<T>>) -> BTreeMap<String, Vec<StashKey>> {
    let mut by_owner: BTreeMap<String, Vec<StashKey>> = BTreeMap::new();
    for key in groups.keys() {
        by_owner
            .entry(key.resource_id.clone())
            .or_default()
            .push(key.clone());
    }
    by_owner
}

async fn reapply_links<C: StoreClient>(
    client: &C,
    codec: &ValueCodec,
    ids: &IdMap,
    groups: &mut BTreeMap<StashKey, Vec<LinkStashItem>>,
    report: &mut RunReport,
    shutdown: &mut broadcast::Receiver<()>,
) -> Result<(), UploadError> {
    for (owner, keys) in keys_by_owner(groups) {
        if cancel_requested(shutdown) {
            return Err(UploadError::Cancelled);
        }
        let read = read_owner(client, ids, &owner).await;
        for key in keys {
            let items = groups.remove(&key).unwrap_or_default();
            let mut kept = Vec::new();
            match &read {
                OwnerRead::Skipped { detail } => {
                    for item in items {
                        report.outstanding.push(OutstandingEntry {
                            resource_id: key.resource_id.clone(),
                            property: key.property.clone(),
                            step: StepKind::PatchLink,
                            detail: detail.clone(),
                        });
                        kept.push(item);
                    }
                }
                OwnerRead::Found { remote_id, .. } => {
                    let mut pending = items.into_iter();
                    while let Some(item) = pending.next() {
                        if cancel_requested(shutdown) {
                            kept.push(item);
                            kept.extend(pending);
                            groups.insert(key, kept);
                            return Err(UploadError::Cancelled);
                        }
                        match patch_link(client, codec, ids, remote_id, &item).await {
                            Ok(()) => {
                                report.reapplied_links += 1;
                                debug!(
                                    resource_id = %item.resource_id,
                                    property = %item.property,
                                    target = %item.target_id,
                                    "Reapplied stashed link"
                                );
                            }
                            Err(detail) => {
                                warn!(
                                    resource_id = %item.resource_id,
                                    property = %item.property,
                                    target = %item.target_id,
                                    detail = %detail,
                                    "Stashed link was not reapplied"
                                );
                                report.outstanding.push(OutstandingEntry {
                                    resource_id: item.resource_id.clone(),
                                    property: item.property.clone(),
                                    step: StepKind::PatchLink,
                                    detail,
                                });
                                kept.push(item);
                            }
                        }
                    }
                }
            }
            if !kept.is_empty() {
                groups.insert(key, kept);
            }
        }
    }
    Ok(())
}

async fn patch_link<C: StoreClient>(
    client: &C,
    codec: &ValueCodec,
    ids: &IdMap,
    remote_id: &str,
    item: &LinkStashItem,
) -> Result<(), String> {
    let value = codec.link_patch_value(item, ids).map_err(|e| e.to_string())?;
    let patch = ValuePatch::Add {
        resource_id: remote_id.to_string(),
        resource_type: item.resource_type.clone(),
        property: item.property.clone(),
        value,
    };
    client.patch_value(&patch).await.map_err(|e| e.reason())
}

async fn reapply_texts<C: StoreClient>(
    client: &C,
    codec: &ValueCodec,
    ids: &IdMap,
    groups: &mut BTreeMap<StashKey, Vec<TextStashItem>>,
    report: &mut RunReport,
    shutdown: &mut broadcast::Receiver<()>,
) -> Result<(), UploadError> {
    for (owner, keys) in keys_by_owner(groups) {
        if cancel_requested(shutdown) {
            return Err(UploadError::Cancelled);
        }
        let read = read_owner(client, ids, &owner).await;
        for key in keys {
            let items = groups.remove(&key).unwrap_or_default();
            let mut kept = Vec::new();
            match &read {
                OwnerRead::Skipped { detail } => {
                    for item in items {
                        report.outstanding.push(OutstandingEntry {
                            resource_id: key.resource_id.clone(),
                            property: key.property.clone(),
                            step: StepKind::PatchText,
                            detail: detail.clone(),
                        });
                        kept.push(item);
                    }
                }
                OwnerRead::Found { remote_id, resource } => {
                    let mut pending = items.into_iter();
                    while let Some(item) = pending.next() {
                        if cancel_requested(shutdown) {
                            kept.push(item);
                            kept.extend(pending);
                            groups.insert(key, kept);
                            return Err(UploadError::Cancelled);
                        }
                        match patch_text(client, codec, ids, remote_id, resource, &item).await {
                            Ok(()) => {
                                report.reapplied_texts += 1;
                                debug!(
                                    resource_id = %item.resource_id,
                                    property = %item.property,
                                    "Restored stashed text"
                                );
                            }
                            Err(detail) => {
                                warn!(
                                    resource_id = %item.resource_id,
                                    property = %item.property,
                                    detail = %detail,
                                    "Stashed text was not restored"
                                );
                                report.outstanding.push(OutstandingEntry {
                                    resource_id: item.resource_id.clone(),
                                    property: item.property.clone(),
                                    step: StepKind::PatchText,
                                    detail,
                                });
                                kept.push(item);
                            }
                        }
                    }
                }
            }
            if !kept.is_empty() {
                groups.insert(key, kept);
            }
        }
    }
    Ok(())
}

async fn patch_text<C: StoreClient>(
    client: &C,
    codec: &ValueCodec,
    ids: &IdMap,
    remote_id: &str,
    resource: &StoredResource,
    item: &TextStashItem,
) -> Result<(), String> {
    // Locate the stored value that carries the placeholder token.
    let located = resource
        .properties
        .get(&item.property)
        .and_then(|values| {
            values
                .iter()
                .find(|v| v.value.as_str().is_some_and(|s| s.contains(&item.token)))
        })
        .ok_or_else(|| {
            format!(
                "placeholder token not found in any '{}' value on the server",
                item.property
            )
        })?;

    let current = located.value.as_str().unwrap_or_default();
    let (value, unresolved) = codec.text_patch_value(item, current, ids);
    if !unresolved.is_empty() {
        warn!(
            resource_id = %item.resource_id,
            property = %item.property,
            unresolved = ?unresolved,
            "Inline references stay unresolved; their local ids are kept as-is"
        );
    }
    let patch = ValuePatch::Replace {
        resource_id: remote_id.to_string(),
        resource_type: item.resource_type.clone(),
        property: item.property.clone(),
        value_id: located.id.clone(),
        value,
    };
    client.patch_value(&patch).await.map_err(|e| e.reason())
}

// ============================================================================
// Tests
// ============================================================================
