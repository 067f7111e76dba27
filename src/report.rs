//! Run accounting.
//!
//! The driver and the reapplier feed one [`RunReport`]; at the end of a run
//! it is logged, written next to the other diagnostics files, and its
//! bookkeeping identities are what the exit code is decided on.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Which step of a resource's upload an entry refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    AssetUpload,
    Create,
    PatchLink,
    PatchText,
}

/// One resource the run could not create. The whole resource is skipped;
/// nothing is retried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedResource {
    pub local_id: String,
    pub label: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub step: StepKind,
    pub reason: String,
}

/// A stashed value the reapply pass could not restore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutstandingEntry {
    pub resource_id: String,
    pub property: String,
    pub step: StepKind,
    pub detail: String,
}

/// Wall-clock duration of one network-bound step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingRecord {
    pub resource: String,
    pub step: StepKind,
    pub millis: u64,
}

/// Everything a finished (or aborted) run has to say for itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunReport {
    pub total: usize,
    pub created: usize,
    /// localId -> remoteId for everything created this run.
    #[serde(default)]
    pub created_pairs: BTreeMap<String, String>,
    pub failed: Vec<FailedResource>,
    pub stashed_links: usize,
    pub stashed_texts: usize,
    pub reapplied_links: usize,
    pub reapplied_texts: usize,
    pub outstanding: Vec<OutstandingEntry>,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub timings: Vec<TimingRecord>,
}

impl RunReport {
    /// True when every resource was created and every stash restored.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.outstanding.is_empty()
    }

    /// Bookkeeping identities: every resource is either created or failed,
    /// and every stashed value is either reapplied or outstanding.
    pub fn conservation_holds(&self) -> bool {
        let outstanding_links = self
            .outstanding
            .iter()
            .filter(|e| e.step == StepKind::PatchLink)
            .count();
        let outstanding_texts = self
            .outstanding
            .iter()
            .filter(|e| e.step == StepKind::PatchText)
            .count();
        self.created + self.failed.len() == self.total
            && self.reapplied_links + outstanding_links == self.stashed_links
            && self.reapplied_texts + outstanding_texts == self.stashed_texts
    }

    pub fn log_summary(&self) {
        info!(
            total = self.total,
            created = self.created,
            failed = self.failed.len(),
            stashed = self.stashed_links + self.stashed_texts,
            reapplied = self.reapplied_links + self.reapplied_texts,
            outstanding = self.outstanding.len(),
            elapsed_ms = self.elapsed_ms,
            "Upload run finished"
        );
        for failure in &self.failed {
            warn!(
                id = %failure.local_id,
                label = %failure.label,
                step = ?failure.step,
                reason = %failure.reason,
                "Resource was not created"
            );
        }
        for entry in &self.outstanding {
            warn!(
                resource = %entry.resource_id,
                property = %entry.property,
                detail = %entry.detail,
                "Stashed value was not restored"
            );
        }
        if !self.conservation_holds() {
            warn!("Report counts do not add up; file an issue with the report JSON attached");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conservation_identities() {
        let mut report = RunReport {
            total: 3,
            created: 2,
            stashed_links: 2,
            reapplied_links: 1,
            ..Default::default()
        };
        report.failed.push(FailedResource {
            local_id: "c".to_string(),
            label: "C".to_string(),
            type_name: "Thing".to_string(),
            step: StepKind::Create,
            reason: "500".to_string(),
        });
        report.outstanding.push(OutstandingEntry {
            resource_id: "a".to_string(),
            property: "p".to_string(),
            step: StepKind::PatchLink,
            detail: "owner failed".to_string(),
        });
        assert!(report.conservation_holds());
        assert!(!report.is_clean());

        report.created = 3;
        assert!(!report.conservation_holds());
    }

    #[test]
    fn test_clean_report() {
        let report = RunReport {
            total: 2,
            created: 2,
            stashed_texts: 1,
            reapplied_texts: 1,
            ..Default::default()
        };
        assert!(report.is_clean());
        assert!(report.conservation_holds());
    }

    #[test]
    fn test_step_kind_wire_names() {
        let json = serde_json::to_string(&StepKind::AssetUpload).unwrap();
        assert_eq!(json, "\"asset_upload\"");
        let back: StepKind = serde_json::from_str("\"patch_text\"").unwrap();
        assert_eq!(back, StepKind::PatchText);
    }
}
