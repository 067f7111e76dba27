//! Resume and report artifacts.
//!
//! Every run leaves files behind in the output directory, tagged with the
//! run timestamp and the server label so artifacts from different runs and
//! stores never collide. An aborted run writes everything needed to pick up
//! by hand: what got created, what never did, and what still waits.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::UploadError;
use crate::upload::RunState;

pub struct DiagnosticsWriter {
    output_dir: PathBuf,
    prefix: String,
}

impl DiagnosticsWriter {
    pub fn new(output_dir: &Path, server_label: &str) -> Self {
        let stamp = chrono::Local::now().format("%Y-%m-%d_%H%M%S");
        Self {
            output_dir: output_dir.to_path_buf(),
            prefix: format!("{stamp}_{}", sanitize_label(server_label)),
        }
    }

    pub fn file_path(&self, name: &str) -> PathBuf {
        self.output_dir.join(format!("{}_{name}.json", self.prefix))
    }

    /// Artifacts of a run that made it to the end, partial failure included:
    /// the identifier-map export, the report, and (only when non-empty) the
    /// outstanding stash, the failed list, and timing rows.
    pub fn write_completed(&self, state: &RunState) -> Result<(), UploadError> {
        self.write("id_map", &state.id_map)?;
        self.write("report", &state.report)?;
        if !state.report.timings.is_empty() {
            self.write("timings", &state.report.timings)?;
        }
        if !state.stash.is_empty() {
            self.write("stash", &state.stash.to_saved())?;
        }
        if !state.report.failed.is_empty() {
            self.write("failed", &state.report.failed)?;
        }
        Ok(())
    }

    /// Resume files for a run that aborted mid-flight.
    pub fn write_aborted(&self, state: &RunState) -> Result<(), UploadError> {
        self.write("id_map", &state.id_map)?;
        self.write("stash", &state.stash.to_saved())?;
        self.write("failed", &state.report.failed)?;
        Ok(())
    }

    fn write<T: serde::Serialize>(&self, name: &str, value: &T) -> Result<(), UploadError> {
        fs::create_dir_all(&self.output_dir)?;
        let path = self.file_path(name);
        let json = serde_json::to_string_pretty(value)?;
        fs::write(&path, json)?;
        info!(path = %path.display(), "Wrote {name} artifact");
        Ok(())
    }
}

/// Keep file names portable: anything outside `[A-Za-z0-9._-]` becomes `-`.
fn sanitize_label(label: &str) -> String {
    let cleaned: String = label
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "store".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idmap::IdMap;
    use crate::report::{FailedResource, RunReport, StepKind};
    use crate::stash::{LinkStashItem, SavedStash, Stash};
    use std::collections::BTreeMap;

    fn state() -> RunState {
        let mut id_map = IdMap::new();
        id_map.record("a", "res_0001");
        let mut stash = Stash::default();
        stash.push_link(LinkStashItem {
            resource_id: "a".to_string(),
            resource_type: "Thing".to_string(),
            property: "points_at".to_string(),
            target_id: "b".to_string(),
            comment: None,
            permissions: None,
        });
        let mut report = RunReport::default();
        report.failed.push(FailedResource {
            local_id: "b".to_string(),
            label: "B".to_string(),
            type_name: "Thing".to_string(),
            step: StepKind::Create,
            reason: "HTTP 500".to_string(),
        });
        RunState {
            id_map,
            stash,
            report,
        }
    }

    #[test]
    fn test_aborted_run_writes_resume_files() {
        let dir = tempfile::tempdir().unwrap();
        let writer = DiagnosticsWriter::new(dir.path(), "store.example.org");
        writer.write_aborted(&state()).unwrap();

        let id_map: BTreeMap<String, String> =
            serde_json::from_str(&fs::read_to_string(writer.file_path("id_map")).unwrap())
                .unwrap();
        assert_eq!(id_map["a"], "res_0001");

        let saved: SavedStash =
            serde_json::from_str(&fs::read_to_string(writer.file_path("stash")).unwrap()).unwrap();
        assert_eq!(saved.links.len(), 1);
        assert_eq!(saved.links[0].target_id, "b");

        let failed: Vec<FailedResource> =
            serde_json::from_str(&fs::read_to_string(writer.file_path("failed")).unwrap())
                .unwrap();
        assert_eq!(failed[0].local_id, "b");
    }

    #[test]
    fn test_clean_run_skips_empty_files() {
        let dir = tempfile::tempdir().unwrap();
        let writer = DiagnosticsWriter::new(dir.path(), "local");
        let mut clean = state();
        clean.stash = Stash::default();
        clean.report = RunReport::default();
        writer.write_completed(&clean).unwrap();

        assert!(writer.file_path("id_map").exists());
        assert!(writer.file_path("report").exists());
        assert!(!writer.file_path("stash").exists());
        assert!(!writer.file_path("failed").exists());
        assert!(!writer.file_path("timings").exists());
    }

    #[test]
    fn test_label_sanitized_for_file_names() {
        assert_eq!(
            sanitize_label("store.example.org:8443/api"),
            "store.example.org-8443-api"
        );
        assert_eq!(sanitize_label(""), "store");
    }
}
