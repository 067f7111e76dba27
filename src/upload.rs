//! The upload driver: sequential resource creation in plan order.
//!
//! [`UploadRunner`] owns the whole pipeline for one batch: order the graph,
//! stash what must wait, create resources one by one, reapply the stash,
//! and leave artifacts behind. Creation is deliberately sequential, one
//! awaited call at a time, because create order is load-bearing for link
//! resolution.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::batch::Batch;
use crate::client::StoreClient;
use crate::diagnostics::DiagnosticsWriter;
use crate::error::UploadError;
use crate::graph::{build_plan, UploadPlan};
use crate::idmap::IdMap;
use crate::model::Resource;
use crate::payload::ValueCodec;
use crate::reapply::reapply_stash;
use crate::report::{FailedResource, RunReport, StepKind, TimingRecord};
use crate::stash::{apply_plan, Stash};

/// Mutable state of one run, threaded through the stages and handed to the
/// diagnostics writer at the end (or at the point of failure).
pub struct RunState {
    pub id_map: IdMap,
    pub stash: Stash,
    pub report: RunReport,
}

/// Knobs the binary sets from config and CLI flags.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Where diagnostics and resume files get written.
    pub output_dir: PathBuf,
    /// Base directory for relative bitstream paths.
    pub assets_dir: Option<PathBuf>,
    /// Human-readable tag baked into artifact file names.
    pub server_label: String,
    /// Capture per-step timing rows.
    pub save_timings: bool,
}

/// Drives one batch through the full pipeline against a store client.
pub struct UploadRunner<C: StoreClient> {
    client: Arc<C>,
    options: RunOptions,
}

impl<C: StoreClient> UploadRunner<C> {
    pub fn new(client: Arc<C>, options: RunOptions) -> Self {
        Self { client, options }
    }

    /// Run the batch to completion. `Ok` covers partial failure too; the
    /// report says what happened. `Err` means the run aborted (batch-fatal
    /// problem, store unreachable at startup, cancellation) and, when
    /// anything had already happened, resume files were written.
    pub async fn run(
        &self,
        mut batch: Batch,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<RunReport, UploadError> {
        let started = Instant::now();
        let total = batch.resources.len();

        // Ordering and stashing are pure; a dangling link aborts here,
        // before the store is contacted at all.
        let plan = build_plan(&batch.resources)?;
        let stash = apply_plan(&mut batch.resources, &plan);

        let mut state = RunState {
            id_map: IdMap::new(),
            stash,
            report: RunReport::default(),
        };
        state.report.total = total;
        state.report.stashed_links = state.stash.link_count();
        state.report.stashed_texts = state.stash.text_count();

        let outcome = self.run_stages(&batch, &plan, &mut state, shutdown).await;

        state.report.elapsed_ms = started.elapsed().as_millis() as u64;
        state.report.created_pairs = state
            .id_map
            .entries()
            .map(|(local, remote)| (local.to_string(), remote.to_string()))
            .collect();

        let writer = DiagnosticsWriter::new(&self.options.output_dir, &self.options.server_label);
        match outcome {
            Ok(()) => {
                state.report.log_summary();
                if let Err(e) = writer.write_completed(&state) {
                    error!(error = %e, "Could not write run artifacts");
                }
                Ok(state.report)
            }
            Err(e) => {
                error!(error = %e, "Upload run aborted; writing resume files");
                if let Err(io) = writer.write_aborted(&state) {
                    error!(error = %io, "Could not write resume files");
                }
                Err(e)
            }
        }
    }

    async fn run_stages(
        &self,
        batch: &Batch,
        plan: &UploadPlan,
        state: &mut RunState,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), UploadError> {
        let schema = self.client.fetch_schema().await?;
        let codec = ValueCodec::new(&schema, &batch.permissions);
        drive_creates(
            self.client.as_ref(),
            &codec,
            &batch.resources,
            plan,
            self.options.assets_dir.as_deref(),
            self.options.save_timings,
            state,
            shutdown,
        )
        .await?;
        reapply_stash(self.client.as_ref(), &codec, state, shutdown).await?;
        Ok(())
    }
}

/// True once a shutdown signal has been sent. A dropped sender does not
/// count; only an actual signal cancels the run.
pub(crate) fn cancel_requested(shutdown: &mut broadcast::Receiver<()>) -> bool {
    use tokio::sync::broadcast::error::TryRecvError;
    match shutdown.try_recv() {
        Ok(()) | Err(TryRecvError::Lagged(_)) => true,
        Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => false,
    }
}

/// Create resources one at a time in plan order. Per-resource failures are
/// recorded and skipped; only cancellation stops the loop.
#[allow(clippy::too_many_arguments)]
async fn drive_creates<C: StoreClient>(
    client: &C,
    codec: &ValueCodec,
    resources: &[Resource],
    plan: &UploadPlan,
    assets_dir: Option<&Path>,
    save_timings: bool,
    state: &mut RunState,
    shutdown: &mut broadcast::Receiver<()>,
) -> Result<(), UploadError> {
    let total = plan.order.len();
    for (position, &index) in plan.order.iter().enumerate() {
        if cancel_requested(shutdown) {
            warn!(
                created = state.report.created,
                total, "Cancellation requested; stopping before next resource"
            );
            return Err(UploadError::Cancelled);
        }
        let resource = &resources[index];

        // The asset goes up first; a resource whose file fails is skipped
        // whole, its create never attempted.
        let mut asset = None;
        if let Some(bitstream) = &resource.bitstream {
            let path = resolve_asset_path(assets_dir, bitstream);
            let step_started = Instant::now();
            let uploaded = client.upload_asset(&path).await;
            record_timing(
                &mut state.report.timings,
                save_timings,
                &resource.local_id,
                StepKind::AssetUpload,
                step_started,
            );
            match uploaded {
                Ok(handle) => asset = Some(handle.handle),
                Err(e) => {
                    warn!(
                        resource_id = %resource.local_id,
                        path = %path.display(),
                        error = %e,
                        "Asset upload failed; resource skipped"
                    );
                    state.report.failed.push(FailedResource {
                        local_id: resource.local_id.clone(),
                        label: resource.label.clone(),
                        type_name: resource.type_name.clone(),
                        step: StepKind::AssetUpload,
                        reason: e.reason(),
                    });
                    continue;
                }
            }
        }

        let payload = match codec.create_payload(resource, &state.id_map, asset) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(
                    resource_id = %resource.local_id,
                    error = %e,
                    "Could not build create payload; resource skipped"
                );
                state.report.failed.push(FailedResource {
                    local_id: resource.local_id.clone(),
                    label: resource.label.clone(),
                    type_name: resource.type_name.clone(),
                    step: StepKind::Create,
                    reason: e.to_string(),
                });
                continue;
            }
        };

        let step_started = Instant::now();
        let created = client.create_resource(&payload).await;
        record_timing(
            &mut state.report.timings,
            save_timings,
            &resource.local_id,
            StepKind::Create,
            step_started,
        );
        match created {
            Ok(remote_id) => {
                state.id_map.record(&resource.local_id, &remote_id);
                state.report.created += 1;
                info!(
                    resource_id = %resource.local_id,
                    remote_id = %remote_id,
                    progress = position + 1,
                    total,
                    "Created resource"
                );
            }
            Err(e) => {
                warn!(
                    resource_id = %resource.local_id,
                    error = %e,
                    "Create failed; resource skipped"
                );
                state.report.failed.push(FailedResource {
                    local_id: resource.local_id.clone(),
                    label: resource.label.clone(),
                    type_name: resource.type_name.clone(),
                    step: StepKind::Create,
                    reason: e.reason(),
                });
            }
        }
    }
    Ok(())
}

fn resolve_asset_path(assets_dir: Option<&Path>, bitstream: &Path) -> PathBuf {
    match assets_dir {
        Some(base) if bitstream.is_relative() => base.join(bitstream),
        _ => bitstream.to_path_buf(),
    }
}

fn record_timing(
    timings: &mut Vec<TimingRecord>,
    enabled: bool,
    resource: &str,
    step: StepKind,
    started: Instant,
) {
    if enabled {
        timings.push(TimingRecord {
            resource: resource.to_string(),
            step,
            millis: started.elapsed().as_millis() as u64,
        });
    }
}

// ============================================================================
// Tests
// ============================================================================
