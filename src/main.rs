//! Stevedore CLI
//!
//! Uploads a batch document of interlinked resources to a remote store.
//!
//! ## Usage
//!
//! ```bash
//! # Upload a batch with defaults
//! stevedore batch.json
//!
//! # Upload against a specific store
//! stevedore batch.json --store-url https://store.example.org/api
//!
//! # Full rehearsal against the built-in in-memory store
//! stevedore batch.json --dry-run
//!
//! # Custom config and artifact directory
//! stevedore batch.json --config ./stevedore.toml --output-dir ./runs
//! ```
//!
//! Exit status is 0 only for a fully clean run; partial failure, a fatal
//! error, or cancellation exit 1 after writing resume files.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use stevedore::model::ValueBody;
use stevedore::{
    Batch, Config, HttpStoreClient, MemoryStoreClient, RunOptions, RunReport, SchemaContext,
    UploadError, UploadRunner,
};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "stevedore")]
#[command(about = "Bulk resource uploader for linked-data stores")]
struct Args {
    /// Batch document to upload
    batch: PathBuf,

    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Base URL of the resource store API
    #[arg(long, env = "STEVEDORE_STORE_URL")]
    store_url: Option<String>,

    /// Bearer token for authenticated stores
    #[arg(long, env = "STEVEDORE_TOKEN")]
    token: Option<String>,

    /// Directory run artifacts and resume files are written to
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Base directory for relative bitstream paths
    #[arg(long)]
    assets_dir: Option<PathBuf>,

    /// Capture per-step timing rows
    #[arg(long)]
    timings: bool,

    /// Run the full pipeline against an in-memory store instead of a server
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("stevedore=info".parse()?))
        .init();

    let args = Args::parse();

    // Load config
    let mut config = if let Some(config_path) = &args.config {
        Config::load(config_path)?
    } else if Config::default_path().exists() {
        Config::load(Config::default_path())?
    } else {
        Config::default()
    };

    // Apply CLI overrides
    if let Some(url) = args.store_url {
        config.store_url = url;
    }
    if let Some(token) = args.token {
        config.token = Some(token);
    }
    if let Some(dir) = args.output_dir {
        config.output_dir = dir;
    }
    if let Some(dir) = args.assets_dir {
        config.assets_dir = Some(dir);
    }
    if args.timings {
        config.save_timings = true;
    }

    info!(
        batch = %args.batch.display(),
        store = %config.store_url,
        dry_run = args.dry_run,
        "Starting stevedore"
    );

    tokio::fs::create_dir_all(&config.output_dir).await?;

    // Save default config if it doesn't exist
    if args.config.is_none() {
        let config_path = Config::default_path();
        if !config_path.exists() {
            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            config.save(&config_path)?;
            info!(path = %config_path.display(), "Created default config");
        }
    }

    let batch = Batch::load(&args.batch)?;

    // Forward Ctrl-C onto the shutdown channel; the run finishes its
    // in-flight call, then stops and writes resume files.
    let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
    let ctrl_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received; finishing the in-flight call then stopping");
            let _ = ctrl_tx.send(());
        }
    });

    let options = RunOptions {
        output_dir: config.output_dir.clone(),
        assets_dir: config.assets_dir.clone(),
        server_label: if args.dry_run {
            "dry-run".to_string()
        } else {
            config.server_label()
        },
        save_timings: config.save_timings,
    };

    let result: Result<RunReport, UploadError> = if args.dry_run {
        info!("Dry run: no server will be contacted");
        let client = Arc::new(MemoryStoreClient::with_schema(dry_run_schema(&batch)));
        UploadRunner::new(client, options).run(batch, &mut shutdown_rx).await
    } else {
        let client = Arc::new(HttpStoreClient::new(&config)?);
        UploadRunner::new(client, options).run(batch, &mut shutdown_rx).await
    };

    let report = result?;
    if report.is_clean() {
        info!(
            created = report.created,
            "✅ All resources created and every held-back value restored"
        );
        Ok(())
    } else {
        warn!(
            failed = report.failed.len(),
            outstanding = report.outstanding.len(),
            "⚠️ Run finished with gaps; see the report and resume files"
        );
        std::process::exit(1);
    }
}

/// Dry runs have no server to fetch list nodes from, so every list label
/// the batch mentions gets a synthetic node id.
fn dry_run_schema(batch: &Batch) -> SchemaContext {
    let mut schema = SchemaContext::default();
    let mut next = 0u32;
    for resource in &batch.resources {
        for property in &resource.properties {
            for value in &property.values {
                if let ValueBody::List(label) = &value.body {
                    if !schema.list_nodes.contains_key(label) {
                        next += 1;
                        schema.list_nodes.insert(label.clone(), format!("node_{next:04}"));
                    }
                }
            }
        }
    }
    schema
}
