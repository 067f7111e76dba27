//! Stevedore - bulk resource uploader for linked-data stores
//!
//! Takes a batch document full of resources that reference each other and
//! drives it into a remote store one create call at a time, in an order the
//! store will accept.
//!
//! ## Pipeline
//!
//! ```text
//! batch.json
//!   ├── load + validate        (batch)
//!   ├── order, break cycles    (graph)      dangling refs abort here
//!   ├── hold back cycle edges  (stash)
//!   ├── create loop            (upload)     localId -> remoteId as we go
//!   ├── patch held-back values (reapply)
//!   └── report + resume files  (diagnostics)
//! ```
//!
//! ## Why stash instead of failing?
//!
//! | Situation | What happens |
//! |-----------|--------------|
//! | Reference cycle | Cheapest edge bundle held back, created later as a patch |
//! | Self-reference | Always held back, never fatal |
//! | Reference to a missing id | Whole batch rejected before any network call |
//! | One resource fails to create | Recorded and skipped; the rest keeps going |
//!
//! Resources are never retried and never rolled back: a partial run leaves
//! the store exactly as far as it got, plus resume files describing the rest.

// Pipeline stages
pub mod batch;
pub mod graph;
pub mod stash;
pub mod upload;
pub mod reapply;
pub mod diagnostics;

// Model and wire plumbing
pub mod model;
pub mod idmap;
pub mod payload;
pub mod client;
pub mod http;

// Ambient
pub mod config;
pub mod error;
pub mod report;

// Re-exports
pub use batch::Batch;
pub use client::{MemoryStoreClient, SchemaContext, StoreClient, StoreError};
pub use config::Config;
pub use error::UploadError;
pub use graph::{build_plan, UploadPlan};
pub use http::HttpStoreClient;
pub use idmap::IdMap;
pub use report::RunReport;
pub use stash::{SavedStash, Stash};
pub use upload::{RunOptions, RunState, UploadRunner};
