//! Reconciliation of remote records into work items, batch imports and
//! scheduled syncs.

mod catalog;
mod config;
mod engine;
mod importer;
mod scheduler;
mod source;

pub use catalog::{create_tracker, save_tracker};
pub use config::SyncConfig;
pub use engine::{convert, reconcile, ReconcileOutcome};
pub use importer::{ImportFailure, ImportSummary, Importer, DEFAULT_IMPORT_CONCURRENCY};
pub use scheduler::{build_scheduler, run_scheduled_import, QueryScheduler};
pub use source::{BundleDirectorySource, RemoteItemSource};

pub const CRATE_NAME: &str = "rwi-sync";
