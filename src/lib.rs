//! Stagehand - app-framework install scheduler for Splunk Enterprise CRs
//!
//! Stagehand reconciles the app packages listed in a remote object store
//! with the apps installed on a fleet of stateful Splunk pods. Each
//! reconcile pass runs a three-stage pipeline: packages are downloaded to a
//! staging volume on the operator host, copied into their target pods, and
//! installed there, under per-stage concurrency caps, a disk budget, and a
//! bounded retry policy. Pass results are written into a persisted status
//! context owned by the CR controller.
//!
//! # Modules
//!
//! - [`config`] - app-framework spec types (volumes, app sources, scopes)
//! - [`status`] - persisted deployment context and phase state machine
//! - [`cr`] - CR kind handles and pod naming contracts
//! - [`remote`] - object-store client trait and provider registry
//! - [`reconciler`] - remote-listing to desired-state diffing
//! - [`paths`] - staging volume layout
//! - [`disk`] - staging volume byte accounting
//! - [`podexec`] - exec-based pod transport
//! - [`pipeline`] - the three-phase install pipeline
//! - [`scheduler`] - the reconcile-pass entry point
//! - [`migration`] - persisted status schema migration
//! - [`mediator`] - shared manual-update config map
//! - [`error`] - error types

#![deny(missing_docs)]

pub mod config;
pub mod cr;
pub mod disk;
pub mod error;
pub mod mediator;
pub mod migration;
pub mod paths;
pub mod pipeline;
pub mod podexec;
pub mod reconciler;
pub mod remote;
pub mod scheduler;
pub mod status;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================
// Defaults shared by CRD defaults, the scheduler tunables, and test fixtures.

/// Parallel package downloads per pass unless the spec overrides it
pub const DEFAULT_MAX_CONCURRENT_APP_DOWNLOADS: u32 = 5;

/// Attempts per phase before a worker is parked with an error status
pub const PIPELINE_PHASE_MAX_RETRY_COUNT: u32 = 3;

/// Wall-clock budget of one reconcile pass, in seconds
pub const DEFAULT_YIELD_SECONDS: u64 = 90;

/// Cadence of the stage manager queue walks
pub const PIPELINE_TICK: std::time::Duration = std::time::Duration::from_millis(200);
