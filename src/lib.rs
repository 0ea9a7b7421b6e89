//! Moonfleet - fleet monitor for Moonraker-based 3D printers.
//!
//! This library provides the synchronization engine for a small fleet of
//! networked printers: each device is polled independently over its HTTP
//! API, fresh status is reconciled into an in-memory record store, and
//! per-device failures are isolated so one unreachable printer never
//! corrupts or delays the others.
//!
//! # Core Components
//!
//! * [`config`] - Configuration from environment variables
//! * [`store`] - In-memory device record table keyed by address
//! * [`fetcher`] - Moonraker status reads normalized into snapshots
//! * [`reconcile`] - Full-replace reconciliation of snapshots and failures
//! * [`scheduler`] - Independent per-device polling loops
//! * [`media`] - Live stream / thumbnail / placeholder fallback chain
//! * [`command`] - Fire-and-forget printer control commands
//! * [`error`] - Command failure taxonomy

pub mod command;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod media;
pub mod reconcile;
pub mod scheduler;
pub mod store;

// Re-export commonly used types for convenience
pub use command::{CommandDispatcher, CommandKind};
pub use config::Config;
pub use error::CommandError;
pub use fetcher::{FetchOutcome, StatusFetcher, StatusSnapshot};
pub use media::MediaResolver;
pub use reconcile::Reconciler;
pub use scheduler::PollScheduler;
pub use store::{DeviceRecord, FleetStore, PrinterStatus};
