//! Sync engine for fetching and storing invoices
//!
//! Provides idempotent per-company sync runs that can be safely retried, and
//! a periodic driver that runs them for every company due.

mod engine;
mod scheduler;
mod timing;

pub use engine::{BackgroundTrigger, SyncEngine, SyncReport, SyncStatusReport, TriggerResult};
pub use scheduler::{CycleReport, SyncScheduler};
pub use timing::{compute_window, interval_elapsed, is_due};
