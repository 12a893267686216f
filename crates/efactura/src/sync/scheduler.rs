//! Periodic driver for automatic syncs
//!
//! Every cycle picks the companies with auto-sync enabled whose interval has
//! passed and syncs them concurrently on the rayon pool. Shutdown is
//! cooperative: the flag is checked between cycles and while sleeping.

use chrono::Utc;
use log::{debug, error, info, warn};
use rayon::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use super::engine::{SyncEngine, TriggerResult};
use super::timing::is_due;
use crate::error::AnafResult;
use crate::models::{Company, CompanyId};
use crate::storage::InvoiceStore;

/// Granularity of the shutdown check while waiting for the next tick
const SHUTDOWN_POLL: Duration = Duration::from_millis(250);

/// Statistics from one driver cycle
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// Companies with auto-sync enabled
    pub considered: usize,
    /// Companies whose sync was due
    pub due: usize,
    pub completed: usize,
    pub failed: usize,
    /// Due, but a run was already in progress
    pub already_running: usize,
    /// Skipped because the stored tax id does not validate
    pub invalid_tax_id: usize,
}

/// Runs due company syncs on a fixed tick until shut down
pub struct SyncScheduler {
    engine: Arc<SyncEngine>,
    store: Arc<dyn InvoiceStore>,
    tick: Duration,
    shutdown: Arc<AtomicBool>,
}

impl SyncScheduler {
    pub fn new(engine: Arc<SyncEngine>, store: Arc<dyn InvoiceStore>, tick: Duration) -> Self {
        Self {
            engine,
            store,
            tick,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that stops [`SyncScheduler::run_until_shutdown`] when set
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Companies the next cycle would sync
    pub fn due_companies(&self) -> AnafResult<(Vec<Company>, CycleReport)> {
        let now = Utc::now();
        let mut report = CycleReport::default();
        let mut due = Vec::new();

        for company in self.store.list_companies()? {
            if !company.auto_sync {
                continue;
            }
            report.considered += 1;

            if let Err(err) = company.validated_tax_id() {
                warn!("Skipping company {}: {}", company.id, err);
                report.invalid_tax_id += 1;
                continue;
            }

            let cursor = self.store.get_cursor(company.id)?;
            if is_due(cursor.as_ref(), company.sync_interval_hours, now) {
                due.push(company);
            }
        }

        report.due = due.len();
        Ok((due, report))
    }

    /// Sync every due company once
    ///
    /// A failing company never stops the others; failures are recorded on
    /// their cursors by the engine.
    pub fn run_cycle(&self) -> AnafResult<CycleReport> {
        let (due, mut report) = self.due_companies()?;
        if due.is_empty() {
            debug!("No company due for sync");
            return Ok(report);
        }

        info!("Sync cycle: {} of {} companies due", report.due, report.considered);

        let outcomes: Vec<(CompanyId, AnafResult<TriggerResult>)> = due
            .par_iter()
            .map(|company| (company.id, self.engine.trigger_sync(company.id)))
            .collect();

        for (company_id, outcome) in outcomes {
            match outcome {
                Ok(TriggerResult::Ran(_)) => report.completed += 1,
                Ok(TriggerResult::AlreadyInProgress) => {
                    debug!("Company {} already syncing", company_id);
                    report.already_running += 1;
                }
                Err(_) => report.failed += 1,
            }
        }

        info!(
            "Sync cycle finished: {} completed, {} failed, {} already running",
            report.completed, report.failed, report.already_running
        );
        Ok(report)
    }

    /// Run cycles on the configured tick until shutdown is requested
    pub fn run_until_shutdown(&self) {
        info!("Sync driver started; tick every {:?}", self.tick);

        while !self.is_shutdown_requested() {
            if let Err(err) = self.run_cycle() {
                error!("Sync cycle failed: {}", err);
            }
            self.sleep_until_next_tick();
        }

        info!("Sync driver stopped");
    }

    fn sleep_until_next_tick(&self) {
        let deadline = Instant::now() + self.tick;
        while !self.is_shutdown_requested() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            std::thread::sleep(remaining.min(SHUTDOWN_POLL));
        }
    }
}
