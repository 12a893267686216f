//! Sync timing utilities: request windows and scheduling
//!
//! Pure functions that can be tested without upstream or storage.

use chrono::{DateTime, Duration, Utc};

use crate::models::{FailureKind, SyncCursor, SyncStatus, SyncWindow};

/// Window to request for the next run of a company
///
/// A company without a completed window gets the full retention. Otherwise the
/// window covers the whole days since the last completed window ended, plus
/// one day of overlap, clamped to `[1, retention_days]`.
pub fn compute_window(
    cursor: Option<&SyncCursor>,
    now: DateTime<Utc>,
    retention_days: u32,
) -> SyncWindow {
    let retention = retention_days.max(1);
    let days = match cursor.and_then(|c| c.last_completed.as_ref()) {
        None => retention,
        Some(last) => {
            let elapsed = (now - last.end).num_days().max(0);
            let days = u32::try_from(elapsed).unwrap_or(u32::MAX).saturating_add(1);
            days.clamp(1, retention)
        }
    };
    SyncWindow::ending_at(now, days)
}

/// Check if enough time has elapsed since the last run to sync again.
///
/// # Arguments
/// * `last_run_at` - When the last run started (None if never run)
/// * `interval_hours` - Minimum hours between runs
/// * `now` - Current time
pub fn interval_elapsed(
    last_run_at: Option<DateTime<Utc>>,
    interval_hours: u32,
    now: DateTime<Utc>,
) -> bool {
    match last_run_at {
        Some(last) => now - last >= Duration::hours(i64::from(interval_hours)),
        None => true, // Never run
    }
}

/// Whether the periodic driver should sync a company now
///
/// Runs that failed for a transient reason are retried on the next cycle
/// instead of waiting out the interval. A cursor still saved as RUNNING is
/// due as well: either a run holds the company's guard and the trigger is
/// turned away, or the process stopped mid-run.
pub fn is_due(cursor: Option<&SyncCursor>, interval_hours: u32, now: DateTime<Utc>) -> bool {
    let Some(cursor) = cursor else {
        return true;
    };
    if cursor.status == SyncStatus::Running {
        return true;
    }

    let transient_failure = cursor.status == SyncStatus::Failed
        && cursor.last_error.as_ref().is_some_and(|e| {
            matches!(
                e.kind,
                FailureKind::UpstreamUnavailable
                    | FailureKind::RateLimited
                    | FailureKind::Interrupted
            )
        });

    transient_failure || interval_elapsed(cursor.last_run_at, interval_hours, now)
}
