//! Per-company sync progress
//!
//! Persisted separately from invoice records so a run can be resumed from the
//! last completed window. Only one cursor per company.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::CompanyId;
use crate::error::AnafError;

/// Run status of a company's synchronization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Idle,
    Running,
    Completed,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Running => "running",
            SyncStatus::Completed => "completed",
            SyncStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(SyncStatus::Idle),
            "running" => Some(SyncStatus::Running),
            "completed" => Some(SyncStatus::Completed),
            "failed" => Some(SyncStatus::Failed),
            _ => None,
        }
    }
}

/// Classified cause of a failed run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    TokenRejected,
    ReauthorizationRequired,
    NotConnected,
    UpstreamUnavailable,
    RateLimited,
    Configuration,
    Storage,
    /// Process stopped while the run was in progress
    Interrupted,
}

/// Failure recorded on the cursor and reported to the dashboard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl SyncFailure {
    pub fn interrupted() -> Self {
        Self {
            kind: FailureKind::Interrupted,
            message: "sync was interrupted before it finished".to_string(),
        }
    }
}

impl From<&AnafError> for SyncFailure {
    fn from(err: &AnafError) -> Self {
        let kind = match err {
            AnafError::TokenRejected | AnafError::TokenExpired => FailureKind::TokenRejected,
            AnafError::ReauthorizationRequired | AnafError::Authorization(_) => {
                FailureKind::ReauthorizationRequired
            }
            AnafError::NotConnected(_) => FailureKind::NotConnected,
            AnafError::UpstreamUnavailable(_) | AnafError::UnexpectedResponse { .. } => {
                FailureKind::UpstreamUnavailable
            }
            AnafError::RateLimited { .. } => FailureKind::RateLimited,
            AnafError::NotConfigured
            | AnafError::InvalidConfiguration(_)
            | AnafError::OAuthRejected { .. }
            | AnafError::InvalidTaxId(_)
            | AnafError::UnknownCompany(_)
            | AnafError::UnknownInvoice { .. }
            | AnafError::Vault(_) => FailureKind::Configuration,
            AnafError::Storage(_) => FailureKind::Storage,
        };
        Self {
            kind,
            message: err.to_string(),
        }
    }
}

/// Historical window requested from the list endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// The `zile` parameter sent upstream
    pub days: u32,
}

impl SyncWindow {
    pub fn ending_at(end: DateTime<Utc>, days: u32) -> Self {
        Self {
            start: end - chrono::Duration::days(i64::from(days)),
            end,
            days,
        }
    }
}

/// Sync progress for one company
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub company_id: CompanyId,
    pub last_completed: Option<SyncWindow>,
    pub last_attempted: Option<SyncWindow>,
    pub status: SyncStatus,
    pub last_error: Option<SyncFailure>,
    pub last_run_at: Option<DateTime<Utc>>,
    /// Records created by the last completed run
    pub last_new_records: usize,
    /// Entries that were already present during the last completed run
    pub last_skipped_records: usize,
}

impl SyncCursor {
    /// Cursor for a company that has never been synced
    pub fn new(company_id: CompanyId) -> Self {
        Self {
            company_id,
            last_completed: None,
            last_attempted: None,
            status: SyncStatus::Idle,
            last_error: None,
            last_run_at: None,
            last_new_records: 0,
            last_skipped_records: 0,
        }
    }

    /// Mark a run as started for `window`
    pub fn begin(mut self, window: SyncWindow) -> Self {
        self.last_run_at = Some(window.end);
        self.last_attempted = Some(window);
        self.status = SyncStatus::Running;
        self
    }

    /// Mark the attempted window as completed
    pub fn complete(mut self, new_records: usize, skipped_records: usize) -> Self {
        self.last_completed = self.last_attempted.clone();
        self.status = SyncStatus::Completed;
        self.last_error = None;
        self.last_new_records = new_records;
        self.last_skipped_records = skipped_records;
        self
    }

    /// Mark the run as failed; the last completed window is left untouched
    pub fn fail(mut self, failure: SyncFailure) -> Self {
        self.status = SyncStatus::Failed;
        self.last_error = Some(failure);
        self
    }

    pub fn has_completed_once(&self) -> bool {
        self.last_completed.is_some()
    }
}
