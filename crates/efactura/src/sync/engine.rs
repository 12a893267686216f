//! Per-company invoice synchronization
//!
//! One run lists the company's messages over a bounded window, records every
//! message not seen before, downloads its bundle and retries bundles that
//! failed on earlier runs. Runs of the same company never overlap; a second
//! trigger while one is in flight is turned away immediately.

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use super::timing::compute_window;
use crate::anaf::{ListSource, TokenManager, Upstream, normalize_entry, parse_message_list};
use crate::config::AnafSettings;
use crate::documents::{DocumentService, RetryStats};
use crate::error::{AnafError, AnafResult};
use crate::models::{
    Company, CompanyId, DocumentStatus, InvoiceRecord, SyncCursor, SyncFailure, SyncStatus,
    SyncWindow, TaxId, Token,
};
use crate::ratelimit::{BackoffController, EndpointClass, WaitPolicy};
use crate::storage::InvoiceStore;

/// Statistics from one sync run
#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    pub company_id: CompanyId,
    /// Window requested from the list endpoint
    pub window: SyncWindow,
    /// Which extraction strategy matched the list response
    pub source: ListSource,
    /// Number of entries in the list response
    pub listed: usize,
    /// Number of new records stored
    pub new_records: usize,
    /// Number of entries skipped (already stored)
    pub skipped_records: usize,
    /// Entries without a usable message id
    pub anomalies: usize,
    /// New records whose bundle was stored during this run
    pub documents_stored: usize,
    /// New records left waiting for their bundle
    pub documents_pending: usize,
    /// Older pending bundles retried at the end of the run
    pub retried: RetryStats,
    /// Duration of the run
    pub duration_ms: u64,
}

/// Result of a synchronous trigger
#[derive(Debug)]
pub enum TriggerResult {
    Ran(SyncReport),
    AlreadyInProgress,
}

/// Result of a background trigger
#[derive(Debug)]
pub enum BackgroundTrigger {
    /// The run holds the company's guard; join to collect its outcome
    Accepted(JoinHandle<AnafResult<SyncReport>>),
    AlreadyInProgress,
}

/// Sync state as shown to users
#[derive(Debug, Clone, PartialEq)]
pub struct SyncStatusReport {
    pub company_id: CompanyId,
    pub status: SyncStatus,
    pub last_run: Option<DateTime<Utc>>,
    pub error: Option<SyncFailure>,
    pub last_completed: Option<SyncWindow>,
    pub records: usize,
}

type RunningSet = Arc<Mutex<HashSet<CompanyId>>>;

/// Membership in the running set, released on drop
struct RunGuard {
    running: RunningSet,
    company: CompanyId,
}

impl RunGuard {
    fn try_acquire(running: &RunningSet, company: CompanyId) -> Option<Self> {
        let inserted = running.lock().unwrap().insert(company);
        inserted.then(|| Self {
            running: Arc::clone(running),
            company,
        })
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        // A poisoned set still has to forget this company
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        running.remove(&self.company);
    }
}

/// Drives sync runs for companies
pub struct SyncEngine {
    store: Arc<dyn InvoiceStore>,
    tokens: Arc<TokenManager>,
    documents: Arc<DocumentService>,
    upstream: Arc<dyn Upstream>,
    backoff: Arc<BackoffController>,
    settings: AnafSettings,
    running: RunningSet,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn InvoiceStore>,
        tokens: Arc<TokenManager>,
        documents: Arc<DocumentService>,
        upstream: Arc<dyn Upstream>,
        backoff: Arc<BackoffController>,
        settings: AnafSettings,
    ) -> Self {
        Self {
            store,
            tokens,
            documents,
            upstream,
            backoff,
            settings,
            running: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Run a sync for `company_id` on the calling thread
    ///
    /// A failed run is recorded on the company's cursor and returned as the
    /// error. Invalid tax ids are refused before any state changes.
    pub fn trigger_sync(&self, company_id: CompanyId) -> AnafResult<TriggerResult> {
        let (company, tax_id) = self.load_company(company_id)?;
        let Some(guard) = RunGuard::try_acquire(&self.running, company_id) else {
            debug!("Sync for company {} already in progress", company_id);
            return Ok(TriggerResult::AlreadyInProgress);
        };
        self.run_guarded(&company, &tax_id, guard)
            .map(TriggerResult::Ran)
    }

    /// Start a sync on a new thread
    ///
    /// The guard is taken before spawning, so an overlapping trigger is
    /// rejected without waiting for the thread to start.
    pub fn trigger_sync_background(
        self: &Arc<Self>,
        company_id: CompanyId,
    ) -> AnafResult<BackgroundTrigger> {
        let (company, tax_id) = self.load_company(company_id)?;
        let Some(guard) = RunGuard::try_acquire(&self.running, company_id) else {
            debug!("Sync for company {} already in progress", company_id);
            return Ok(BackgroundTrigger::AlreadyInProgress);
        };

        let engine = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(format!("efactura-sync-{company_id}"))
            .spawn(move || engine.run_guarded(&company, &tax_id, guard))
            .map_err(|e| anyhow::Error::new(e).context("Failed to spawn sync thread"))?;
        Ok(BackgroundTrigger::Accepted(handle))
    }

    /// Current sync state of a company
    ///
    /// A persisted RUNNING status with no run in flight means the process
    /// stopped mid-run; it is reported as an interrupted failure.
    pub fn get_sync_status(&self, company_id: CompanyId) -> AnafResult<SyncStatusReport> {
        if self.store.get_company(company_id)?.is_none() {
            return Err(AnafError::UnknownCompany(company_id));
        }
        let in_flight = self.is_running(company_id);
        let cursor = self.store.get_cursor(company_id)?;
        let records = self.store.count_invoices(company_id)?;

        let Some(cursor) = cursor else {
            return Ok(SyncStatusReport {
                company_id,
                status: if in_flight { SyncStatus::Running } else { SyncStatus::Idle },
                last_run: None,
                error: None,
                last_completed: None,
                records,
            });
        };

        let (status, error) = match (in_flight, cursor.status) {
            (true, _) => (SyncStatus::Running, None),
            (false, SyncStatus::Running) => (SyncStatus::Failed, Some(SyncFailure::interrupted())),
            (false, status) => (status, cursor.last_error),
        };

        Ok(SyncStatusReport {
            company_id,
            status,
            last_run: cursor.last_run_at,
            error,
            last_completed: cursor.last_completed,
            records,
        })
    }

    /// Whether a run for `company_id` currently holds the guard
    pub fn is_running(&self, company_id: CompanyId) -> bool {
        self.running.lock().unwrap().contains(&company_id)
    }

    fn load_company(&self, company_id: CompanyId) -> AnafResult<(Company, TaxId)> {
        let company = self
            .store
            .get_company(company_id)?
            .ok_or(AnafError::UnknownCompany(company_id))?;
        let tax_id = company.validated_tax_id().inspect_err(|e| {
            warn!("Not syncing company {}: {}", company_id, e);
        })?;
        Ok((company, tax_id))
    }

    fn run_guarded(
        &self,
        company: &Company,
        tax_id: &TaxId,
        _guard: RunGuard,
    ) -> AnafResult<SyncReport> {
        let start = Instant::now();
        let now = Utc::now();

        let cursor = self
            .store
            .get_cursor(company.id)?
            .unwrap_or_else(|| SyncCursor::new(company.id));
        let window = compute_window(Some(&cursor), now, self.settings.retention_days);
        let cursor = cursor.begin(window.clone());
        self.store.save_cursor(&cursor)?;

        info!(
            "Syncing company {} ({}) over the last {} day(s)",
            company.id, tax_id, window.days
        );

        match self.execute(company, tax_id, window, start) {
            Ok(report) => {
                self.store
                    .save_cursor(&cursor.complete(report.new_records, report.skipped_records))?;
                info!(
                    "Sync for company {} completed: {} new, {} skipped, {} pending bundle(s) in {}ms",
                    company.id,
                    report.new_records,
                    report.skipped_records,
                    report.documents_pending,
                    report.duration_ms
                );
                Ok(report)
            }
            Err(err) => {
                let failure = SyncFailure::from(&err);
                self.store.save_cursor(&cursor.fail(failure))?;
                if err.is_transient() {
                    warn!("Sync for company {} failed, will retry: {}", company.id, err);
                } else {
                    error!("Sync for company {} failed: {}", company.id, err);
                }
                Err(err)
            }
        }
    }

    fn execute(
        &self,
        company: &Company,
        tax_id: &TaxId,
        window: SyncWindow,
        start: Instant,
    ) -> AnafResult<SyncReport> {
        // 1. List messages for the window
        let token = self.tokens.get_valid_token(company.owner)?;
        let body = self.list_messages(company, &token, tax_id, window.days)?;

        // 2. Extract entries from whatever shape came back
        let list = parse_message_list(&body);
        self.log_list_source(company.id, &list.source);
        if !list.reported_tax_ids.is_empty()
            && !list.reported_tax_ids.iter().any(|t| t == tax_id.as_str())
        {
            warn!(
                "List response for company {} names tax ids {:?}, not {}",
                company.id, list.reported_tax_ids, tax_id
            );
        }

        let mut report = SyncReport {
            company_id: company.id,
            window,
            source: list.source.clone(),
            listed: list.entries.len(),
            new_records: 0,
            skipped_records: 0,
            anomalies: 0,
            documents_stored: 0,
            documents_pending: 0,
            retried: RetryStats::default(),
            duration_ms: 0,
        };

        // 3. Store every message not seen before
        let mut seen = HashSet::new();
        let mut inserted = HashSet::new();
        for entry in &list.entries {
            let Some(entry) = normalize_entry(entry, tax_id) else {
                warn!("List entry for company {} has no message id: {}", company.id, entry);
                report.anomalies += 1;
                continue;
            };

            if !seen.insert(entry.message_id.clone())
                || self.store.has_invoice(company.id, &entry.message_id)?
            {
                report.skipped_records += 1;
                continue;
            }

            let mut record = InvoiceRecord {
                company_id: company.id,
                message_id: entry.message_id,
                direction: entry.direction,
                counterparts: entry.counterparts,
                invoice_date: entry.invoice_date,
                amount: None,
                request_id: entry.request_id,
                message_type: entry.message_type,
                content: None,
                document_status: DocumentStatus::RetryPending,
                document_attempts: 1,
                ingested_at: Utc::now(),
            };

            match self.documents.retrieve(company, &record.message_id) {
                Ok((content, details)) => record = record.with_content(content, details),
                Err(err) => warn!(
                    "Bundle for {} of company {} not stored, will retry: {}",
                    record.message_id, company.id, err
                ),
            }

            let stored = record.document_status == DocumentStatus::Stored;
            if self.store.insert_invoice(&record)? {
                inserted.insert(record.message_id);
                report.new_records += 1;
                if stored {
                    report.documents_stored += 1;
                } else {
                    report.documents_pending += 1;
                }
            } else {
                report.skipped_records += 1;
            }
        }

        // 4. Give bundles left pending by earlier runs another chance
        report.retried = self.documents.retry_pending_except(
            company,
            self.settings.document_retries_per_run,
            &inserted,
        )?;

        report.duration_ms = start.elapsed().as_millis() as u64;
        Ok(report)
    }

    /// List call with one forced refresh on 401
    fn list_messages(
        &self,
        company: &Company,
        token: &Token,
        tax_id: &TaxId,
        days: u32,
    ) -> AnafResult<Value> {
        let policy = WaitPolicy::WaitUpTo(self.settings.list_wait());
        let attempt = |access_token: &str| {
            self.backoff.call(EndpointClass::ListMessages, policy, || {
                self.upstream.list_messages(access_token, tax_id, days)
            })
        };

        match attempt(&token.access_token) {
            Err(AnafError::TokenExpired) => {
                info!(
                    "List call for company {} returned 401; refreshing token",
                    company.id
                );
                let refreshed = self
                    .tokens
                    .force_refresh(company.owner, &token.access_token)?;
                attempt(&refreshed.access_token).map_err(|err| match err {
                    AnafError::TokenExpired => AnafError::TokenRejected,
                    other => other,
                })
            }
            other => other,
        }
    }

    fn log_list_source(&self, company_id: CompanyId, source: &ListSource) {
        match source {
            ListSource::Key(key) => debug!("Messages for company {} under {:?}", company_id, key),
            ListSource::BareArray => debug!("Messages for company {} as a bare array", company_id),
            ListSource::UpstreamMessage(text) => {
                if text.to_lowercase().contains("nu exista mesaje") {
                    info!("No messages for company {}: {}", company_id, text);
                } else {
                    warn!("List for company {} returned an error text: {}", company_id, text);
                }
            }
            ListSource::Unrecognized => warn!(
                "ParseAnomaly: list response for company {} has no recognizable message list",
                company_id
            ),
        }
    }
}
