//! EfacturaService facade
//!
//! Wires storage, the token manager, document retrieval and the sync engine
//! together around one shared backoff controller, and exposes the operations
//! collaborators (a web dashboard, the sync binary) need.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use log::info;

use crate::anaf::{
    AuthorizationCallback, AuthorizationRequest, HttpUpstream, RevokeOutcome, TokenManager,
    Upstream,
};
use crate::config::AnafSettings;
use crate::documents::{DocumentBundle, DocumentService, RetryStats};
use crate::error::{AnafError, AnafResult};
use crate::models::{
    Company, CompanyId, InvoiceRecord, MessageId, OAuthConfig, TaxId, Token, UserId,
};
use crate::ratelimit::{BackoffController, EndpointClass, EndpointStats};
use crate::storage::{BlobStore, FileBlobStore, InvoiceStore, SqliteInvoiceStore};
use crate::sync::{
    BackgroundTrigger, SyncEngine, SyncScheduler, SyncStatusReport, TriggerResult,
};
use crate::vault::SecretVault;

/// Database file inside the data directory
const DB_FILE: &str = "efactura.sqlite";
/// Blob directory inside the data directory
const BLOB_DIR: &str = "bundles";

/// Main entry point for e-Factura operations
pub struct EfacturaService {
    store: Arc<dyn InvoiceStore>,
    tokens: Arc<TokenManager>,
    documents: Arc<DocumentService>,
    engine: Arc<SyncEngine>,
    backoff: Arc<BackoffController>,
    settings: AnafSettings,
}

impl EfacturaService {
    /// Assemble the service from its collaborators
    pub fn new(
        store: Arc<dyn InvoiceStore>,
        blobs: Arc<dyn BlobStore>,
        vault: Arc<dyn SecretVault>,
        upstream: Arc<dyn Upstream>,
        settings: AnafSettings,
    ) -> Self {
        let backoff = Arc::new(BackoffController::new(settings.backoff.clone()));
        let tokens = Arc::new(TokenManager::new(
            Arc::clone(&store),
            vault,
            Arc::clone(&upstream),
            Arc::clone(&backoff),
            settings.clone(),
        ));
        let documents = Arc::new(DocumentService::new(
            Arc::clone(&store),
            blobs,
            Arc::clone(&tokens),
            Arc::clone(&upstream),
            Arc::clone(&backoff),
        ));
        let engine = Arc::new(SyncEngine::new(
            Arc::clone(&store),
            Arc::clone(&tokens),
            Arc::clone(&documents),
            upstream,
            Arc::clone(&backoff),
            settings.clone(),
        ));

        Self {
            store,
            tokens,
            documents,
            engine,
            backoff,
            settings,
        }
    }

    /// Open the production service: SQLite and file blobs under `data_dir`,
    /// HTTP upstream from `settings`
    pub fn open(
        data_dir: &Path,
        vault: Arc<dyn SecretVault>,
        settings: AnafSettings,
    ) -> AnafResult<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

        let store = SqliteInvoiceStore::new(data_dir.join(DB_FILE))?;
        let blobs = FileBlobStore::new(data_dir.join(BLOB_DIR))?;
        let upstream = HttpUpstream::new(settings.clone());
        info!("Opened e-Factura storage in {}", data_dir.display());

        Ok(Self::new(
            Arc::new(store),
            Arc::new(blobs),
            vault,
            Arc::new(upstream),
            settings,
        ))
    }

    pub fn settings(&self) -> &AnafSettings {
        &self.settings
    }

    // ========================================================================
    // OAuth
    // ========================================================================

    /// Seal and store the OAuth client registration
    pub fn configure_oauth(
        &self,
        client_id: &str,
        client_secret: &str,
        redirect_uri: &str,
    ) -> AnafResult<OAuthConfig> {
        self.tokens
            .configure_oauth(client_id, client_secret, redirect_uri)
    }

    pub fn initiate_authorization(&self, user: UserId) -> AnafResult<AuthorizationRequest> {
        self.tokens.initiate_authorization(user)
    }

    pub fn complete_authorization(
        &self,
        code: &str,
        state: &str,
        user: UserId,
    ) -> AnafResult<Token> {
        self.tokens.complete_authorization(code, state, user)
    }

    pub fn complete_callback(
        &self,
        callback: &AuthorizationCallback,
        user: UserId,
    ) -> AnafResult<Token> {
        self.tokens.complete_callback(callback, user)
    }

    pub fn get_valid_token(&self, user: UserId) -> AnafResult<Token> {
        self.tokens.get_valid_token(user)
    }

    pub fn revoke(&self, user: UserId) -> AnafResult<RevokeOutcome> {
        self.tokens.revoke(user)
    }

    pub fn is_connected(&self, user: UserId) -> AnafResult<bool> {
        self.tokens.has_token(user)
    }

    // ========================================================================
    // Companies
    // ========================================================================

    /// Create or update a company
    ///
    /// The tax id must validate; it is stored normalized (digits only).
    pub fn save_company(&self, company: Company) -> AnafResult<Company> {
        let tax_id = TaxId::parse(&company.tax_id)?;
        let company = Company {
            tax_id: tax_id.as_str().to_string(),
            ..company
        };
        self.store.upsert_company(&company)?;
        Ok(company)
    }

    pub fn get_company(&self, id: CompanyId) -> AnafResult<Company> {
        self.store
            .get_company(id)?
            .ok_or(AnafError::UnknownCompany(id))
    }

    pub fn list_companies(&self) -> AnafResult<Vec<Company>> {
        Ok(self.store.list_companies()?)
    }

    // ========================================================================
    // Sync
    // ========================================================================

    pub fn trigger_sync(&self, company: CompanyId) -> AnafResult<TriggerResult> {
        self.engine.trigger_sync(company)
    }

    pub fn trigger_sync_background(&self, company: CompanyId) -> AnafResult<BackgroundTrigger> {
        self.engine.trigger_sync_background(company)
    }

    pub fn get_sync_status(&self, company: CompanyId) -> AnafResult<SyncStatusReport> {
        self.engine.get_sync_status(company)
    }

    /// Periodic driver over this service's engine
    pub fn scheduler(&self) -> SyncScheduler {
        SyncScheduler::new(
            Arc::clone(&self.engine),
            Arc::clone(&self.store),
            self.settings.scheduler_tick(),
        )
    }

    // ========================================================================
    // Invoices and documents
    // ========================================================================

    pub fn list_invoices(&self, company: CompanyId) -> AnafResult<Vec<InvoiceRecord>> {
        self.get_company(company)?;
        Ok(self.store.list_invoices(company)?)
    }

    pub fn fetch_document(
        &self,
        company: CompanyId,
        message_id: &MessageId,
    ) -> AnafResult<DocumentBundle> {
        self.documents.fetch_document(company, message_id)
    }

    /// Re-fetch pending bundles of a company outside a sync run
    pub fn retry_pending_documents(
        &self,
        company: CompanyId,
        limit: usize,
    ) -> AnafResult<RetryStats> {
        let company = self.get_company(company)?;
        self.documents.retry_pending(&company, limit)
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    pub fn endpoint_stats(&self) -> Vec<(EndpointClass, EndpointStats)> {
        EndpointClass::ALL
            .into_iter()
            .map(|class| (class, self.backoff.stats(class)))
            .collect()
    }
}
