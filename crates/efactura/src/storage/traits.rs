//! Storage trait definitions

use crate::models::{
    Company, CompanyId, InvoiceRecord, MessageId, OAuthConfig, SealedToken, SyncCursor, UserId,
};
use anyhow::Result;

/// Trait for e-Factura persistence
///
/// This trait abstracts over different storage backends (in-memory, SQLite)
/// and holds everything the token manager and sync engine persist. Raw
/// document bundles live in a separate [`super::BlobStore`].
pub trait InvoiceStore: Send + Sync {
    // === OAuth client registration ===

    /// Get the system-wide OAuth configuration
    fn get_oauth_config(&self) -> Result<Option<OAuthConfig>>;

    /// Save the OAuth configuration, replacing any previous one
    fn save_oauth_config(&self, config: &OAuthConfig) -> Result<()>;

    // === Tokens ===

    /// Get a user's token
    fn get_token(&self, user: UserId) -> Result<Option<SealedToken>>;

    /// Save a user's token (upsert; at most one per user)
    fn save_token(&self, token: &SealedToken) -> Result<()>;

    /// Delete a user's token; returns whether one existed
    fn delete_token(&self, user: UserId) -> Result<bool>;

    // === Companies ===

    /// Get a company by ID
    fn get_company(&self, id: CompanyId) -> Result<Option<Company>>;

    /// List all companies, ordered by ID
    fn list_companies(&self) -> Result<Vec<Company>>;

    /// Insert or update a company
    fn upsert_company(&self, company: &Company) -> Result<()>;

    // === Invoice records ===

    /// Check if a record exists for (company, message id)
    fn has_invoice(&self, company: CompanyId, message_id: &MessageId) -> Result<bool>;

    /// Insert a record unless one exists for the same (company, message id)
    ///
    /// Returns `false` if the record was already present; the existing row
    /// is left untouched.
    fn insert_invoice(&self, record: &InvoiceRecord) -> Result<bool>;

    /// Get a record by (company, message id)
    fn get_invoice(&self, company: CompanyId, message_id: &MessageId)
    -> Result<Option<InvoiceRecord>>;

    /// List a company's records, ordered by ingestion time then message id
    fn list_invoices(&self, company: CompanyId) -> Result<Vec<InvoiceRecord>>;

    /// Records still waiting for their bundle, fewest attempts first
    fn list_pending_documents(&self, company: CompanyId, limit: usize)
    -> Result<Vec<InvoiceRecord>>;

    /// Update the document fields of an existing record
    ///
    /// Writes content reference, amount, document status and attempt count.
    fn update_invoice_document(&self, record: &InvoiceRecord) -> Result<()>;

    /// Count a company's records
    fn count_invoices(&self, company: CompanyId) -> Result<usize>;

    // === Sync cursors ===

    /// Get a company's sync cursor
    fn get_cursor(&self, company: CompanyId) -> Result<Option<SyncCursor>>;

    /// Save a sync cursor (upsert)
    fn save_cursor(&self, cursor: &SyncCursor) -> Result<()>;
}
