//! In-memory storage implementation
//!
//! Used by tests and by callers that don't need persistence across restarts.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::RwLock;

use super::InvoiceStore;
use crate::models::{
    Company, CompanyId, DocumentStatus, InvoiceRecord, MessageId, OAuthConfig, SealedToken,
    SyncCursor, UserId,
};

/// In-memory implementation of InvoiceStore
///
/// Uses HashMaps protected by RwLocks for thread-safe access.
pub struct InMemoryInvoiceStore {
    oauth_config: RwLock<Option<OAuthConfig>>,
    tokens: RwLock<HashMap<UserId, SealedToken>>,
    companies: RwLock<HashMap<CompanyId, Company>>,
    invoices: RwLock<HashMap<(CompanyId, MessageId), InvoiceRecord>>,
    cursors: RwLock<HashMap<CompanyId, SyncCursor>>,
}

impl InMemoryInvoiceStore {
    /// Create a new empty in-memory store
    pub fn new() -> Self {
        Self {
            oauth_config: RwLock::new(None),
            tokens: RwLock::new(HashMap::new()),
            companies: RwLock::new(HashMap::new()),
            invoices: RwLock::new(HashMap::new()),
            cursors: RwLock::new(HashMap::new()),
        }
    }

    fn company_invoices(&self, company: CompanyId) -> Vec<InvoiceRecord> {
        let invoices = self.invoices.read().unwrap();
        let mut records: Vec<InvoiceRecord> = invoices
            .values()
            .filter(|r| r.company_id == company)
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            a.ingested_at
                .cmp(&b.ingested_at)
                .then_with(|| a.message_id.cmp(&b.message_id))
        });
        records
    }
}

impl Default for InMemoryInvoiceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InvoiceStore for InMemoryInvoiceStore {
    fn get_oauth_config(&self) -> Result<Option<OAuthConfig>> {
        Ok(self.oauth_config.read().unwrap().clone())
    }

    fn save_oauth_config(&self, config: &OAuthConfig) -> Result<()> {
        *self.oauth_config.write().unwrap() = Some(config.clone());
        Ok(())
    }

    fn get_token(&self, user: UserId) -> Result<Option<SealedToken>> {
        Ok(self.tokens.read().unwrap().get(&user).cloned())
    }

    fn save_token(&self, token: &SealedToken) -> Result<()> {
        self.tokens
            .write()
            .unwrap()
            .insert(token.user_id, token.clone());
        Ok(())
    }

    fn delete_token(&self, user: UserId) -> Result<bool> {
        Ok(self.tokens.write().unwrap().remove(&user).is_some())
    }

    fn get_company(&self, id: CompanyId) -> Result<Option<Company>> {
        Ok(self.companies.read().unwrap().get(&id).cloned())
    }

    fn list_companies(&self) -> Result<Vec<Company>> {
        let mut companies: Vec<Company> =
            self.companies.read().unwrap().values().cloned().collect();
        companies.sort_by_key(|c| c.id);
        Ok(companies)
    }

    fn upsert_company(&self, company: &Company) -> Result<()> {
        self.companies
            .write()
            .unwrap()
            .insert(company.id, company.clone());
        Ok(())
    }

    fn has_invoice(&self, company: CompanyId, message_id: &MessageId) -> Result<bool> {
        Ok(self
            .invoices
            .read()
            .unwrap()
            .contains_key(&(company, message_id.clone())))
    }

    fn insert_invoice(&self, record: &InvoiceRecord) -> Result<bool> {
        let mut invoices = self.invoices.write().unwrap();
        let key = (record.company_id, record.message_id.clone());
        if invoices.contains_key(&key) {
            return Ok(false);
        }
        invoices.insert(key, record.clone());
        Ok(true)
    }

    fn get_invoice(
        &self,
        company: CompanyId,
        message_id: &MessageId,
    ) -> Result<Option<InvoiceRecord>> {
        Ok(self
            .invoices
            .read()
            .unwrap()
            .get(&(company, message_id.clone()))
            .cloned())
    }

    fn list_invoices(&self, company: CompanyId) -> Result<Vec<InvoiceRecord>> {
        Ok(self.company_invoices(company))
    }

    fn list_pending_documents(
        &self,
        company: CompanyId,
        limit: usize,
    ) -> Result<Vec<InvoiceRecord>> {
        let mut pending: Vec<InvoiceRecord> = self
            .company_invoices(company)
            .into_iter()
            .filter(|r| r.document_status == DocumentStatus::RetryPending)
            .collect();
        // Stable sort keeps ingestion order among equal attempt counts
        pending.sort_by_key(|r| r.document_attempts);
        pending.truncate(limit);
        Ok(pending)
    }

    fn update_invoice_document(&self, record: &InvoiceRecord) -> Result<()> {
        let mut invoices = self.invoices.write().unwrap();
        let key = (record.company_id, record.message_id.clone());
        let existing = invoices.get_mut(&key).ok_or_else(|| {
            anyhow::anyhow!(
                "No invoice {} for company {}",
                record.message_id,
                record.company_id
            )
        })?;
        existing.content = record.content.clone();
        existing.amount = record.amount.clone();
        existing.counterparts = record.counterparts.clone();
        existing.document_status = record.document_status;
        existing.document_attempts = record.document_attempts;
        Ok(())
    }

    fn count_invoices(&self, company: CompanyId) -> Result<usize> {
        Ok(self
            .invoices
            .read()
            .unwrap()
            .keys()
            .filter(|(c, _)| *c == company)
            .count())
    }

    fn get_cursor(&self, company: CompanyId) -> Result<Option<SyncCursor>> {
        Ok(self.cursors.read().unwrap().get(&company).cloned())
    }

    fn save_cursor(&self, cursor: &SyncCursor) -> Result<()> {
        self.cursors
            .write()
            .unwrap()
            .insert(cursor.company_id, cursor.clone());
        Ok(())
    }
}
