//! Document bundle retrieval with a fallback to the stored copy
//!
//! Every download goes upstream first. When that fails and the record already
//! has content, the bundle stored at ingestion is returned instead, after its
//! digest has been checked.

use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;

use crate::anaf::{TokenManager, Upstream, bundle_details};
use crate::error::{AnafError, AnafResult};
use crate::models::{
    BundleFormat, Company, CompanyId, ContentRef, InvoiceDetails, InvoiceRecord, MessageId, UserId,
};
use crate::ratelimit::{BackoffController, EndpointClass, WaitPolicy};
use crate::storage::{BlobKey, BlobStore, InvoiceStore};

/// Where the bytes of a [`DocumentBundle`] came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleSource {
    /// Downloaded from upstream just now
    Fresh,
    /// Read back from blob storage because the refetch failed
    Cached,
}

/// A document bundle handed to a caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentBundle {
    pub message_id: MessageId,
    pub bytes: Vec<u8>,
    pub format: BundleFormat,
    pub source: BundleSource,
}

impl DocumentBundle {
    /// Suggested file name, e.g. `3001234567.zip`
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.message_id, self.format.extension())
    }
}

/// Outcome of a pass over `retry_pending` records
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RetryStats {
    pub attempted: usize,
    pub healed: usize,
    pub still_pending: usize,
}

/// Fetches bundles upstream and keeps the raw bytes in blob storage
pub struct DocumentService {
    store: Arc<dyn InvoiceStore>,
    blobs: Arc<dyn BlobStore>,
    tokens: Arc<TokenManager>,
    upstream: Arc<dyn Upstream>,
    backoff: Arc<BackoffController>,
}

impl DocumentService {
    pub fn new(
        store: Arc<dyn InvoiceStore>,
        blobs: Arc<dyn BlobStore>,
        tokens: Arc<TokenManager>,
        upstream: Arc<dyn Upstream>,
        backoff: Arc<BackoffController>,
    ) -> Self {
        Self {
            store,
            blobs,
            tokens,
            upstream,
            backoff,
        }
    }

    /// Download a bundle and write it to blob storage
    ///
    /// Returns the content reference and the details read from the invoice
    /// document inside the bundle.
    pub fn retrieve(
        &self,
        company: &Company,
        message_id: &MessageId,
    ) -> AnafResult<(ContentRef, InvoiceDetails)> {
        let bytes = self.fetch_remote(company.owner, message_id)?;
        store_bundle(self.blobs.as_ref(), company.id, message_id, &bytes)
    }

    /// Bundle for `record`: refetched if possible, otherwise the stored copy
    ///
    /// A pending record whose refetch succeeds is healed. A record without
    /// content whose refetch fails returns the refetch error.
    pub fn download(&self, company: &Company, record: &InvoiceRecord) -> AnafResult<DocumentBundle> {
        let message_id = &record.message_id;

        let err = match self.fetch_remote(company.owner, message_id) {
            Ok(bytes) => {
                if !record.has_content() {
                    let (content, details) =
                        store_bundle(self.blobs.as_ref(), company.id, message_id, &bytes)?;
                    let healed = record.clone().with_content(content, details);
                    self.store.update_invoice_document(&healed)?;
                    info!("Stored bundle for pending invoice {} of company {}", message_id, company.id);
                }
                return Ok(DocumentBundle {
                    message_id: message_id.clone(),
                    format: BundleFormat::detect(&bytes),
                    bytes,
                    source: BundleSource::Fresh,
                });
            }
            Err(err) => err,
        };

        let Some(content) = &record.content else {
            debug!("No stored bundle for {} to fall back on: {}", message_id, err);
            return Err(err);
        };

        warn!(
            "Refetch of {} for company {} failed ({}); serving stored bundle",
            message_id, company.id, err
        );
        let bytes = read_cached(self.blobs.as_ref(), content)?;
        Ok(DocumentBundle {
            message_id: message_id.clone(),
            bytes,
            format: content.format,
            source: BundleSource::Cached,
        })
    }

    /// Look up a record and download its bundle
    pub fn fetch_document(
        &self,
        company_id: CompanyId,
        message_id: &MessageId,
    ) -> AnafResult<DocumentBundle> {
        let company = self
            .store
            .get_company(company_id)?
            .ok_or(AnafError::UnknownCompany(company_id))?;
        let record = self
            .store
            .get_invoice(company_id, message_id)?
            .ok_or_else(|| AnafError::UnknownInvoice {
                company: company_id,
                message_id: message_id.clone(),
            })?;
        self.download(&company, &record)
    }

    /// Re-fetch up to `limit` records still waiting for their bundle
    ///
    /// Failures bump the attempt count. Rate limiting or a token problem ends
    /// the pass early, since every further attempt would fail the same way.
    pub fn retry_pending(&self, company: &Company, limit: usize) -> AnafResult<RetryStats> {
        self.retry_pending_except(company, limit, &HashSet::new())
    }

    /// [`DocumentService::retry_pending`], leaving out the records in `skip`
    ///
    /// A sync run passes the ids it just tried, so their first failure isn't
    /// followed by an immediate second attempt.
    pub fn retry_pending_except(
        &self,
        company: &Company,
        limit: usize,
        skip: &HashSet<MessageId>,
    ) -> AnafResult<RetryStats> {
        let mut stats = RetryStats::default();
        if limit == 0 {
            return Ok(stats);
        }

        let pending = self
            .store
            .list_pending_documents(company.id, limit.saturating_add(skip.len()))?
            .into_iter()
            .filter(|record| !skip.contains(&record.message_id))
            .take(limit);
        for record in pending {
            stats.attempted += 1;
            match self.retrieve(company, &record.message_id) {
                Ok((content, details)) => {
                    self.store
                        .update_invoice_document(&record.with_content(content, details))?;
                    stats.healed += 1;
                }
                Err(err) => {
                    let attempts = record.document_attempts.saturating_add(1);
                    let mut failed = record;
                    failed.document_attempts = attempts;
                    self.store.update_invoice_document(&failed)?;
                    stats.still_pending += 1;
                    debug!(
                        "Bundle {} still pending after {} attempt(s): {}",
                        failed.message_id, attempts, err
                    );
                    if matches!(err, AnafError::RateLimited { .. }) || err.requires_reauthorization()
                    {
                        break;
                    }
                }
            }
        }

        if stats.attempted > 0 {
            info!(
                "Retried {} pending bundle(s) for company {}: {} stored",
                stats.attempted, company.id, stats.healed
            );
        }
        Ok(stats)
    }

    /// Download through the backoff controller, refreshing once on 401
    fn fetch_remote(&self, owner: UserId, message_id: &MessageId) -> AnafResult<Vec<u8>> {
        let token = self.tokens.get_valid_token(owner)?;
        let attempt = |access_token: &str| {
            self.backoff
                .call(EndpointClass::Download, WaitPolicy::FailFast, || {
                    self.upstream.download(access_token, message_id)
                })
        };

        match attempt(&token.access_token) {
            Err(AnafError::TokenExpired) => {
                let refreshed = self.tokens.force_refresh(owner, &token.access_token)?;
                attempt(&refreshed.access_token).map_err(|err| match err {
                    AnafError::TokenExpired => AnafError::TokenRejected,
                    other => other,
                })
            }
            other => other,
        }
    }
}

/// Lowercase hex SHA-256 of `bytes`
pub fn bundle_digest(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Write `bytes` to blob storage and describe what was stored
fn store_bundle(
    blobs: &dyn BlobStore,
    company_id: CompanyId,
    message_id: &MessageId,
    bytes: &[u8],
) -> AnafResult<(ContentRef, InvoiceDetails)> {
    let key = BlobKey::bundle(company_id, message_id);
    blobs.put(&key, bytes)?;

    let format = BundleFormat::detect(bytes);
    let details = bundle_details(bytes, format);

    let content = ContentRef {
        blob_key: key.as_str().to_string(),
        sha256: bundle_digest(bytes),
        size: bytes.len() as u64,
        format,
    };
    Ok((content, details))
}

/// Read a stored bundle back, refusing bytes that don't match the digest
fn read_cached(blobs: &dyn BlobStore, content: &ContentRef) -> AnafResult<Vec<u8>> {
    let key = BlobKey::from(content.blob_key.as_str());
    let bytes = blobs
        .get(&key)?
        .ok_or_else(|| anyhow::anyhow!("stored bundle {} is missing", content.blob_key))?;

    let digest = bundle_digest(&bytes);
    if digest != content.sha256 {
        return Err(anyhow::anyhow!(
            "stored bundle {} is corrupt: digest {} does not match {}",
            content.blob_key,
            digest,
            content.sha256
        )
        .into());
    }
    Ok(bytes)
}
