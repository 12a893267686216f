//! Error taxonomy for the e-Factura integration
//!
//! Callers must be able to tell "refresh will fix it" apart from "the user has
//! to go through authorization again", so token problems are never collapsed
//! into a single variant.

use std::sync::Arc;
use std::time::Duration;

use crate::models::{CompanyId, MessageId, UserId};
use crate::ratelimit::EndpointClass;

/// Result alias used across the crate's public API
pub type AnafResult<T> = Result<T, AnafError>;

/// Errors produced by the token manager, the sync engine and document retrieval
///
/// Cloneable so that a single refresh result can be shared with every waiter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AnafError {
    /// State mismatch, replayed or expired state, or consent denied by the user
    #[error("authorization failed: {0}")]
    Authorization(String),

    /// Access token past its expiry; recovered automatically by refreshing
    #[error("access token expired")]
    TokenExpired,

    /// Token is valid but the API refuses it for this service or taxpayer
    #[error(
        "access token rejected by the e-Factura API (service or taxpayer not granted to this token); \
         re-register the application or authorize again with the right certificate"
    )]
    TokenRejected,

    /// The refresh grant is no longer accepted; the stored token was discarded
    #[error("the ANAF session can no longer be renewed; the user must authorize again")]
    ReauthorizationRequired,

    /// Token endpoint returned an OAuth error other than `invalid_grant`
    #[error("token endpoint rejected the request: {error}{}", .description.as_deref().map(|d| format!(" ({d})")).unwrap_or_default())]
    OAuthRejected {
        error: String,
        description: Option<String>,
    },

    /// Network failure, timeout or 5xx from upstream
    #[error("ANAF upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Upstream answered with a status or body this client cannot use
    #[error("unexpected response from ANAF (HTTP {status}): {detail}")]
    UnexpectedResponse { status: u16, detail: String },

    /// Upstream answered 429 or the local call budget is exhausted
    #[error("rate limited on {endpoint} endpoint, retry after {}s", .retry_after.as_secs())]
    RateLimited {
        endpoint: EndpointClass,
        retry_after: Duration,
    },

    /// Rejected administrative input (client registration, company data)
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// No OAuth client configuration has been stored
    #[error("ANAF OAuth client is not configured")]
    NotConfigured,

    /// The user has never connected (or has disconnected)
    #[error("user {0} has no ANAF connection")]
    NotConnected(UserId),

    /// Taxpayer identifier failed format validation
    #[error("invalid taxpayer identifier: {0}")]
    InvalidTaxId(String),

    /// Company id not present in storage
    #[error("unknown company {0}")]
    UnknownCompany(CompanyId),

    /// No record for this message under the company
    #[error("no invoice {message_id} for company {company}")]
    UnknownInvoice {
        company: CompanyId,
        message_id: MessageId,
    },

    /// Sealing or opening a secret failed
    #[error("secret vault error: {0}")]
    Vault(String),

    /// Persistence layer failure
    #[error("storage error: {0:#}")]
    Storage(Arc<anyhow::Error>),
}

impl AnafError {
    /// Transient failures are left for the next scheduler cycle
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AnafError::UpstreamUnavailable(_) | AnafError::RateLimited { .. }
        )
    }

    /// Failures that only a new authorization by the user can fix
    pub fn requires_reauthorization(&self) -> bool {
        matches!(
            self,
            AnafError::TokenRejected
                | AnafError::ReauthorizationRequired
                | AnafError::NotConnected(_)
        )
    }
}

impl From<anyhow::Error> for AnafError {
    fn from(err: anyhow::Error) -> Self {
        AnafError::Storage(Arc::new(err))
    }
}
