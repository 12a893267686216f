//! ANAF OAuth2 and e-Factura REST integration
//!
//! This module provides:
//! - The [`Upstream`] seam and its HTTP implementation
//! - Token lifecycle management (authorization, refresh, revocation)
//! - Defensive normalization of list responses
//! - Invoice details read from downloaded bundles

mod auth;
mod bundle;
mod client;
mod normalize;
mod single_flight;

pub use auth::{
    AuthorizationCallback, AuthorizationRequest, RemoteRevocation, RevokeOutcome, TokenManager,
};
pub use bundle::{bundle_details, extract_details, unsigned_invoice_xml};
pub use client::HttpUpstream;
pub use normalize::{
    ListSource, MessageList, NormalizedEntry, normalize_entry, parse_message_list,
};
pub use single_flight::SingleFlight;

use crate::error::AnafResult;
use crate::models::{ClientCredentials, MessageId, TaxId};

/// ANAF API response types
pub mod api {
    use serde::{Deserialize, Serialize};

    /// Successful response from the token endpoint
    #[derive(Debug, Clone, Deserialize, Serialize)]
    pub struct TokenResponse {
        pub access_token: String,
        pub refresh_token: Option<String>,
        pub expires_in: Option<u64>,
        pub token_type: Option<String>,
        pub scope: Option<String>,
    }

    /// Error body returned by the token endpoint (RFC 6749 section 5.2)
    #[derive(Debug, Clone, Deserialize)]
    pub struct OAuthErrorBody {
        pub error: String,
        pub error_description: Option<String>,
    }
}

/// Calls to the tax authority's OAuth and REST endpoints
///
/// Implementations classify HTTP outcomes into [`crate::AnafError`]:
/// 401 is `TokenExpired`, 403 `TokenRejected`, 429 `RateLimited`, 5xx and
/// transport failures `UpstreamUnavailable`. Token endpoint errors come back
/// as `OAuthRejected` and are interpreted by the caller.
pub trait Upstream: Send + Sync {
    /// Exchange an authorization code for a token pair
    fn exchange_code(
        &self,
        client: &ClientCredentials,
        code: &str,
    ) -> AnafResult<api::TokenResponse>;

    /// Obtain a new access token with a refresh token
    fn refresh_token(
        &self,
        client: &ClientCredentials,
        refresh_token: &str,
    ) -> AnafResult<api::TokenResponse>;

    /// Revoke a token at the authority
    fn revoke_token(&self, client: &ClientCredentials, token: &str) -> AnafResult<()>;

    /// List e-Factura messages for `tax_id` over the last `days` days
    ///
    /// Returns the raw JSON; its shape varies and is normalized by the caller.
    fn list_messages(
        &self,
        access_token: &str,
        tax_id: &TaxId,
        days: u32,
    ) -> AnafResult<serde_json::Value>;

    /// Download the document bundle of one message
    fn download(&self, access_token: &str, message_id: &MessageId) -> AnafResult<Vec<u8>>;
}
