//! Domain models for the e-Factura integration

mod company;
mod invoice;
mod oauth_config;
mod sync_cursor;
mod token;

pub use company::{Company, CompanyId, TaxId};
pub use invoice::{
    Amount, BundleFormat, ContentRef, Counterparts, Direction, DocumentStatus, InvoiceDetails,
    InvoiceRecord, MessageId, PartyDetails,
};
pub use oauth_config::{ClientCredentials, OAuthConfig};
pub use sync_cursor::{FailureKind, SyncCursor, SyncFailure, SyncStatus, SyncWindow};
pub use token::{DEFAULT_EXPIRES_IN_SECS, SealedToken, Token, UserId};
