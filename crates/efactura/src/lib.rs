//! e-Factura crate - ANAF OAuth and invoice synchronization
//!
//! This crate provides the platform-independent core of the e-Factura
//! integration:
//! - Domain models (Company, InvoiceRecord, Token, SyncCursor)
//! - ANAF OAuth2 token lifecycle with coalesced refreshes
//! - Defensive parsing of the e-Factura message list
//! - Storage trait abstractions (SQLite, in-memory) and blob storage
//! - Idempotent per-company sync engine and a periodic driver
//! - Document retrieval with a fallback to the stored bundle
//! - Shared per-endpoint rate limiting and backoff

pub mod anaf;
pub mod config;
pub mod documents;
pub mod error;
pub mod models;
pub mod ratelimit;
pub mod service;
pub mod storage;
pub mod sync;
pub mod vault;

pub use anaf::{
    AuthorizationCallback, AuthorizationRequest, HttpUpstream, ListSource, RemoteRevocation,
    RevokeOutcome, TokenManager, Upstream, api::TokenResponse, bundle_details,
};
pub use self::config::AnafSettings;
pub use documents::{BundleSource, DocumentBundle, DocumentService, RetryStats};
pub use error::{AnafError, AnafResult};
pub use models::{
    Amount, BundleFormat, ClientCredentials, Company, CompanyId, ContentRef, Counterparts,
    Direction, DocumentStatus, FailureKind, InvoiceDetails, InvoiceRecord, MessageId, OAuthConfig,
    PartyDetails, SyncCursor, SyncFailure, SyncStatus, SyncWindow, TaxId, Token, UserId,
};
pub use ratelimit::{BackoffController, BackoffSettings, EndpointClass, EndpointStats, WaitPolicy};
pub use service::EfacturaService;
pub use storage::{
    BlobKey, BlobStore, FileBlobStore, InMemoryBlobStore, InMemoryInvoiceStore, InvoiceStore,
    SqliteInvoiceStore,
};
pub use sync::{
    BackgroundTrigger, CycleReport, SyncEngine, SyncReport, SyncScheduler, SyncStatusReport,
    TriggerResult,
};
pub use vault::{AesGcmVault, SecretVault};
