//! Storage traits and implementations
//!
//! [`InvoiceStore`] holds structured state (OAuth config, tokens, companies,
//! invoice records, sync cursors); [`BlobStore`] holds raw document bundles.
//! Both come with an in-memory implementation for tests and a persistent one.

mod blob;
mod blob_file;
mod memory;
mod sqlite;
mod traits;

pub use blob::{BlobKey, BlobStore, InMemoryBlobStore};
pub use blob_file::FileBlobStore;
pub use memory::InMemoryInvoiceStore;
pub use sqlite::SqliteInvoiceStore;
pub use traits::InvoiceStore;

/// Behaviour every [`InvoiceStore`] must share, run against each backend
#[cfg(test)]
pub(crate) mod contract {
    use chrono::{DateTime, Duration, NaiveDate, Utc};

    use super::InvoiceStore;
    use crate::models::{
        Amount, BundleFormat, Company, CompanyId, ContentRef, Counterparts, Direction,
        DocumentStatus, FailureKind, InvoiceDetails, InvoiceRecord, MessageId, OAuthConfig,
        PartyDetails, SealedToken, SyncCursor, SyncFailure, SyncStatus, SyncWindow, UserId,
    };

    pub fn record(company: i64, id: &str, ingested_at: DateTime<Utc>) -> InvoiceRecord {
        InvoiceRecord {
            company_id: CompanyId(company),
            message_id: MessageId::new(id),
            direction: Direction::Received,
            counterparts: Counterparts {
                issuer_tax_id: Some("32640679".into()),
                receiver_tax_id: Some("51331025".into()),
                ..Counterparts::default()
            },
            invoice_date: NaiveDate::from_ymd_opt(2025, 11, 28),
            amount: None,
            request_id: Some("5638821927".into()),
            message_type: Some("FACTURA PRIMITA".into()),
            content: None,
            document_status: DocumentStatus::RetryPending,
            document_attempts: 1,
            ingested_at,
        }
    }

    fn sealed(user: i64, access: &str) -> SealedToken {
        let now = Utc::now();
        SealedToken {
            user_id: UserId(user),
            access_token: access.into(),
            refresh_token: Some("sealed-refresh".into()),
            expires_at: now + Duration::hours(1),
            scope: None,
            updated_at: now,
        }
    }

    pub fn tokens(store: &dyn InvoiceStore) {
        assert!(store.get_token(UserId(1)).unwrap().is_none());

        store.save_token(&sealed(1, "a1")).unwrap();
        store.save_token(&sealed(2, "b1")).unwrap();
        store.save_token(&sealed(1, "a2")).unwrap();

        let token = store.get_token(UserId(1)).unwrap().unwrap();
        assert_eq!(token.access_token, "a2");
        assert_eq!(token.refresh_token.as_deref(), Some("sealed-refresh"));

        assert!(store.delete_token(UserId(1)).unwrap());
        assert!(!store.delete_token(UserId(1)).unwrap());
        assert!(store.get_token(UserId(1)).unwrap().is_none());
        assert!(store.get_token(UserId(2)).unwrap().is_some());
    }

    pub fn oauth_config(store: &dyn InvoiceStore) {
        assert!(store.get_oauth_config().unwrap().is_none());

        let mut config = OAuthConfig {
            client_id: "client".into(),
            sealed_client_secret: "sealed".into(),
            redirect_uri: "https://app.example/callback".into(),
            updated_at: Utc::now(),
        };
        store.save_oauth_config(&config).unwrap();
        config.client_id = "client-2".into();
        store.save_oauth_config(&config).unwrap();

        assert_eq!(store.get_oauth_config().unwrap().unwrap(), config);
    }

    pub fn companies(store: &dyn InvoiceStore) {
        let a = Company::new(CompanyId(2), UserId(1), "14399840", "Dante");
        let b = Company::new(CompanyId(1), UserId(1), "RO32640679", "Beta").with_auto_sync(false);
        store.upsert_company(&a).unwrap();
        store.upsert_company(&b).unwrap();

        let listed = store.list_companies().unwrap();
        assert_eq!(listed.iter().map(|c| c.id).collect::<Vec<_>>(), vec![CompanyId(1), CompanyId(2)]);
        assert!(!listed[0].auto_sync);

        let renamed = a.clone().with_sync_interval_hours(6);
        store.upsert_company(&renamed).unwrap();
        assert_eq!(store.get_company(CompanyId(2)).unwrap().unwrap(), renamed);
        assert!(store.get_company(CompanyId(9)).unwrap().is_none());
    }

    pub fn invoice_idempotent_insert(store: &dyn InvoiceStore) {
        let now = Utc::now();
        let first = record(1, "100", now);

        assert!(store.insert_invoice(&first).unwrap());
        // Same key with different data leaves the original row untouched
        let mut dup = record(1, "100", now + Duration::seconds(5));
        dup.direction = Direction::Issued;
        assert!(!store.insert_invoice(&dup).unwrap());
        // Same message id under another company is a different record
        assert!(store.insert_invoice(&record(2, "100", now)).unwrap());

        assert!(store.has_invoice(CompanyId(1), &MessageId::new("100")).unwrap());
        assert!(!store.has_invoice(CompanyId(1), &MessageId::new("101")).unwrap());
        assert_eq!(store.count_invoices(CompanyId(1)).unwrap(), 1);
        assert_eq!(
            store.get_invoice(CompanyId(1), &MessageId::new("100")).unwrap().unwrap(),
            first
        );

        let stored = first.clone().with_content(
            ContentRef {
                blob_key: "1/00/100.bundle".into(),
                sha256: "ab".repeat(32),
                size: 1234,
                format: BundleFormat::Xml,
            },
            InvoiceDetails {
                amount: Some(Amount {
                    value: "400.00".into(),
                    currency: Some("RON".into()),
                }),
                issuer: PartyDetails {
                    name: Some("FURNIZOR SRL".into()),
                    tax_id: Some("RO32640679".into()),
                },
                receiver: PartyDetails {
                    name: Some("CLIENT SA".into()),
                    ..PartyDetails::default()
                },
            },
        );
        assert_eq!(stored.counterparts.issuer_name.as_deref(), Some("FURNIZOR SRL"));
        store.update_invoice_document(&stored).unwrap();
        assert_eq!(
            store.get_invoice(CompanyId(1), &MessageId::new("100")).unwrap().unwrap(),
            stored
        );

        assert!(store.update_invoice_document(&record(3, "404", now)).is_err());
    }

    pub fn pending_documents(store: &dyn InvoiceStore) {
        let now = Utc::now();
        let mut a = record(1, "a", now);
        a.document_attempts = 3;
        let b = record(1, "b", now + Duration::seconds(1));
        let c = record(1, "c", now + Duration::seconds(2));
        let mut stored = record(1, "d", now);
        stored.document_status = DocumentStatus::Stored;
        for r in [&a, &b, &c, &stored] {
            store.insert_invoice(r).unwrap();
        }

        let pending = store.list_pending_documents(CompanyId(1), 10).unwrap();
        let ids: Vec<_> = pending.iter().map(|r| r.message_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);

        assert_eq!(store.list_pending_documents(CompanyId(1), 1).unwrap().len(), 1);
        assert!(store.list_pending_documents(CompanyId(2), 10).unwrap().is_empty());

        let listed = store.list_invoices(CompanyId(1)).unwrap();
        let ids: Vec<_> = listed.iter().map(|r| r.message_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "d", "b", "c"]);
    }

    pub fn cursors(store: &dyn InvoiceStore) {
        assert!(store.get_cursor(CompanyId(1)).unwrap().is_none());

        let now = Utc::now();
        let cursor = SyncCursor::new(CompanyId(1))
            .begin(SyncWindow::ending_at(now, 60))
            .complete(3, 1);
        store.save_cursor(&cursor).unwrap();
        assert_eq!(store.get_cursor(CompanyId(1)).unwrap().unwrap(), cursor);

        let failed = cursor.begin(SyncWindow::ending_at(now, 2)).fail(SyncFailure {
            kind: FailureKind::TokenRejected,
            message: "rejected".into(),
        });
        store.save_cursor(&failed).unwrap();

        let loaded = store.get_cursor(CompanyId(1)).unwrap().unwrap();
        assert_eq!(loaded.status, SyncStatus::Failed);
        assert_eq!(loaded.last_completed.unwrap().days, 60);
        assert_eq!(loaded.last_error.unwrap().kind, FailureKind::TokenRejected);
    }
}
