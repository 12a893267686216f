//! SQLite-based invoice storage

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use rusqlite_migration::{M, Migrations};

use super::traits::InvoiceStore;
use crate::models::{
    Amount, BundleFormat, Company, CompanyId, ContentRef, Counterparts, Direction, DocumentStatus,
    InvoiceRecord, MessageId, OAuthConfig, SealedToken, SyncCursor, SyncFailure, SyncStatus,
    SyncWindow, UserId,
};

/// Database migrations
///
/// Each migration is applied in order. The user_version pragma tracks which
/// migrations have been applied.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // Migration 1: Initial schema
        M::up(
            r#"
            -- System-wide OAuth client registration (single row)
            CREATE TABLE oauth_config (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                client_id TEXT NOT NULL,
                sealed_client_secret TEXT NOT NULL,
                redirect_uri TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- One token per user; token values are vault ciphertext
            CREATE TABLE tokens (
                user_id INTEGER PRIMARY KEY,
                access_token TEXT NOT NULL,
                refresh_token TEXT,
                expires_at TEXT NOT NULL,
                scope TEXT,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE companies (
                id INTEGER PRIMARY KEY,
                owner_id INTEGER NOT NULL,
                tax_id TEXT NOT NULL,
                name TEXT NOT NULL,
                auto_sync INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            );

            -- Ingested invoices, unique per (company, upstream message id)
            CREATE TABLE invoices (
                company_id INTEGER NOT NULL,
                message_id TEXT NOT NULL,
                direction TEXT NOT NULL,
                issuer_tax_id TEXT,
                receiver_tax_id TEXT,
                invoice_date TEXT,
                amount_value TEXT,
                amount_currency TEXT,
                request_id TEXT,
                message_type TEXT,
                blob_key TEXT,
                sha256 TEXT,
                size INTEGER,
                format TEXT,
                document_status TEXT NOT NULL,
                document_attempts INTEGER NOT NULL DEFAULT 0,
                ingested_at TEXT NOT NULL,
                PRIMARY KEY (company_id, message_id)
            );

            CREATE INDEX idx_invoices_pending
                ON invoices(company_id, document_status, document_attempts);

            -- Sync progress per company
            CREATE TABLE sync_cursors (
                company_id INTEGER PRIMARY KEY,
                status TEXT NOT NULL,
                last_completed TEXT,   -- JSON SyncWindow
                last_attempted TEXT,   -- JSON SyncWindow
                last_error TEXT,       -- JSON SyncFailure
                last_run_at TEXT,
                last_new_records INTEGER NOT NULL DEFAULT 0,
                last_skipped_records INTEGER NOT NULL DEFAULT 0
            );
            "#,
        ),
        // Migration 2: Per-company sync interval
        M::up(
            r#"
            ALTER TABLE companies ADD COLUMN sync_interval_hours INTEGER NOT NULL DEFAULT 24;
            "#,
        ),
        // Migration 3: Party names read from the invoice document
        M::up(
            r#"
            ALTER TABLE invoices ADD COLUMN issuer_name TEXT;
            ALTER TABLE invoices ADD COLUMN receiver_name TEXT;
            "#,
        ),
    ])
}

const INVOICE_COLUMNS: &str = "company_id, message_id, direction, issuer_tax_id, receiver_tax_id,
    invoice_date, amount_value, amount_currency, request_id, message_type,
    blob_key, sha256, size, format, document_status, document_attempts, ingested_at,
    issuer_name, receiver_name";

/// SQLite-based invoice storage
pub struct SqliteInvoiceStore {
    conn: Mutex<Connection>,
}

impl SqliteInvoiceStore {
    /// Open (or create) the database at `db_path` and run migrations
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        // WAL lets the dashboard read while a sync writes; NORMAL sync is
        // durable enough with WAL; busy_timeout covers concurrent company runs
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            PRAGMA busy_timeout = 5000;
            PRAGMA foreign_keys = ON;
            "#,
        )?;

        migrations()
            .to_latest(&mut conn)
            .context("Failed to run database migrations")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn fmt_ts(ts: &DateTime<Utc>) -> String {
    // Fixed width so that text ordering matches time ordering
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp in database: {raw}"))
}

fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        message.into(),
    )
}

fn ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(&raw).map_err(|e| conversion_error(idx, format!("{e:#}")))
}

fn invoice_from_row(row: &Row<'_>) -> rusqlite::Result<InvoiceRecord> {
    let direction: String = row.get(2)?;
    let direction = Direction::parse(&direction)
        .ok_or_else(|| conversion_error(2, format!("unknown direction {direction}")))?;

    let invoice_date = row
        .get::<_, Option<String>>(5)?
        .map(|raw| {
            NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
                .map_err(|e| conversion_error(5, format!("invalid invoice date {raw}: {e}")))
        })
        .transpose()?;

    let currency: Option<String> = row.get(7)?;
    let amount = row
        .get::<_, Option<String>>(6)?
        .map(|value| Amount { value, currency });

    let blob_key: Option<String> = row.get(10)?;
    let content = match blob_key {
        Some(blob_key) => {
            let format: String = row.get(13)?;
            Some(ContentRef {
                blob_key,
                sha256: row.get(11)?,
                size: row.get::<_, i64>(12)? as u64,
                format: BundleFormat::parse(&format)
                    .ok_or_else(|| conversion_error(13, format!("unknown format {format}")))?,
            })
        }
        None => None,
    };

    let status: String = row.get(14)?;
    let document_status = DocumentStatus::parse(&status)
        .ok_or_else(|| conversion_error(14, format!("unknown document status {status}")))?;

    Ok(InvoiceRecord {
        company_id: CompanyId(row.get(0)?),
        message_id: MessageId(row.get(1)?),
        direction,
        counterparts: Counterparts {
            issuer_tax_id: row.get(3)?,
            receiver_tax_id: row.get(4)?,
            issuer_name: row.get(17)?,
            receiver_name: row.get(18)?,
        },
        invoice_date,
        amount,
        request_id: row.get(8)?,
        message_type: row.get(9)?,
        content,
        document_status,
        document_attempts: row.get::<_, i64>(15)? as u32,
        ingested_at: ts_column(row, 16)?,
    })
}

fn company_from_row(row: &Row<'_>) -> rusqlite::Result<Company> {
    Ok(Company {
        id: CompanyId(row.get(0)?),
        owner: UserId(row.get(1)?),
        tax_id: row.get(2)?,
        name: row.get(3)?,
        auto_sync: row.get(4)?,
        sync_interval_hours: row.get(5)?,
        created_at: ts_column(row, 6)?,
    })
}

impl InvoiceStore for SqliteInvoiceStore {
    fn get_oauth_config(&self) -> Result<Option<OAuthConfig>> {
        let conn = self.conn.lock().unwrap();

        let row: Option<(String, String, String, String)> = conn
            .query_row(
                "SELECT client_id, sealed_client_secret, redirect_uri, updated_at
                 FROM oauth_config WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        let Some((client_id, sealed_client_secret, redirect_uri, updated_at)) = row else {
            return Ok(None);
        };

        Ok(Some(OAuthConfig {
            client_id,
            sealed_client_secret,
            redirect_uri,
            updated_at: parse_ts(&updated_at)?,
        }))
    }

    fn save_oauth_config(&self, config: &OAuthConfig) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO oauth_config (id, client_id, sealed_client_secret, redirect_uri, updated_at)
             VALUES (1, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                client_id = excluded.client_id,
                sealed_client_secret = excluded.sealed_client_secret,
                redirect_uri = excluded.redirect_uri,
                updated_at = excluded.updated_at",
            params![
                config.client_id,
                config.sealed_client_secret,
                config.redirect_uri,
                fmt_ts(&config.updated_at),
            ],
        )?;
        Ok(())
    }

    fn get_token(&self, user: UserId) -> Result<Option<SealedToken>> {
        let conn = self.conn.lock().unwrap();

        let row: Option<(String, Option<String>, String, Option<String>, String)> = conn
            .query_row(
                "SELECT access_token, refresh_token, expires_at, scope, updated_at
                 FROM tokens WHERE user_id = ?",
                [user.0],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((access_token, refresh_token, expires_at, scope, updated_at)) = row else {
            return Ok(None);
        };

        Ok(Some(SealedToken {
            user_id: user,
            access_token,
            refresh_token,
            expires_at: parse_ts(&expires_at)?,
            scope,
            updated_at: parse_ts(&updated_at)?,
        }))
    }

    fn save_token(&self, token: &SealedToken) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO tokens (user_id, access_token, refresh_token, expires_at, scope, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                expires_at = excluded.expires_at,
                scope = excluded.scope,
                updated_at = excluded.updated_at",
            params![
                token.user_id.0,
                token.access_token,
                token.refresh_token,
                fmt_ts(&token.expires_at),
                token.scope,
                fmt_ts(&token.updated_at),
            ],
        )?;
        Ok(())
    }

    fn delete_token(&self, user: UserId) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute("DELETE FROM tokens WHERE user_id = ?", [user.0])?;
        Ok(deleted > 0)
    }

    fn get_company(&self, id: CompanyId) -> Result<Option<Company>> {
        let conn = self.conn.lock().unwrap();
        let company = conn
            .query_row(
                "SELECT id, owner_id, tax_id, name, auto_sync, sync_interval_hours, created_at
                 FROM companies WHERE id = ?",
                [id.0],
                company_from_row,
            )
            .optional()?;
        Ok(company)
    }

    fn list_companies(&self) -> Result<Vec<Company>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, owner_id, tax_id, name, auto_sync, sync_interval_hours, created_at
             FROM companies ORDER BY id",
        )?;
        let companies = stmt
            .query_map([], company_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(companies)
    }

    fn upsert_company(&self, company: &Company) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO companies (id, owner_id, tax_id, name, auto_sync, sync_interval_hours, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                owner_id = excluded.owner_id,
                tax_id = excluded.tax_id,
                name = excluded.name,
                auto_sync = excluded.auto_sync,
                sync_interval_hours = excluded.sync_interval_hours",
            params![
                company.id.0,
                company.owner.0,
                company.tax_id,
                company.name,
                company.auto_sync,
                company.sync_interval_hours,
                fmt_ts(&company.created_at),
            ],
        )?;
        Ok(())
    }

    fn has_invoice(&self, company: CompanyId, message_id: &MessageId) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM invoices WHERE company_id = ? AND message_id = ?",
            params![company.0, message_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn insert_invoice(&self, record: &InvoiceRecord) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let content = record.content.as_ref();
        let inserted = conn.execute(
            &format!(
                "INSERT INTO invoices ({INVOICE_COLUMNS})
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(company_id, message_id) DO NOTHING"
            ),
            params![
                record.company_id.0,
                record.message_id.as_str(),
                record.direction.as_str(),
                record.counterparts.issuer_tax_id,
                record.counterparts.receiver_tax_id,
                record.invoice_date.map(|d| d.format("%Y-%m-%d").to_string()),
                record.amount.as_ref().map(|a| a.value.as_str()),
                record.amount.as_ref().and_then(|a| a.currency.as_deref()),
                record.request_id,
                record.message_type,
                content.map(|c| c.blob_key.as_str()),
                content.map(|c| c.sha256.as_str()),
                content.map(|c| c.size as i64),
                content.map(|c| c.format.as_str()),
                record.document_status.as_str(),
                record.document_attempts as i64,
                fmt_ts(&record.ingested_at),
                record.counterparts.issuer_name,
                record.counterparts.receiver_name,
            ],
        )?;
        Ok(inserted == 1)
    }

    fn get_invoice(
        &self,
        company: CompanyId,
        message_id: &MessageId,
    ) -> Result<Option<InvoiceRecord>> {
        let conn = self.conn.lock().unwrap();
        let record = conn
            .query_row(
                &format!(
                    "SELECT {INVOICE_COLUMNS} FROM invoices
                     WHERE company_id = ? AND message_id = ?"
                ),
                params![company.0, message_id.as_str()],
                invoice_from_row,
            )
            .optional()?;
        Ok(record)
    }

    fn list_invoices(&self, company: CompanyId) -> Result<Vec<InvoiceRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices
             WHERE company_id = ?
             ORDER BY ingested_at ASC, message_id ASC"
        ))?;
        let records = stmt
            .query_map([company.0], invoice_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    fn list_pending_documents(
        &self,
        company: CompanyId,
        limit: usize,
    ) -> Result<Vec<InvoiceRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices
             WHERE company_id = ? AND document_status = ?
             ORDER BY document_attempts ASC, ingested_at ASC, message_id ASC
             LIMIT ?"
        ))?;
        let records = stmt
            .query_map(
                params![
                    company.0,
                    DocumentStatus::RetryPending.as_str(),
                    limit as i64
                ],
                invoice_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    fn update_invoice_document(&self, record: &InvoiceRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let content = record.content.as_ref();
        let updated = conn.execute(
            "UPDATE invoices SET
                blob_key = ?, sha256 = ?, size = ?, format = ?,
                amount_value = ?, amount_currency = ?,
                issuer_tax_id = ?, receiver_tax_id = ?, issuer_name = ?, receiver_name = ?,
                document_status = ?, document_attempts = ?
             WHERE company_id = ? AND message_id = ?",
            params![
                content.map(|c| c.blob_key.as_str()),
                content.map(|c| c.sha256.as_str()),
                content.map(|c| c.size as i64),
                content.map(|c| c.format.as_str()),
                record.amount.as_ref().map(|a| a.value.as_str()),
                record.amount.as_ref().and_then(|a| a.currency.as_deref()),
                record.counterparts.issuer_tax_id,
                record.counterparts.receiver_tax_id,
                record.counterparts.issuer_name,
                record.counterparts.receiver_name,
                record.document_status.as_str(),
                record.document_attempts as i64,
                record.company_id.0,
                record.message_id.as_str(),
            ],
        )?;
        anyhow::ensure!(
            updated == 1,
            "No invoice {} for company {}",
            record.message_id,
            record.company_id
        );
        Ok(())
    }

    fn count_invoices(&self, company: CompanyId) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM invoices WHERE company_id = ?",
            [company.0],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn get_cursor(&self, company: CompanyId) -> Result<Option<SyncCursor>> {
        let conn = self.conn.lock().unwrap();

        type CursorRow = (
            String,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
            i64,
            i64,
        );
        let row: Option<CursorRow> = conn
            .query_row(
                "SELECT status, last_completed, last_attempted, last_error, last_run_at,
                        last_new_records, last_skipped_records
                 FROM sync_cursors WHERE company_id = ?",
                [company.0],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                    ))
                },
            )
            .optional()?;

        let Some((
            status,
            last_completed,
            last_attempted,
            last_error,
            last_run_at,
            last_new_records,
            last_skipped_records,
        )) = row
        else {
            return Ok(None);
        };

        let window = |json: Option<String>| -> Result<Option<SyncWindow>> {
            json.map(|j| serde_json::from_str(&j).context("Invalid sync window JSON"))
                .transpose()
        };

        Ok(Some(SyncCursor {
            company_id: company,
            status: SyncStatus::parse(&status)
                .with_context(|| format!("Unknown sync status {status}"))?,
            last_completed: window(last_completed)?,
            last_attempted: window(last_attempted)?,
            last_error: last_error
                .map(|j| serde_json::from_str::<SyncFailure>(&j))
                .transpose()
                .context("Invalid sync failure JSON")?,
            last_run_at: last_run_at.as_deref().map(parse_ts).transpose()?,
            last_new_records: last_new_records as usize,
            last_skipped_records: last_skipped_records as usize,
        }))
    }

    fn save_cursor(&self, cursor: &SyncCursor) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        let last_completed = cursor
            .last_completed
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let last_attempted = cursor
            .last_attempted
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let last_error = cursor
            .last_error
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        conn.execute(
            "INSERT INTO sync_cursors
             (company_id, status, last_completed, last_attempted, last_error, last_run_at,
              last_new_records, last_skipped_records)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(company_id) DO UPDATE SET
                status = excluded.status,
                last_completed = excluded.last_completed,
                last_attempted = excluded.last_attempted,
                last_error = excluded.last_error,
                last_run_at = excluded.last_run_at,
                last_new_records = excluded.last_new_records,
                last_skipped_records = excluded.last_skipped_records",
            params![
                cursor.company_id.0,
                cursor.status.as_str(),
                last_completed,
                last_attempted,
                last_error,
                cursor.last_run_at.as_ref().map(fmt_ts),
                cursor.last_new_records as i64,
                cursor.last_skipped_records as i64,
            ],
        )?;

        Ok(())
    }
}
