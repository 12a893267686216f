//! Invoice records ingested from the e-Factura message list

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::CompanyId;

/// Upstream message identifier (the `id` of a list entry)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Whether the company received or issued the invoice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Received,
    Issued,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Received => "received",
            Direction::Issued => "issued",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "received" => Some(Direction::Received),
            "issued" => Some(Direction::Issued),
            _ => None,
        }
    }
}

/// Both parties of an invoice
///
/// Fiscal codes come from the list entry; names (and fiscal codes the entry
/// lacked) are filled in from the invoice document once it is stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counterparts {
    pub issuer_tax_id: Option<String>,
    pub receiver_tax_id: Option<String>,
    pub issuer_name: Option<String>,
    pub receiver_name: Option<String>,
}

/// Packaging of a document bundle, detected from its leading bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleFormat {
    Zip,
    Xml,
    Binary,
}

impl BundleFormat {
    pub fn detect(bytes: &[u8]) -> Self {
        if bytes.starts_with(b"PK\x03\x04") {
            return BundleFormat::Zip;
        }
        let trimmed = bytes
            .strip_prefix(b"\xEF\xBB\xBF".as_slice())
            .unwrap_or(bytes)
            .trim_ascii_start();
        if trimmed.starts_with(b"<") {
            BundleFormat::Xml
        } else {
            BundleFormat::Binary
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BundleFormat::Zip => "zip",
            BundleFormat::Xml => "xml",
            BundleFormat::Binary => "binary",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "zip" => Some(BundleFormat::Zip),
            "xml" => Some(BundleFormat::Xml),
            "binary" => Some(BundleFormat::Binary),
            _ => None,
        }
    }

    /// File extension used when handing a bundle to a caller
    pub fn extension(&self) -> &'static str {
        match self {
            BundleFormat::Zip => "zip",
            BundleFormat::Xml => "xml",
            BundleFormat::Binary => "bin",
        }
    }
}

/// Reference to the raw bundle kept in blob storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRef {
    pub blob_key: String,
    /// Lowercase hex SHA-256 of the bundle bytes as received
    pub sha256: String,
    pub size: u64,
    pub format: BundleFormat,
}

/// Whether the record's bundle has been stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Stored,
    /// Download failed during ingestion; retried on later runs
    RetryPending,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Stored => "stored",
            DocumentStatus::RetryPending => "retry_pending",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stored" => Some(DocumentStatus::Stored),
            "retry_pending" => Some(DocumentStatus::RetryPending),
            _ => None,
        }
    }
}

/// Monetary total extracted from an XML bundle, kept as the textual decimal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Amount {
    pub value: String,
    pub currency: Option<String>,
}

/// One party as named in an invoice document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartyDetails {
    pub name: Option<String>,
    pub tax_id: Option<String>,
}

/// Fields read from the invoice document inside a bundle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvoiceDetails {
    pub amount: Option<Amount>,
    pub issuer: PartyDetails,
    pub receiver: PartyDetails,
}

/// An ingested invoice; unique per (company, message id)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceRecord {
    pub company_id: CompanyId,
    pub message_id: MessageId,
    pub direction: Direction,
    pub counterparts: Counterparts,
    pub invoice_date: Option<NaiveDate>,
    pub amount: Option<Amount>,
    /// `id_solicitare` of the upload that produced the message
    pub request_id: Option<String>,
    /// Upstream message type verbatim (`tip`)
    pub message_type: Option<String>,
    pub content: Option<ContentRef>,
    pub document_status: DocumentStatus,
    pub document_attempts: u32,
    pub ingested_at: DateTime<Utc>,
}

impl InvoiceRecord {
    pub fn has_content(&self) -> bool {
        self.content.is_some()
    }

    /// Attach a stored bundle and clear the retry flag
    ///
    /// Document details only fill fields that are still empty.
    pub fn with_content(mut self, content: ContentRef, details: InvoiceDetails) -> Self {
        self.content = Some(content);
        if details.amount.is_some() {
            self.amount = details.amount;
        }

        let parties = &mut self.counterparts;
        fill(&mut parties.issuer_name, details.issuer.name);
        fill(&mut parties.issuer_tax_id, details.issuer.tax_id);
        fill(&mut parties.receiver_name, details.receiver.name);
        fill(&mut parties.receiver_tax_id, details.receiver.tax_id);

        self.document_status = DocumentStatus::Stored;
        self
    }
}

fn fill(slot: &mut Option<String>, value: Option<String>) {
    if slot.is_none() {
        *slot = value;
    }
}
