//! Normalization of e-Factura list responses to domain values
//!
//! The list endpoint has returned its messages under several different keys
//! over time, sometimes as a bare array, and answers "no messages" with a
//! textual `eroare` field instead of an empty list. Extraction tries an
//! ordered list of strategies and reports which one matched.

use chrono::NaiveDate;
use serde_json::Value;

use crate::models::{Counterparts, Direction, MessageId, TaxId};

/// Which extraction strategy produced a [`MessageList`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListSource {
    /// Array found under this top-level key
    Key(&'static str),
    /// The body itself is an array
    BareArray,
    /// No array, but upstream explained itself in `eroare`
    UpstreamMessage(String),
    /// Nothing recognizable; treated as empty
    Unrecognized,
}

impl ListSource {
    /// Whether this outcome should be reported as a parse anomaly
    pub fn is_anomaly(&self) -> bool {
        matches!(self, ListSource::Unrecognized)
    }
}

/// Raw entries extracted from a list response
#[derive(Debug, Clone, PartialEq)]
pub struct MessageList {
    pub source: ListSource,
    pub entries: Vec<Value>,
    /// Fiscal codes from the `cui` field, which lists what the token may access
    pub reported_tax_ids: Vec<String>,
}

/// Keys tried in order before falling back to a bare array
const LIST_KEYS: [&str; 5] = ["listaMesajeFactura", "data", "invoices", "mesaje", "rezultate"];

#[derive(Clone, Copy)]
enum Strategy {
    Key(&'static str),
    BareArray,
    ErrorText,
}

impl Strategy {
    fn extract(self, body: &Value) -> Option<(ListSource, Vec<Value>)> {
        match self {
            Strategy::Key(key) => body
                .get(key)
                .and_then(Value::as_array)
                .map(|items| (ListSource::Key(key), items.clone())),
            Strategy::BareArray => body
                .as_array()
                .map(|items| (ListSource::BareArray, items.clone())),
            Strategy::ErrorText => body
                .get("eroare")
                .and_then(Value::as_str)
                .map(|text| (ListSource::UpstreamMessage(text.trim().to_string()), Vec::new())),
        }
    }
}

fn strategies() -> impl Iterator<Item = Strategy> {
    LIST_KEYS
        .into_iter()
        .map(Strategy::Key)
        .chain([Strategy::BareArray, Strategy::ErrorText])
}

/// Extract the message entries from a list response body
pub fn parse_message_list(body: &Value) -> MessageList {
    let (source, entries) = strategies()
        .find_map(|strategy| strategy.extract(body))
        .unwrap_or((ListSource::Unrecognized, Vec::new()));

    let reported_tax_ids = body
        .get("cui")
        .and_then(Value::as_str)
        .map(|cui| {
            cui.split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    MessageList {
        source,
        entries,
        reported_tax_ids,
    }
}

/// One list entry converted to domain values
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEntry {
    pub message_id: MessageId,
    pub direction: Direction,
    pub counterparts: Counterparts,
    pub invoice_date: Option<NaiveDate>,
    pub request_id: Option<String>,
    pub message_type: Option<String>,
}

/// Normalize a list entry for the company identified by `company_tax_id`
///
/// Returns `None` when the entry carries no usable message id.
pub fn normalize_entry(entry: &Value, company_tax_id: &TaxId) -> Option<NormalizedEntry> {
    // Some responses list bare ids
    if let Some(id) = scalar_text(entry) {
        return Some(NormalizedEntry {
            message_id: MessageId::new(id),
            direction: Direction::Received,
            counterparts: Counterparts::default(),
            invoice_date: None,
            request_id: None,
            message_type: None,
        });
    }

    let obj = entry.as_object()?;
    let id = obj
        .get("id")
        .or_else(|| obj.get("ID"))
        .and_then(scalar_text)?;

    let message_type = obj
        .get("tip")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string);

    let details = obj.get("detalii").and_then(Value::as_str).unwrap_or_default();
    let counterparts = Counterparts {
        issuer_tax_id: detail_value(details, "cif_emitent"),
        receiver_tax_id: detail_value(details, "cif_beneficiar"),
        ..Counterparts::default()
    };

    let direction = direction_of(message_type.as_deref(), &counterparts, company_tax_id);

    let invoice_date = obj
        .get("data_creare")
        .and_then(scalar_text)
        .and_then(|raw| parse_creation_date(&raw));

    let request_id = obj.get("id_solicitare").and_then(scalar_text);

    Some(NormalizedEntry {
        message_id: MessageId::new(id),
        direction,
        counterparts,
        invoice_date,
        request_id,
        message_type,
    })
}

fn direction_of(
    message_type: Option<&str>,
    counterparts: &Counterparts,
    company_tax_id: &TaxId,
) -> Direction {
    match message_type.map(str::to_uppercase).as_deref() {
        Some("FACTURA PRIMITA") => Direction::Received,
        Some("FACTURA TRIMISA") => Direction::Issued,
        _ => {
            if counterparts.receiver_tax_id.as_deref() == Some(company_tax_id.as_str()) {
                Direction::Received
            } else {
                Direction::Issued
            }
        }
    }
}

/// Non-empty string or number rendered as text
fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Digits following `key=` in a `detalii` sentence
fn detail_value(details: &str, key: &str) -> Option<String> {
    let needle = format!("{key}=");
    let start = details.find(&needle)? + needle.len();
    let digits: String = details[start..]
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    Some(digits).filter(|d| !d.is_empty())
}

/// `data_creare` is `YYYYMMDDHHmm`; only the date part is kept
fn parse_creation_date(raw: &str) -> Option<NaiveDate> {
    let date = raw.get(..8)?;
    NaiveDate::parse_from_str(date, "%Y%m%d").ok()
}
