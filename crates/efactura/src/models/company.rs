//! Taxpayer entities whose invoices are synchronized

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::UserId;
use crate::error::AnafError;

/// Company identifier (database primary key)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CompanyId(pub i64);

impl fmt::Display for CompanyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for CompanyId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Romanian fiscal code (CIF/CUI), digits only, without the `RO` VAT prefix
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaxId(String);

impl TaxId {
    /// Weights applied right-aligned to the digits preceding the control digit
    const CONTROL_KEY: [u32; 9] = [7, 5, 3, 2, 1, 7, 5, 3, 2];

    /// Parse and validate a fiscal code
    ///
    /// Accepts surrounding whitespace and an optional `RO` prefix. The code must
    /// be 2-10 digits without a leading zero and carry a valid control digit.
    pub fn parse(raw: &str) -> Result<Self, AnafError> {
        let trimmed = raw.trim();
        let digits = trimmed
            .strip_prefix("RO")
            .or_else(|| trimmed.strip_prefix("ro"))
            .or_else(|| trimmed.strip_prefix("Ro"))
            .unwrap_or(trimmed)
            .trim();

        let invalid = || AnafError::InvalidTaxId(raw.to_string());

        if !(2..=10).contains(&digits.len())
            || !digits.bytes().all(|b| b.is_ascii_digit())
            || digits.starts_with('0')
        {
            return Err(invalid());
        }

        let values: Vec<u32> = digits.bytes().map(|b| u32::from(b - b'0')).collect();
        let (body, control) = values.split_at(values.len() - 1);
        let offset = Self::CONTROL_KEY.len() - body.len();
        let sum: u32 = body
            .iter()
            .zip(&Self::CONTROL_KEY[offset..])
            .map(|(digit, weight)| digit * weight)
            .sum();
        let expected = (sum * 10 % 11) % 10;

        if expected != control[0] {
            return Err(invalid());
        }

        Ok(Self(digits.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TaxId {
    type Error = AnafError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TaxId> for String {
    fn from(value: TaxId) -> Self {
        value.0
    }
}

/// A taxpayer entity owned by a user
///
/// The tax id is stored as entered; it is validated before every sync
/// attempt rather than at construction so legacy rows can still be listed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Company {
    pub id: CompanyId,
    /// User whose ANAF token is used to query this company
    pub owner: UserId,
    pub tax_id: String,
    pub name: String,
    pub auto_sync: bool,
    /// Minimum hours between background syncs
    pub sync_interval_hours: u32,
    pub created_at: DateTime<Utc>,
}

impl Company {
    pub const DEFAULT_SYNC_INTERVAL_HOURS: u32 = 24;

    pub fn new(
        id: CompanyId,
        owner: UserId,
        tax_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id,
            owner,
            tax_id: tax_id.into(),
            name: name.into(),
            auto_sync: true,
            sync_interval_hours: Self::DEFAULT_SYNC_INTERVAL_HOURS,
            created_at: Utc::now(),
        }
    }

    pub fn with_auto_sync(mut self, auto_sync: bool) -> Self {
        self.auto_sync = auto_sync;
        self
    }

    pub fn with_sync_interval_hours(mut self, hours: u32) -> Self {
        self.sync_interval_hours = hours;
        self
    }

    /// Validated fiscal code; syncs are only scheduled when this succeeds
    pub fn validated_tax_id(&self) -> Result<TaxId, AnafError> {
        TaxId::parse(&self.tax_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_tax_ids() {
        assert_eq!(TaxId::parse("14399840").unwrap().as_str(), "14399840");
        assert_eq!(TaxId::parse("RO32640679").unwrap().as_str(), "32640679");
        assert_eq!(TaxId::parse("  ro 51331025 ").unwrap().as_str(), "51331025");
    }

    #[test]
    fn test_bad_control_digit() {
        assert!(TaxId::parse("14399841").is_err());
        assert!(TaxId::parse("32640678").is_err());
    }

    #[test]
    fn test_bad_format() {
        assert!(TaxId::parse("").is_err());
        assert!(TaxId::parse("1").is_err());
        assert!(TaxId::parse("01439984").is_err());
        assert!(TaxId::parse("12345678901").is_err());
        assert!(TaxId::parse("1439-9840").is_err());
        assert!(TaxId::parse("ABCDEFGH").is_err());
    }

    #[test]
    fn test_company_validation() {
        let ok = Company::new(CompanyId(1), UserId(1), "RO14399840", "Dante");
        assert_eq!(ok.validated_tax_id().unwrap().as_str(), "14399840");

        let bad = Company::new(CompanyId(2), UserId(1), "12345", "Broken");
        assert!(matches!(
            bad.validated_tax_id(),
            Err(AnafError::InvalidTaxId(_))
        ));
    }

    #[test]
    fn test_tax_id_serde_validates() {
        let ok: TaxId = serde_json::from_str("\"32640679\"").unwrap();
        assert_eq!(ok.as_str(), "32640679");
        assert!(serde_json::from_str::<TaxId>("\"32640678\"").is_err());
    }
}
