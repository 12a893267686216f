//! Invoice details read from downloaded bundles
//!
//! The download endpoint answers with a zip holding the UBL invoice
//! (`{id}.xml`) next to the authority's signature (`semnatura_{id}.xml`).
//! Details are read from the unsigned invoice only.

use log::{debug, warn};
use std::io::{Cursor, Read};

use crate::models::{Amount, BundleFormat, InvoiceDetails, PartyDetails};

/// Archive entries are not inflated past this size
const MAX_XML_BYTES: u64 = 16 * 1024 * 1024;

/// Elements holding the invoice total, in order of preference
const AMOUNT_ELEMENTS: [&str; 2] = ["TaxInclusiveAmount", "PayableAmount"];

/// Details of the invoice inside a bundle of the given format
///
/// Unreadable archives and documents yield empty details; the bundle itself
/// is still stored.
pub fn bundle_details(bytes: &[u8], format: BundleFormat) -> InvoiceDetails {
    match format {
        BundleFormat::Xml => extract_details(bytes),
        BundleFormat::Zip => match unsigned_invoice_xml(bytes) {
            Ok(Some(xml)) => extract_details(&xml),
            Ok(None) => {
                debug!("Bundle archive holds no unsigned invoice XML");
                InvoiceDetails::default()
            }
            Err(e) => {
                warn!("Unreadable bundle archive: {}", e);
                InvoiceDetails::default()
            }
        },
        BundleFormat::Binary => InvoiceDetails::default(),
    }
}

/// Bytes of the first unsigned `.xml` entry of a bundle archive
pub fn unsigned_invoice_xml(archive: &[u8]) -> zip::result::ZipResult<Option<Vec<u8>>> {
    let mut archive = zip::ZipArchive::new(Cursor::new(archive))?;

    for index in 0..archive.len() {
        let entry = archive.by_index(index)?;
        if !entry.is_file() || !is_unsigned_xml(entry.name()) {
            continue;
        }
        let mut xml = Vec::new();
        entry.take(MAX_XML_BYTES).read_to_end(&mut xml)?;
        return Ok(Some(xml));
    }
    Ok(None)
}

fn is_unsigned_xml(path: &str) -> bool {
    let file_name = path.rsplit('/').next().unwrap_or(path).to_ascii_lowercase();
    file_name.ends_with(".xml") && !file_name.starts_with("semnatura")
}

/// Total, currency and both parties of a UBL invoice document
pub fn extract_details(xml: &[u8]) -> InvoiceDetails {
    let Ok(text) = std::str::from_utf8(xml) else {
        return InvoiceDetails::default();
    };

    InvoiceDetails {
        amount: extract_amount(text),
        issuer: party(text, "AccountingSupplierParty"),
        receiver: party(text, "AccountingCustomerParty"),
    }
}

/// Only looks inside `LegalMonetaryTotal` when the document has one
fn extract_amount(text: &str) -> Option<Amount> {
    let scope = element_body(text, "LegalMonetaryTotal").unwrap_or(text);

    AMOUNT_ELEMENTS.iter().find_map(|name| {
        let el = find_element(scope, name)?;
        let value = el.text.trim();
        let is_decimal = !value.is_empty()
            && value
                .chars()
                .all(|c| c.is_ascii_digit() || c == '.' || c == '-');
        is_decimal.then(|| Amount {
            value: value.to_string(),
            currency: attribute(el.attrs, "currencyID"),
        })
    })
}

/// Registration name (or trading name) and fiscal code of one party
fn party(text: &str, role: &str) -> PartyDetails {
    let Some(scope) = element_body(text, role) else {
        return PartyDetails::default();
    };

    PartyDetails {
        name: nested_text(scope, "PartyLegalEntity", "RegistrationName")
            .or_else(|| nested_text(scope, "PartyName", "Name")),
        tax_id: nested_text(scope, "PartyTaxScheme", "CompanyID")
            .or_else(|| nested_text(scope, "PartyLegalEntity", "CompanyID")),
    }
}

fn nested_text(scope: &str, outer: &str, inner: &str) -> Option<String> {
    let body = element_body(scope, outer)?;
    let value = unescape(find_element(body, inner)?.text.trim());
    Some(value).filter(|v| !v.is_empty())
}

struct Element<'a> {
    start: usize,
    attrs: &'a str,
    text: &'a str,
}

/// First start tag whose local name is `local`, ignoring namespace prefixes
fn find_element<'a>(xml: &'a str, local: &str) -> Option<Element<'a>> {
    xml.match_indices('<').find_map(|(start, _)| {
        let rest = &xml[start + 1..];
        let name_len = rest
            .find(|c: char| c.is_whitespace() || c == '>' || c == '/')
            .unwrap_or(rest.len());
        let name = &rest[..name_len];
        if name.starts_with(['/', '?', '!']) || name.rsplit(':').next() != Some(local) {
            return None;
        }

        let tag_end = rest.find('>')?;
        let attrs = &rest[name_len..tag_end];
        let body = &rest[tag_end + 1..];
        let text = if attrs.ends_with('/') {
            ""
        } else {
            &body[..body.find('<').unwrap_or(body.len())]
        };
        Some(Element { start, attrs, text })
    })
}

/// Everything between the first `local` start tag and its end tag
fn element_body<'a>(xml: &'a str, local: &str) -> Option<&'a str> {
    let el = find_element(xml, local)?;
    if el.attrs.ends_with('/') {
        return Some("");
    }

    let open_end = el.start + xml[el.start..].find('>')? + 1;
    let rest = &xml[open_end..];
    let close = rest.match_indices("</").find_map(|(at, _)| {
        let tail = &rest[at + 2..];
        let name = tail[..tail.find('>')?].trim();
        (name.rsplit(':').next() == Some(local)).then_some(at)
    })?;
    Some(&rest[..close])
}

fn attribute(attrs: &str, name: &str) -> Option<String> {
    let needle = format!("{name}=");
    let start = attrs.find(&needle)? + needle.len();
    let rest = &attrs[start..];
    let quote = rest.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let value = &rest[1..];
    let end = value.find(quote)?;
    Some(value[..end].trim().to_string()).filter(|v| !v.is_empty())
}

fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    const INVOICE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Invoice xmlns="urn:oasis:names:specification:ubl:schema:xsd:Invoice-2"
    xmlns:cac="urn:oasis:names:specification:ubl:schema:xsd:CommonAggregateComponents-2"
    xmlns:cbc="urn:oasis:names:specification:ubl:schema:xsd:CommonBasicComponents-2">
  <cbc:ID>DIM-0042</cbc:ID>
  <cac:AccountingSupplierParty>
    <cac:Party>
      <cac:PartyName><cbc:Name>Dimitrie Trade</cbc:Name></cac:PartyName>
      <cac:PartyTaxScheme>
        <cbc:CompanyID>RO32640679</cbc:CompanyID>
        <cac:TaxScheme><cbc:ID>VAT</cbc:ID></cac:TaxScheme>
      </cac:PartyTaxScheme>
      <cac:PartyLegalEntity>
        <cbc:RegistrationName>Dimitrie Trade &amp; Co SRL</cbc:RegistrationName>
        <cbc:CompanyID>J40/1234/2015</cbc:CompanyID>
      </cac:PartyLegalEntity>
    </cac:Party>
  </cac:AccountingSupplierParty>
  <cac:AccountingCustomerParty>
    <cac:Party>
      <cac:PartyName><cbc:Name>Dante Impex</cbc:Name></cac:PartyName>
      <cac:PartyLegalEntity>
        <cbc:CompanyID>14399840</cbc:CompanyID>
      </cac:PartyLegalEntity>
    </cac:Party>
  </cac:AccountingCustomerParty>
  <cac:InvoiceLine>
    <cbc:LineExtensionAmount currencyID="RON">100.00</cbc:LineExtensionAmount>
  </cac:InvoiceLine>
  <cac:LegalMonetaryTotal>
    <cbc:LineExtensionAmount currencyID="RON">336.13</cbc:LineExtensionAmount>
    <cbc:TaxInclusiveAmount currencyID="RON">400.00</cbc:TaxInclusiveAmount>
    <cbc:PayableAmount currencyID="RON">400.00</cbc:PayableAmount>
  </cac:LegalMonetaryTotal>
</Invoice>"#;

    const SIGNATURE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Signature xmlns="http://www.w3.org/2000/09/xmldsig#">
  <LegalMonetaryTotal><TaxInclusiveAmount currencyID="EUR">1.00</TaxInclusiveAmount></LegalMonetaryTotal>
</Signature>"#;

    fn archive(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, body) in entries {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(body.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_extract_details() {
        let details = extract_details(INVOICE.as_bytes());

        let amount = details.amount.unwrap();
        assert_eq!(amount.value, "400.00");
        assert_eq!(amount.currency.as_deref(), Some("RON"));

        assert_eq!(details.issuer.name.as_deref(), Some("Dimitrie Trade & Co SRL"));
        assert_eq!(details.issuer.tax_id.as_deref(), Some("RO32640679"));
        // No legal name: falls back to the trading name
        assert_eq!(details.receiver.name.as_deref(), Some("Dante Impex"));
        assert_eq!(details.receiver.tax_id.as_deref(), Some("14399840"));
    }

    #[test]
    fn test_payable_amount_fallback() {
        let xml = b"<Invoice><PayableAmount currencyID='EUR'>12.5</PayableAmount></Invoice>";
        let amount = extract_details(xml).amount.unwrap();
        assert_eq!(amount.value, "12.5");
        assert_eq!(amount.currency.as_deref(), Some("EUR"));
    }

    #[test]
    fn test_missing_details() {
        assert_eq!(
            extract_details(b"<Invoice><cbc:ID>1</cbc:ID></Invoice>"),
            InvoiceDetails::default()
        );
        assert!(
            extract_details(b"<Invoice><PayableAmount>n/a</PayableAmount></Invoice>")
                .amount
                .is_none()
        );
        assert_eq!(extract_details(&[0xff, 0xfe, 0x00]), InvoiceDetails::default());
    }

    #[test]
    fn test_zip_bundle_skips_signature() {
        let bytes = archive(&[
            ("semnatura_3001.xml", SIGNATURE),
            ("3001.xml", INVOICE),
        ]);
        assert_eq!(BundleFormat::detect(&bytes), BundleFormat::Zip);

        let xml = unsigned_invoice_xml(&bytes).unwrap().unwrap();
        assert_eq!(xml, INVOICE.as_bytes());

        let details = bundle_details(&bytes, BundleFormat::Zip);
        assert_eq!(details.amount.unwrap().value, "400.00");
        assert_eq!(details.receiver.name.as_deref(), Some("Dante Impex"));
    }

    #[test]
    fn test_zip_without_invoice() {
        let bytes = archive(&[("semnatura_3001.xml", SIGNATURE), ("readme.txt", "x")]);
        assert!(unsigned_invoice_xml(&bytes).unwrap().is_none());
        assert_eq!(bundle_details(&bytes, BundleFormat::Zip), InvoiceDetails::default());

        // Zip magic followed by garbage
        let broken = b"PK\x03\x04not really an archive";
        assert!(unsigned_invoice_xml(broken).is_err());
        assert_eq!(bundle_details(broken, BundleFormat::Zip), InvoiceDetails::default());
    }

    #[test]
    fn test_unsigned_entry_names() {
        assert!(is_unsigned_xml("3001.xml"));
        assert!(is_unsigned_xml("out/3001.XML"));
        assert!(!is_unsigned_xml("semnatura_3001.xml"));
        assert!(!is_unsigned_xml("dir/Semnatura_3001.xml"));
        assert!(!is_unsigned_xml("3001.pdf"));
    }
}
