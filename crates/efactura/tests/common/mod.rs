//! Shared fixtures for the integration tests: a scripted upstream and a
//! service wired to in-memory storage.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io::{Cursor, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use efactura::anaf::api::TokenResponse;
use efactura::{
    AesGcmVault, AnafError, AnafResult, AnafSettings, BlobStore, ClientCredentials, Company,
    CompanyId, EfacturaService, InMemoryBlobStore, InMemoryInvoiceStore, InvoiceStore,
    MessageId, TaxId, Token, Upstream, UserId,
};
use serde_json::{Value, json};

pub const USER: UserId = UserId(1);
pub const COMPANY: CompanyId = CompanyId(10);
pub const TAX_ID: &str = "14399840";
pub const SUPPLIER_TAX_ID: &str = "32640679";

/// Blocks list calls until opened, and reports when a caller is waiting
#[derive(Default)]
pub struct Gate {
    state: Mutex<(bool, bool)>, // (entered, open)
    cv: Condvar,
}

impl Gate {
    fn pass(&self) {
        let mut state = self.state.lock().unwrap();
        state.0 = true;
        self.cv.notify_all();
        while !state.1 {
            state = self.cv.wait(state).unwrap();
        }
    }

    pub fn wait_entered(&self) {
        let mut state = self.state.lock().unwrap();
        while !state.0 {
            state = self.cv.wait(state).unwrap();
        }
    }

    pub fn open(&self) {
        self.state.lock().unwrap().1 = true;
        self.cv.notify_all();
    }
}

/// Upstream whose answers are scripted by the test
#[derive(Default)]
pub struct FakeUpstream {
    /// Answers consumed one per list call; `list_default` once empty
    list_script: Mutex<VecDeque<AnafResult<Value>>>,
    list_default: Mutex<Option<Value>>,
    list_gate: Mutex<Option<Arc<Gate>>>,
    documents: Mutex<HashMap<String, Vec<u8>>>,
    download_error: Mutex<Option<AnafError>>,
    refresh_error: Mutex<Option<AnafError>>,
    revoke_error: Mutex<Option<AnafError>>,
    refresh_delay: Mutex<Duration>,
    /// `expires_in` handed out by the code exchange
    initial_expires_in: Mutex<Option<u64>>,

    pub exchange_calls: AtomicUsize,
    pub refresh_calls: AtomicUsize,
    pub revoke_calls: AtomicUsize,
    pub list_calls: AtomicUsize,
    pub download_calls: AtomicUsize,
    /// (access token, zile) of every list call
    pub list_requests: Mutex<Vec<(String, u32)>>,
    pub revoked_tokens: Mutex<Vec<String>>,
}

impl FakeUpstream {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script_list(&self, response: AnafResult<Value>) {
        self.list_script.lock().unwrap().push_back(response);
    }

    pub fn set_list(&self, body: Value) {
        *self.list_default.lock().unwrap() = Some(body);
    }

    pub fn gate_list(&self) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        *self.list_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn put_document(&self, id: &str, bytes: &[u8]) {
        self.documents
            .lock()
            .unwrap()
            .insert(id.to_string(), bytes.to_vec());
    }

    pub fn fail_downloads(&self, err: Option<AnafError>) {
        *self.download_error.lock().unwrap() = err;
    }

    pub fn fail_refresh(&self, err: Option<AnafError>) {
        *self.refresh_error.lock().unwrap() = err;
    }

    pub fn fail_revoke(&self, err: Option<AnafError>) {
        *self.revoke_error.lock().unwrap() = err;
    }

    pub fn slow_refresh(&self, delay: Duration) {
        *self.refresh_delay.lock().unwrap() = delay;
    }

    pub fn issue_expires_in(&self, secs: u64) {
        *self.initial_expires_in.lock().unwrap() = Some(secs);
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

impl Upstream for FakeUpstream {
    fn exchange_code(&self, _: &ClientCredentials, code: &str) -> AnafResult<TokenResponse> {
        self.exchange_calls.fetch_add(1, Ordering::SeqCst);
        Ok(TokenResponse {
            access_token: format!("access-{code}"),
            refresh_token: Some(format!("refresh-{code}")),
            expires_in: Some(self.initial_expires_in.lock().unwrap().unwrap_or(7_776_000)),
            token_type: Some("Bearer".into()),
            scope: None,
        })
    }

    fn refresh_token(&self, _: &ClientCredentials, refresh: &str) -> AnafResult<TokenResponse> {
        let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = *self.refresh_delay.lock().unwrap();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if let Some(err) = self.refresh_error.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(TokenResponse {
            access_token: format!("access-r{n}"),
            refresh_token: Some(format!("{refresh}+")),
            expires_in: Some(3600),
            token_type: Some("Bearer".into()),
            scope: None,
        })
    }

    fn revoke_token(&self, _: &ClientCredentials, token: &str) -> AnafResult<()> {
        self.revoke_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.revoke_error.lock().unwrap().clone() {
            return Err(err);
        }
        self.revoked_tokens.lock().unwrap().push(token.to_string());
        Ok(())
    }

    fn list_messages(&self, access_token: &str, _: &TaxId, days: u32) -> AnafResult<Value> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.list_requests
            .lock()
            .unwrap()
            .push((access_token.to_string(), days));

        let gate = self.list_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.pass();
        }

        if let Some(scripted) = self.list_script.lock().unwrap().pop_front() {
            return scripted;
        }
        Ok(self
            .list_default
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| json!({ "listaMesajeFactura": [] })))
    }

    fn download(&self, _: &str, message_id: &MessageId) -> AnafResult<Vec<u8>> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.download_error.lock().unwrap().clone() {
            return Err(err);
        }
        self.documents
            .lock()
            .unwrap()
            .get(message_id.as_str())
            .cloned()
            .ok_or_else(|| AnafError::UnexpectedResponse {
                status: 404,
                detail: format!("no document {message_id}"),
            })
    }
}

/// A received invoice list entry, as the list endpoint reports it
pub fn entry(id: &str) -> Value {
    json!({
        "data_creare": "202511281030",
        "cif": TAX_ID,
        "id_solicitare": format!("56{id}"),
        "detalii": format!(
            "Factura cu id_incarcare=56{id} emisa de cif_emitent={SUPPLIER_TAX_ID} pentru cif_beneficiar={TAX_ID}"
        ),
        "tip": "FACTURA PRIMITA",
        "id": id
    })
}

/// UBL invoice XML used as the bundle of message `id`
pub fn invoice_xml(id: &str) -> Vec<u8> {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<Invoice xmlns="urn:oasis:names:specification:ubl:schema:xsd:Invoice-2">
  <cbc:ID>INV-{id}</cbc:ID>
  <cac:AccountingSupplierParty>
    <cac:Party>
      <cac:PartyTaxScheme><cbc:CompanyID>RO{SUPPLIER_TAX_ID}</cbc:CompanyID></cac:PartyTaxScheme>
      <cac:PartyLegalEntity><cbc:RegistrationName>FURNIZOR SRL</cbc:RegistrationName></cac:PartyLegalEntity>
    </cac:Party>
  </cac:AccountingSupplierParty>
  <cac:AccountingCustomerParty>
    <cac:Party>
      <cac:PartyTaxScheme><cbc:CompanyID>RO{TAX_ID}</cbc:CompanyID></cac:PartyTaxScheme>
      <cac:PartyLegalEntity><cbc:RegistrationName>CLIENT &amp; FIU SRL</cbc:RegistrationName></cac:PartyLegalEntity>
    </cac:Party>
  </cac:AccountingCustomerParty>
  <cac:LegalMonetaryTotal>
    <cbc:TaxExclusiveAmount currencyID="RON">100.00</cbc:TaxExclusiveAmount>
    <cbc:TaxInclusiveAmount currencyID="RON">119.00</cbc:TaxInclusiveAmount>
    <cbc:PayableAmount currencyID="RON">119.00</cbc:PayableAmount>
  </cac:LegalMonetaryTotal>
</Invoice>"#
    )
    .into_bytes()
}

/// A zip bundle as upstream serves it: the invoice next to its signature
pub fn zip_bundle(id: &str) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    writer.start_file(format!("{id}.xml"), options).unwrap();
    writer.write_all(&invoice_xml(id)).unwrap();
    writer.start_file(format!("semnatura_{id}.xml"), options).unwrap();
    writer.write_all(b"<Signature/>").unwrap();
    writer.finish().unwrap().into_inner()
}

/// Settings with millisecond backoff so failures don't stall later calls
pub fn test_settings() -> AnafSettings {
    let mut settings = AnafSettings::default();
    settings.backoff.base_delay_ms = 1;
    settings.list_wait_secs = 2;
    settings
}

/// Service over in-memory storage and a [`FakeUpstream`]
pub struct Harness {
    pub service: Arc<EfacturaService>,
    pub upstream: Arc<FakeUpstream>,
    pub store: Arc<dyn InvoiceStore>,
    pub blobs: Arc<dyn BlobStore>,
}

impl Harness {
    /// OAuth configured and one company registered; the user isn't connected
    pub fn new() -> Self {
        Self::with_storage(
            Arc::new(InMemoryInvoiceStore::new()),
            Arc::new(InMemoryBlobStore::new()),
            test_settings(),
        )
    }

    pub fn with_storage(
        store: Arc<dyn InvoiceStore>,
        blobs: Arc<dyn BlobStore>,
        settings: AnafSettings,
    ) -> Self {
        let upstream = FakeUpstream::new();
        let service = EfacturaService::new(
            Arc::clone(&store),
            Arc::clone(&blobs),
            Arc::new(AesGcmVault::from_passphrase("integration-tests")),
            Arc::clone(&upstream) as Arc<dyn Upstream>,
            settings,
        );
        service
            .configure_oauth("client-id", "client-secret", "https://app.example/anaf/callback")
            .unwrap();
        service
            .save_company(Company::new(COMPANY, USER, format!("RO{TAX_ID}"), "Dante Impex SRL"))
            .unwrap();

        Self {
            service: Arc::new(service),
            upstream,
            store,
            blobs,
        }
    }

    /// Harness whose user has completed authorization
    pub fn connected() -> Self {
        let harness = Self::new();
        harness.connect();
        harness
    }

    pub fn connect(&self) -> Token {
        let request = self.service.initiate_authorization(USER).unwrap();
        self.service
            .complete_authorization("code", &request.state, USER)
            .unwrap()
    }

    /// Serve `ids` from the list endpoint under `key`, each with an XML bundle
    pub fn publish(&self, key: &str, ids: &[&str]) {
        let entries: Vec<Value> = ids.iter().map(|id| entry(id)).collect();
        self.upstream.set_list(json!({
            key: entries,
            "serial": "1234AA456",
            "cui": TAX_ID,
            "titlu": "Lista Mesaje disponibile din ultimele 60 zile"
        }));
        for id in ids {
            self.upstream.put_document(id, &invoice_xml(id));
        }
    }
}
