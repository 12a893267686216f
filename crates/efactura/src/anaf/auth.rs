//! ANAF OAuth2 token lifecycle
//!
//! Implements the authorization code flow against logincert.anaf.ro, keeps one
//! token per user in storage (sealed by the vault) and refreshes it shortly
//! before expiry. Concurrent refreshes for the same user are coalesced.

use base64::Engine as _;
use chrono::Utc;
use log::{debug, info, warn};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use super::{SingleFlight, Upstream};
use crate::config::AnafSettings;
use crate::error::{AnafError, AnafResult};
use crate::models::{ClientCredentials, OAuthConfig, SealedToken, Token, UserId};
use crate::ratelimit::{BackoffController, EndpointClass, WaitPolicy};
use crate::storage::InvoiceStore;
use crate::vault::SecretVault;

/// Authorization URL handed to the user's browser, with its state value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRequest {
    pub url: String,
    pub state: String,
}

/// Parameters ANAF appends to the redirect URI
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorizationCallback {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

impl AuthorizationCallback {
    /// Parse the query string of the callback request (with or without `?`)
    pub fn from_query(query: &str) -> Self {
        let query = query.strip_prefix('?').unwrap_or(query);
        let mut callback = Self::default();
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            let value = Some(value.into_owned()).filter(|v| !v.is_empty());
            match key.as_ref() {
                "code" => callback.code = value,
                "state" => callback.state = value,
                "error" => callback.error = value,
                "error_description" => callback.error_description = value,
                _ => {}
            }
        }
        callback
    }
}

/// Result of the remote half of a disconnect
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteRevocation {
    Revoked,
    /// No revoke endpoint configured, or no usable credentials
    Skipped,
    Failed(String),
}

/// What [`TokenManager::revoke`] did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevokeOutcome {
    /// Whether a local token existed and was deleted
    pub deleted: bool,
    pub remote: RemoteRevocation,
}

struct PendingState {
    user: UserId,
    issued_at: Instant,
}

/// Per-user OAuth token manager
pub struct TokenManager {
    store: Arc<dyn InvoiceStore>,
    vault: Arc<dyn SecretVault>,
    upstream: Arc<dyn Upstream>,
    backoff: Arc<BackoffController>,
    settings: AnafSettings,
    pending: Mutex<HashMap<String, PendingState>>,
    refreshes: SingleFlight<UserId, AnafResult<Token>>,
}

impl TokenManager {
    /// Random bytes in a state value
    const STATE_BYTES: usize = 32;

    pub fn new(
        store: Arc<dyn InvoiceStore>,
        vault: Arc<dyn SecretVault>,
        upstream: Arc<dyn Upstream>,
        backoff: Arc<BackoffController>,
        settings: AnafSettings,
    ) -> Self {
        Self {
            store,
            vault,
            upstream,
            backoff,
            settings,
            pending: Mutex::new(HashMap::new()),
            refreshes: SingleFlight::new(),
        }
    }

    /// Seal and store the OAuth client registration
    pub fn configure_oauth(
        &self,
        client_id: &str,
        client_secret: &str,
        redirect_uri: &str,
    ) -> AnafResult<OAuthConfig> {
        if client_id.trim().is_empty() || client_secret.is_empty() {
            return Err(AnafError::InvalidConfiguration(
                "client id and client secret are required".to_string(),
            ));
        }
        url::Url::parse(redirect_uri).map_err(|e| {
            AnafError::InvalidConfiguration(format!("invalid redirect URI {redirect_uri}: {e}"))
        })?;

        let config = OAuthConfig::seal(
            self.vault.as_ref(),
            client_id.trim(),
            client_secret,
            redirect_uri,
        )?;
        self.store.save_oauth_config(&config)?;
        info!("Stored OAuth client configuration for client {}", config.client_id);
        Ok(config)
    }

    /// Start the authorization code flow for `user`
    pub fn initiate_authorization(&self, user: UserId) -> AnafResult<AuthorizationRequest> {
        let client = self.client_credentials()?;

        let mut bytes = [0u8; Self::STATE_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        let state = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes);

        {
            let ttl = self.settings.authorization_state_ttl();
            let mut pending = self.pending.lock().unwrap();
            pending.retain(|_, p| p.issued_at.elapsed() < ttl);
            pending.insert(
                state.clone(),
                PendingState {
                    user,
                    issued_at: Instant::now(),
                },
            );
        }

        let url = url::Url::parse_with_params(
            &self.settings.authorize_url,
            &[
                ("client_id", client.client_id.as_str()),
                ("response_type", "code"),
                ("redirect_uri", client.redirect_uri.as_str()),
                ("state", state.as_str()),
                ("token_content_type", "jwt"),
            ],
        )
        .map_err(|e| AnafError::InvalidConfiguration(format!("invalid authorize URL: {e}")))?;

        debug!("Issued authorization state for user {}", user);
        Ok(AuthorizationRequest {
            url: url.into(),
            state,
        })
    }

    /// Finish the flow: validate `state`, exchange `code`, store the token
    pub fn complete_authorization(
        &self,
        code: &str,
        state: &str,
        user: UserId,
    ) -> AnafResult<Token> {
        self.consume_state(state, user)?;
        let client = self.client_credentials()?;

        let response = self
            .backoff
            .call(EndpointClass::Token, self.token_wait(), || {
                self.upstream.exchange_code(&client, code)
            })
            .map_err(|err| match err {
                AnafError::OAuthRejected { error, description } if error == "invalid_grant" => {
                    AnafError::Authorization(format!(
                        "authorization code was rejected{}",
                        description.map(|d| format!(": {d}")).unwrap_or_default()
                    ))
                }
                other => other,
            })?;

        let token = Token::from_response(user, &response, Utc::now());
        if token.refresh_token.is_none() {
            warn!("Token endpoint returned no refresh token for user {}", user);
        }
        self.save_token(&token)?;
        info!(
            "User {} connected to ANAF; token valid until {}",
            user, token.expires_at
        );
        Ok(token)
    }

    /// Finish the flow from the raw redirect parameters
    pub fn complete_callback(
        &self,
        callback: &AuthorizationCallback,
        user: UserId,
    ) -> AnafResult<Token> {
        let state = callback
            .state
            .as_deref()
            .ok_or_else(|| AnafError::Authorization("callback carries no state".to_string()))?;

        if let Some(error) = &callback.error {
            // Burn the state so the attempt can't be resumed
            let _ = self.consume_state(state, user);
            warn!("User {} authorization ended with error {}", user, error);
            return Err(AnafError::Authorization(match &callback.error_description {
                Some(description) => format!("{error}: {description}"),
                None => error.clone(),
            }));
        }

        match callback.code.as_deref() {
            Some(code) => self.complete_authorization(code, state, user),
            None => {
                let _ = self.consume_state(state, user);
                Err(AnafError::Authorization(
                    "callback carries no authorization code".to_string(),
                ))
            }
        }
    }

    /// A token usable for at least the safety margin, refreshing if needed
    pub fn get_valid_token(&self, user: UserId) -> AnafResult<Token> {
        let token = self.load_token(user)?.ok_or(AnafError::NotConnected(user))?;
        if token.is_fresh(Utc::now(), self.settings.token_safety_margin()) {
            return Ok(token);
        }
        self.refresh_coalesced(user, None)
    }

    /// Refresh after the API refused `rejected_access_token`
    ///
    /// If another caller already replaced that token, the newer one is
    /// returned without a second refresh.
    pub fn force_refresh(&self, user: UserId, rejected_access_token: &str) -> AnafResult<Token> {
        self.refresh_coalesced(user, Some(rejected_access_token))
    }

    /// Delete the user's token, then revoke it remotely on a best-effort basis
    pub fn revoke(&self, user: UserId) -> AnafResult<RevokeOutcome> {
        let Some(sealed) = self.store.get_token(user)? else {
            return Ok(RevokeOutcome {
                deleted: false,
                remote: RemoteRevocation::Skipped,
            });
        };

        self.store.delete_token(user)?;
        info!("Deleted ANAF token for user {}", user);

        let remote = if self.settings.revoke_url.is_none() {
            RemoteRevocation::Skipped
        } else {
            match self.revoke_remote(&sealed) {
                Ok(()) => RemoteRevocation::Revoked,
                Err(err) => {
                    warn!("Remote revocation for user {} failed: {}", user, err);
                    RemoteRevocation::Failed(err.to_string())
                }
            }
        };

        Ok(RevokeOutcome {
            deleted: true,
            remote,
        })
    }

    /// Whether `user` currently has a stored token
    pub fn has_token(&self, user: UserId) -> AnafResult<bool> {
        Ok(self.store.get_token(user)?.is_some())
    }

    fn revoke_remote(&self, sealed: &SealedToken) -> AnafResult<()> {
        let client = self.client_credentials()?;
        let token = self.open_token(sealed)?;
        let value = token.refresh_token.as_deref().unwrap_or(&token.access_token);
        self.backoff
            .call(EndpointClass::Revoke, WaitPolicy::FailFast, || {
                self.upstream.revoke_token(&client, value)
            })
    }

    fn refresh_coalesced(&self, user: UserId, rejected: Option<&str>) -> AnafResult<Token> {
        self.refreshes.run(&user, || {
            // Re-read inside the flight: a previous flight may already have
            // replaced the token this caller saw
            let current = self.load_token(user)?.ok_or(AnafError::NotConnected(user))?;
            let superseded = match rejected {
                Some(rejected) => current.access_token != rejected,
                None => current.is_fresh(Utc::now(), self.settings.token_safety_margin()),
            };
            if superseded {
                debug!("Token for user {} already refreshed by another caller", user);
                return Ok(current);
            }
            self.refresh_now(current, rejected.is_some())
        })
    }

    fn refresh_now(&self, mut token: Token, rejected: bool) -> AnafResult<Token> {
        let user = token.user_id;
        let now = Utc::now();

        let Some(refresh_token) = token.refresh_token.clone() else {
            if rejected || token.is_expired(now) {
                warn!("Token for user {} expired and cannot be refreshed", user);
                self.store.delete_token(user)?;
                return Err(AnafError::ReauthorizationRequired);
            }
            // Inside the margin but still valid; nothing to refresh with
            return Ok(token);
        };

        let client = self.client_credentials()?;
        let result = self.backoff.call(EndpointClass::Token, self.token_wait(), || {
            self.upstream.refresh_token(&client, &refresh_token)
        });

        match result {
            Ok(response) => {
                token.apply_refresh(&response, Utc::now());
                self.save_token(&token)?;
                info!(
                    "Refreshed ANAF token for user {}; valid until {}",
                    user, token.expires_at
                );
                Ok(token)
            }
            Err(AnafError::OAuthRejected { error, .. }) if error == "invalid_grant" => {
                warn!("Refresh token for user {} was rejected; deleting token", user);
                self.store.delete_token(user)?;
                Err(AnafError::ReauthorizationRequired)
            }
            Err(err) => Err(err),
        }
    }

    fn consume_state(&self, state: &str, user: UserId) -> AnafResult<()> {
        let entry = self.pending.lock().unwrap().remove(state);
        let Some(entry) = entry else {
            return Err(AnafError::Authorization(
                "unknown or already used authorization state".to_string(),
            ));
        };
        if entry.user != user {
            return Err(AnafError::Authorization(
                "authorization state was issued for another user".to_string(),
            ));
        }
        if entry.issued_at.elapsed() >= self.settings.authorization_state_ttl() {
            return Err(AnafError::Authorization(
                "authorization state expired".to_string(),
            ));
        }
        Ok(())
    }

    fn client_credentials(&self) -> AnafResult<ClientCredentials> {
        self.store
            .get_oauth_config()?
            .ok_or(AnafError::NotConfigured)?
            .credentials(self.vault.as_ref())
    }

    fn token_wait(&self) -> WaitPolicy {
        WaitPolicy::WaitUpTo(self.settings.request_timeout())
    }

    fn load_token(&self, user: UserId) -> AnafResult<Option<Token>> {
        self.store
            .get_token(user)?
            .map(|sealed| self.open_token(&sealed))
            .transpose()
    }

    fn save_token(&self, token: &Token) -> AnafResult<()> {
        let sealed = SealedToken {
            user_id: token.user_id,
            access_token: self.vault.seal(&token.access_token)?,
            refresh_token: token
                .refresh_token
                .as_deref()
                .map(|t| self.vault.seal(t))
                .transpose()?,
            expires_at: token.expires_at,
            scope: token.scope.clone(),
            updated_at: token.updated_at,
        };
        self.store.save_token(&sealed)?;
        Ok(())
    }

    fn open_token(&self, sealed: &SealedToken) -> AnafResult<Token> {
        Ok(Token {
            user_id: sealed.user_id,
            access_token: self.vault.open(&sealed.access_token)?,
            refresh_token: sealed
                .refresh_token
                .as_deref()
                .map(|t| self.vault.open(t))
                .transpose()?,
            expires_at: sealed.expires_at,
            scope: sealed.scope.clone(),
            updated_at: sealed.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anaf::api::TokenResponse;
    use crate::models::{MessageId, TaxId};
    use crate::storage::InMemoryInvoiceStore;
    use crate::vault::AesGcmVault;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Upstream that only answers token requests
    #[derive(Default)]
    struct TokenEndpoint {
        refreshes: AtomicUsize,
        refresh_error: Mutex<Option<AnafError>>,
    }

    impl Upstream for TokenEndpoint {
        fn exchange_code(&self, _: &ClientCredentials, code: &str) -> AnafResult<TokenResponse> {
            if code == "bad" {
                return Err(AnafError::OAuthRejected {
                    error: "invalid_grant".into(),
                    description: None,
                });
            }
            Ok(TokenResponse {
                access_token: format!("access-{code}"),
                refresh_token: Some("refresh-1".into()),
                expires_in: None,
                token_type: Some("Bearer".into()),
                scope: None,
            })
        }

        fn refresh_token(&self, _: &ClientCredentials, _: &str) -> AnafResult<TokenResponse> {
            let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(err) = self.refresh_error.lock().unwrap().clone() {
                return Err(err);
            }
            Ok(TokenResponse {
                access_token: format!("access-r{n}"),
                refresh_token: None,
                expires_in: Some(3600),
                token_type: None,
                scope: None,
            })
        }

        fn revoke_token(&self, _: &ClientCredentials, _: &str) -> AnafResult<()> {
            Ok(())
        }

        fn list_messages(&self, _: &str, _: &TaxId, _: u32) -> AnafResult<serde_json::Value> {
            unimplemented!()
        }

        fn download(&self, _: &str, _: &MessageId) -> AnafResult<Vec<u8>> {
            unimplemented!()
        }
    }

    fn manager(upstream: Arc<TokenEndpoint>) -> TokenManager {
        let manager = TokenManager::new(
            Arc::new(InMemoryInvoiceStore::new()),
            Arc::new(AesGcmVault::from_passphrase("auth-tests")),
            upstream,
            Arc::new(BackoffController::default()),
            AnafSettings::default(),
        );
        manager
            .configure_oauth("client-id", "client-secret", "https://app.example/anaf/callback")
            .unwrap();
        manager
    }

    fn connect(manager: &TokenManager, user: UserId) -> Token {
        let request = manager.initiate_authorization(user).unwrap();
        manager.complete_authorization("code", &request.state, user).unwrap()
    }

    #[test]
    fn test_authorization_url() {
        let manager = manager(Arc::new(TokenEndpoint::default()));
        let request = manager.initiate_authorization(UserId(1)).unwrap();

        let url = url::Url::parse(&request.url).unwrap();
        assert_eq!(url.host_str(), Some("logincert.anaf.ro"));
        let params: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(params["client_id"], "client-id");
        assert_eq!(params["response_type"], "code");
        assert_eq!(params["redirect_uri"], "https://app.example/anaf/callback");
        assert_eq!(params["token_content_type"], "jwt");
        assert_eq!(params["state"], request.state);
        assert!(!params.contains_key("scope"));
        // 32 bytes, URL-safe base64 without padding
        assert_eq!(request.state.len(), 43);
    }

    #[test]
    fn test_state_is_single_use() {
        let manager = manager(Arc::new(TokenEndpoint::default()));
        let request = manager.initiate_authorization(UserId(1)).unwrap();

        manager.complete_authorization("code", &request.state, UserId(1)).unwrap();
        let replay = manager.complete_authorization("code", &request.state, UserId(1));
        assert!(matches!(replay, Err(AnafError::Authorization(_))));
    }

    #[test]
    fn test_state_bound_to_user() {
        let manager = manager(Arc::new(TokenEndpoint::default()));
        let request = manager.initiate_authorization(UserId(1)).unwrap();

        let err = manager
            .complete_authorization("code", &request.state, UserId(2))
            .unwrap_err();
        assert!(matches!(err, AnafError::Authorization(_)));
        assert!(!manager.has_token(UserId(2)).unwrap());
    }

    #[test]
    fn test_rejected_code_is_authorization_error() {
        let manager = manager(Arc::new(TokenEndpoint::default()));
        let request = manager.initiate_authorization(UserId(1)).unwrap();
        let err = manager
            .complete_authorization("bad", &request.state, UserId(1))
            .unwrap_err();
        assert!(matches!(err, AnafError::Authorization(_)));
    }

    #[test]
    fn test_callback_with_error_consumes_state() {
        let manager = manager(Arc::new(TokenEndpoint::default()));
        let request = manager.initiate_authorization(UserId(1)).unwrap();

        let denied = AuthorizationCallback::from_query(&format!(
            "?error=access_denied&error_description=User+cancelled&state={}",
            request.state
        ));
        assert_eq!(denied.error_description.as_deref(), Some("User cancelled"));
        let err = manager.complete_callback(&denied, UserId(1)).unwrap_err();
        assert!(err.to_string().contains("access_denied"));

        let retry = AuthorizationCallback::from_query(&format!("code=abc&state={}", request.state));
        assert!(matches!(
            manager.complete_callback(&retry, UserId(1)),
            Err(AnafError::Authorization(_))
        ));
    }

    #[test]
    fn test_fresh_token_is_returned_without_refresh() {
        let upstream = Arc::new(TokenEndpoint::default());
        let manager = manager(Arc::clone(&upstream));
        let connected = connect(&manager, UserId(1));

        let token = manager.get_valid_token(UserId(1)).unwrap();
        assert_eq!(token, connected);
        assert_eq!(upstream.refreshes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_force_refresh_skips_superseded_token() {
        let upstream = Arc::new(TokenEndpoint::default());
        let manager = manager(Arc::clone(&upstream));
        let connected = connect(&manager, UserId(1));

        let refreshed = manager.force_refresh(UserId(1), &connected.access_token).unwrap();
        assert_eq!(refreshed.access_token, "access-r1");
        assert_eq!(refreshed.refresh_token.as_deref(), Some("refresh-1"));

        // A second caller holding the old token gets the new one
        let again = manager.force_refresh(UserId(1), &connected.access_token).unwrap();
        assert_eq!(again.access_token, "access-r1");
        assert_eq!(upstream.refreshes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invalid_grant_deletes_token() {
        let upstream = Arc::new(TokenEndpoint::default());
        let manager = manager(Arc::clone(&upstream));
        let connected = connect(&manager, UserId(1));
        *upstream.refresh_error.lock().unwrap() = Some(AnafError::OAuthRejected {
            error: "invalid_grant".into(),
            description: Some("refresh token expired".into()),
        });

        let err = manager.force_refresh(UserId(1), &connected.access_token).unwrap_err();
        assert!(matches!(err, AnafError::ReauthorizationRequired));
        assert!(!manager.has_token(UserId(1)).unwrap());
        assert!(matches!(
            manager.get_valid_token(UserId(1)),
            Err(AnafError::NotConnected(UserId(1)))
        ));
    }

    #[test]
    fn test_not_configured() {
        let manager = TokenManager::new(
            Arc::new(InMemoryInvoiceStore::new()),
            Arc::new(AesGcmVault::from_passphrase("k")),
            Arc::new(TokenEndpoint::default()),
            Arc::new(BackoffController::default()),
            AnafSettings::default(),
        );
        assert!(matches!(
            manager.initiate_authorization(UserId(1)),
            Err(AnafError::NotConfigured)
        ));
        assert!(matches!(
            manager.configure_oauth("id", "secret", "not a uri"),
            Err(AnafError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_revoke_without_token() {
        let manager = manager(Arc::new(TokenEndpoint::default()));
        let outcome = manager.revoke(UserId(5)).unwrap();
        assert!(!outcome.deleted);
    }
}
