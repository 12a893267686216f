//! System-wide OAuth client registration

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::AnafResult;
use crate::vault::SecretVault;

/// The application's registration with the ANAF OAuth server
///
/// One per installation, managed by an administrator. Each user obtains their
/// own token with it by authenticating with their qualified certificate.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthConfig {
    pub client_id: String,
    /// Vault ciphertext; open with [`OAuthConfig::client_secret`]
    pub sealed_client_secret: String,
    pub redirect_uri: String,
    pub updated_at: DateTime<Utc>,
}

impl OAuthConfig {
    /// Build a config, sealing the plaintext client secret
    pub fn seal(
        vault: &dyn SecretVault,
        client_id: impl Into<String>,
        client_secret: &str,
        redirect_uri: impl Into<String>,
    ) -> AnafResult<Self> {
        Ok(Self {
            client_id: client_id.into(),
            sealed_client_secret: vault.seal(client_secret)?,
            redirect_uri: redirect_uri.into(),
            updated_at: Utc::now(),
        })
    }

    /// Open the client secret and bundle the client credentials
    pub fn credentials(&self, vault: &dyn SecretVault) -> AnafResult<ClientCredentials> {
        Ok(ClientCredentials {
            client_id: self.client_id.clone(),
            client_secret: vault.open(&self.sealed_client_secret)?,
            redirect_uri: self.redirect_uri.clone(),
        })
    }
}

impl fmt::Debug for OAuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthConfig")
            .field("client_id", &self.client_id)
            .field("redirect_uri", &self.redirect_uri)
            .field("updated_at", &self.updated_at)
            .finish_non_exhaustive()
    }
}

/// Plaintext confidential-client credentials, used per request and dropped
#[derive(Clone)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

impl fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("client_id", &self.client_id)
            .field("redirect_uri", &self.redirect_uri)
            .finish_non_exhaustive()
    }
}
