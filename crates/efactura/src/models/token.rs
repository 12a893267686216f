//! OAuth token held per user

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::anaf::api::TokenResponse;

/// Identifier of an account holder (database primary key)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for UserId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Lifetime assumed when the token endpoint omits `expires_in`
pub const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

/// A user's ANAF access/refresh token pair, in plaintext
///
/// Only ever lives in memory; persisted as a [`SealedToken`].
#[derive(Clone, PartialEq)]
pub struct Token {
    pub user_id: UserId,
    pub access_token: String,
    /// ANAF normally returns one, but the grant doesn't guarantee it
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub scope: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Token {
    /// Build a token from a token endpoint response received at `now`
    pub fn from_response(user_id: UserId, response: &TokenResponse, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            access_token: response.access_token.clone(),
            refresh_token: response.refresh_token.clone(),
            expires_at: expiry_from(response.expires_in, now),
            scope: response.scope.clone(),
            updated_at: now,
        }
    }

    /// Apply a refresh response in place
    ///
    /// The previous refresh token is kept when the response doesn't rotate it.
    pub fn apply_refresh(&mut self, response: &TokenResponse, now: DateTime<Utc>) {
        self.access_token = response.access_token.clone();
        if let Some(refresh) = &response.refresh_token {
            self.refresh_token = Some(refresh.clone());
        }
        if response.scope.is_some() {
            self.scope = response.scope.clone();
        }
        self.expires_at = expiry_from(response.expires_in, now);
        self.updated_at = now;
    }

    /// Usable without refreshing: `now < expires_at - margin`
    pub fn is_fresh(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        now < self.expires_at - margin
    }

    /// Whether the token is past its hard expiry
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("user_id", &self.user_id)
            .field("access_token", &format_args!("<{} chars>", self.access_token.len()))
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

fn expiry_from(expires_in: Option<u64>, now: DateTime<Utc>) -> DateTime<Utc> {
    let secs = expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS).min(i64::MAX as u64) as i64;
    now + Duration::seconds(secs)
}

/// Persisted form of [`Token`]: token values are vault ciphertext
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct SealedToken {
    pub user_id: UserId,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub scope: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl fmt::Debug for SealedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SealedToken")
            .field("user_id", &self.user_id)
            .field("expires_at", &self.expires_at)
            .field("updated_at", &self.updated_at)
            .finish_non_exhaustive()
    }
}
