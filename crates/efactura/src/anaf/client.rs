//! HTTP implementation of [`Upstream`]
//!
//! Uses synchronous HTTP (ureq) to be executor-agnostic. Status codes are not
//! turned into errors by the agent; every response is classified here.

use base64::Engine as _;
use log::{debug, warn};
use std::time::Duration;
use ureq::http::Response;

use super::Upstream;
use super::api::{OAuthErrorBody, TokenResponse};
use crate::config::AnafSettings;
use crate::error::{AnafError, AnafResult};
use crate::models::{ClientCredentials, MessageId, TaxId};
use crate::ratelimit::EndpointClass;

/// Bundles larger than this are refused
const MAX_BUNDLE_BYTES: u64 = 64 * 1024 * 1024;

/// Upstream client backed by a shared ureq agent
pub struct HttpUpstream {
    agent: ureq::Agent,
    settings: AnafSettings,
}

impl HttpUpstream {
    pub fn new(settings: AnafSettings) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(settings.request_timeout()))
            .http_status_as_error(false)
            .build();

        Self {
            agent: ureq::Agent::new_with_config(config),
            settings,
        }
    }

    /// POST a form to the token endpoint with HTTP Basic client authentication
    fn token_request(
        &self,
        client: &ClientCredentials,
        form: &[(&str, &str)],
    ) -> AnafResult<TokenResponse> {
        let mut response = self
            .agent
            .post(&self.settings.token_url)
            .header("Authorization", &basic_auth(client))
            .header("Accept", "application/json")
            .send_form(form.iter().copied())
            .map_err(transport_error)?;

        let status = response.status().as_u16();
        if (200..300).contains(&status) {
            return response.body_mut().read_json::<TokenResponse>().map_err(|e| {
                AnafError::UnexpectedResponse {
                    status,
                    detail: format!("unparseable token response: {e}"),
                }
            });
        }

        match status {
            429 => Err(rate_limited(EndpointClass::Token, &response)),
            500..=599 => Err(AnafError::UpstreamUnavailable(format!(
                "token endpoint returned HTTP {status}"
            ))),
            _ => {
                let body = response.body_mut().read_to_string().unwrap_or_default();
                match serde_json::from_str::<OAuthErrorBody>(&body) {
                    Ok(err) => Err(AnafError::OAuthRejected {
                        error: err.error,
                        description: err.error_description,
                    }),
                    Err(_) => Err(AnafError::UnexpectedResponse {
                        status,
                        detail: truncate(&body, 200),
                    }),
                }
            }
        }
    }

    fn api_get(
        &self,
        class: EndpointClass,
        url: &url::Url,
        access_token: &str,
    ) -> AnafResult<Response<ureq::Body>> {
        debug!("GET {} ({})", url.path(), class);
        let response = self
            .agent
            .get(url.as_str())
            .header("Authorization", &format!("Bearer {}", access_token))
            .call()
            .map_err(transport_error)?;

        classify_status(class, response)
    }

    fn api_url(&self, path: &str, params: &[(&str, &str)]) -> AnafResult<url::Url> {
        let base = format!("{}/{}", self.settings.api_base_url, path);
        url::Url::parse_with_params(&base, params).map_err(|e| AnafError::UnexpectedResponse {
            status: 0,
            detail: format!("invalid API URL {base}: {e}"),
        })
    }
}

impl Upstream for HttpUpstream {
    fn exchange_code(&self, client: &ClientCredentials, code: &str) -> AnafResult<TokenResponse> {
        self.token_request(
            client,
            &[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", client.redirect_uri.as_str()),
                ("token_content_type", "jwt"),
            ],
        )
    }

    fn refresh_token(
        &self,
        client: &ClientCredentials,
        refresh_token: &str,
    ) -> AnafResult<TokenResponse> {
        self.token_request(
            client,
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("token_content_type", "jwt"),
            ],
        )
    }

    fn revoke_token(&self, client: &ClientCredentials, token: &str) -> AnafResult<()> {
        let Some(revoke_url) = &self.settings.revoke_url else {
            return Ok(());
        };

        let response = self
            .agent
            .post(revoke_url)
            .header("Authorization", &basic_auth(client))
            .send_form(revoke_form(token))
            .map_err(transport_error)?;

        classify_status(EndpointClass::Revoke, response).map(|_| ())
    }

    fn list_messages(
        &self,
        access_token: &str,
        tax_id: &TaxId,
        days: u32,
    ) -> AnafResult<serde_json::Value> {
        let days = days.to_string();
        let url = self.api_url(
            "listaMesajeFactura",
            &[("zile", days.as_str()), ("cif", tax_id.as_str())],
        )?;
        let mut response = self.api_get(EndpointClass::ListMessages, &url, access_token)?;

        let body = response
            .body_mut()
            .read_to_string()
            .map_err(|e| AnafError::UpstreamUnavailable(format!("failed to read list response: {e}")))?;

        serde_json::from_str(&body).map_err(|_| {
            warn!("List endpoint returned a non-JSON body ({} bytes)", body.len());
            AnafError::UpstreamUnavailable(format!(
                "list endpoint returned a non-JSON body: {}",
                truncate(&body, 120)
            ))
        })
    }

    fn download(&self, access_token: &str, message_id: &MessageId) -> AnafResult<Vec<u8>> {
        let url = self.api_url("descarcare", &[("id", message_id.as_str())])?;
        let mut response = self.api_get(EndpointClass::Download, &url, access_token)?;

        response
            .body_mut()
            .with_config()
            .limit(MAX_BUNDLE_BYTES)
            .read_to_vec()
            .map_err(|e| AnafError::UpstreamUnavailable(format!("failed to read bundle {message_id}: {e}")))
    }
}

/// Map a REST response status onto the error taxonomy
fn classify_status(
    class: EndpointClass,
    mut response: Response<ureq::Body>,
) -> AnafResult<Response<ureq::Body>> {
    let status = response.status().as_u16();
    match status {
        200..=299 => Ok(response),
        401 => Err(AnafError::TokenExpired),
        403 => Err(AnafError::TokenRejected),
        429 => Err(rate_limited(class, &response)),
        500..=599 => Err(AnafError::UpstreamUnavailable(format!(
            "{class} endpoint returned HTTP {status}"
        ))),
        _ => {
            let body = response.body_mut().read_to_string().unwrap_or_default();
            Err(AnafError::UnexpectedResponse {
                status,
                detail: truncate(&body, 200),
            })
        }
    }
}

fn rate_limited(class: EndpointClass, response: &Response<ureq::Body>) -> AnafError {
    let retry_after = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or_default();

    AnafError::RateLimited {
        endpoint: class,
        retry_after,
    }
}

fn transport_error(err: ureq::Error) -> AnafError {
    match err {
        ureq::Error::Timeout(_) => AnafError::UpstreamUnavailable("request timed out".to_string()),
        other => AnafError::UpstreamUnavailable(other.to_string()),
    }
}

/// Revocation body; the client authenticates through the Basic header only
fn revoke_form(token: &str) -> [(&'static str, &str); 1] {
    [("token", token)]
}

/// `Basic base64(urlencode(id):urlencode(secret))` as in RFC 6749 section 2.3.1
fn basic_auth(client: &ClientCredentials) -> String {
    let pair = format!(
        "{}:{}",
        urlencoding::encode(&client.client_id),
        urlencoding::encode(&client.client_secret)
    );
    format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD.encode(pair)
    )
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(id: &str, secret: &str) -> ClientCredentials {
        ClientCredentials {
            client_id: id.to_string(),
            client_secret: secret.to_string(),
            redirect_uri: "https://app.example/callback".to_string(),
        }
    }

    #[test]
    fn test_basic_auth_header() {
        let header = basic_auth(&creds("abc", "def"));
        assert_eq!(header, "Basic YWJjOmRlZg==");
    }

    #[test]
    fn test_basic_auth_encodes_reserved_chars() {
        let header = basic_auth(&creds("id", "a:b"));
        let encoded = header.strip_prefix("Basic ").unwrap();
        let decoded = base64::engine::general_purpose::STANDARD.decode(encoded).unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), "id:a%3Ab");
    }

    #[test]
    fn test_revoke_form_carries_no_client_credentials() {
        let form = revoke_form("refresh-token");
        assert_eq!(form, [("token", "refresh-token")]);
        assert!(form.iter().all(|(key, _)| !key.starts_with("client_")));
    }

    #[test]
    fn test_api_url_encodes_params() {
        let upstream = HttpUpstream::new(AnafSettings::default());
        let url = upstream
            .api_url("listaMesajeFactura", &[("zile", "60"), ("cif", "14399840")])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.anaf.ro/prod/FCTEL/rest/listaMesajeFactura?zile=60&cif=14399840"
        );
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdef", 3), "abc...");
        assert_eq!(truncate("ăîșțâ", 2), "ăî...");
    }
}
