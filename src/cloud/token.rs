//! OAuth2 access-token lifecycle.
//!
//! Holds the cached access token for the device's robot account and
//! refreshes it through the token endpoint. Concurrent callers coalesce on
//! a single in-flight refresh: the cache lives behind an async mutex, so
//! whoever holds the lock refreshes and everyone else awaits the result.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::cloud::client::{self, CONTENT_TYPE_FORM};
use crate::cloud::encoding::web_params_encode;
use crate::error::{domain, Error, Result};
use crate::providers::{HttpRequest, Method, Transport};
use crate::settings::Config;

/// Refresh when the token is within this margin of expiry.
pub const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// OAuth scope requested for all device tokens.
pub const CLOUD_SCOPE: &str = "https://www.googleapis.com/auth/clouddevices";

/// Error codes from the token endpoint that mean the stored credentials
/// (or the client registration) are no good and retrying is pointless.
const CREDENTIALS_REJECTED_CODES: &[&str] = &[
    "invalid_grant",
    "invalid_client",
    "unauthorized_client",
    "access_denied",
    "invalid_request",
    "unsupported_grant_type",
];

/// How a refresh failure should be treated by the session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshFailure {
    /// Stored credentials were rejected; stop retrying.
    CredentialsRejected,
    /// Transient; retry with backoff.
    Transient,
}

/// Classify a refresh error per the OAuth `error` field. Unknown codes and
/// all transport-level failures are treated as transient.
pub fn classify_refresh_error(error: &Error) -> RefreshFailure {
    if error.domain() == domain::OAUTH2
        && CREDENTIALS_REJECTED_CODES.contains(&error.code())
    {
        return RefreshFailure::CredentialsRejected;
    }
    RefreshFailure::Transient
}

/// Result of an authorization-code exchange during registration.
#[derive(Debug, Clone)]
pub struct AuthCodeGrant {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: SystemTime,
}

struct CachedToken {
    access_token: String,
    expires_at: SystemTime,
}

pub struct TokenManager {
    config: Arc<Config>,
    transport: Arc<dyn Transport>,
    cache: Mutex<Option<CachedToken>>,
}

impl TokenManager {
    pub fn new(config: Arc<Config>, transport: Arc<dyn Transport>) -> Self {
        TokenManager {
            config,
            transport,
            cache: Mutex::new(None),
        }
    }

    /// Whether a refresh token is available at all.
    pub fn have_credentials(&self) -> bool {
        !self.config.settings().refresh_token.is_empty()
    }

    /// Wall-clock expiry of the cached token, if one is cached.
    pub async fn expires_at(&self) -> Option<SystemTime> {
        self.cache.lock().await.as_ref().map(|t| t.expires_at)
    }

    /// Drop the cached token (used on reset and on 401 from the cloud).
    pub async fn invalidate(&self) {
        *self.cache.lock().await = None;
    }

    /// Return a valid access token, refreshing when the cached one is
    /// absent or within [`EXPIRY_MARGIN`] of expiry.
    pub async fn access_token(&self) -> Result<String> {
        let mut cache = self.cache.lock().await;
        if let Some(token) = cache.as_ref() {
            if SystemTime::now() + EXPIRY_MARGIN < token.expires_at {
                return Ok(token.access_token.clone());
            }
        }
        let token = self.refresh(&mut cache).await?;
        Ok(token)
    }

    /// Refresh unconditionally, coalescing with other callers.
    pub async fn force_refresh(&self) -> Result<String> {
        let mut cache = self.cache.lock().await;
        *cache = None;
        self.refresh(&mut cache).await
    }

    async fn refresh(&self, cache: &mut Option<CachedToken>) -> Result<String> {
        let settings = self.config.settings();
        if settings.refresh_token.is_empty() {
            return Err(Error::new(
                domain::GCD,
                "unauthorized",
                "no refresh token; device is not registered",
            ));
        }

        debug!(target: "cloud", "refreshing access token");
        let body = web_params_encode([
            ("grant_type", "refresh_token"),
            ("refresh_token", settings.refresh_token.as_str()),
            ("client_id", settings.client_id.as_str()),
            ("client_secret", settings.client_secret.as_str()),
        ]);
        let response = self
            .token_endpoint_request(&settings.oauth_url, body)
            .await?;

        let (access_token, expires_at) = parse_token_response(&response)?;
        *cache = Some(CachedToken {
            access_token: access_token.clone(),
            expires_at,
        });
        Ok(access_token)
    }

    /// Exchange the robot-account authorization code from registration
    /// finalize for the initial token pair. Does not touch the cache; the
    /// caller persists the refresh token and reconnects.
    pub async fn exchange_auth_code(&self, auth_code: &str) -> Result<AuthCodeGrant> {
        let settings = self.config.settings();
        let body = web_params_encode([
            ("grant_type", "authorization_code"),
            ("code", auth_code),
            ("client_id", settings.client_id.as_str()),
            ("client_secret", settings.client_secret.as_str()),
            ("redirect_uri", "oob"),
            ("scope", CLOUD_SCOPE),
        ]);
        let response = self
            .token_endpoint_request(&settings.oauth_url, body)
            .await?;

        let (access_token, expires_at) = parse_token_response(&response)?;
        let refresh_token = response
            .get("refresh_token")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::new(
                    domain::OAUTH2,
                    "unexpected_response",
                    "token response lacks refresh_token",
                )
            })?
            .to_string();
        Ok(AuthCodeGrant {
            access_token,
            refresh_token,
            expires_at,
        })
    }

    async fn token_endpoint_request(&self, oauth_url: &str, body: String) -> Result<Value> {
        if oauth_url.is_empty() {
            return Err(Error::new(
                domain::GCD,
                "invalid_config",
                "oauth_url is not configured",
            ));
        }
        let url = format!("{oauth_url}token");
        let request = HttpRequest::new(Method::Post, url)
            .header(client::HEADER_CONTENT_TYPE, CONTENT_TYPE_FORM)
            .body(body.into_bytes());

        let response = self.transport.send(request).await?;
        let json = response.json()?;

        if let Some(code) = json.get("error").and_then(Value::as_str) {
            let message = json
                .get("error_description")
                .and_then(Value::as_str)
                .unwrap_or("token endpoint rejected the request");
            warn!(target: "cloud", code, "oauth token request failed");
            return Err(Error::new(domain::OAUTH2, code.to_string(), message.to_string()));
        }
        if !response.is_success() {
            return Err(Error::new(
                domain::GCD_SERVER,
                response.status.to_string(),
                "token endpoint returned an error status",
            ));
        }
        Ok(json)
    }
}

fn parse_token_response(json: &Value) -> Result<(String, SystemTime)> {
    let access_token = json
        .get("access_token")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| {
            Error::new(
                domain::OAUTH2,
                "unexpected_response",
                "token response lacks access_token",
            )
        })?;
    let expires_in = json
        .get("expires_in")
        .and_then(Value::as_u64)
        .ok_or_else(|| {
            Error::new(
                domain::OAUTH2,
                "unexpected_response",
                "token response lacks expires_in",
            )
        })?;
    Ok((
        access_token.to_string(),
        SystemTime::now() + Duration::from_secs(expires_in),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_table() {
        for code in ["invalid_grant", "invalid_client", "unauthorized_client", "access_denied"] {
            let err = Error::new(domain::OAUTH2, code, "rejected");
            assert_eq!(classify_refresh_error(&err), RefreshFailure::CredentialsRejected);
        }
        for code in ["invalid_request", "unsupported_grant_type"] {
            let err = Error::new(domain::OAUTH2, code, "programmer error");
            assert_eq!(classify_refresh_error(&err), RefreshFailure::CredentialsRejected);
        }

        let unknown = Error::new(domain::OAUTH2, "unable_to_authenticate", "odd");
        assert_eq!(classify_refresh_error(&unknown), RefreshFailure::Transient);
        let network = Error::new(domain::NETWORK, "send_failed", "down");
        assert_eq!(classify_refresh_error(&network), RefreshFailure::Transient);
        let timeout = Error::new(domain::BUFFET, "deadline_exceeded", "slow");
        assert_eq!(classify_refresh_error(&timeout), RefreshFailure::Transient);
    }

    #[test]
    fn test_parse_token_response() {
        let json = serde_json::json!({"access_token": "AT", "expires_in": 3600});
        let (token, expires_at) = parse_token_response(&json).unwrap();
        assert_eq!(token, "AT");
        let remaining = expires_at
            .duration_since(SystemTime::now())
            .unwrap_or_default();
        assert!(remaining > Duration::from_secs(3590));
        assert!(remaining <= Duration::from_secs(3600));

        let missing = serde_json::json!({"expires_in": 3600});
        assert!(parse_token_response(&missing)
            .unwrap_err()
            .has_error(domain::OAUTH2, "unexpected_response"));
    }
}
