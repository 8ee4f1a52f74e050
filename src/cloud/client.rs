//! Authenticated JSON client for the cloud service.
//!
//! Builds service/device/OAuth URLs from the configured bases and speaks
//! JSON-over-HTTP with bearer injection. A 401 triggers exactly one
//! in-place token refresh and retry; a second 401 fails the request.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::cloud::encoding::web_params_encode;
use crate::cloud::token::TokenManager;
use crate::error::{domain, Error, Result};
use crate::providers::{HttpRequest, HttpResponse, Method, Transport};
use crate::settings::Config;

pub const HEADER_AUTHORIZATION: &str = "Authorization";
pub const HEADER_CONTENT_TYPE: &str = "Content-Type";
pub const CONTENT_TYPE_JSON_UTF8: &str = "application/json; charset=utf-8";
pub const CONTENT_TYPE_FORM: &str = "application/x-www-form-urlencoded";

pub struct CloudClient {
    config: Arc<Config>,
    transport: Arc<dyn Transport>,
    tokens: Arc<TokenManager>,
}

impl CloudClient {
    pub fn new(
        config: Arc<Config>,
        transport: Arc<dyn Transport>,
        tokens: Arc<TokenManager>,
    ) -> Self {
        CloudClient {
            config,
            transport,
            tokens,
        }
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    /// Service URL: `{service_url}{subpath}?{params}`.
    pub fn service_url(&self, subpath: &str, params: &[(&str, &str)]) -> String {
        build_url(&self.config.settings().service_url, subpath, params)
    }

    /// URL of the registered device's resource tree:
    /// `{service_url}devices/{cloud_id}/{subpath}?{params}`.
    pub fn device_url(&self, subpath: &str, params: &[(&str, &str)]) -> String {
        let settings = self.config.settings();
        let base = build_url(&settings.service_url, "devices/", &[]);
        let device_base = if subpath.is_empty() {
            format!("{}{}", base, settings.cloud_id)
        } else {
            format!("{}{}/", base, settings.cloud_id)
        };
        build_url(&device_base, subpath, params)
    }

    /// OAuth URL: `{oauth_url}{subpath}?{params}`.
    pub fn oauth_url(&self, subpath: &str, params: &[(&str, &str)]) -> String {
        build_url(&self.config.settings().oauth_url, subpath, params)
    }

    /// Unauthenticated JSON exchange (registration endpoints authenticate
    /// with the API key in the query string instead).
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<Value> {
        self.ensure_configured()?;
        let response = self.send_json(method, url, None, body).await?;
        decode_response(response)
    }

    /// Authenticated JSON exchange with the one-retry 401 rule.
    pub async fn authorized_request(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<Value> {
        self.ensure_configured()?;

        let token = self.tokens.access_token().await?;
        let response = self.send_json(method, url, Some(&token), body).await?;
        if response.status != 401 {
            return decode_response(response);
        }

        debug!(target: "cloud", url, "401 from cloud, refreshing token and retrying");
        let token = self.tokens.force_refresh().await?;
        let response = self.send_json(method, url, Some(&token), body).await?;
        if response.status == 401 {
            return Err(Error::wrap(
                domain::GCD,
                "unauthorized",
                "request rejected after token refresh",
                server_error(&response),
            ));
        }
        decode_response(response)
    }

    fn ensure_configured(&self) -> Result<()> {
        if self.config.settings().service_url.is_empty() {
            return Err(Error::new(
                domain::GCD,
                "invalid_config",
                "service_url is not configured",
            ));
        }
        Ok(())
    }

    async fn send_json(
        &self,
        method: Method,
        url: &str,
        token: Option<&str>,
        body: Option<&Value>,
    ) -> Result<HttpResponse> {
        let mut request = HttpRequest::new(method, url)
            .header(HEADER_CONTENT_TYPE, CONTENT_TYPE_JSON_UTF8);
        if let Some(token) = token {
            request = request.header(HEADER_AUTHORIZATION, format!("Bearer {token}"));
        }
        if let Some(body) = body {
            request = request.body(serde_json::to_vec(body).map_err(|e| {
                Error::new(domain::BUFFET, "serialize_failed", e.to_string())
            })?);
        }
        self.transport.send(request).await
    }
}

fn build_url(base: &str, subpath: &str, params: &[(&str, &str)]) -> String {
    let mut url = format!("{base}{subpath}");
    if !params.is_empty() {
        url.push('?');
        url.push_str(&web_params_encode(params.iter().copied()));
    }
    url
}

fn decode_response(response: HttpResponse) -> Result<Value> {
    if response.is_success() {
        if response.body.is_empty() {
            return Ok(Value::Object(serde_json::Map::new()));
        }
        return response.json();
    }
    Err(server_error(&response))
}

/// Decode a cloud error body into the `gcd_server` domain. The code is the
/// server-supplied `error.code` when present, else the HTTP status.
fn server_error(response: &HttpResponse) -> Error {
    let body = response.json().ok();
    let error_obj = body.as_ref().and_then(|v| v.get("error"));
    let code = error_obj
        .and_then(|e| e.get("code"))
        .map(|c| match c {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_else(|| response.status.to_string());
    let message = error_obj
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .unwrap_or("cloud request failed")
        .to_string();
    Error::new(domain::GCD_SERVER, code, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_url_appends_params_in_order() {
        let url = build_url(
            "http://gcd.server.com/",
            "registrationTickets",
            &[("key", "K"), ("restart", "true")],
        );
        assert_eq!(url, "http://gcd.server.com/registrationTickets?key=K&restart=true");
    }

    #[test]
    fn test_build_url_without_params() {
        assert_eq!(
            build_url("http://gcd.server.com/", "", &[]),
            "http://gcd.server.com/"
        );
    }

    #[test]
    fn test_server_error_prefers_server_code() {
        let response = HttpResponse {
            status: 404,
            content_type: "application/json".to_string(),
            body: br#"{"error":{"code":"resource_missing","message":"no such device"}}"#.to_vec(),
        };
        let err = server_error(&response);
        assert!(err.has_error(domain::GCD_SERVER, "resource_missing"));
        assert_eq!(err.message(), "no such device");

        let response = HttpResponse {
            status: 503,
            content_type: "text/plain".to_string(),
            body: b"overloaded".to_vec(),
        };
        let err = server_error(&response);
        assert!(err.has_error(domain::GCD_SERVER, "503"));
    }
}
