//! Collaborator interfaces consumed by the agent.
//!
//! The agent core is embedded as a library; the host supplies transport,
//! storage, and radio integrations through these traits. Production hosts
//! get a ready-made [`ReqwestTransport`]; everything else is host-specific.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{domain, Error, Result};
use crate::settings::Settings;

/// Default timeout applied to individual cloud requests.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP method subset used against the cloud service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Patch,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Patch => "PATCH",
        }
    }
}

/// An outbound HTTP request handed to the transport.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub timeout: Duration,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        HttpRequest {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    /// Returns the value of a header, case-insensitively.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A completed HTTP exchange.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Parse the body as JSON; the cloud always replies `application/json`.
    pub fn json(&self) -> Result<serde_json::Value> {
        if !self.content_type.starts_with("application/json") {
            return Err(Error::new(
                domain::NETWORK,
                "unexpected_content_type",
                format!("expected application/json, got {}", self.content_type),
            ));
        }
        serde_json::from_slice(&self.body).map_err(|e| {
            Error::new(
                domain::NETWORK,
                "malformed_response",
                format!("response is not valid JSON: {e}"),
            )
        })
    }
}

/// HTTP client provider. Implementations perform I/O off the agent's task
/// context and resolve the future with the final response.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// Persistent key-value store holding the single settings document.
pub trait ConfigStore: Send + Sync {
    /// Fill in compiled-in / host-provisioned defaults.
    fn load_defaults(&self, settings: &mut Settings);

    /// Load the persisted settings document, if any.
    fn load_settings(&self) -> Option<String>;

    /// Atomically replace the persisted settings document.
    fn save_settings(&self, document: &str) -> Result<()>;
}

/// Network connectivity provider. Hosts publish connection changes into
/// the watch channel; the agent reacts by suspending or resuming its
/// cloud session.
pub trait Network: Send + Sync {
    fn is_online(&self) -> bool;
    fn subscribe(&self) -> tokio::sync::watch::Receiver<bool>;
}

/// Wi-Fi bootstrap radio control.
#[async_trait]
pub trait Wifi: Send + Sync {
    async fn connect(&self, ssid: &str, passphrase: &str) -> Result<()>;
    async fn start_access_point(&self, ssid: &str) -> Result<()>;
    async fn stop_access_point(&self) -> Result<()>;
}

/// DNS-SD advertisement. Payload formatting is the host's concern; the
/// agent only hands over the TXT map.
pub trait DnsSd: Send + Sync {
    fn publish(&self, service_type: &str, port: u16, txt: &HashMap<String, String>);
    fn update(&self, txt: &HashMap<String, String>);
}

/// In-memory config store. Used by hosts that keep settings elsewhere and
/// by tests; `fail_save` makes the next save fail to exercise rollback.
#[derive(Default)]
pub struct MemoryConfigStore {
    pub defaults: parking_lot::Mutex<Settings>,
    pub document: parking_lot::Mutex<Option<String>>,
    pub fail_save: parking_lot::Mutex<bool>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults(defaults: Settings) -> Self {
        let store = Self::default();
        *store.defaults.lock() = defaults;
        store
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load_defaults(&self, settings: &mut Settings) {
        *settings = self.defaults.lock().clone();
    }

    fn load_settings(&self) -> Option<String> {
        self.document.lock().clone()
    }

    fn save_settings(&self, document: &str) -> Result<()> {
        if *self.fail_save.lock() {
            return Err(Error::new(domain::BUFFET, "io_error", "save rejected"));
        }
        *self.document.lock() = Some(document.to_string());
        Ok(())
    }
}

/// Production transport backed by reqwest.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        ReqwestTransport {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Patch => reqwest::Method::PATCH,
        };

        let mut builder = self
            .client
            .request(method, &request.url)
            .timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::new(domain::BUFFET, "deadline_exceeded", "request timed out")
            } else {
                Error::new(domain::NETWORK, "send_failed", e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::new(domain::NETWORK, "read_failed", e.to_string()))?
            .to_vec();

        Ok(HttpResponse {
            status,
            content_type,
            body,
        })
    }
}
