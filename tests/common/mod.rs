//! Shared test fixtures: a scripted HTTP transport and settings helpers.
#![allow(dead_code)]

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use weft::error::{domain, Error, Result};
use weft::providers::{HttpRequest, HttpResponse, Transport};
use weft::settings::Settings;

pub const SERVICE_URL: &str = "http://gcd.server.com/";
pub const OAUTH_URL: &str = "http://oauth.server.com/";
pub const API_KEY: &str = "GOadRdTf9FERf0k4w6EFOof56fUJ3kFDdFL3d7f";
pub const CLIENT_ID: &str = "123543821385-sfjkjshdkjhfk234sdfsdfkskdfkjh7f.apps.googleusercontent.com";
pub const CLIENT_SECRET: &str = "5sdGdGlfolGlrFKfdFlgP6FG";
pub const DEVICE_ID: &str = "4a7ea2d1-b331-1e1f-b206-e863c7635196";
pub const CLAIM_TICKET_ID: &str = "RTcUE";
pub const ACCESS_TOKEN: &str = "ya29.1.AADtN_V-dLUM-sVZ0qVjG9Dxm5Ngd";
pub const REFRESH_TOKEN: &str = "1/zQmxR6PKNvhcxf9SjXUrCjcmCrcqRKXctc6cp1nI-GQ";
pub const ROBOT_ACCOUNT_EMAIL: &str =
    "6ed0b3f54f9bd619b942f4ad2441c252@clouddevices.gserviceaccount.com";
pub const ROBOT_ACCOUNT_AUTH_CODE: &str =
    "4/Mf_ujEhPejVhOq-OxW9F5cSOnWzx.YgciVjTYGscRshQV0ieZDAqiTIjMigI";

/// Host-provisioned defaults, matching a typical appliance manifest.
pub fn default_settings() -> Settings {
    Settings {
        client_id: CLIENT_ID.to_string(),
        client_secret: CLIENT_SECRET.to_string(),
        api_key: API_KEY.to_string(),
        oauth_url: OAUTH_URL.to_string(),
        service_url: SERVICE_URL.to_string(),
        oem_name: "Coffee Pot Maker".to_string(),
        model_name: "Pot v1".to_string(),
        model_id: "AAAAA".to_string(),
        name: "Coffee Pot".to_string(),
        description: "Easy to clean".to_string(),
        location: "Kitchen".to_string(),
        local_discovery_enabled: true,
        local_pairing_enabled: true,
        ..Settings::default()
    }
}

/// Scripted transport: responses are queued per `(method, url)` pair and
/// every request is recorded for assertions.
#[derive(Default)]
pub struct MockTransport {
    responses: Mutex<HashMap<(String, String), VecDeque<HttpResponse>>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a JSON response for the next request to `url`.
    pub fn expect_json(&self, method: &str, url: &str, status: u16, body: Value) {
        self.responses
            .lock()
            .entry((method.to_string(), url.to_string()))
            .or_default()
            .push_back(HttpResponse {
                status,
                content_type: "application/json; charset=utf-8".to_string(),
                body: body.to_string().into_bytes(),
            });
    }

    /// All requests observed so far.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    /// Requests to a given URL.
    pub fn requests_to(&self, url: &str) -> Vec<HttpRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.url == url)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let key = (request.method.as_str().to_string(), request.url.clone());
        self.requests.lock().push(request);
        let response = self.responses.lock().get_mut(&key).and_then(|q| q.pop_front());
        response.ok_or_else(|| {
            Error::new(
                domain::NETWORK,
                "send_failed",
                format!("no scripted response for {} {}", key.0, key.1),
            )
        })
    }
}

/// Poll until `check` passes or the timeout elapses.
pub async fn wait_for<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
