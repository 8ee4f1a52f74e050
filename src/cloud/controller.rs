//! Registration and session controller.
//!
//! Owns the device's cloud session: drives [`GcdState`], runs the
//! two-phase claim/finalize registration, polls the command queue, and
//! uploads state deltas. The controller exclusively owns the token
//! manager and HTTP client; everything else reaches the cloud through it.
//!
//! Background loops are cancelled by epoch: every spawned loop captures
//! the session epoch at spawn time and exits as soon as the controller
//! bumps it (reset, network loss, disable).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde_json::{json, Map, Value};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::cloud::client::CloudClient;
use crate::cloud::token::{classify_refresh_error, RefreshFailure, TokenManager};
use crate::cloud::{Backoff, GcdState};
use crate::commands::dispatch::CommandDispatcher;
use crate::commands::catalog::CommandCatalog;
use crate::error::{domain, Error, Result};
use crate::privet::AuthScope;
use crate::providers::{DnsSd, Method, Network, Transport};
use crate::settings::Config;
use crate::state::{StateChangeQueue, NOTIFY_DEBOUNCE_MS};

/// DNS-SD service type advertised for local discovery.
pub const DNSSD_SERVICE_TYPE: &str = "_privet._tcp";

/// Progress of a long-running setup step (registration or Wi-Fi).
#[derive(Debug, Clone, PartialEq)]
pub enum SetupState {
    Idle,
    InProgress,
    Success,
    Error(String),
}

impl SetupState {
    /// JSON shape used in `setup/status` sections.
    pub fn to_json(&self) -> Option<Value> {
        match self {
            SetupState::Idle => None,
            SetupState::InProgress => Some(json!({ "status": "inProgress" })),
            SetupState::Success => Some(json!({ "status": "success" })),
            SetupState::Error(message) => Some(json!({
                "status": "error",
                "error": { "code": "setupFailed", "message": message },
            })),
        }
    }
}

struct Discovery {
    dns_sd: Arc<dyn DnsSd>,
    port: u16,
}

pub struct DeviceController {
    config: Arc<Config>,
    client: Arc<CloudClient>,
    catalog: Arc<CommandCatalog>,
    dispatcher: Arc<CommandDispatcher>,
    state_queue: Arc<StateChangeQueue>,
    gcd_state: RwLock<GcdState>,
    registration_setup: RwLock<SetupState>,
    discovery: RwLock<Option<Discovery>>,
    session_epoch: AtomicU64,
    started_at: Instant,
}

impl DeviceController {
    pub fn new(
        config: Arc<Config>,
        transport: Arc<dyn Transport>,
        catalog: Arc<CommandCatalog>,
        state_queue: Arc<StateChangeQueue>,
    ) -> Arc<Self> {
        let tokens = Arc::new(TokenManager::new(config.clone(), transport.clone()));
        let client = Arc::new(CloudClient::new(config.clone(), transport, tokens));
        let dispatcher = Arc::new(CommandDispatcher::new(client.clone()));
        Arc::new(DeviceController {
            config,
            client,
            catalog,
            dispatcher,
            state_queue,
            gcd_state: RwLock::new(GcdState::Unconfigured),
            registration_setup: RwLock::new(SetupState::Idle),
            discovery: RwLock::new(None),
            session_epoch: AtomicU64::new(0),
            started_at: Instant::now(),
        })
    }

    pub fn client(&self) -> &Arc<CloudClient> {
        &self.client
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        self.client.tokens()
    }

    pub fn catalog(&self) -> &Arc<CommandCatalog> {
        &self.catalog
    }

    pub fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.dispatcher
    }

    pub fn state_queue(&self) -> &Arc<StateChangeQueue> {
        &self.state_queue
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn gcd_state(&self) -> GcdState {
        *self.gcd_state.read()
    }

    pub fn registration_setup_state(&self) -> SetupState {
        self.registration_setup.read().clone()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Evaluate loaded settings and begin connecting when credentials are
    /// present.
    pub fn start(self: &Arc<Self>) {
        if self.config.settings().refresh_token.is_empty() {
            self.set_state(GcdState::Unconfigured);
            return;
        }
        self.connect();
    }

    /// Begin (or restart) the session: bumps the epoch, cancelling any
    /// previous loops, and spawns a fresh connect loop.
    pub fn connect(self: &Arc<Self>) {
        self.set_state(GcdState::Connecting);
        let epoch = self.bump_epoch();
        let controller = self.clone();
        tokio::spawn(async move { controller.session_task(epoch).await });
    }

    /// Follow a host network provider: suspend on loss, reconnect with a
    /// fresh backoff on return.
    pub fn attach_network(self: &Arc<Self>, network: Arc<dyn Network>) {
        self.set_network_available(network.is_online());
        let controller = self.clone();
        let mut rx = network.subscribe();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let online = *rx.borrow_and_update();
                controller.set_network_available(online);
            }
        });
    }

    /// Network connectivity callback from the host.
    pub fn set_network_available(self: &Arc<Self>, available: bool) {
        let current = self.gcd_state();
        if !available {
            if !matches!(
                current,
                GcdState::Unconfigured | GcdState::InvalidCredentials | GcdState::Disabled
            ) {
                self.bump_epoch();
                self.set_state(GcdState::Offline);
            }
            return;
        }
        if current == GcdState::Offline {
            self.connect();
        }
    }

    /// Administratively enable or disable the cloud connection.
    pub fn set_enabled(self: &Arc<Self>, enabled: bool) {
        if !enabled {
            if self.gcd_state() != GcdState::Unconfigured {
                self.bump_epoch();
                self.set_state(GcdState::Disabled);
            }
            return;
        }
        if self.gcd_state() == GcdState::Disabled {
            self.start();
        }
    }

    /// Explicit reset back to factory-unregistered. Erases the
    /// registration triple in one transaction and drops the session.
    pub async fn reset(self: &Arc<Self>) -> Result<()> {
        self.bump_epoch();
        self.config
            .update(|s| {
                s.refresh_token.clear();
                s.cloud_id.clear();
                s.robot_account.clear();
            })
            .map_err(Error::from)?;
        self.tokens().invalidate().await;
        *self.registration_setup.write() = SetupState::Idle;
        self.set_state(GcdState::Unconfigured);
        info!(target: "cloud", "device reset to unconfigured");
        Ok(())
    }

    /// Kick off registration in the background (used by `setup/start`).
    pub fn start_registration(self: &Arc<Self>, ticket_id: String) {
        *self.registration_setup.write() = SetupState::InProgress;
        let controller = self.clone();
        tokio::spawn(async move {
            if let Err(err) = controller.register_device(&ticket_id).await {
                warn!(target: "cloud", error = %err, "registration failed");
            }
        });
    }

    /// The two-phase claim/finalize registration protocol plus the token
    /// exchange. Nothing persists until all three steps succeed; then the
    /// registration triple lands in a single transaction.
    pub async fn register_device(self: &Arc<Self>, ticket_id: &str) -> Result<()> {
        *self.registration_setup.write() = SetupState::InProgress;
        match self.register_device_inner(ticket_id).await {
            Ok(()) => {
                *self.registration_setup.write() = SetupState::Success;
                self.connect();
                Ok(())
            }
            Err(err) => {
                *self.registration_setup.write() = SetupState::Error(err.to_string());
                self.set_state(GcdState::Unconfigured);
                Err(err)
            }
        }
    }

    async fn register_device_inner(&self, ticket_id: &str) -> Result<()> {
        let settings = self.config.settings();
        if settings.service_url.is_empty() {
            return Err(Error::new(
                domain::GCD,
                "invalid_config",
                "service_url is not configured",
            ));
        }

        // Step 1: claim the ticket with the device draft.
        let mut draft = Map::new();
        draft.insert("channel".into(), json!({ "supportedType": "pull" }));
        draft.insert("name".into(), Value::String(settings.name.clone()));
        if !settings.description.is_empty() {
            draft.insert(
                "description".into(),
                Value::String(settings.description.clone()),
            );
        }
        if !settings.location.is_empty() {
            draft.insert("location".into(), Value::String(settings.location.clone()));
        }
        draft.insert(
            "modelManifestId".into(),
            Value::String(settings.model_id.clone()),
        );
        draft.insert("commandDefs".into(), self.catalog.get_definitions());
        draft.insert("state".into(), self.state_snapshot_json());

        let body = json!({
            "id": ticket_id,
            "oauthClientId": settings.client_id,
            "deviceDraft": Value::Object(draft),
        });
        let ticket_url = self.client.service_url(
            &format!("registrationTickets/{ticket_id}"),
            &[("key", settings.api_key.as_str())],
        );
        let claimed = self
            .client
            .request(Method::Patch, &ticket_url, Some(&body))
            .await
            .map_err(|e| registration_error("ticket claim failed", e))?;

        let cloud_id = claimed
            .pointer("/deviceDraft/id")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::new(
                    domain::GCD,
                    "unexpected_response",
                    "claim response lacks deviceDraft.id",
                )
            })?
            .to_string();

        // Step 2: finalize.
        let finalize_url = self.client.service_url(
            &format!("registrationTickets/{ticket_id}/finalize"),
            &[("key", settings.api_key.as_str())],
        );
        let finalized = self
            .client
            .request(Method::Post, &finalize_url, None)
            .await
            .map_err(|e| registration_error("ticket finalize failed", e))?;

        let robot_account = finalized
            .get("robotAccountEmail")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::new(
                    domain::GCD,
                    "unexpected_response",
                    "finalize response lacks robotAccountEmail",
                )
            })?
            .to_string();
        let auth_code = finalized
            .get("robotAccountAuthorizationCode")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::new(
                    domain::GCD,
                    "unexpected_response",
                    "finalize response lacks robotAccountAuthorizationCode",
                )
            })?;

        // Step 3: exchange the robot account auth code.
        let grant = self.tokens().exchange_auth_code(auth_code).await?;

        // Persist the registration triple atomically.
        self.config
            .update(|s| {
                s.cloud_id = cloud_id.clone();
                s.refresh_token = grant.refresh_token.clone();
                s.robot_account = robot_account.clone();
            })
            .map_err(Error::from)?;

        info!(target: "cloud", cloud_id = %cloud_id, "device registered");
        Ok(())
    }

    /// Fetch the device resource from the cloud.
    pub async fn get_device_info(&self) -> Result<Value> {
        if self.config.settings().cloud_id.is_empty() {
            return Err(Error::new(
                domain::GCD,
                "device_not_registered",
                "no cloud id; device is not registered",
            ));
        }
        let url = self.client.device_url("", &[]);
        self.client.authorized_request(Method::Get, &url, None).await
    }

    /// Advertise the device over DNS-SD and keep the TXT records fresh.
    pub fn set_discovery(self: &Arc<Self>, dns_sd: Arc<dyn DnsSd>, port: u16) {
        if !self.config.settings().local_discovery_enabled {
            return;
        }
        dns_sd.publish(DNSSD_SERVICE_TYPE, port, &self.discovery_txt());
        *self.discovery.write() = Some(Discovery { dns_sd, port });
    }

    fn discovery_txt(&self) -> HashMap<String, String> {
        let settings = self.config.settings();
        let mut txt = HashMap::new();
        txt.insert("id".to_string(), settings.cloud_id.clone());
        txt.insert("model_id".to_string(), settings.model_id.clone());
        txt.insert("name".to_string(), settings.name.clone());
        txt.insert("gcd_state".to_string(), self.gcd_state().as_str().to_string());
        txt
    }

    fn set_state(&self, to: GcdState) {
        let mut state = self.gcd_state.write();
        if *state == to {
            return;
        }
        // Only an explicit reset (which goes to unconfigured) leaves the
        // invalid-credentials state.
        if *state == GcdState::InvalidCredentials && to != GcdState::Unconfigured {
            warn!(target: "cloud", to = %to, "ignoring transition out of invalid_credentials");
            return;
        }
        info!(target: "cloud", from = %state, to = %to, "gcd state change");
        *state = to;
        drop(state);

        if let Some(discovery) = self.discovery.read().as_ref() {
            discovery.dns_sd.update(&self.discovery_txt());
        }
    }

    fn bump_epoch(&self) -> u64 {
        self.session_epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn epoch_stale(&self, epoch: u64) -> bool {
        self.session_epoch.load(Ordering::SeqCst) != epoch
    }

    async fn session_task(self: Arc<Self>, epoch: u64) {
        let mut backoff = Backoff::new();
        loop {
            if self.epoch_stale(epoch) {
                return;
            }
            match self.tokens().access_token().await {
                Ok(_) => break,
                Err(err) => match classify_refresh_error(&err) {
                    RefreshFailure::CredentialsRejected => {
                        warn!(target: "cloud", error = %err, "credentials rejected");
                        self.set_state(GcdState::InvalidCredentials);
                        return;
                    }
                    RefreshFailure::Transient => {
                        debug!(target: "cloud", error = %err, "token refresh failed, backing off");
                        sleep(backoff.next_delay()).await;
                    }
                },
            }
        }
        if self.epoch_stale(epoch) {
            return;
        }
        self.set_state(GcdState::Connected);

        let poller = self.clone();
        tokio::spawn(async move { poller.poll_loop(epoch).await });
        let uploader = self.clone();
        tokio::spawn(async move { uploader.state_upload_loop(epoch).await });
        let refresher = self.clone();
        tokio::spawn(async move { refresher.token_refresh_loop(epoch).await });
    }

    /// Long-poll the command queue while connected.
    async fn poll_loop(self: Arc<Self>, epoch: u64) {
        let mut backoff = Backoff::new();
        loop {
            if self.epoch_stale(epoch) {
                return;
            }
            let settings = self.config.settings();
            let url = self.client.device_url(
                "commands/queue",
                &[("deviceId", settings.cloud_id.as_str())],
            );
            match self
                .client
                .authorized_request(Method::Get, &url, None)
                .await
            {
                Ok(response) => {
                    backoff.reset();
                    if let Some(commands) = response.get("commands").and_then(Value::as_array) {
                        self.publish_commands(commands);
                    }
                }
                Err(err) => {
                    if self.handle_session_error(&err) {
                        return;
                    }
                    sleep(backoff.next_delay()).await;
                }
            }
        }
    }

    /// Materialize cloud commands: validate, dispatch, acknowledge.
    pub fn publish_commands(self: &Arc<Self>, commands: &[Value]) {
        for command in commands {
            let Some(id) = command.get("id").and_then(Value::as_str) else {
                warn!(target: "commands", "dropping cloud command without id");
                continue;
            };
            if self.dispatcher.find(id).is_some() {
                continue;
            }
            let name = command.get("name").and_then(Value::as_str).unwrap_or("");
            let parameters = command
                .get("parameters")
                .cloned()
                .unwrap_or_else(|| json!({}));

            match self
                .catalog
                .validate_instance(name, &parameters, AuthScope::Owner)
            {
                Ok(definition) => {
                    let instance =
                        self.dispatcher
                            .create_cloud_instance(id, definition, parameters);
                    if self.dispatcher.dispatch(&instance) {
                        if let Err(err) = instance.start() {
                            warn!(target: "commands", id, error = %err, "failed to acknowledge command");
                        }
                    } else {
                        let err = Error::new(
                            domain::GCD,
                            "unknown_command",
                            format!("no handler registered for '{name}'"),
                        );
                        let _ = instance.fail(&err);
                    }
                }
                Err(err) => {
                    warn!(target: "commands", id, name, error = %err, "rejecting cloud command");
                    self.reject_command(id, &err);
                }
            }
        }
    }

    /// Report a validation failure for a command we never materialized.
    fn reject_command(self: &Arc<Self>, id: &str, error: &Error) {
        let body = json!({
            "state": "error",
            "error": { "code": error.code(), "message": error.message() },
        });
        let client = self.client.clone();
        let url = client.service_url(&format!("commands/{id}"), &[]);
        tokio::spawn(async move {
            if let Err(err) = client.authorized_request(Method::Patch, &url, Some(&body)).await {
                warn!(target: "commands", error = %err, "failed to report command rejection");
            }
        });
    }

    /// Debounced state uploader with an acknowledge watermark. At most one
    /// upload is in flight; changes made during an upload queue behind it.
    async fn state_upload_loop(self: Arc<Self>, epoch: u64) {
        let mut rx = self.state_queue.subscribe();
        let mut backoff = Backoff::new();
        loop {
            if self.epoch_stale(epoch) {
                return;
            }
            let changes = self.state_queue.get_since(0);
            if changes.is_empty() {
                if rx.changed().await.is_err() {
                    return;
                }
                sleep(Duration::from_millis(NOTIFY_DEBOUNCE_MS)).await;
                continue;
            }

            let watermark = changes.last().map(|c| c.id).unwrap_or(0);
            let patches: Vec<Value> = changes
                .iter()
                .map(|c| {
                    let mut patch = Map::new();
                    patch.insert(c.property.clone(), c.value.clone());
                    json!({ "timeMs": c.timestamp_ms, "patch": patch })
                })
                .collect();
            let body = json!({
                "requestTimeMs": now_ms(),
                "patches": patches,
            });
            let url = self.client.device_url("patchState", &[]);
            match self
                .client
                .authorized_request(Method::Post, &url, Some(&body))
                .await
            {
                Ok(_) => {
                    self.state_queue.clear_up_to(watermark);
                    backoff.reset();
                    sleep(Duration::from_millis(NOTIFY_DEBOUNCE_MS)).await;
                }
                Err(err) if is_client_rejection(&err) => {
                    // State is idempotent; a future upload carries the
                    // current values.
                    warn!(target: "cloud", error = %err, "state upload rejected, dropping batch");
                    self.state_queue.clear_up_to(watermark);
                    backoff.reset();
                }
                Err(err) => {
                    if self.handle_session_error(&err) {
                        return;
                    }
                    sleep(backoff.next_delay()).await;
                }
            }
        }
    }

    /// Proactively refresh shortly before expiry.
    async fn token_refresh_loop(self: Arc<Self>, epoch: u64) {
        loop {
            if self.epoch_stale(epoch) {
                return;
            }
            let delay = match self.tokens().expires_at().await {
                Some(expires_at) => expires_at
                    .duration_since(SystemTime::now())
                    .unwrap_or_default()
                    .saturating_sub(Duration::from_secs(60)),
                None => Duration::from_secs(60),
            };
            sleep(delay.max(Duration::from_secs(1))).await;
            if self.epoch_stale(epoch) {
                return;
            }
            if let Err(err) = self.tokens().access_token().await {
                if self.handle_session_error(&err) {
                    return;
                }
            }
        }
    }

    /// Shared failure policy for the connected loops. Returns true when
    /// the loop should stop.
    fn handle_session_error(&self, error: &Error) -> bool {
        match classify_refresh_error(error) {
            RefreshFailure::CredentialsRejected => {
                warn!(target: "cloud", error = %error, "credentials rejected during session");
                self.bump_epoch();
                self.set_state(GcdState::InvalidCredentials);
                true
            }
            RefreshFailure::Transient => false,
        }
    }

    fn state_snapshot_json(&self) -> Value {
        let mut out = Map::new();
        for (property, value) in self.state_queue.snapshot() {
            out.insert(property, value);
        }
        Value::Object(out)
    }
}

fn registration_error(message: &str, cause: Error) -> Error {
    if cause.domain() == domain::GCD {
        return cause;
    }
    Error::wrap(domain::GCD, "registration_failed", message, cause)
}

/// 4xx cloud responses other than auth failures.
fn is_client_rejection(error: &Error) -> bool {
    if error.domain() != domain::GCD_SERVER {
        return false;
    }
    matches!(error.code().parse::<u16>(), Ok(status) if (400..500).contains(&status) && status != 401)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_state_json() {
        assert_eq!(SetupState::Idle.to_json(), None);
        assert_eq!(
            SetupState::InProgress.to_json().unwrap(),
            json!({"status": "inProgress"})
        );
        let error = SetupState::Error("claim failed".into()).to_json().unwrap();
        assert_eq!(error["status"], "error");
        assert_eq!(error["error"]["code"], "setupFailed");
    }

    #[test]
    fn test_client_rejection_classification() {
        assert!(is_client_rejection(&Error::new(domain::GCD_SERVER, "400", "bad")));
        assert!(!is_client_rejection(&Error::new(domain::GCD_SERVER, "401", "auth")));
        assert!(!is_client_rejection(&Error::new(domain::GCD_SERVER, "500", "oops")));
        assert!(!is_client_rejection(&Error::new(domain::NETWORK, "send_failed", "down")));
    }
}
