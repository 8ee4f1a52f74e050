//! Local request dispatch: the route table, scope enforcement, and the
//! endpoint handlers behind `/privet/`.
//!
//! The handler is transport-agnostic: it takes a method/path/auth-header/
//! JSON-body tuple and returns a status plus JSON body, so the HTTP
//! adapter stays thin and tests can drive it directly. It holds only weak
//! references to the controller and security manager; requests arriving
//! during teardown answer with an error instead of keeping them alive.

use std::sync::{Arc, Weak};
use std::time::SystemTime;

use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64URL;
use base64::Engine;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use serde_json::{json, Map, Value};
use sha2::Sha256;
use tracing::debug;

use crate::cloud::controller::{DeviceController, SetupState};
use crate::commands::instance::CommandInstance;
use crate::error::{domain, Error, Result};
use crate::privet::{
    privet_error, reason, AuthScope, PrivetResponse, UserInfo,
};
use crate::security::pairing::PairingMode;
use crate::security::{SecurityManager, ACCESS_TOKEN_EXPIRY};
use crate::providers::Wifi;

/// Privet API version advertised in `/privet/info`.
const API_VERSION: &str = "3.0";

/// Token type returned by `/privet/v3/auth`.
const TOKEN_TYPE: &str = "Privet";

const AUTH_TYPE_ANONYMOUS: &str = "anonymous";
const AUTH_TYPE_PAIRING: &str = "pairing";
const SCOPE_AUTO: &str = "auto";

const INVALID_PARAM_FMT: &str = "Invalid parameter";

/// UI device kind by model-manifest-id prefix (first two characters).
const DEVICE_KIND_MAP: &[(&str, &str)] = &[
    ("AC", "accessPoint"),
    ("AK", "aggregator"),
    ("AM", "camera"),
    ("AB", "developmentBoard"),
    ("AE", "printer"),
    ("AF", "scanner"),
    ("AD", "speaker"),
    ("AL", "storage"),
    ("AJ", "toy"),
    ("AA", "vendor"),
    ("AN", "video"),
];

/// Derive the UI device kind advertised in `/privet/info` from the model
/// manifest id. Unknown or malformed ids fall back to `vendor`.
fn device_ui_kind(model_id: &str) -> &'static str {
    let code = model_id.get(..2).unwrap_or("");
    DEVICE_KIND_MAP
        .iter()
        .find(|(key, _)| *key == code)
        .map(|(_, kind)| *kind)
        .unwrap_or("vendor")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Info,
    Auth,
    PairingStart,
    PairingConfirm,
    PairingCancel,
    SetupStart,
    SetupStatus,
    CommandDefs,
    CommandsExecute,
    CommandsStatus,
    CommandsCancel,
    CommandsList,
    State,
}

/// `(path, method, minimum scope, route)`
const ROUTES: &[(&str, &str, AuthScope, Route)] = &[
    ("/privet/info", "GET", AuthScope::None, Route::Info),
    ("/privet/v3/auth", "POST", AuthScope::None, Route::Auth),
    ("/privet/v3/pairing/start", "POST", AuthScope::None, Route::PairingStart),
    ("/privet/v3/pairing/confirm", "POST", AuthScope::None, Route::PairingConfirm),
    ("/privet/v3/pairing/cancel", "POST", AuthScope::None, Route::PairingCancel),
    ("/privet/v3/setup/start", "POST", AuthScope::Manager, Route::SetupStart),
    ("/privet/v3/setup/status", "GET", AuthScope::Viewer, Route::SetupStatus),
    ("/privet/v3/commandDefs", "GET", AuthScope::Viewer, Route::CommandDefs),
    ("/privet/v3/commands/execute", "POST", AuthScope::Viewer, Route::CommandsExecute),
    ("/privet/v3/commands/status", "GET", AuthScope::Viewer, Route::CommandsStatus),
    ("/privet/v3/commands/cancel", "POST", AuthScope::Viewer, Route::CommandsCancel),
    ("/privet/v3/commands/list", "GET", AuthScope::Viewer, Route::CommandsList),
    ("/privet/v3/state", "GET", AuthScope::Viewer, Route::State),
];

pub struct PrivetHandler {
    controller: Weak<DeviceController>,
    security: Weak<SecurityManager>,
    wifi: Option<Arc<dyn Wifi>>,
    wifi_setup: Arc<RwLock<SetupState>>,
    connected_ssid: Arc<RwLock<Option<String>>>,
    http_port: u16,
    https_port: u16,
}

impl PrivetHandler {
    pub fn new(
        controller: &Arc<DeviceController>,
        security: &Arc<SecurityManager>,
        wifi: Option<Arc<dyn Wifi>>,
        http_port: u16,
        https_port: u16,
    ) -> Self {
        PrivetHandler {
            controller: Arc::downgrade(controller),
            security: Arc::downgrade(security),
            wifi,
            wifi_setup: Arc::new(RwLock::new(SetupState::Idle)),
            connected_ssid: Arc::new(RwLock::new(None)),
            http_port,
            https_port,
        }
    }

    /// Paths served by this handler, for host listener registration.
    pub fn paths(&self) -> Vec<&'static str> {
        ROUTES.iter().map(|(path, ..)| *path).collect()
    }

    /// Dispatch one local request.
    ///
    /// `input` is `None` when the request body failed to parse; GET
    /// requests pass an empty object.
    pub fn handle_request(
        &self,
        method: &str,
        path: &str,
        auth_header: Option<&str>,
        input: Option<Value>,
    ) -> PrivetResponse {
        let Some((_, route_method, min_scope, route)) =
            ROUTES.iter().find(|(p, ..)| *p == path)
        else {
            return PrivetResponse::from_error(&privet_error(
                reason::NOT_FOUND,
                "Path not found",
            ));
        };
        if *route_method != method {
            return PrivetResponse {
                status: 405,
                body: json!({
                    "error": {
                        "code": "invalidMethod",
                        "message": format!("{path} does not support {method}"),
                    }
                }),
            };
        }
        let Some(input) = input else {
            return PrivetResponse::from_error(&privet_error(
                reason::INVALID_FORMAT,
                "Malformed JSON",
            ));
        };

        let user = match self.authenticate(auth_header) {
            Ok(user) => user,
            Err(err) => return PrivetResponse::from_error(&err),
        };
        if user.scope < *min_scope {
            return PrivetResponse::from_error(&privet_error(
                reason::INVALID_AUTHORIZATION_SCOPE,
                format!("Scope '{}' does not allow '{path}'", user.scope),
            ));
        }
        debug!(target: "privet", path, scope = %user.scope, "privet request");

        let result = match route {
            Route::Info => self.handle_info(),
            Route::Auth => self.handle_auth(&input),
            Route::PairingStart => self.handle_pairing_start(&input),
            Route::PairingConfirm => self.handle_pairing_confirm(&input),
            Route::PairingCancel => self.handle_pairing_cancel(&input),
            Route::SetupStart => self.handle_setup_start(&input),
            Route::SetupStatus => self.handle_setup_status(),
            Route::CommandDefs => self.handle_command_defs(),
            Route::CommandsExecute => self.handle_commands_execute(&input, user),
            Route::CommandsStatus => self.handle_commands_status(&input, user),
            Route::CommandsCancel => self.handle_commands_cancel(&input, user),
            Route::CommandsList => self.handle_commands_list(user),
            Route::State => self.handle_state(),
        };
        match result {
            Ok(body) => PrivetResponse::ok(body),
            Err(err) => PrivetResponse::from_error(&to_privet_error(err)),
        }
    }

    /// Parse the `Authorization` header: `Privet <token>` or
    /// `Privet anonymous`.
    fn authenticate(&self, auth_header: Option<&str>) -> Result<UserInfo> {
        let header = auth_header.unwrap_or("").trim();
        if header.is_empty() {
            return Err(privet_error(
                reason::AUTHORIZATION_MISSING,
                "Authorization header must not be empty",
            ));
        }
        let token = header
            .split_once(' ')
            .map(|(_, token)| token.trim())
            .unwrap_or("");
        if token.is_empty() {
            return Err(privet_error(
                reason::INVALID_AUTHORIZATION,
                format!("Invalid authorization header: {header}"),
            ));
        }
        if token == AUTH_TYPE_ANONYMOUS {
            let scope = self
                .controller()?
                .config()
                .settings()
                .local_anonymous_access_role;
            return Ok(UserInfo { scope, user_id: 0 });
        }

        let security = self.security()?;
        let (user, expiry) = security.parse_access_token(token)?;
        if SecurityManager::is_token_expired(expiry) {
            return Err(privet_error(reason::AUTHORIZATION_EXPIRED, "Token expired"));
        }
        Ok(user)
    }

    fn controller(&self) -> Result<Arc<DeviceController>> {
        self.controller
            .upgrade()
            .ok_or_else(|| privet_error(reason::INVALID_STATE, "device is shutting down"))
    }

    fn security(&self) -> Result<Arc<SecurityManager>> {
        self.security
            .upgrade()
            .ok_or_else(|| privet_error(reason::INVALID_STATE, "device is shutting down"))
    }

    fn handle_info(&self) -> Result<Value> {
        let controller = self.controller()?;
        let security = self.security()?;
        let settings = controller.config().settings();

        let pairing_modes: Vec<&str> = security
            .pairing()
            .modes()
            .iter()
            .map(PairingMode::as_str)
            .collect();
        let crypto_modes = security.pairing().crypto_modes();

        let mut output = Map::new();
        output.insert("version".into(), json!(API_VERSION));
        output.insert("id".into(), json!(settings.cloud_id));
        output.insert("name".into(), json!(settings.name));
        if !settings.description.is_empty() {
            output.insert("description".into(), json!(settings.description));
        }
        if !settings.location.is_empty() {
            output.insert("location".into(), json!(settings.location));
        }
        output.insert("modelManifestId".into(), json!(settings.model_id));
        let ui_kind = device_ui_kind(&settings.model_id);
        output.insert(
            "basicModelManifest".into(),
            json!({
                "uiDeviceKind": ui_kind,
                "oemName": settings.oem_name,
                "modelName": settings.model_name,
            }),
        );
        output.insert("services".into(), json!([ui_kind]));
        output.insert(
            "authentication".into(),
            json!({
                "anonymousMaxScope": settings.local_anonymous_access_role.as_str(),
                "mode": [AUTH_TYPE_ANONYMOUS, AUTH_TYPE_PAIRING],
                "pairing": pairing_modes,
                "crypto": crypto_modes,
            }),
        );
        output.insert(
            "endpoints".into(),
            json!({
                "httpPort": self.http_port,
                "httpsPort": self.https_port,
            }),
        );
        if self.wifi.is_some() {
            let mut wifi = Map::new();
            if let Some(ssid) = self.connected_ssid.read().clone() {
                wifi.insert("ssid".into(), json!(ssid));
            }
            if let Some(status) = self.wifi_setup.read().to_json() {
                wifi.insert("status".into(), status["status"].clone());
            }
            output.insert("wifi".into(), Value::Object(wifi));
        }
        output.insert(
            "gcd".into(),
            json!({
                "id": settings.cloud_id,
                "status": controller.gcd_state().as_str(),
            }),
        );
        output.insert("uptime".into(), json!(controller.uptime().as_secs()));
        Ok(Value::Object(output))
    }

    fn handle_auth(&self, input: &Value) -> Result<Value> {
        let controller = self.controller()?;
        let security = self.security()?;
        let settings = controller.config().settings();

        let mode = input.get("mode").and_then(Value::as_str).unwrap_or("");
        let auth_code = input.get("authCode").and_then(Value::as_str).unwrap_or("");

        let max_scope = match mode {
            AUTH_TYPE_ANONYMOUS => settings.local_anonymous_access_role,
            AUTH_TYPE_PAIRING => {
                if !security.pairing().is_valid_auth_code(auth_code) {
                    return Err(privet_error(
                        reason::INVALID_AUTH_CODE,
                        format!("{INVALID_PARAM_FMT}: 'authCode'"),
                    ));
                }
                AuthScope::Owner
            }
            other => {
                return Err(privet_error(
                    reason::INVALID_AUTH_MODE,
                    format!("{INVALID_PARAM_FMT}: 'mode'='{other}'"),
                ))
            }
        };

        let requested = input
            .get("requestedScope")
            .and_then(Value::as_str)
            .unwrap_or(SCOPE_AUTO);
        let scope = if requested == SCOPE_AUTO {
            max_scope
        } else {
            AuthScope::parse(requested).ok_or_else(|| {
                privet_error(
                    reason::INVALID_REQUESTED_SCOPE,
                    format!("{INVALID_PARAM_FMT}: 'requestedScope'='{requested}'"),
                )
            })?
        };
        if scope == AuthScope::None {
            return Err(privet_error(
                reason::INVALID_REQUESTED_SCOPE,
                format!("{INVALID_PARAM_FMT}: 'requestedScope'='{requested}'"),
            ));
        }
        if scope > max_scope {
            return Err(privet_error(
                reason::ACCESS_DENIED,
                format!("Scope '{scope}' is not allowed"),
            ));
        }

        let user = UserInfo {
            scope,
            user_id: security.next_user_id(),
        };
        Ok(json!({
            "accessToken": security.create_access_token(user, SystemTime::now()),
            "tokenType": TOKEN_TYPE,
            "expiresIn": ACCESS_TOKEN_EXPIRY.as_secs(),
            "scope": scope.as_str(),
        }))
    }

    fn handle_pairing_start(&self, input: &Value) -> Result<Value> {
        let controller = self.controller()?;
        let security = self.security()?;
        if !controller.config().settings().local_pairing_enabled {
            return Err(privet_error(
                reason::SETUP_UNAVAILABLE,
                "local pairing is disabled",
            ));
        }

        let pairing_str = input.get("pairing").and_then(Value::as_str).unwrap_or("");
        let mode = PairingMode::parse(pairing_str).ok_or_else(|| {
            privet_error(
                reason::INVALID_PARAMS,
                format!("{INVALID_PARAM_FMT}: 'pairing'='{pairing_str}'"),
            )
        })?;
        let crypto = input.get("crypto").and_then(Value::as_str).unwrap_or("");

        let started = security.pairing().start(mode, crypto)?;
        Ok(json!({
            "sessionId": started.session_id,
            "deviceCommitment": started.device_commitment,
        }))
    }

    fn handle_pairing_confirm(&self, input: &Value) -> Result<Value> {
        let security = self.security()?;
        let session_id = input.get("sessionId").and_then(Value::as_str).unwrap_or("");
        let commitment = input
            .get("clientCommitment")
            .and_then(Value::as_str)
            .unwrap_or("");

        let session_key = security.pairing().confirm(session_id, commitment)?;
        let fingerprint = security.certificate_fingerprint().unwrap_or_default();

        // Channel binding: MAC the TLS fingerprint under the session key.
        let mut mac = Hmac::<Sha256>::new_from_slice(&session_key).expect("hmac key length");
        mac.update(fingerprint.as_bytes());
        let signature = B64URL.encode(mac.finalize().into_bytes());

        Ok(json!({
            "certFingerprint": fingerprint,
            "certSignature": signature,
        }))
    }

    fn handle_pairing_cancel(&self, input: &Value) -> Result<Value> {
        let security = self.security()?;
        let session_id = input.get("sessionId").and_then(Value::as_str).unwrap_or("");
        security.pairing().cancel(session_id)?;
        Ok(json!({}))
    }

    fn handle_setup_start(&self, input: &Value) -> Result<Value> {
        let controller = self.controller()?;
        let settings = controller.config().settings();

        // Optional device-info updates ride along with setup.
        let name = input.get("name").and_then(Value::as_str);
        let description = input.get("description").and_then(Value::as_str);
        let location = input.get("location").and_then(Value::as_str);
        if name.is_some() || description.is_some() || location.is_some() {
            controller
                .config()
                .update(|s| {
                    if let Some(name) = name {
                        s.name = name.to_string();
                    }
                    if let Some(description) = description {
                        s.description = description.to_string();
                    }
                    if let Some(location) = location {
                        s.location = location.to_string();
                    }
                })
                .map_err(Error::from)?;
        }

        if let Some(wifi_section) = input.get("wifi") {
            let Some(wifi) = self.wifi.clone() else {
                return Err(privet_error(
                    reason::SETUP_UNAVAILABLE,
                    "WiFi setup unavailable",
                ));
            };
            if !settings.wifi_auto_setup_enabled {
                return Err(privet_error(
                    reason::SETUP_UNAVAILABLE,
                    "WiFi setup unavailable",
                ));
            }
            let ssid = wifi_section
                .get("ssid")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            if ssid.is_empty() {
                return Err(privet_error(
                    reason::INVALID_PARAMS,
                    format!("{INVALID_PARAM_FMT}: 'ssid'=''"),
                ));
            }
            let passphrase = wifi_section
                .get("passphrase")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();

            *self.wifi_setup.write() = SetupState::InProgress;
            let setup = self.wifi_setup.clone();
            let connected = self.connected_ssid.clone();
            tokio::spawn(async move {
                match wifi.connect(&ssid, &passphrase).await {
                    Ok(()) => {
                        *connected.write() = Some(ssid);
                        *setup.write() = SetupState::Success;
                    }
                    Err(err) => {
                        *setup.write() = SetupState::Error(err.to_string());
                    }
                }
            });
        }

        if let Some(registration) = input.get("gcd") {
            let ticket = registration
                .get("ticketId")
                .and_then(Value::as_str)
                .unwrap_or("");
            if ticket.is_empty() {
                return Err(privet_error(
                    reason::INVALID_PARAMS,
                    format!("{INVALID_PARAM_FMT}: 'ticketId'=''"),
                ));
            }
            controller.start_registration(ticket.to_string());
        }

        self.setup_status_json()
    }

    fn handle_setup_status(&self) -> Result<Value> {
        self.setup_status_json()
    }

    fn setup_status_json(&self) -> Result<Value> {
        let controller = self.controller()?;
        let mut output = Map::new();

        let registration = controller.registration_setup_state();
        if let Some(mut gcd) = registration.to_json() {
            if registration == SetupState::Success {
                gcd["id"] = json!(controller.config().settings().cloud_id);
            }
            output.insert("gcd".into(), gcd);
        }
        let wifi_state = self.wifi_setup.read().clone();
        if let Some(mut wifi) = wifi_state.to_json() {
            if wifi_state == SetupState::Success {
                if let Some(ssid) = self.connected_ssid.read().clone() {
                    wifi["ssid"] = json!(ssid);
                }
            }
            output.insert("wifi".into(), wifi);
        }
        Ok(Value::Object(output))
    }

    fn handle_command_defs(&self) -> Result<Value> {
        let controller = self.controller()?;
        Ok(json!({
            "commands": controller.catalog().get_definitions(),
            "fingerprint": controller.catalog().fingerprint().to_string(),
        }))
    }

    fn handle_commands_execute(&self, input: &Value, user: UserInfo) -> Result<Value> {
        let controller = self.controller()?;
        let name = input.get("name").and_then(Value::as_str).unwrap_or("");
        let parameters = input
            .get("parameters")
            .cloned()
            .unwrap_or_else(|| json!({}));

        let definition = controller
            .catalog()
            .validate_instance(name, &parameters, user.scope)?;
        let instance = controller
            .dispatcher()
            .create_local_instance(definition, parameters);
        if !controller.dispatcher().dispatch(&instance) {
            let err = Error::new(
                domain::GCD,
                "unknown_command",
                format!("no handler registered for '{name}'"),
            );
            let _ = instance.fail(&err);
            return Err(err);
        }
        Ok(instance.to_json())
    }

    fn handle_commands_status(&self, input: &Value, user: UserInfo) -> Result<Value> {
        let instance = self.find_accessible_command(input, user)?;
        Ok(instance.to_json())
    }

    fn handle_commands_cancel(&self, input: &Value, user: UserInfo) -> Result<Value> {
        let instance = self.find_accessible_command(input, user)?;
        instance.cancel()?;
        Ok(instance.to_json())
    }

    fn handle_commands_list(&self, user: UserInfo) -> Result<Value> {
        let controller = self.controller()?;
        let commands: Vec<Value> = controller
            .dispatcher()
            .list()
            .into_iter()
            .filter(|c| user.scope >= c.definition().minimal_role)
            .map(|c| c.to_json())
            .collect();
        Ok(json!({ "commands": commands }))
    }

    fn handle_state(&self) -> Result<Value> {
        let controller = self.controller()?;
        let mut state = Map::new();
        for (property, value) in controller.state_queue().snapshot() {
            state.insert(property, value);
        }
        Ok(json!({
            "state": Value::Object(state),
            "fingerprint": controller.state_queue().last_change_id().to_string(),
        }))
    }

    fn find_accessible_command(
        &self,
        input: &Value,
        user: UserInfo,
    ) -> Result<Arc<CommandInstance>> {
        let controller = self.controller()?;
        let id = input.get("id").and_then(Value::as_str).unwrap_or("");
        if id.is_empty() {
            return Err(privet_error(
                reason::INVALID_PARAMS,
                format!("{INVALID_PARAM_FMT}: 'id'=''"),
            ));
        }
        let instance = controller
            .dispatcher()
            .find(id)
            .ok_or_else(|| privet_error(reason::NOT_FOUND, "Unknown command ID"))?;
        if user.scope < instance.definition().minimal_role {
            return Err(privet_error(
                reason::ACCESS_DENIED,
                format!("Scope '{}' is not allowed", user.scope),
            ));
        }
        Ok(instance)
    }
}

/// Translate internal errors into privet reasons, mirroring the cloud
/// error mapping: unknown commands surface as 404, denied access as 403,
/// validation problems as 400.
fn to_privet_error(error: Error) -> Error {
    if error.domain() == domain::PRIVET {
        return error;
    }
    if error.domain() == domain::GCD {
        let (code, message) = match error.code() {
            "unknown_command" => (reason::NOT_FOUND, "Unknown command ID".to_string()),
            "access_denied" => (reason::ACCESS_DENIED, error.message().to_string()),
            "invalid_state" => (reason::INVALID_STATE, error.message().to_string()),
            _ => (reason::INVALID_PARAMS, error.message().to_string()),
        };
        return Error::wrap(domain::PRIVET, code.to_string(), message, error);
    }
    Error::wrap(
        domain::PRIVET,
        reason::INVALID_STATE,
        error.message().to_string(),
        error,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_ui_kind_by_model_prefix() {
        assert_eq!(device_ui_kind("AAAAA"), "vendor");
        assert_eq!(device_ui_kind("AEXYZ"), "printer");
        assert_eq!(device_ui_kind("AMQQQ"), "camera");
        // Unknown prefixes and malformed ids fall back to vendor.
        assert_eq!(device_ui_kind("ZZZZZ"), "vendor");
        assert_eq!(device_ui_kind("A"), "vendor");
        assert_eq!(device_ui_kind(""), "vendor");
    }
}
