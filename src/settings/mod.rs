//! Persisted device settings and the transactional config wrapper.
//!
//! The agent owns exactly one persisted artifact: a JSON settings document
//! managed through the host's [`ConfigStore`]. All writes go through
//! [`Config::update`], which rewrites the whole document atomically;
//! partial writes are never observable. Host-provisioned defaults are
//! loaded first and the persisted document is overlaid on top.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error as ThisError;

use crate::error::{domain, Error};
use crate::privet::AuthScope;
use crate::providers::ConfigStore;
use crate::security::pairing::PairingMode;

/// Settings load/save errors.
#[derive(ThisError, Debug)]
pub enum SettingsError {
    #[error("Failed to parse settings document: {0}")]
    Parse(String),

    #[error("Failed to serialize settings document: {0}")]
    Serialize(String),

    #[error("Failed to persist settings document: {0}")]
    Store(Error),
}

impl From<SettingsError> for Error {
    fn from(err: SettingsError) -> Self {
        Error::new(domain::BUFFET, "settings_error", err.to_string())
    }
}

/// The full settings document. Host defaults plus the persisted overlay.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    // OAuth2 / cloud endpoints.
    pub client_id: String,
    pub client_secret: String,
    pub api_key: String,
    pub oauth_url: String,
    pub service_url: String,

    // Device identity.
    pub oem_name: String,
    pub model_name: String,
    pub model_id: String,
    pub name: String,
    pub description: String,
    pub location: String,

    // Registration artifacts, written only by a successful enrollment.
    pub cloud_id: String,
    pub refresh_token: String,
    pub robot_account: String,

    // Local security.
    /// Random device secret, base64. Generated on first start if absent.
    pub device_secret: String,
    pub pairing_modes: Vec<PairingMode>,
    pub embedded_code: Option<String>,
    pub local_anonymous_access_role: AuthScope,

    // Feature switches.
    pub local_discovery_enabled: bool,
    pub local_pairing_enabled: bool,
    pub wifi_auto_setup_enabled: bool,
    /// Test-only: disables pairing crypto and token MACs.
    pub disable_security: bool,
}

/// Keys written to the persisted document. Everything else comes from
/// host defaults on every start.
const PERSISTED_KEYS: &[&str] = &[
    "name",
    "description",
    "location",
    "cloud_id",
    "refresh_token",
    "robot_account",
    "device_secret",
];

/// Transactional settings holder.
///
/// Readers get cheap clones; writers go through [`Config::update`], which
/// commits to memory only after the store accepted the rewritten document.
pub struct Config {
    store: Arc<dyn ConfigStore>,
    inner: RwLock<ConfigInner>,
}

struct ConfigInner {
    settings: Settings,
    /// Unknown keys found in the persisted document, preserved on rewrite.
    extra: Map<String, Value>,
}

impl Config {
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Config {
            store,
            inner: RwLock::new(ConfigInner {
                settings: Settings::default(),
                extra: Map::new(),
            }),
        }
    }

    /// Load defaults from the store, then overlay the persisted document.
    pub fn load(&self) -> Result<(), SettingsError> {
        let mut settings = Settings::default();
        self.store.load_defaults(&mut settings);

        let mut extra = Map::new();
        if let Some(document) = self.store.load_settings() {
            let parsed: Value = serde_json::from_str(&document)
                .map_err(|e| SettingsError::Parse(e.to_string()))?;
            let Value::Object(map) = parsed else {
                return Err(SettingsError::Parse("document is not an object".into()));
            };
            for (key, value) in map {
                if PERSISTED_KEYS.contains(&key.as_str()) {
                    apply_persisted_field(&mut settings, &key, &value);
                } else {
                    extra.insert(key, value);
                }
            }
        }

        let mut inner = self.inner.write();
        inner.settings = settings;
        inner.extra = extra;
        Ok(())
    }

    /// Snapshot of the current settings.
    pub fn settings(&self) -> Settings {
        self.inner.read().settings.clone()
    }

    /// Run `mutate` against a copy of the settings and persist the result
    /// in a single document rewrite. Memory is updated only after the
    /// store accepted the write, so a failed save leaves no trace.
    pub fn update<F>(&self, mutate: F) -> Result<(), SettingsError>
    where
        F: FnOnce(&mut Settings),
    {
        let mut inner = self.inner.write();
        let mut candidate = inner.settings.clone();
        mutate(&mut candidate);

        let document = persisted_document(&candidate, &inner.extra)?;
        self.store
            .save_settings(&document)
            .map_err(SettingsError::Store)?;

        inner.settings = candidate;
        Ok(())
    }
}

fn apply_persisted_field(settings: &mut Settings, key: &str, value: &Value) {
    let Some(text) = value.as_str() else { return };
    match key {
        "name" => settings.name = text.to_string(),
        "description" => settings.description = text.to_string(),
        "location" => settings.location = text.to_string(),
        "cloud_id" => settings.cloud_id = text.to_string(),
        "refresh_token" => settings.refresh_token = text.to_string(),
        "robot_account" => settings.robot_account = text.to_string(),
        "device_secret" => settings.device_secret = text.to_string(),
        _ => {}
    }
}

fn persisted_document(
    settings: &Settings,
    extra: &Map<String, Value>,
) -> Result<String, SettingsError> {
    let mut map = extra.clone();
    map.insert("name".into(), Value::String(settings.name.clone()));
    map.insert(
        "description".into(),
        Value::String(settings.description.clone()),
    );
    map.insert("location".into(), Value::String(settings.location.clone()));
    map.insert("cloud_id".into(), Value::String(settings.cloud_id.clone()));
    map.insert(
        "refresh_token".into(),
        Value::String(settings.refresh_token.clone()),
    );
    map.insert(
        "robot_account".into(),
        Value::String(settings.robot_account.clone()),
    );
    map.insert(
        "device_secret".into(),
        Value::String(settings.device_secret.clone()),
    );
    serde_json::to_string_pretty(&Value::Object(map))
        .map_err(|e| SettingsError::Serialize(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::MemoryConfigStore;

    fn store_with_defaults() -> Arc<MemoryConfigStore> {
        let store = MemoryConfigStore::new();
        store.defaults.lock().client_id = "CID".to_string();
        store.defaults.lock().service_url = "http://gcd.server.com/".to_string();
        Arc::new(store)
    }

    #[test]
    fn test_load_overlays_persisted_document() {
        let store = store_with_defaults();
        *store.document.lock() = Some(
            r#"{"refresh_token":"RT","cloud_id":"DEV1","robot_account":"robot@example.com"}"#
                .to_string(),
        );

        let config = Config::new(store);
        config.load().unwrap();
        let settings = config.settings();
        assert_eq!(settings.client_id, "CID");
        assert_eq!(settings.refresh_token, "RT");
        assert_eq!(settings.cloud_id, "DEV1");
        assert_eq!(settings.robot_account, "robot@example.com");
    }

    #[test]
    fn test_update_commits_only_after_save() {
        let store = store_with_defaults();
        let config = Config::new(store.clone());
        config.load().unwrap();

        *store.fail_save.lock() = true;
        let result = config.update(|s| s.refresh_token = "RT".to_string());
        assert!(result.is_err());
        assert_eq!(config.settings().refresh_token, "");

        *store.fail_save.lock() = false;
        config
            .update(|s| s.refresh_token = "RT".to_string())
            .unwrap();
        assert_eq!(config.settings().refresh_token, "RT");
        let document = store.document.lock().clone().unwrap();
        assert!(document.contains("\"refresh_token\": \"RT\""));
    }

    #[test]
    fn test_unknown_persisted_keys_survive_rewrite() {
        let store = store_with_defaults();
        *store.document.lock() = Some(r#"{"refresh_token":"RT","legacy_field":42}"#.to_string());

        let config = Config::new(store.clone());
        config.load().unwrap();
        config.update(|s| s.cloud_id = "DEV1".to_string()).unwrap();

        let document = store.document.lock().clone().unwrap();
        let parsed: Value = serde_json::from_str(&document).unwrap();
        assert_eq!(parsed["legacy_field"], 42);
        assert_eq!(parsed["refresh_token"], "RT");
        assert_eq!(parsed["cloud_id"], "DEV1");
    }
}
