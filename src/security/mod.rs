//! Device secret, local access tokens, and the TLS fingerprint.
//!
//! Local access tokens are symmetric: an HMAC-SHA256 over the token
//! payload using a key derived from the device secret. Verification is
//! constant-time. The secret itself is generated on first start and
//! persisted through a config transaction.

pub mod pairing;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::{STANDARD as B64, URL_SAFE_NO_PAD as B64URL};
use base64::Engine;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use rand::RngCore;
use serde_json::json;
use sha2::Sha256;
use tracing::info;

use crate::error::{Error, Result};
use crate::privet::{privet_error, reason, AuthScope, UserInfo};
use crate::security::pairing::{PairingConfig, PairingRegistry};
use crate::settings::Config;

type HmacSha256 = Hmac<Sha256>;

/// Lifetime of a minted local access token.
pub const ACCESS_TOKEN_EXPIRY: Duration = Duration::from_secs(3600);

/// Extra slack allowed on expiry checks, against device/client clock skew.
pub const ACCESS_TOKEN_SKEW: Duration = Duration::from_secs(300);

/// Bytes of freshly generated device secrets.
const DEVICE_SECRET_LEN: usize = 32;

/// Minimum accepted secret length when loaded from settings.
const DEVICE_SECRET_MIN_LEN: usize = 16;

const TOKEN_KEY_INFO: &[u8] = b"privet-access-token-v1";

pub struct SecurityManager {
    mac_key: [u8; 32],
    cert_fingerprint: RwLock<Option<String>>,
    pairing: PairingRegistry,
    disable_security: bool,
    user_counter: AtomicU64,
}

impl SecurityManager {
    /// Build the manager, generating and persisting the device secret if
    /// the settings hold none.
    pub fn new(config: &Arc<Config>) -> Result<Self> {
        let mut settings = config.settings();
        if settings.device_secret.is_empty() {
            let mut secret = [0u8; DEVICE_SECRET_LEN];
            rand::thread_rng().fill_bytes(&mut secret);
            let encoded = B64.encode(secret);
            config
                .update(|s| s.device_secret = encoded.clone())
                .map_err(Error::from)?;
            info!(target: "security", "generated new device secret");
            settings = config.settings();
        }

        let secret = B64
            .decode(&settings.device_secret)
            .map_err(|e| privet_error(reason::INVALID_STATE, format!("bad device secret: {e}")))?;
        if secret.len() < DEVICE_SECRET_MIN_LEN {
            return Err(privet_error(
                reason::INVALID_STATE,
                "device secret is too short",
            ));
        }

        let mut mac_key = [0u8; 32];
        Hkdf::<Sha256>::new(None, &secret)
            .expand(TOKEN_KEY_INFO, &mut mac_key)
            .map_err(|_| privet_error(reason::INVALID_STATE, "key derivation failed"))?;

        Ok(SecurityManager {
            mac_key,
            cert_fingerprint: RwLock::new(None),
            pairing: PairingRegistry::new(PairingConfig {
                modes: settings.pairing_modes.clone(),
                embedded_code: settings.embedded_code.clone(),
                disable_security: settings.disable_security,
            }),
            disable_security: settings.disable_security,
            user_counter: AtomicU64::new(0),
        })
    }

    pub fn pairing(&self) -> &PairingRegistry {
        &self.pairing
    }

    /// SHA-256 fingerprint of the HTTPS server certificate, set by the
    /// host once the listener is up.
    pub fn set_certificate_fingerprint(&self, fingerprint: impl Into<String>) {
        *self.cert_fingerprint.write() = Some(fingerprint.into());
    }

    pub fn certificate_fingerprint(&self) -> Option<String> {
        self.cert_fingerprint.read().clone()
    }

    /// Allocate a fresh local user id.
    pub fn next_user_id(&self) -> u64 {
        self.user_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Mint an access token for a local user.
    pub fn create_access_token(&self, user: UserInfo, issued_at: SystemTime) -> String {
        if self.disable_security {
            return format!("{}:{}", user.scope.as_str(), user.user_id);
        }
        let issued = unix_secs(issued_at);
        let payload = json!({
            "user": user.user_id,
            "role": user.scope.as_str(),
            "scope": "privet",
            "iat": issued,
            "exp": issued + ACCESS_TOKEN_EXPIRY.as_secs(),
        });
        let payload_bytes = payload.to_string().into_bytes();
        let mac = self.sign(&payload_bytes);
        format!("{}.{}", B64URL.encode(&payload_bytes), B64URL.encode(mac))
    }

    /// Validate a token and return the caller identity plus expiry.
    /// MAC comparison is constant-time.
    pub fn parse_access_token(&self, token: &str) -> Result<(UserInfo, SystemTime)> {
        if self.disable_security {
            if let Some((scope, user_id)) = token.split_once(':') {
                if let (Some(scope), Ok(user_id)) = (AuthScope::parse(scope), user_id.parse()) {
                    let expiry = SystemTime::now() + ACCESS_TOKEN_EXPIRY;
                    return Ok((UserInfo { scope, user_id }, expiry));
                }
            }
            return Err(privet_error(reason::INVALID_AUTHORIZATION, "invalid access token"));
        }

        let (payload_b64, mac_b64) = token
            .split_once('.')
            .ok_or_else(|| privet_error(reason::INVALID_AUTHORIZATION, "invalid access token"))?;
        let payload_bytes = B64URL
            .decode(payload_b64)
            .map_err(|_| privet_error(reason::INVALID_AUTHORIZATION, "invalid access token"))?;
        let mac = B64URL
            .decode(mac_b64)
            .map_err(|_| privet_error(reason::INVALID_AUTHORIZATION, "invalid access token"))?;

        let mut verifier = HmacSha256::new_from_slice(&self.mac_key).expect("hmac key length");
        verifier.update(&payload_bytes);
        verifier
            .verify_slice(&mac)
            .map_err(|_| privet_error(reason::INVALID_AUTHORIZATION, "invalid access token"))?;

        let payload: serde_json::Value = serde_json::from_slice(&payload_bytes)
            .map_err(|_| privet_error(reason::INVALID_AUTHORIZATION, "invalid access token"))?;
        let scope = payload
            .get("role")
            .and_then(serde_json::Value::as_str)
            .and_then(AuthScope::parse)
            .ok_or_else(|| privet_error(reason::INVALID_AUTHORIZATION, "invalid access token"))?;
        let user_id = payload
            .get("user")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| privet_error(reason::INVALID_AUTHORIZATION, "invalid access token"))?;
        let exp = payload
            .get("exp")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| privet_error(reason::INVALID_AUTHORIZATION, "invalid access token"))?;

        Ok((
            UserInfo { scope, user_id },
            UNIX_EPOCH + Duration::from_secs(exp),
        ))
    }

    /// Expiry check with the clock-skew allowance.
    pub fn is_token_expired(expiry: SystemTime) -> bool {
        expiry + ACCESS_TOKEN_SKEW < SystemTime::now()
    }

    fn sign(&self, data: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.mac_key).expect("hmac key length");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }
}

fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}
