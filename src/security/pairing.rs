//! Pairing sessions: password-authenticated key exchange for
//! bootstrapping a trusted local session without the cloud.
//!
//! The device is side B of a SPAKE2 exchange over the pairing code. A
//! confirmed session yields a session key; the client proves possession by
//! MACing the session id, which `/privet/v3/auth` accepts as `authCode`.
//!
//! Abuse limits: at most [`MAX_SESSIONS`] live sessions (oldest evicted),
//! unconfirmed sessions expire after [`SESSION_EXPIRY`], and
//! [`LOCKOUT_FAILURES`] failed confirms within [`LOCKOUT_WINDOW`] lock
//! pairing down for [`LOCKOUT_DURATION`].

use std::collections::HashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64URL;
use base64::Engine;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use spake2::{Ed25519Group, Identity, Password, Spake2};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::privet::{privet_error, reason};

type HmacSha256 = Hmac<Sha256>;

/// Concurrent pairing session cap; starting a fourth evicts the oldest.
pub const MAX_SESSIONS: usize = 3;

/// Unconfirmed sessions expire this long after `pairingStart`.
pub const SESSION_EXPIRY: Duration = Duration::from_secs(60);

/// Confirmed sessions stay valid for `auth` this long.
pub const CONFIRMED_EXPIRY: Duration = Duration::from_secs(600);

/// Failed confirms within [`LOCKOUT_WINDOW`] before pairing locks.
pub const LOCKOUT_FAILURES: usize = 5;
pub const LOCKOUT_WINDOW: Duration = Duration::from_secs(600);
pub const LOCKOUT_DURATION: Duration = Duration::from_secs(1800);

const SESSION_KEY_INFO: &[u8] = b"privet-pairing-session-v1";

/// How the pairing code reaches the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PairingMode {
    /// 4-digit code generated per session, displayed out-of-band.
    PinCode,
    /// Fixed code preconfigured in settings.
    EmbeddedCode,
    /// 32-byte code sent over an ultrasonic side channel.
    Ultrasound32,
    /// 32-byte code sent over an audible side channel.
    Audible32,
}

impl PairingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PairingMode::PinCode => "pinCode",
            PairingMode::EmbeddedCode => "embeddedCode",
            PairingMode::Ultrasound32 => "ultrasound32",
            PairingMode::Audible32 => "audible32",
        }
    }

    pub fn parse(value: &str) -> Option<PairingMode> {
        match value {
            "pinCode" => Some(PairingMode::PinCode),
            "embeddedCode" => Some(PairingMode::EmbeddedCode),
            "ultrasound32" => Some(PairingMode::Ultrasound32),
            "audible32" => Some(PairingMode::Audible32),
            _ => None,
        }
    }
}

/// Key-exchange suite identifiers accepted in `pairingStart`.
pub const CRYPTO_SPAKE2: &str = "spake2_ed25519_sha256";
pub const CRYPTO_NONE: &str = "none";

#[derive(Debug, Clone)]
pub struct PairingConfig {
    pub modes: Vec<PairingMode>,
    pub embedded_code: Option<String>,
    /// Test-only: skips the key exchange entirely.
    pub disable_security: bool,
}

/// Outcome of `pairingStart`.
#[derive(Debug)]
pub struct StartedPairing {
    pub session_id: String,
    /// Base64url SPAKE2 message from the device.
    pub device_commitment: String,
    /// Code for the host to show out-of-band (pinCode mode only).
    pub display_code: Option<String>,
}

enum SessionState {
    Started { spake: Option<Spake2<Ed25519Group>> },
    Confirmed { session_key: [u8; 32], confirmed_at: Instant },
}

struct PairingSession {
    mode: PairingMode,
    created_at: Instant,
    state: SessionState,
    /// Pairing code, kept for the disabled-security path.
    code: Vec<u8>,
}

impl PairingSession {
    fn is_expired(&self, now: Instant) -> bool {
        match &self.state {
            SessionState::Started { .. } => now.duration_since(self.created_at) > SESSION_EXPIRY,
            SessionState::Confirmed { confirmed_at, .. } => {
                now.duration_since(*confirmed_at) > CONFIRMED_EXPIRY
            }
        }
    }
}

struct RegistryInner {
    sessions: HashMap<String, PairingSession>,
    failures: VecDeque<Instant>,
    locked_until: Option<Instant>,
}

pub struct PairingRegistry {
    config: PairingConfig,
    inner: Mutex<RegistryInner>,
}

impl PairingRegistry {
    pub fn new(config: PairingConfig) -> Self {
        PairingRegistry {
            config,
            inner: Mutex::new(RegistryInner {
                sessions: HashMap::new(),
                failures: VecDeque::new(),
                locked_until: None,
            }),
        }
    }

    /// Modes the device is configured to offer.
    pub fn modes(&self) -> &[PairingMode] {
        &self.config.modes
    }

    /// Crypto suites the device accepts.
    pub fn crypto_modes(&self) -> Vec<&'static str> {
        if self.config.disable_security {
            vec![CRYPTO_SPAKE2, CRYPTO_NONE]
        } else {
            vec![CRYPTO_SPAKE2]
        }
    }

    /// Start a new pairing session.
    pub fn start(&self, mode: PairingMode, crypto: &str) -> Result<StartedPairing> {
        if !self.config.modes.contains(&mode) {
            return Err(privet_error(
                reason::INVALID_PARAMS,
                format!("Invalid parameter: 'pairing'='{}'", mode.as_str()),
            ));
        }
        if !self.crypto_modes().contains(&crypto) {
            return Err(privet_error(
                reason::INVALID_PARAMS,
                format!("Invalid parameter: 'crypto'='{crypto}'"),
            ));
        }

        let mut inner = self.inner.lock();
        let now = Instant::now();
        self.check_lockout(&mut inner, now)?;
        sweep(&mut inner.sessions, now);

        let (code, display_code) = self.pairing_code(mode)?;
        let session_id = Uuid::new_v4().to_string();

        let (state, commitment) = if self.config.disable_security && crypto == CRYPTO_NONE {
            (SessionState::Started { spake: None }, Vec::new())
        } else {
            let (spake, outbound) = Spake2::<Ed25519Group>::start_b(
                &Password::new(&code),
                &Identity::new(b"privet-client"),
                &Identity::new(b"privet-device"),
            );
            (
                SessionState::Started {
                    spake: Some(spake),
                },
                outbound,
            )
        };

        // Cap live sessions; the oldest one makes room.
        while inner.sessions.len() >= MAX_SESSIONS {
            let oldest = inner
                .sessions
                .iter()
                .min_by_key(|(_, s)| s.created_at)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => {
                    warn!(target: "pairing", session = %id, "evicting oldest pairing session");
                    inner.sessions.remove(&id);
                }
                None => break,
            }
        }

        inner.sessions.insert(
            session_id.clone(),
            PairingSession {
                mode,
                created_at: now,
                state,
                code,
            },
        );
        debug!(target: "pairing", session = %session_id, mode = mode.as_str(), "pairing started");

        Ok(StartedPairing {
            session_id,
            device_commitment: B64URL.encode(commitment),
            display_code,
        })
    }

    /// Complete the exchange with the client's commitment; returns the
    /// derived session key.
    pub fn confirm(&self, session_id: &str, client_commitment: &str) -> Result<[u8; 32]> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        self.check_lockout(&mut inner, now)?;
        sweep(&mut inner.sessions, now);

        let exchanged = {
            let session = inner
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| privet_error(reason::UNKNOWN_SESSION, "unknown pairing session"))?;

            match &mut session.state {
                SessionState::Confirmed { session_key, .. } => return Ok(*session_key),
                SessionState::Started { spake } => {
                    if self.config.disable_security && spake.is_none() {
                        let mut key = vec![0u8; 32];
                        let len = session.code.len().min(32);
                        key[..len].copy_from_slice(&session.code[..len]);
                        Some(key)
                    } else {
                        let inbound = B64URL.decode(client_commitment).map_err(|_| {
                            privet_error(
                                reason::INVALID_CLIENT_COMMITMENT,
                                "client commitment is not valid base64",
                            )
                        })?;
                        let spake = spake.take().expect("spake state present before confirm");
                        spake.finish(&inbound).ok()
                    }
                }
            }
        };

        let Some(raw_key) = exchanged else {
            inner.sessions.remove(session_id);
            self.note_failure(&mut inner, now);
            return Err(privet_error(
                reason::COMMITMENT_MISMATCH,
                "pairing commitment mismatch",
            ));
        };

        let mut session_key = [0u8; 32];
        Hkdf::<Sha256>::new(None, &raw_key)
            .expand(SESSION_KEY_INFO, &mut session_key)
            .map_err(|_| privet_error(reason::INVALID_STATE, "key derivation failed"))?;

        let session = inner
            .sessions
            .get_mut(session_id)
            .expect("session present after exchange");
        session.state = SessionState::Confirmed {
            session_key,
            confirmed_at: now,
        };
        inner.failures.clear();
        debug!(target: "pairing", session = %session_id, "pairing confirmed");
        Ok(session_key)
    }

    /// Terminate a session.
    pub fn cancel(&self, session_id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner
            .sessions
            .remove(session_id)
            .map(|_| ())
            .ok_or_else(|| privet_error(reason::UNKNOWN_SESSION, "unknown pairing session"))
    }

    /// Check an `authCode` against every confirmed session: the code is
    /// the base64url MAC of the session id under the session key.
    pub fn is_valid_auth_code(&self, auth_code: &str) -> bool {
        if self.config.disable_security {
            return true;
        }
        let mut inner = self.inner.lock();
        let now = Instant::now();
        sweep(&mut inner.sessions, now);

        let Ok(provided) = B64URL.decode(auth_code) else {
            return false;
        };
        for (id, session) in &inner.sessions {
            if let SessionState::Confirmed { session_key, .. } = &session.state {
                let mut mac = HmacSha256::new_from_slice(session_key).expect("hmac key length");
                mac.update(id.as_bytes());
                if mac.verify_slice(&provided).is_ok() {
                    return true;
                }
            }
        }
        false
    }

    /// Number of live sessions (test and introspection hook).
    pub fn session_count(&self) -> usize {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        sweep(&mut inner.sessions, now);
        inner.sessions.len()
    }

    fn pairing_code(&self, mode: PairingMode) -> Result<(Vec<u8>, Option<String>)> {
        match mode {
            PairingMode::PinCode => {
                let pin = format!("{:04}", rand::thread_rng().gen_range(0..10000));
                Ok((pin.clone().into_bytes(), Some(pin)))
            }
            PairingMode::EmbeddedCode => self
                .config
                .embedded_code
                .as_ref()
                .map(|code| (code.clone().into_bytes(), None))
                .ok_or_else(|| {
                    privet_error(reason::SETUP_UNAVAILABLE, "no embedded code configured")
                }),
            PairingMode::Ultrasound32 | PairingMode::Audible32 => {
                let mut code = vec![0u8; 32];
                rand::thread_rng().fill_bytes(&mut code);
                Ok((code, None))
            }
        }
    }

    fn check_lockout(&self, inner: &mut RegistryInner, now: Instant) -> Result<()> {
        if let Some(until) = inner.locked_until {
            if now < until {
                return Err(privet_error(
                    reason::DEVICE_BUSY,
                    "pairing is temporarily locked",
                ));
            }
            inner.locked_until = None;
            inner.failures.clear();
        }
        Ok(())
    }

    fn note_failure(&self, inner: &mut RegistryInner, now: Instant) {
        inner.failures.push_back(now);
        while let Some(first) = inner.failures.front() {
            if now.duration_since(*first) > LOCKOUT_WINDOW {
                inner.failures.pop_front();
            } else {
                break;
            }
        }
        if inner.failures.len() >= LOCKOUT_FAILURES {
            warn!(target: "pairing", "too many failed confirms, locking pairing");
            inner.locked_until = Some(now + LOCKOUT_DURATION);
        }
    }
}

fn sweep(sessions: &mut HashMap<String, PairingSession>, now: Instant) {
    sessions.retain(|_, s| !s.is_expired(now));
}
