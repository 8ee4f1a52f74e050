//! Cloud-facing subsystems: OAuth2 tokens, the authenticated JSON client,
//! and the registration/session controller.

pub mod client;
pub mod controller;
pub mod encoding;
pub mod token;

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Connection state of the device as seen by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GcdState {
    /// No enrollment credentials are present.
    Unconfigured,
    /// Credentials were rejected; only an explicit reset leaves this state.
    InvalidCredentials,
    /// Cloud connectivity administratively off.
    Disabled,
    /// Credentials present, network unavailable.
    Offline,
    /// Attempting to establish an authenticated session.
    Connecting,
    /// Authenticated; polling for commands and uploading state.
    Connected,
}

impl GcdState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GcdState::Unconfigured => "unconfigured",
            GcdState::InvalidCredentials => "invalid_credentials",
            GcdState::Disabled => "disabled",
            GcdState::Offline => "offline",
            GcdState::Connecting => "connecting",
            GcdState::Connected => "connected",
        }
    }
}

impl std::fmt::Display for GcdState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Initial retry delay for transient cloud failures.
pub const BACKOFF_INITIAL: Duration = Duration::from_secs(1);

/// Upper bound on the retry delay.
pub const BACKOFF_MAX: Duration = Duration::from_secs(300);

/// Jitter applied to every delay, as a fraction of the nominal value.
pub const BACKOFF_JITTER: f64 = 0.2;

/// Exponential backoff with ±20% jitter, doubling from 1s up to 5min.
#[derive(Debug)]
pub struct Backoff {
    attempt: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Backoff { attempt: 0 }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delay before the next attempt; advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let nominal = BACKOFF_INITIAL
            .saturating_mul(1u32.checked_shl(self.attempt).unwrap_or(u32::MAX))
            .min(BACKOFF_MAX);
        self.attempt = self.attempt.saturating_add(1);

        let jitter = rand::thread_rng().gen_range(-BACKOFF_JITTER..=BACKOFF_JITTER);
        nominal.mul_f64(1.0 + jitter)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
