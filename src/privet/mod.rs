//! Privet local protocol: auth scopes, error codes, response shapes.

pub mod handler;
pub mod http;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{domain, Error};

/// Authorization level of a local caller. Ordered: each scope includes
/// everything below it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum AuthScope {
    None,
    #[default]
    Viewer,
    User,
    Manager,
    Owner,
}

impl AuthScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthScope::None => "none",
            AuthScope::Viewer => "viewer",
            AuthScope::User => "user",
            AuthScope::Manager => "manager",
            AuthScope::Owner => "owner",
        }
    }

    pub fn parse(value: &str) -> Option<AuthScope> {
        match value {
            "none" => Some(AuthScope::None),
            "viewer" => Some(AuthScope::Viewer),
            "user" => Some(AuthScope::User),
            "manager" => Some(AuthScope::Manager),
            "owner" => Some(AuthScope::Owner),
            _ => None,
        }
    }
}

impl std::fmt::Display for AuthScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity attached to a validated local request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserInfo {
    pub scope: AuthScope,
    pub user_id: u64,
}

impl UserInfo {
    pub const ANONYMOUS: UserInfo = UserInfo {
        scope: AuthScope::None,
        user_id: 0,
    };
}

/// Privet error reason codes, returned as `error.code`.
pub mod reason {
    pub const INVALID_FORMAT: &str = "invalidFormat";
    pub const AUTHORIZATION_MISSING: &str = "authorizationMissing";
    pub const INVALID_AUTHORIZATION: &str = "invalidAuthorization";
    pub const INVALID_AUTHORIZATION_SCOPE: &str = "invalidAuthorizationScope";
    pub const AUTHORIZATION_EXPIRED: &str = "authorizationExpired";
    pub const INVALID_CLIENT_COMMITMENT: &str = "invalidClientCommitment";
    pub const COMMITMENT_MISMATCH: &str = "commitmentMismatch";
    pub const UNKNOWN_SESSION: &str = "unknownSession";
    pub const INVALID_AUTH_CODE: &str = "invalidAuthCode";
    pub const INVALID_AUTH_MODE: &str = "invalidAuthMode";
    pub const INVALID_REQUESTED_SCOPE: &str = "invalidRequestedScope";
    pub const ACCESS_DENIED: &str = "accessDenied";
    pub const INVALID_PARAMS: &str = "invalidParams";
    pub const SETUP_UNAVAILABLE: &str = "setupUnavailable";
    pub const DEVICE_BUSY: &str = "deviceBusy";
    pub const INVALID_STATE: &str = "invalidState";
    pub const NOT_FOUND: &str = "notFound";
    pub const NOT_IMPLEMENTED: &str = "notImplemented";
}

/// HTTP status for a privet error reason.
pub fn reason_to_status(code: &str) -> u16 {
    match code {
        reason::INVALID_FORMAT
        | reason::INVALID_AUTH_MODE
        | reason::INVALID_REQUESTED_SCOPE
        | reason::INVALID_PARAMS
        | reason::SETUP_UNAVAILABLE => 400,
        reason::AUTHORIZATION_MISSING
        | reason::INVALID_AUTHORIZATION
        | reason::AUTHORIZATION_EXPIRED => 401,
        reason::INVALID_AUTHORIZATION_SCOPE
        | reason::INVALID_CLIENT_COMMITMENT
        | reason::COMMITMENT_MISMATCH
        | reason::INVALID_AUTH_CODE
        | reason::ACCESS_DENIED => 403,
        reason::UNKNOWN_SESSION | reason::NOT_FOUND => 404,
        reason::NOT_IMPLEMENTED => 501,
        reason::DEVICE_BUSY => 503,
        _ => 500,
    }
}

/// Build a privet-domain error.
pub fn privet_error(code: &str, message: impl Into<String>) -> Error {
    Error::new(domain::PRIVET, code.to_string(), message)
}

/// A completed local request: HTTP status plus JSON body.
#[derive(Debug, Clone)]
pub struct PrivetResponse {
    pub status: u16,
    pub body: Value,
}

impl PrivetResponse {
    pub fn ok(body: Value) -> Self {
        PrivetResponse { status: 200, body }
    }

    /// Render an error as `{error: {code, message, debugInfo?}}`.
    pub fn from_error(error: &Error) -> Self {
        let code = if error.domain() == domain::PRIVET {
            error.code().to_string()
        } else {
            reason::INVALID_STATE.to_string()
        };
        let mut body = json!({
            "error": {
                "code": code,
                "message": error.message(),
            }
        });
        if let Some(inner) = error.inner() {
            body["error"]["debugInfo"] = Value::String(inner.to_string());
        }
        PrivetResponse {
            status: reason_to_status(&code),
            body,
        }
    }
}
