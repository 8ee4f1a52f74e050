//! Chained error values shared by every subsystem.
//!
//! Every fallible operation in the agent returns an [`Error`]: a
//! `{domain, code, message}` triple with an optional inner cause. Domains
//! partition errors by origin so callers can match on behavior (retry,
//! re-auth, reject) without string-scraping messages.

use std::fmt;

/// Error domains used across the agent.
pub mod domain {
    /// Local agent logic (timeouts, scheduling, invariant violations).
    pub const BUFFET: &str = "buffet";
    /// The OAuth2 token endpoint; code is the response `error` field.
    pub const OAUTH2: &str = "oauth2";
    /// Local registration logic.
    pub const GCD: &str = "gcd";
    /// Errors returned by the cloud service; code is the HTTP status or
    /// the server-supplied error code.
    pub const GCD_SERVER: &str = "gcd_server";
    /// Transport-level failures.
    pub const NETWORK: &str = "network";
    /// Local protocol errors surfaced to Privet clients.
    pub const PRIVET: &str = "privet";
}

/// A chained error: domain + code + message, with an optional inner cause.
#[derive(Debug, Clone, PartialEq)]
pub struct Error {
    domain: &'static str,
    code: String,
    message: String,
    inner: Option<Box<Error>>,
}

impl Error {
    pub fn new(
        domain: &'static str,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error {
            domain,
            code: code.into(),
            message: message.into(),
            inner: None,
        }
    }

    /// Wrap `cause` with an outer error, preserving the chain.
    pub fn wrap(
        domain: &'static str,
        code: impl Into<String>,
        message: impl Into<String>,
        cause: Error,
    ) -> Self {
        Error {
            domain,
            code: code.into(),
            message: message.into(),
            inner: Some(Box::new(cause)),
        }
    }

    pub fn domain(&self) -> &'static str {
        self.domain
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn inner(&self) -> Option<&Error> {
        self.inner.as_deref()
    }

    /// True if this error or any inner cause matches `domain`/`code`.
    pub fn has_error(&self, domain: &str, code: &str) -> bool {
        let mut cur = Some(self);
        while let Some(err) = cur {
            if err.domain == domain && err.code == code {
                return true;
            }
            cur = err.inner.as_deref();
        }
        false
    }

    /// The innermost error in the chain.
    pub fn root(&self) -> &Error {
        let mut cur = self;
        while let Some(inner) = cur.inner.as_deref() {
            cur = inner;
        }
        cur
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}: {}", self.domain, self.code, self.message)?;
        if let Some(inner) = &self.inner {
            write!(f, ": {}", inner)?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.as_ref().map(|e| e as &(dyn std::error::Error))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_error_walks_chain() {
        let inner = Error::new(domain::NETWORK, "timeout", "connect timed out");
        let outer = Error::wrap(domain::GCD, "registration_failed", "claim failed", inner);

        assert!(outer.has_error(domain::GCD, "registration_failed"));
        assert!(outer.has_error(domain::NETWORK, "timeout"));
        assert!(!outer.has_error(domain::OAUTH2, "timeout"));
    }

    #[test]
    fn test_display_includes_chain() {
        let inner = Error::new(domain::NETWORK, "refused", "connection refused");
        let outer = Error::wrap(domain::OAUTH2, "unavailable", "token refresh failed", inner);
        let text = outer.to_string();
        assert!(text.contains("oauth2/unavailable"));
        assert!(text.contains("network/refused"));
    }

    #[test]
    fn test_root_returns_innermost() {
        let inner = Error::new(domain::NETWORK, "reset", "peer reset");
        let outer = Error::wrap(domain::GCD_SERVER, "502", "bad gateway", inner);
        assert_eq!(outer.root().code(), "reset");
    }
}
