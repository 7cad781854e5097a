//! # Proxy Configuration & Constants
//!
//! Every magic number of the proxy lives here. The binary layers CLI flags
//! and environment variables on top of these defaults; the library only
//! ever sees the resolved values through [`Endpoints`] and the component
//! constructors.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// NVP Protocol
// ---------------------------------------------------------------------------

/// Default protocol version sent in the `VERSION` field of every call.
/// The upstream API accepts anything from the 5x range onwards, but newer
/// response fields (multi-currency balances, extended error lists) need a
/// recent version.
pub const DEFAULT_NVP_VERSION: &str = "204.0";

/// Classic NVP sandbox endpoint.
pub const DEFAULT_SANDBOX_URL: &str = "https://api-3t.sandbox.paypal.com/nvp";

/// Classic NVP live endpoint. Real money. Be careful.
pub const DEFAULT_LIVE_URL: &str = "https://api-3t.paypal.com/nvp";

/// Hard deadline for a single upstream call. Not retried on expiry.
pub const NVP_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Content type of both the outbound request body and the inbound reply.
pub const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

// ---------------------------------------------------------------------------
// Event Hub
// ---------------------------------------------------------------------------

/// Default ring buffer capacity for the in-process log.
pub const DEFAULT_LOG_BUFFER_SIZE: usize = 300;

/// Per-observer outbound queue depth. An observer that falls this far
/// behind is disconnected rather than allowed to stall producers.
pub const OBSERVER_QUEUE_CAPACITY: usize = 256;

/// Interval between SSE keep-alive comments. Most reverse proxies cut idle
/// streams at 30-60 s, so 20 s stays comfortably under.
pub const SSE_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);

/// Number of records pushed to a socket observer right after it connects.
pub const SOCKET_INITIAL_LOGS: usize = 50;

/// Default `limit` for socket `GET_LOGS` queries that omit one.
pub const SOCKET_DEFAULT_QUERY_LIMIT: usize = 100;

/// Marker that replaces every redacted value.
pub const REDACTION_MARKER: &str = "[REDACTED]";

// ---------------------------------------------------------------------------
// Rate Limiting
// ---------------------------------------------------------------------------

/// Default fixed window for NVP dispatch rate limiting.
pub const DEFAULT_RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

/// Default maximum NVP calls per client per window.
pub const DEFAULT_RATE_LIMIT_MAX: u32 = 30;

// ---------------------------------------------------------------------------
// Sessions & Key Store
// ---------------------------------------------------------------------------

/// Name of the session cookie handed to browser clients.
pub const SESSION_COOKIE_NAME: &str = "pp_nvp_session";

/// Sessions untouched for this long are dropped by the sweeper.
pub const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(8 * 60 * 60);

/// Salt length for saved-key password hashes.
pub const PASSWORD_SALT_LENGTH: usize = 16;

/// SHA-256 rounds applied on top of the salted digest. Slows down offline
/// guessing against a stolen key store without needing a dedicated KDF.
pub const PASSWORD_HASH_ROUNDS: u32 = 10_000;

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// Which upstream deployment a call targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Sandbox,
    Live,
}

impl Environment {
    /// Lenient parse: a case-insensitive `"live"` is `Live`, every other
    /// value (including typos like `"production"`) is `Sandbox`. Unknown
    /// input never escalates to the live endpoint.
    pub fn from_str_lossy(s: &str) -> Self {
        if s.trim().eq_ignore_ascii_case("live") {
            Environment::Live
        } else {
            Environment::Sandbox
        }
    }

    /// Resolve a per-call override against the process default. An absent
    /// or blank override defers to the default; a present one is parsed
    /// leniently and wins.
    pub fn resolve(override_env: Option<&str>, default: Environment) -> Self {
        match override_env.map(str::trim).filter(|s| !s.is_empty()) {
            Some(s) => Self::from_str_lossy(s),
            None => default,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Sandbox => "sandbox",
            Environment::Live => "live",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The two fixed upstream base URLs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub sandbox: String,
    pub live: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            sandbox: DEFAULT_SANDBOX_URL.to_string(),
            live: DEFAULT_LIVE_URL.to_string(),
        }
    }
}

impl Endpoints {
    pub fn url_for(&self, env: Environment) -> &str {
        match env {
            Environment::Sandbox => &self.sandbox,
            Environment::Live => &self.live,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_parse_is_lenient() {
        assert_eq!(Environment::from_str_lossy("live"), Environment::Live);
        assert_eq!(Environment::from_str_lossy("LIVE"), Environment::Live);
        assert_eq!(Environment::from_str_lossy(" Live "), Environment::Live);
        assert_eq!(Environment::from_str_lossy("sandbox"), Environment::Sandbox);
        // Unknown input never escalates to live.
        assert_eq!(
            Environment::from_str_lossy("production"),
            Environment::Sandbox
        );
        assert_eq!(Environment::from_str_lossy(""), Environment::Sandbox);
    }

    #[test]
    fn test_override_beats_default() {
        assert_eq!(
            Environment::resolve(Some("sandbox"), Environment::Live),
            Environment::Sandbox
        );
        assert_eq!(
            Environment::resolve(Some("live"), Environment::Sandbox),
            Environment::Live
        );
        assert_eq!(
            Environment::resolve(Some("production"), Environment::Live),
            Environment::Sandbox
        );
    }

    #[test]
    fn test_blank_override_defers_to_default() {
        assert_eq!(Environment::resolve(None, Environment::Live), Environment::Live);
        assert_eq!(
            Environment::resolve(Some("  "), Environment::Live),
            Environment::Live
        );
    }

    #[test]
    fn test_endpoints_map_to_fixed_urls() {
        let endpoints = Endpoints::default();
        assert_eq!(endpoints.url_for(Environment::Sandbox), DEFAULT_SANDBOX_URL);
        assert_eq!(endpoints.url_for(Environment::Live), DEFAULT_LIVE_URL);
    }

    #[test]
    fn test_environment_serde_is_lowercase() {
        let json = serde_json::to_string(&Environment::Live).unwrap();
        assert_eq!(json, "\"live\"");
    }

    #[test]
    fn test_timing_constants_sanity() {
        assert!(SSE_KEEPALIVE_INTERVAL < NVP_CALL_TIMEOUT);
        assert!(DEFAULT_RATE_LIMIT_MAX > 0);
        assert!(SOCKET_INITIAL_LOGS <= DEFAULT_LOG_BUFFER_SIZE);
    }
}
