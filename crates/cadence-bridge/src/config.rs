//! Bridge configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Slack between the HTTP timeout and callback expiry.
pub const CALLBACK_TTL_MARGIN_SECS: u64 = 5;

/// Runtime configuration shared by every bridge instance.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Root directory under which each resolver gets its storage namespace.
    pub storage_root: PathBuf,
    /// Transport timeout for relayed HTTP requests, in seconds (default: 30).
    pub http_timeout_secs: u64,
    /// How long an outstanding callback handle stays valid (default: 300).
    pub callback_ttl_secs: u64,
    /// How long native code waits for a script function to answer (default: 20).
    pub call_timeout_secs: u64,
    /// `User-Agent` sent with relayed requests.
    pub user_agent: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("/data/resolvers/storage"),
            http_timeout_secs: 30,
            callback_ttl_secs: 300,
            call_timeout_secs: 20,
            user_agent: format!("Cadence/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl BridgeConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            storage_root: std::env::var("RESOLVER_STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.storage_root),
            http_timeout_secs: std::env::var("RESOLVER_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            callback_ttl_secs: std::env::var("RESOLVER_CALLBACK_TTL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.callback_ttl_secs),
            call_timeout_secs: std::env::var("RESOLVER_CALL_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.call_timeout_secs),
            user_agent: std::env::var("RESOLVER_USER_AGENT").unwrap_or(defaults.user_agent),
        }
    }

    /// Expiry for outstanding callback handles. Never shorter than the HTTP
    /// timeout plus [`CALLBACK_TTL_MARGIN_SECS`], so a request that completes
    /// within its timeout always finds its continuation.
    pub fn callback_ttl(&self) -> Duration {
        let floor = self
            .http_timeout_secs
            .saturating_add(CALLBACK_TTL_MARGIN_SECS);
        Duration::from_secs(self.callback_ttl_secs.max(floor))
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}
