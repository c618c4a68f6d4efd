//! Session configuration.
//!
//! The only value the session truly needs is the Discord application
//! (client) id presented in the handshake. It resolves from the runtime
//! environment first, then from the value baked in at compile time; when
//! both are absent the session is considered configured off and `enable()`
//! does nothing. The timing knobs exist so tests can run the full
//! reconnect machinery in milliseconds.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::reconnect::ReconnectConfig;

/// Runtime override for the Discord application id.
pub const CLIENT_ID_ENV: &str = "OVERTONE_CLIENT_ID";
/// When set, socket discovery is bypassed and only this directory is probed.
pub const IPC_DIR_ENV: &str = "OVERTONE_IPC_DIR";

const BAKED_CLIENT_ID: Option<&str> = option_env!("OVERTONE_CLIENT_ID");

const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;
const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 5;

/// Everything the session worker needs to run.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Discord application id sent in the handshake. Empty means presence
    /// is configured off.
    pub client_id: String,
    /// Replaces socket discovery with a fixed directory when set.
    pub socket_dir_override: Option<PathBuf>,
    /// Backoff schedule for reconnect attempts.
    pub reconnect: ReconnectConfig,
    /// Fixed cadence of the availability probe while disconnected. Not
    /// subject to backoff.
    pub poll_interval: Duration,
    /// Read timeout while waiting for the handshake acknowledgement.
    pub handshake_timeout: Duration,
}

impl PresenceConfig {
    /// Configuration with an explicit client id and default timings.
    pub fn with_client_id(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            socket_dir_override: None,
            reconnect: ReconnectConfig::default(),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            handshake_timeout: Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
        }
    }

    /// Resolves configuration from the environment, falling back to the
    /// compile-time client id.
    pub fn from_env() -> Self {
        let client_id = non_empty_env(CLIENT_ID_ENV)
            .or_else(|| BAKED_CLIENT_ID.map(str::to_string))
            .unwrap_or_default();
        let mut config = Self::with_client_id(client_id);
        config.socket_dir_override = non_empty_env(IPC_DIR_ENV).map(PathBuf::from);
        config
    }

    /// Whether a usable client id is present.
    pub fn is_configured(&self) -> bool {
        !self.client_id.trim().is_empty()
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self::with_client_id(String::new())
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}
