//! Chain-loading configuration knobs.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Configuration for chain loading and persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// How long a locally committed tail suppresses server tail reads,
    /// in seconds. The server lags slightly behind a client's own
    /// writes; within this window the local overlay wins.
    #[serde(default = "default_server_update_lag_secs")]
    pub server_update_lag_secs: u64,

    /// Base URL of the remote API.
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// HTTP connect timeout in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// HTTP request timeout in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Path to the chain database; `None` selects an in-memory store.
    #[serde(default)]
    pub db_path: Option<PathBuf>,
}

const fn default_server_update_lag_secs() -> u64 {
    60
}

fn default_api_base_url() -> String {
    "http://127.0.0.1:3000".to_string()
}

const fn default_connect_timeout_secs() -> u64 {
    15
}

const fn default_request_timeout_secs() -> u64 {
    60
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            server_update_lag_secs: default_server_update_lag_secs(),
            api_base_url: default_api_base_url(),
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            db_path: None,
        }
    }
}

impl ChainConfig {
    /// The overlay-suppression window as a duration.
    #[must_use]
    pub fn server_update_lag(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.server_update_lag_secs).unwrap_or(i64::MAX))
    }
}
