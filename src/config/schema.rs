use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Coordinator process configuration, sourced from the environment.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Mode selector; anything starting with `p` means production.
    #[serde(default)]
    pub mode: String,
    #[serde(default = "default_listen")]
    pub listen: String,
    /// SQLite connection string (a file path, or `:memory:`).
    pub db_conn: String,
    /// Key for encrypting sensitive rows at rest. Must not change once set.
    pub encrypt_secret_key: String,
    /// Key for signing admin tokens. Rotating it invalidates open sessions.
    pub signature_secret_key: String,
}

/// Agent process configuration, sourced from the environment.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub mode: String,
    pub server_endpoint: String,
    pub instance_id: i64,
    pub instance_token: String,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,
    pub caddy_endpoint: String,
}

impl ServerConfig {
    pub fn is_prod(&self) -> bool {
        self.mode.to_lowercase().starts_with('p')
    }
}

impl AgentConfig {
    pub fn is_prod(&self) -> bool {
        self.mode.to_lowercase().starts_with('p')
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval)
    }
}

fn default_listen() -> String {
    "0.0.0.0:1323".to_string()
}

fn default_heartbeat_interval() -> u64 {
    60
}
