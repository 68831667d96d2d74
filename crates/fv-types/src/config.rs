//! Configuration documents for the Host service and the Router.

use serde::{Deserialize, Serialize};

/// When the Host rotates its one-time access password.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PasswordRotation {
    Never,
    PerConnection,
    /// Regenerated each time a UI helper attaches. Default.
    #[default]
    PerSession,
}

/// Host service settings, persisted as a JSON document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Router endpoint the Host registers at, `host:port`.
    pub router_server_endpoint: String,
    /// Update-check endpoint, forwarded to UI helpers.
    pub update_server: String,
    /// How long a User Session may stay detached before it is reaped.
    pub attach_timeout_ms: u64,
    /// How long the capture pipeline idles without subscribers before it is
    /// stopped rather than suspended.
    pub capture_idle_grace_ms: u64,
    /// Upper bound on concurrently connected peers in one User Session.
    pub max_clients_per_host: u32,
    pub password_rotation: PasswordRotation,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            router_server_endpoint: "127.0.0.1:8060".to_string(),
            update_server: "https://update.farview.org".to_string(),
            attach_timeout_ms: 60_000,
            capture_idle_grace_ms: 30_000,
            max_clients_per_host: 16,
            password_rotation: PasswordRotation::PerSession,
        }
    }
}

/// Router runtime settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Listen endpoint for peer connections, `host:port`.
    pub listen_endpoint: String,
    /// Upper bound on live relay streams per registered Host.
    pub max_clients_per_host: u32,
    /// Upper bound on live relay streams per authenticated client.
    pub max_sessions_per_client: u32,
    /// Private identity key, hex. Filled in by `create-config`.
    pub private_key: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            listen_endpoint: "0.0.0.0:8060".to_string(),
            max_clients_per_host: 16,
            max_sessions_per_client: 8,
            private_key: String::new(),
        }
    }
}
