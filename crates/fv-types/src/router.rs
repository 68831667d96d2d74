//! Router connection state as seen by Hosts.

use serde::{Deserialize, Serialize};

/// Why a router connection is not (or no longer) usable.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouterStateError {
    Unreachable,
    HandshakeFailed,
}

/// Snapshot of the router connection status.
///
/// Pushed to every User Session and forwarded verbatim to UI helpers; the
/// sessions treat it as an opaque value.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterState {
    pub connected: bool,
    /// Endpoint the Host registers at, `host:port`.
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RouterStateError>,
}

impl RouterState {
    pub fn connected(endpoint: impl Into<String>) -> Self {
        Self {
            connected: true,
            endpoint: endpoint.into(),
            error: None,
        }
    }

    pub fn failed(endpoint: impl Into<String>, error: RouterStateError) -> Self {
        Self {
            connected: false,
            endpoint: endpoint.into(),
            error: Some(error),
        }
    }
}
