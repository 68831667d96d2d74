//! Local IPC payloads between the privileged service and per-session UI
//! helpers.
//!
//! The IPC pipe is the only trust boundary between the service and the user
//! desktop; both sides validate message kind and size before acting.

use serde::{Deserialize, Serialize};

use crate::{router::RouterState, ClientKind, HostId, SessionId};

/// Messages the UI helper sends to the service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UiToService {
    /// First message on a fresh channel; binds it to the helper's OS session.
    Hello { session_id: SessionId },
    /// Helper wants the Router-issued id for its session displayed.
    HostIdRequest { session_name: String },
    /// Helper wants the one-time password (re)generated and shown.
    CredentialsRequest,
    /// User accepted or rejected an incoming connection prompt.
    ConnectConfirmation { id: u32, accept: bool },
    /// User asked to disconnect one remote peer.
    KillClient { id: u32 },
}

/// Messages the service sends to the UI helper.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServiceToUi {
    /// A remote peer joined this session.
    ConnectEvent {
        id: u32,
        #[serde(rename = "type")]
        kind: ClientKind,
        username: String,
    },
    /// A remote peer left this session.
    DisconnectEvent { id: u32 },
    /// Current access credentials for display. The password is one-time and
    /// must never be persisted or logged by either side.
    Credentials {
        host_id: HostId,
        password: String,
        /// Update-check endpoint forwarded from host settings.
        update_server: String,
    },
    RouterState(RouterState),
    HostId(HostId),
}
