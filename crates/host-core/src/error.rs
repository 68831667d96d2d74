use fv_types::{HostId, SessionId};
use thiserror::Error;

/// Errors that can occur in host-core operations
#[derive(Error, Debug)]
pub enum HostError {
    /// Transport error on an IPC or peer channel
    #[error("transport error: {0}")]
    Net(#[from] peer_net::NetError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// No started user session matches the requested host id
    #[error("no active session for host id {0}")]
    NoActiveSession(HostId),

    /// Operation requires an attached session
    #[error("session {0} is detached")]
    SessionDetached(SessionId),

    /// Operation is only valid before the session finished
    #[error("session {0} already finished")]
    SessionFinished(SessionId),

    /// Per-session connected peer limit reached
    #[error("session {session_id} is at its limit of {limit} clients")]
    ClientLimitReached { session_id: SessionId, limit: u32 },

    /// The peer kind is not served by a host session
    #[error("client kind '{0}' is not routable to a user session")]
    UnroutableKind(fv_types::ClientKind),

    /// Settings document failed its integrity verification
    #[error("settings integrity check failed: {0}")]
    SettingsIntegrity(String),

    /// UI helper process could not be started
    #[error("failed to spawn session helper for session {session_id}: {reason}")]
    SpawnFailed { session_id: SessionId, reason: String },

    /// First IPC message was not the expected hello
    #[error("IPC channel did not identify itself")]
    MissingHello,
}

/// Result type alias for host-core operations
pub type HostResult<T> = Result<T, HostError>;
