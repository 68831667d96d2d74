//! Shared domain and protocol types for the Farview remote-desktop system.
//!
//! Every other crate in the workspace depends on this one; it carries no I/O
//! of its own. The wire and IPC enums here define the only payloads the core
//! ever frames onto a channel.

pub mod config;
pub mod ipc;
pub mod router;
pub mod user;
pub mod wire;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque identifier the Router issues for a registered Host.
///
/// Stable for the lifetime of a registration; `0` is reserved as the invalid
/// sentinel and never assigned.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostId(pub u64);

impl HostId {
    pub const INVALID: HostId = HostId(0);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// OS-assigned interactive session identifier. `0` is reserved.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What a connected remote peer wants from a Host or the Router.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientKind {
    Desktop,
    FileTransfer,
    Admin,
}

impl fmt::Display for ClientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClientKind::Desktop => "desktop",
            ClientKind::FileTransfer => "file_transfer",
            ClientKind::Admin => "admin",
        };
        f.write_str(s)
    }
}
