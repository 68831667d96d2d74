//! Remote wire payloads exchanged with the Router.
//!
//! Frames on the remote wire are 4-byte big-endian length prefixed; the
//! payload is one of the tagged documents below. Relay payload bytes are
//! opaque to the Router and base64-armored inside the envelope.

use serde::{Deserialize, Serialize};

use crate::{router::RouterState, ClientKind, HostId};

/// Identifies one brokered relay stream between a client and a host.
pub type RendezvousToken = u64;

/// Messages a connected peer sends to the Router.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PeerToRouter {
    /// Client authentication against the user directory.
    Authenticate { username: String, password: String },
    /// Host asks to be entered into the live registry. The peer's identity
    /// was already proven during the channel handshake.
    RegisterHost,
    /// Client asks to be introduced to a registered Host.
    ConnectRequest {
        host_id: HostId,
        #[serde(rename = "type")]
        kind: ClientKind,
    },
    /// One hop of an established relay stream.
    RelayData {
        token: RendezvousToken,
        #[serde(with = "b64")]
        data: Vec<u8>,
    },
    /// Deliberate end of one relay stream, leaving the channel up.
    RelayClose { token: RendezvousToken },
    Ping,
}

/// Outcome of a `ConnectRequest`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ConnectOutcome {
    Accepted {
        token: RendezvousToken,
        host_id: HostId,
    },
    NoHostFound,
    LimitExceeded,
    AccessDenied,
}

/// Messages the Router sends to a connected peer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RouterToPeer {
    /// Authentication verdict. Failures are opaque.
    AuthResult { ok: bool },
    /// Registration completed; the Host keeps this id for its lifetime.
    HostRegistered { host_id: HostId },
    /// Sent to both sides of an introduction attempt.
    ConnectResponse {
        #[serde(flatten)]
        outcome: ConnectOutcome,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer_kind: Option<ClientKind>,
    },
    /// One hop of an established relay stream.
    RelayData {
        token: RendezvousToken,
        #[serde(with = "b64")]
        data: Vec<u8>,
    },
    /// The other side of a relay stream went away.
    RelayClose { token: RendezvousToken },
    /// Router connection status snapshot, pushed to Hosts.
    State(RouterState),
    Pong,
}

mod b64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&crate::wire::encode_base64(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(de)?;
        crate::wire::decode_base64(&text).map_err(serde::de::Error::custom)
    }
}

pub fn encode_base64(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(data)
}

pub fn decode_base64(text: &str) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_data_round_trips_through_json() {
        let msg = PeerToRouter::RelayData {
            token: 7,
            data: vec![0, 1, 2, 255],
        };
        let text = serde_json::to_string(&msg).unwrap();
        let back: PeerToRouter = serde_json::from_str(&text).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn connect_outcome_tags_are_stable() {
        let text = serde_json::to_string(&ConnectOutcome::NoHostFound).unwrap();
        assert!(text.contains("no_host_found"));
    }
}
