//! Framed transport and authenticated peer channels.
//!
//! Everything on a Farview wire is a whole message: a 4-byte big-endian
//! length followed by the payload. Remote channels additionally pass an
//! identity handshake before the first payload frame; the on-wire cipher
//! itself is a collaborator and not implemented here.

pub mod channel;
pub mod error;
pub mod frame;
pub mod keys;
pub mod logging;

pub use channel::{accept_handshake, connect_handshake, PeerChannel, PeerEvent, PeerRole, PeerSender};
pub use error::{NetError, NetResult};
pub use keys::{IdentityKeyPair, KeyHash};
