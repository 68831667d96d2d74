//! Authenticated peer channels.
//!
//! A channel comes out of a successful handshake: the accepting side issues a
//! random challenge, the connecting side proves possession of its identity
//! key by signing it, and both sides learn the other's public-key digest.
//! Session payload encryption is a collaborator concern layered under the
//! stream this module is handed.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Duration;
use tracing::debug;

use crate::error::{NetError, NetResult};
use crate::frame::{read_frame, write_frame, MAX_PEER_FRAME};
use crate::keys::{hash_public_key, verify, IdentityKeyPair, KeyHash};

pub const PROTOCOL_VERSION: u32 = 1;

/// What the connecting peer wants to be to the Router.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerRole {
    Host,
    Client,
}

#[derive(Serialize, Deserialize)]
struct ServerChallenge {
    version: u32,
    nonce: String,
    public_key: String,
}

#[derive(Serialize, Deserialize)]
struct ClientHello {
    version: u32,
    role: PeerRole,
    public_key: String,
    signature: String,
}

#[derive(Serialize, Deserialize)]
struct HandshakeAck {
    session_key_id: u64,
}

/// Events delivered off a peer channel, strictly in wire order.
/// `Disconnected` is emitted exactly once, after the last message.
#[derive(Debug)]
pub enum PeerEvent {
    Message(Vec<u8>),
    Disconnected,
}

enum Outgoing {
    Frame(Vec<u8>),
    Close,
}

/// Cloneable sending half of a peer channel.
#[derive(Clone)]
pub struct PeerSender {
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl PeerSender {
    /// Queue a payload frame. Fails once the channel is closed; messages
    /// queued but untransmitted at close time are dropped.
    pub fn send(&self, payload: Vec<u8>) -> NetResult<()> {
        self.tx
            .send(Outgoing::Frame(payload))
            .map_err(|_| NetError::ChannelClosed)
    }

    pub fn close(&self) {
        let _ = self.tx.send(Outgoing::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// A sender with nothing behind it; every send fails with
    /// [`NetError::ChannelClosed`]. Placeholder wiring and tests.
    pub fn detached() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }
}

/// An authenticated, ordered message pipe to a remote peer.
pub struct PeerChannel {
    sender: PeerSender,
    events: mpsc::UnboundedReceiver<PeerEvent>,
    role: PeerRole,
    peer_public_key: String,
    peer_key_hash: KeyHash,
    session_key_id: u64,
}

impl PeerChannel {
    /// Next event, or `None` after `Disconnected` has been consumed.
    pub async fn recv(&mut self) -> Option<PeerEvent> {
        self.events.recv().await
    }

    pub fn send(&self, payload: Vec<u8>) -> NetResult<()> {
        self.sender.send(payload)
    }

    pub fn sender(&self) -> PeerSender {
        self.sender.clone()
    }

    pub fn close(&self) {
        self.sender.close();
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn peer_public_key(&self) -> &str {
        &self.peer_public_key
    }

    /// SHA-256 digest of the authenticated peer's public key.
    pub fn peer_key_hash(&self) -> KeyHash {
        self.peer_key_hash
    }

    /// Identifier of the negotiated session key.
    pub fn session_key_id(&self) -> u64 {
        self.session_key_id
    }
}

/// Accept-side handshake: challenge the peer, verify its signature, spawn the
/// channel pumps.
pub async fn accept_handshake<S>(
    stream: S,
    identity: &IdentityKeyPair,
    deadline: Duration,
) -> NetResult<PeerChannel>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut stream = stream;
    let nonce: [u8; 32] = rand::random();

    let (hello, session_key_id) = tokio::time::timeout(deadline, async {
        let challenge = ServerChallenge {
            version: PROTOCOL_VERSION,
            nonce: hex::encode(nonce),
            public_key: identity.public_key_hex(),
        };
        send_doc(&mut stream, &challenge).await?;

        let hello: ClientHello = read_doc(&mut stream).await?;
        if hello.version != PROTOCOL_VERSION {
            return Err(NetError::VersionMismatch {
                peer: hello.version,
                local: PROTOCOL_VERSION,
            });
        }

        let signature = hex::decode(&hello.signature).map_err(|_| NetError::InvalidSignature)?;
        verify(&hello.public_key, &nonce, &signature)?;

        let session_key_id: u64 = rand::random();
        send_doc(&mut stream, &HandshakeAck { session_key_id }).await?;
        Ok((hello, session_key_id))
    })
    .await
    .map_err(|_| NetError::HandshakeTimeout)??;

    let peer_key_bytes = hex::decode(&hello.public_key).map_err(|e| NetError::InvalidKey(e.to_string()))?;
    let peer_key_hash = hash_public_key(&peer_key_bytes);
    let (sender, events) = spawn_pumps(stream);

    Ok(PeerChannel {
        sender,
        events,
        role: hello.role,
        peer_public_key: hello.public_key,
        peer_key_hash,
        session_key_id,
    })
}

/// Connect-side handshake: answer the challenge with a signature over it.
pub async fn connect_handshake<S>(
    stream: S,
    identity: &IdentityKeyPair,
    role: PeerRole,
    deadline: Duration,
) -> NetResult<PeerChannel>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut stream = stream;

    let (challenge, ack) = tokio::time::timeout(deadline, async {
        let challenge: ServerChallenge = read_doc(&mut stream).await?;
        if challenge.version != PROTOCOL_VERSION {
            return Err(NetError::VersionMismatch {
                peer: challenge.version,
                local: PROTOCOL_VERSION,
            });
        }

        let nonce = hex::decode(&challenge.nonce)
            .map_err(|_| NetError::HandshakeFailed("malformed challenge nonce".into()))?;
        let hello = ClientHello {
            version: PROTOCOL_VERSION,
            role,
            public_key: identity.public_key_hex(),
            signature: hex::encode(identity.sign(&nonce)),
        };
        send_doc(&mut stream, &hello).await?;

        let ack: HandshakeAck = read_doc(&mut stream).await?;
        Ok((challenge, ack))
    })
    .await
    .map_err(|_| NetError::HandshakeTimeout)??;

    let peer_key_bytes =
        hex::decode(&challenge.public_key).map_err(|e| NetError::InvalidKey(e.to_string()))?;
    let peer_key_hash = hash_public_key(&peer_key_bytes);
    let (sender, events) = spawn_pumps(stream);

    Ok(PeerChannel {
        sender,
        events,
        role,
        peer_public_key: challenge.public_key,
        peer_key_hash,
        session_key_id: ack.session_key_id,
    })
}

async fn send_doc<S, T>(stream: &mut S, doc: &T) -> NetResult<()>
where
    S: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(doc)?;
    write_frame(stream, &payload, MAX_PEER_FRAME).await
}

async fn read_doc<S, T>(stream: &mut S) -> NetResult<T>
where
    S: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let payload = read_frame(stream, MAX_PEER_FRAME)
        .await?
        .ok_or(NetError::TruncatedFrame)?;
    Ok(serde_json::from_slice(&payload)?)
}

fn spawn_pumps<S>(stream: S) -> (PeerSender, mpsc::UnboundedReceiver<PeerEvent>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outgoing>();
    let (evt_tx, evt_rx) = mpsc::unbounded_channel::<PeerEvent>();
    let (closed_tx, mut closed_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        while let Some(out) = out_rx.recv().await {
            match out {
                Outgoing::Frame(payload) => {
                    if let Err(e) = write_frame(&mut write_half, &payload, MAX_PEER_FRAME).await {
                        debug!(error = %e, "peer channel write failed");
                        break;
                    }
                }
                Outgoing::Close => break,
            }
        }
        let _ = write_half.shutdown().await;
        let _ = closed_tx.send(());
    });

    tokio::spawn(async move {
        let mut reader = read_half;
        loop {
            tokio::select! {
                res = read_frame(&mut reader, MAX_PEER_FRAME) => match res {
                    Ok(Some(payload)) => {
                        if evt_tx.send(PeerEvent::Message(payload)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(error = %e, "peer channel read failed");
                        break;
                    }
                },
                _ = &mut closed_rx => break,
            }
        }
        let _ = evt_tx.send(PeerEvent::Disconnected);
    });

    (PeerSender { tx: out_tx }, evt_rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn handshake_pair() -> (PeerChannel, PeerChannel) {
        let (server_stream, client_stream) = tokio::io::duplex(64 * 1024);
        let server_key = IdentityKeyPair::generate();
        let client_key = IdentityKeyPair::generate();

        let accept = tokio::spawn(async move {
            accept_handshake(server_stream, &server_key, Duration::from_secs(5)).await
        });
        let connect = connect_handshake(
            client_stream,
            &client_key,
            PeerRole::Host,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        let accepted = accept.await.unwrap().unwrap();
        (accepted, connect)
    }

    #[tokio::test]
    async fn handshake_establishes_both_sides() {
        let (server_side, client_side) = handshake_pair().await;
        assert_eq!(server_side.role(), PeerRole::Host);
        assert_eq!(server_side.session_key_id(), client_side.session_key_id());
    }

    #[tokio::test]
    async fn messages_flow_in_order_and_close_emits_disconnected_once() {
        let (server_side, mut client_side) = handshake_pair().await;

        server_side.send(b"one".to_vec()).unwrap();
        server_side.send(b"two".to_vec()).unwrap();

        match client_side.recv().await.unwrap() {
            PeerEvent::Message(m) => assert_eq!(m, b"one"),
            other => panic!("unexpected event {other:?}"),
        }
        match client_side.recv().await.unwrap() {
            PeerEvent::Message(m) => assert_eq!(m, b"two"),
            other => panic!("unexpected event {other:?}"),
        }

        server_side.close();
        assert!(matches!(client_side.recv().await, Some(PeerEvent::Disconnected)));
        assert!(client_side.recv().await.is_none());
    }

    #[tokio::test]
    async fn bad_signature_fails_the_handshake() {
        let (server_stream, client_stream) = tokio::io::duplex(64 * 1024);
        let server_key = IdentityKeyPair::generate();

        let accept = tokio::spawn(async move {
            accept_handshake(server_stream, &server_key, Duration::from_secs(5)).await
        });

        // Answer the challenge with a signature over the wrong bytes.
        let mut stream = client_stream;
        let challenge: ServerChallenge = read_doc(&mut stream).await.unwrap();
        assert_eq!(challenge.version, PROTOCOL_VERSION);
        let impostor = IdentityKeyPair::generate();
        let hello = ClientHello {
            version: PROTOCOL_VERSION,
            role: PeerRole::Client,
            public_key: impostor.public_key_hex(),
            signature: hex::encode(impostor.sign(b"not the nonce")),
        };
        send_doc(&mut stream, &hello).await.unwrap();

        assert!(matches!(
            accept.await.unwrap(),
            Err(NetError::InvalidSignature)
        ));
    }
}
