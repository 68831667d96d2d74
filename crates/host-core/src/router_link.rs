//! Host-side connection to the Router.
//!
//! Maintains one registered peer channel, answers the sessions' Host ID
//! requests from it, and turns brokered introductions into client sessions
//! backed by relay streams.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fv_types::{
    router::{RouterState, RouterStateError},
    wire::{PeerToRouter, RendezvousToken, RouterToPeer},
    HostId,
};
use once_cell::sync::OnceCell;
use peer_net::{connect_handshake, IdentityKeyPair, PeerChannel, PeerEvent, PeerRole, PeerSender};
use tracing::{debug, info, warn};

use crate::client_session::{ClientCapabilities, ClientTransport};
use crate::error::{HostError, HostResult};
use crate::session_manager::{ManagerDelegate, UserSessionManager};

const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(15);
const RECONNECT_INITIAL: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(60);

struct LinkState {
    sender: Option<PeerSender>,
    host_id: HostId,
    /// Session names waiting for a Host ID answer.
    pending_sessions: Vec<String>,
    /// Live relay streams, token to client session id.
    relays: HashMap<RendezvousToken, u32>,
}

/// Relay stream presented to a client session as its transport.
struct RelayTransport {
    sender: PeerSender,
    token: RendezvousToken,
    closed: Mutex<bool>,
}

impl RelayTransport {
    fn send_wire(&self, message: &PeerToRouter) -> HostResult<()> {
        let payload = serde_json::to_vec(message)?;
        self.sender.send(payload).map_err(Into::into)
    }
}

impl ClientTransport for RelayTransport {
    fn send(&self, payload: Vec<u8>) -> HostResult<()> {
        if *self.closed.lock().expect("relay transport poisoned") {
            return Err(peer_net::NetError::ChannelClosed.into());
        }
        self.send_wire(&PeerToRouter::RelayData {
            token: self.token,
            data: payload,
        })
    }

    fn close(&self) {
        let mut closed = self.closed.lock().expect("relay transport poisoned");
        if !*closed {
            *closed = true;
            let _ = self.send_wire(&PeerToRouter::RelayClose { token: self.token });
        }
    }

    fn is_closed(&self) -> bool {
        *self.closed.lock().expect("relay transport poisoned") || self.sender.is_closed()
    }
}

/// The Host's registered presence at the Router.
pub struct RouterLink {
    endpoint: String,
    identity: IdentityKeyPair,
    manager: OnceCell<UserSessionManager>,
    state: Mutex<LinkState>,
}

impl RouterLink {
    pub fn new(endpoint: impl Into<String>, identity: IdentityKeyPair) -> Arc<Self> {
        Arc::new(Self {
            endpoint: endpoint.into(),
            identity,
            manager: OnceCell::new(),
            state: Mutex::new(LinkState {
                sender: None,
                host_id: HostId::INVALID,
                pending_sessions: Vec::new(),
                relays: HashMap::new(),
            }),
        })
    }

    /// Wire the manager in. Must happen before [`run`](Self::run).
    pub fn set_manager(&self, manager: UserSessionManager) {
        let _ = self.manager.set(manager);
    }

    fn manager(&self) -> &UserSessionManager {
        self.manager.get().expect("router link started without a manager")
    }

    pub fn host_id(&self) -> HostId {
        self.state.lock().expect("router link poisoned").host_id
    }

    /// Keep a registered connection alive, reconnecting with capped backoff.
    pub async fn run(self: Arc<Self>) {
        let mut delay = RECONNECT_INITIAL;
        loop {
            let reason = match self.connect_once().await {
                Ok(()) => {
                    delay = RECONNECT_INITIAL;
                    RouterStateError::Unreachable
                }
                Err(e) => {
                    debug!(error = %e, endpoint = %self.endpoint, "router connection failed");
                    link_failure_reason(&e)
                }
            };
            self.on_link_down(reason);
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(RECONNECT_CAP);
        }
    }

    async fn connect_once(&self) -> HostResult<()> {
        let stream = tokio::net::TcpStream::connect(&self.endpoint).await?;
        let mut channel: PeerChannel =
            connect_handshake(stream, &self.identity, PeerRole::Host, HANDSHAKE_DEADLINE).await?;
        info!(endpoint = %self.endpoint, "connected to router");

        {
            let mut state = self.state.lock().expect("router link poisoned");
            state.sender = Some(channel.sender());
        }
        channel.send(serde_json::to_vec(&PeerToRouter::RegisterHost)?)?;

        while let Some(event) = channel.recv().await {
            match event {
                PeerEvent::Message(payload) => match serde_json::from_slice::<RouterToPeer>(&payload) {
                    Ok(message) => self.on_router_message(message),
                    Err(e) => {
                        warn!(error = %e, "malformed router message, dropping connection");
                        channel.close();
                    }
                },
                PeerEvent::Disconnected => break,
            }
        }
        Ok(())
    }

    fn on_router_message(&self, message: RouterToPeer) {
        match message {
            RouterToPeer::HostRegistered { host_id } => {
                let pending = {
                    let mut state = self.state.lock().expect("router link poisoned");
                    state.host_id = host_id;
                    std::mem::take(&mut state.pending_sessions)
                };
                info!(host_id = %host_id, "registered at router");
                for session_name in pending {
                    self.manager().set_host_id(&session_name, host_id);
                }
                self.manager()
                    .set_router_state(RouterState::connected(self.endpoint.clone()));
            }
            RouterToPeer::State(router_state) => {
                self.manager().set_router_state(router_state);
            }
            RouterToPeer::ConnectResponse {
                outcome,
                username,
                peer_kind,
            } => {
                let fv_types::wire::ConnectOutcome::Accepted { token, .. } = outcome else {
                    return;
                };
                let (sender, target) = {
                    let state = self.state.lock().expect("router link poisoned");
                    (state.sender.clone(), state.host_id)
                };
                let Some(sender) = sender else { return };
                let kind = peer_kind.unwrap_or(fv_types::ClientKind::Desktop);
                let transport = Arc::new(RelayTransport {
                    sender,
                    token,
                    closed: Mutex::new(false),
                });
                let capabilities = ClientCapabilities {
                    clipboard: true,
                    ..Default::default()
                };
                match self.manager().add_new_session(
                    kind,
                    username.unwrap_or_else(|| "unknown".to_string()),
                    target,
                    transport.clone(),
                    capabilities,
                ) {
                    Ok(client_id) => {
                        let mut state = self.state.lock().expect("router link poisoned");
                        state.relays.insert(token, client_id);
                    }
                    Err(e) => {
                        // The broker already told both sides "accepted"; the
                        // relay close is how the client learns otherwise.
                        debug!(error = %e, token, "introduction refused");
                        transport.close();
                    }
                }
            }
            RouterToPeer::RelayData { token, data } => {
                let client_id = {
                    let state = self.state.lock().expect("router link poisoned");
                    state.relays.get(&token).copied()
                };
                if let Some(client_id) = client_id {
                    self.manager().route_client_payload(client_id, &data);
                }
            }
            RouterToPeer::RelayClose { token } => {
                let client_id = {
                    let mut state = self.state.lock().expect("router link poisoned");
                    state.relays.remove(&token)
                };
                if let Some(client_id) = client_id {
                    self.manager().on_client_disconnected(client_id);
                }
            }
            RouterToPeer::AuthResult { .. } | RouterToPeer::Pong => {}
        }
    }

    fn on_link_down(&self, reason: RouterStateError) {
        let relays = {
            let mut state = self.state.lock().expect("router link poisoned");
            state.sender = None;
            state.host_id = HostId::INVALID;
            std::mem::take(&mut state.relays)
        };
        for (_token, client_id) in relays {
            self.manager().on_client_disconnected(client_id);
        }
        self.manager()
            .set_router_state(RouterState::failed(self.endpoint.clone(), reason));
    }
}

/// What a failed connection round means to the sessions watching the
/// router state.
fn link_failure_reason(error: &HostError) -> RouterStateError {
    match error {
        HostError::Net(
            peer_net::NetError::HandshakeTimeout
            | peer_net::NetError::HandshakeFailed(_)
            | peer_net::NetError::InvalidSignature
            | peer_net::NetError::VersionMismatch { .. },
        ) => RouterStateError::HandshakeFailed,
        _ => RouterStateError::Unreachable,
    }
}

#[async_trait]
impl ManagerDelegate for RouterLink {
    async fn on_host_id_request(&self, session_name: String) {
        let (host_id, sender) = {
            let mut state = self.state.lock().expect("router link poisoned");
            if state.host_id.is_valid() {
                (state.host_id, None)
            } else {
                if !state.pending_sessions.contains(&session_name) {
                    state.pending_sessions.push(session_name.clone());
                }
                (HostId::INVALID, state.sender.clone())
            }
        };

        if host_id.is_valid() {
            self.manager().set_host_id(&session_name, host_id);
        } else if let Some(sender) = sender {
            // Nudge the router again; registration is idempotent.
            if let Ok(payload) = serde_json::to_vec(&PeerToRouter::RegisterHost) {
                let _ = sender.send(payload);
            }
        }
    }

    async fn on_reset_host_id(&self, host_id: HostId) {
        debug!(host_id = %host_id, "session released its host id");
    }

    async fn on_user_list_changed(&self) {}
}
