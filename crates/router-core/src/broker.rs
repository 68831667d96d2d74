//! The introduction and relay engine.
//!
//! Every accepted peer channel gets its own task here. Host peers register
//! and then mostly sit idle until an introduction names them; client peers
//! authenticate, request introductions, and push relay bytes. The broker
//! forwards relay payloads opaquely and survives any single-connection
//! failure.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use fv_types::{
    config::RouterConfig,
    router::RouterState,
    user::{session_access, User},
    wire::{ConnectOutcome, PeerToRouter, RendezvousToken, RouterToPeer},
    ClientKind, HostId,
};
use peer_net::{KeyHash, PeerChannel, PeerEvent, PeerRole, PeerSender};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::auth::{authenticate_password, AuthDecision, AuthRateLimiter};
use crate::directory::Directory;
use crate::registry::HostRegistry;

const AUTH_DEADLINE: Duration = Duration::from_secs(30);

struct RelayStream {
    host_id: HostId,
    /// Session key of the client channel that opened the stream.
    client_key: u64,
    client_tx: PeerSender,
    host_tx: PeerSender,
}

pub struct Broker {
    config: RouterConfig,
    directory: Directory,
    registry: HostRegistry,
    relays: RwLock<HashMap<RendezvousToken, RelayStream>>,
    limiter: AuthRateLimiter,
}

impl Broker {
    pub fn new(config: RouterConfig, directory: Directory) -> Arc<Self> {
        Arc::new(Self {
            config,
            directory,
            registry: HostRegistry::new(),
            relays: RwLock::new(HashMap::new()),
            limiter: AuthRateLimiter::default(),
        })
    }

    pub fn registry(&self) -> &HostRegistry {
        &self.registry
    }

    /// Drive one authenticated peer channel until it disconnects.
    pub async fn handle_connection(self: Arc<Self>, channel: PeerChannel, peer_addr: Option<SocketAddr>) {
        match channel.role() {
            PeerRole::Host => self.run_host(channel).await,
            PeerRole::Client => self.run_client(channel, peer_addr).await,
        }
    }

    async fn run_host(&self, mut channel: PeerChannel) {
        let key_hash = channel.peer_key_hash();
        let sender = channel.sender();
        let mut host_id = HostId::INVALID;

        while let Some(event) = channel.recv().await {
            match event {
                PeerEvent::Message(payload) => {
                    let message = match serde_json::from_slice::<PeerToRouter>(&payload) {
                        Ok(m) => m,
                        Err(e) => {
                            warn!(error = %e, "framing violation from host peer");
                            channel.close();
                            continue;
                        }
                    };
                    match message {
                        PeerToRouter::RegisterHost => {
                            host_id = self.register_host(key_hash, &sender, host_id).await;
                        }
                        PeerToRouter::RelayData { token, data } => {
                            self.forward_from_host(host_id, token, data).await;
                        }
                        PeerToRouter::RelayClose { token } => {
                            self.close_relay(token, RelayEnd::Host(host_id)).await;
                        }
                        PeerToRouter::Ping => {
                            send(&sender, &RouterToPeer::Pong);
                        }
                        PeerToRouter::Authenticate { .. } | PeerToRouter::ConnectRequest { .. } => {
                            debug!(host_id = %host_id, "client-only message from host peer dropped");
                        }
                    }
                }
                PeerEvent::Disconnected => break,
            }
        }

        // Evict before tearing down streams so no introduction can pick the
        // dead channel up in between.
        if host_id.is_valid() {
            self.registry.unregister(host_id).await;
        }
        self.drop_relays_for_host(host_id).await;
    }

    async fn register_host(&self, key_hash: KeyHash, sender: &PeerSender, current: HostId) -> HostId {
        match self.directory.add_host(&key_hash).await {
            Ok(host_id) => {
                self.registry.register(host_id, key_hash, sender.clone()).await;
                send(sender, &RouterToPeer::HostRegistered { host_id });
                send(
                    sender,
                    &RouterToPeer::State(RouterState::connected(self.config.listen_endpoint.clone())),
                );
                host_id
            }
            Err(e) => {
                // Storage trouble is not fatal to the broker.
                error!(error = %e, key_hash = %key_hash, "host registration failed");
                current
            }
        }
    }

    async fn run_client(&self, mut channel: PeerChannel, peer_addr: Option<SocketAddr>) {
        let source = peer_addr.map(|a| a.ip());
        if let Some(ip) = source {
            if !self.limiter.allows(ip) {
                debug!(%ip, "authentication rate limit exceeded");
                channel.close();
                return;
            }
        }

        let sender = channel.sender();
        let user = match self.authenticate_client(&mut channel, &sender, source).await {
            Some(user) => user,
            None => {
                channel.close();
                return;
            }
        };

        let client_key = channel.session_key_id();
        while let Some(event) = channel.recv().await {
            match event {
                PeerEvent::Message(payload) => {
                    let message = match serde_json::from_slice::<PeerToRouter>(&payload) {
                        Ok(m) => m,
                        Err(e) => {
                            warn!(error = %e, user = %user.username, "framing violation from client peer");
                            channel.close();
                            continue;
                        }
                    };
                    match message {
                        PeerToRouter::ConnectRequest { host_id, kind } => {
                            self.handle_connect_request(client_key, &sender, &user, host_id, kind)
                                .await;
                        }
                        PeerToRouter::RelayData { token, data } => {
                            self.forward_from_client(client_key, token, data).await;
                        }
                        PeerToRouter::RelayClose { token } => {
                            self.close_relay(token, RelayEnd::Client(client_key)).await;
                        }
                        PeerToRouter::Ping => {
                            send(&sender, &RouterToPeer::Pong);
                        }
                        PeerToRouter::Authenticate { .. } | PeerToRouter::RegisterHost => {
                            debug!(user = %user.username, "unexpected message from authenticated client");
                        }
                    }
                }
                PeerEvent::Disconnected => break,
            }
        }

        self.drop_relays_for_client(client_key).await;
    }

    /// First message must be a credential check. Every failure mode looks
    /// the same from outside.
    async fn authenticate_client(
        &self,
        channel: &mut PeerChannel,
        sender: &PeerSender,
        source: Option<std::net::IpAddr>,
    ) -> Option<User> {
        let first = tokio::time::timeout(AUTH_DEADLINE, channel.recv()).await.ok()??;
        let PeerEvent::Message(payload) = first else {
            return None;
        };
        let Ok(PeerToRouter::Authenticate { username, password }) = serde_json::from_slice::<PeerToRouter>(&payload) else {
            debug!("peer spoke before authenticating");
            return None;
        };

        // Which kinds the account may open is checked per request; here the
        // account just has to be allowed to open something.
        let accepted = match authenticate_password(&self.directory, &username, &password).await {
            Ok(AuthDecision::Accept(user)) if user.may_open(session_access::CLIENT | session_access::ADMIN) => Some(user),
            Ok(_) => None,
            Err(e) => {
                error!(error = %e, "authentication backend failure");
                None
            }
        };

        send(sender, &RouterToPeer::AuthResult { ok: accepted.is_some() });
        match accepted {
            Some(user) => {
                if let Some(ip) = source {
                    self.limiter.record_success(ip);
                }
                info!(user = %user.username, "client authenticated");
                Some(user)
            }
            None => {
                if let Some(ip) = source {
                    self.limiter.record_failure(ip);
                }
                None
            }
        }
    }

    async fn handle_connect_request(
        &self,
        client_key: u64,
        client_tx: &PeerSender,
        user: &User,
        target: HostId,
        kind: ClientKind,
    ) {
        let required = match kind {
            ClientKind::Admin => session_access::ADMIN,
            ClientKind::Desktop | ClientKind::FileTransfer => session_access::CLIENT,
        };
        if !user.may_open(required) {
            debug!(user = %user.username, %kind, "session kind not permitted for account");
            send_connect_response(client_tx, ConnectOutcome::AccessDenied, None, None);
            return;
        }

        let Some(host) = self.registry.get(target).await else {
            debug!(host_id = %target, "connect request for offline host");
            send_connect_response(client_tx, ConnectOutcome::NoHostFound, None, None);
            return;
        };

        let mut relays = self.relays.write().await;
        let per_client = relays.values().filter(|r| r.client_key == client_key).count() as u32;
        if per_client >= self.config.max_sessions_per_client {
            send_connect_response(client_tx, ConnectOutcome::LimitExceeded, None, None);
            return;
        }
        let per_host = relays.values().filter(|r| r.host_id == target).count() as u32;
        if per_host >= self.config.max_clients_per_host {
            send_connect_response(client_tx, ConnectOutcome::LimitExceeded, None, None);
            return;
        }

        let token: RendezvousToken = rand::random();
        relays.insert(
            token,
            RelayStream {
                host_id: target,
                client_key,
                client_tx: client_tx.clone(),
                host_tx: host.sender.clone(),
            },
        );
        drop(relays);

        info!(user = %user.username, host_id = %target, %kind, "introduction brokered");
        send_connect_response(
            client_tx,
            ConnectOutcome::Accepted { token, host_id: target },
            None,
            None,
        );
        send_connect_response(
            &host.sender,
            ConnectOutcome::Accepted { token, host_id: target },
            Some(user.username.clone()),
            Some(kind),
        );
    }

    async fn forward_from_client(&self, client_key: u64, token: RendezvousToken, data: Vec<u8>) {
        let relays = self.relays.read().await;
        if let Some(relay) = relays.get(&token) {
            if relay.client_key == client_key {
                send(&relay.host_tx, &RouterToPeer::RelayData { token, data });
            }
        }
    }

    async fn forward_from_host(&self, host_id: HostId, token: RendezvousToken, data: Vec<u8>) {
        let relays = self.relays.read().await;
        if let Some(relay) = relays.get(&token) {
            if relay.host_id == host_id {
                send(&relay.client_tx, &RouterToPeer::RelayData { token, data });
            }
        }
    }

    async fn close_relay(&self, token: RendezvousToken, end: RelayEnd) {
        let removed = {
            let mut relays = self.relays.write().await;
            match relays.get(&token) {
                Some(relay) if end.owns(relay) => relays.remove(&token),
                _ => None,
            }
        };
        if let Some(relay) = removed {
            let other = match end {
                RelayEnd::Client(_) => &relay.host_tx,
                RelayEnd::Host(_) => &relay.client_tx,
            };
            send(other, &RouterToPeer::RelayClose { token });
        }
    }

    async fn drop_relays_for_host(&self, host_id: HostId) {
        if !host_id.is_valid() {
            return;
        }
        let dropped = {
            let mut relays = self.relays.write().await;
            let tokens: Vec<_> = relays
                .iter()
                .filter(|(_, r)| r.host_id == host_id)
                .map(|(t, _)| *t)
                .collect();
            tokens
                .into_iter()
                .filter_map(|t| relays.remove(&t).map(|r| (t, r)))
                .collect::<Vec<_>>()
        };
        for (token, relay) in dropped {
            send(&relay.client_tx, &RouterToPeer::RelayClose { token });
        }
    }

    async fn drop_relays_for_client(&self, client_key: u64) {
        let dropped = {
            let mut relays = self.relays.write().await;
            let tokens: Vec<_> = relays
                .iter()
                .filter(|(_, r)| r.client_key == client_key)
                .map(|(t, _)| *t)
                .collect();
            tokens
                .into_iter()
                .filter_map(|t| relays.remove(&t).map(|r| (t, r)))
                .collect::<Vec<_>>()
        };
        for (token, relay) in dropped {
            send(&relay.host_tx, &RouterToPeer::RelayClose { token });
        }
    }

    pub async fn relay_count(&self) -> usize {
        self.relays.read().await.len()
    }
}

enum RelayEnd {
    Client(u64),
    Host(HostId),
}

impl RelayEnd {
    fn owns(&self, relay: &RelayStream) -> bool {
        match self {
            RelayEnd::Client(key) => relay.client_key == *key,
            RelayEnd::Host(id) => relay.host_id == *id,
        }
    }
}

fn send(sender: &PeerSender, message: &RouterToPeer) {
    match serde_json::to_vec(message) {
        Ok(payload) => {
            let _ = sender.send(payload);
        }
        Err(e) => error!(error = %e, "failed to encode router message"),
    }
}

fn send_connect_response(
    sender: &PeerSender,
    outcome: ConnectOutcome,
    username: Option<String>,
    peer_kind: Option<ClientKind>,
) {
    send(
        sender,
        &RouterToPeer::ConnectResponse {
            outcome,
            username,
            peer_kind,
        },
    );
}
