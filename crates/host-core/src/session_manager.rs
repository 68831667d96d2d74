//! Accepts helper connections and keeps exactly one user session per
//! interactive OS session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use fv_types::{router::RouterState, ClientKind, HostId, SessionId};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::client_session::{ClientCapabilities, ClientSession, ClientTransport};
use crate::desktop::DesktopPipelineFactory;
use crate::error::{HostError, HostResult};
use crate::ipc::IpcChannel;
use crate::user_session::{SessionNotice, UserSession, UserSessionState, UserSessionType};

/// OS-level interactive session transitions, delivered by the platform
/// collaborator and consumed as opaque state changes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    ConsoleConnect,
    ConsoleDisconnect,
    RemoteConnect,
    RemoteDisconnect,
    SessionLogon,
    SessionLogoff,
    SessionLock,
    SessionUnlock,
}

impl SessionStatus {
    fn is_arrival(self) -> bool {
        matches!(
            self,
            SessionStatus::ConsoleConnect
                | SessionStatus::RemoteConnect
                | SessionStatus::SessionLogon
                | SessionStatus::SessionUnlock
        )
    }

    fn session_type(self) -> UserSessionType {
        match self {
            SessionStatus::RemoteConnect | SessionStatus::RemoteDisconnect => UserSessionType::Rdp,
            _ => UserSessionType::Console,
        }
    }
}

/// Upward surface of the manager.
#[async_trait]
pub trait ManagerDelegate: Send + Sync {
    /// A session wants a Host ID for `session_name`.
    async fn on_host_id_request(&self, session_name: String);
    /// A session holding `host_id` finished; the id is free to drop from the
    /// router registration.
    async fn on_reset_host_id(&self, host_id: HostId);
    /// The set of live sessions changed.
    async fn on_user_list_changed(&self);
}

/// Spawns the UI helper into an OS session. Privilege crossing lives behind
/// this seam.
pub trait SessionProcessLauncher: Send + Sync {
    fn launch(&self, session_id: SessionId) -> HostResult<()>;
}

const LAUNCH_ATTEMPTS: u32 = 3;
const LAUNCH_RETRY_DELAY: Duration = Duration::from_millis(500);

struct ManagerShared {
    sessions: Mutex<HashMap<SessionId, Arc<UserSession>>>,
    router_state: Mutex<RouterState>,
    config: fv_types::config::HostConfig,
    delegate: Arc<dyn ManagerDelegate>,
    launcher: Arc<dyn SessionProcessLauncher>,
    pipelines: Arc<dyn DesktopPipelineFactory>,
    notices_tx: mpsc::UnboundedSender<SessionNotice>,
    next_client_id: AtomicU32,
}

/// Cheaply cloneable handle to the one manager instance.
#[derive(Clone)]
pub struct UserSessionManager {
    shared: Arc<ManagerShared>,
}

impl UserSessionManager {
    pub fn start(
        config: fv_types::config::HostConfig,
        delegate: Arc<dyn ManagerDelegate>,
        launcher: Arc<dyn SessionProcessLauncher>,
        pipelines: Arc<dyn DesktopPipelineFactory>,
    ) -> Self {
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ManagerShared {
            sessions: Mutex::new(HashMap::new()),
            router_state: Mutex::new(RouterState::default()),
            config,
            delegate,
            launcher,
            pipelines,
            notices_tx,
            next_client_id: AtomicU32::new(1),
        });
        tokio::spawn(Self::run_notices(Arc::downgrade(&shared), notices_rx));
        Self { shared }
    }

    async fn run_notices(shared: Weak<ManagerShared>, mut rx: mpsc::UnboundedReceiver<SessionNotice>) {
        while let Some(notice) = rx.recv().await {
            let Some(shared) = shared.upgrade() else { break };
            match notice {
                SessionNotice::HostIdRequest { session_name } => {
                    shared.delegate.on_host_id_request(session_name).await;
                }
                SessionNotice::CredentialsChanged { session_id } => {
                    debug!(session = %session_id, "credentials rotated");
                }
                SessionNotice::Detached { session_id } => {
                    info!(session = %session_id, "session detached, awaiting helper");
                }
                SessionNotice::Finished { session_id, host_id } => {
                    let removed = shared
                        .sessions
                        .lock()
                        .expect("manager sessions poisoned")
                        .remove(&session_id)
                        .is_some();
                    if removed {
                        info!(session = %session_id, "session reaped");
                        if host_id.is_valid() {
                            shared.delegate.on_reset_host_id(host_id).await;
                        }
                        shared.delegate.on_user_list_changed().await;
                    }
                }
            }
        }
    }

    /// Feed an OS session transition in. Arrivals with no live session spawn
    /// the helper; everything is forwarded to the matching session.
    pub fn handle_session_event(&self, status: SessionStatus, session_id: SessionId) {
        let existing = self.session(session_id);
        match &existing {
            Some(session) => session.set_session_event(status, session_id),
            None if status.is_arrival() => {
                let session = UserSession::new(
                    session_id,
                    status.session_type(),
                    self.shared.config.clone(),
                    self.shared.notices_tx.clone(),
                    self.shared.pipelines.as_ref(),
                );
                session.set_router_state(self.cached_router_state());
                session.start(None);
                self.shared
                    .sessions
                    .lock()
                    .expect("manager sessions poisoned")
                    .insert(session_id, session);
                self.start_session_process(session_id);
            }
            None => debug!(session = %session_id, ?status, "event for unknown session dropped"),
        }
    }

    /// Launch the in-session helper, retrying transient failures.
    pub fn start_session_process(&self, session_id: SessionId) {
        let launcher = self.shared.launcher.clone();
        tokio::spawn(async move {
            for attempt in 1..=LAUNCH_ATTEMPTS {
                match launcher.launch(session_id) {
                    Ok(()) => return,
                    Err(e) => {
                        warn!(session = %session_id, attempt, error = %e, "helper launch failed");
                        tokio::time::sleep(LAUNCH_RETRY_DELAY * attempt).await;
                    }
                }
            }
            warn!(session = %session_id, "giving up on helper launch");
        });
    }

    /// A helper connected over IPC: create its session or re-attach the
    /// existing one.
    pub async fn add_user_session(&self, channel: IpcChannel) -> HostResult<()> {
        let session_id = channel.session_id();
        if let Some(session) = self.session(session_id) {
            return session.restart(channel);
        }

        let session = UserSession::new(
            session_id,
            UserSessionType::Console,
            self.shared.config.clone(),
            self.shared.notices_tx.clone(),
            self.shared.pipelines.as_ref(),
        );
        session.set_router_state(self.cached_router_state());
        session.start(Some(channel));
        self.shared
            .sessions
            .lock()
            .expect("manager sessions poisoned")
            .insert(session_id, session);
        self.shared.delegate.on_user_list_changed().await;
        Ok(())
    }

    pub fn set_router_state(&self, router_state: RouterState) {
        *self.shared.router_state.lock().expect("router state poisoned") = router_state.clone();
        for session in self.all_sessions() {
            session.set_router_state(router_state.clone());
        }
    }

    /// Deliver a Host ID answer, resolved by session name.
    pub fn set_host_id(&self, session_name: &str, host_id: HostId) {
        for session in self.all_sessions() {
            if session.session_name() == session_name {
                session.set_host_id(host_id);
                return;
            }
        }
        debug!(session_name, "host id answer for unknown session dropped");
    }

    /// Route an accepted remote peer into the session registered under
    /// `target`. Closes the transport when nothing can take it.
    pub fn add_new_session(
        &self,
        kind: ClientKind,
        username: impl Into<String>,
        target: HostId,
        transport: Arc<dyn ClientTransport>,
        capabilities: ClientCapabilities,
    ) -> HostResult<u32> {
        if kind == ClientKind::Admin {
            transport.close();
            return Err(HostError::UnroutableKind(kind));
        }

        let Some(session) = self
            .all_sessions()
            .into_iter()
            .find(|s| s.host_id() == target && s.state() == UserSessionState::Started)
        else {
            transport.close();
            return Err(HostError::NoActiveSession(target));
        };

        let id = self.shared.next_client_id.fetch_add(1, Ordering::Relaxed);
        let client = ClientSession::new(id, kind, username, transport);
        session.add_client(client, capabilities)?;
        Ok(id)
    }

    /// Kill one client wherever it lives.
    pub fn kill_client_session(&self, client_id: u32) -> bool {
        self.all_sessions()
            .into_iter()
            .any(|s| s.kill_client_session(client_id))
    }

    pub fn on_client_disconnected(&self, client_id: u32) {
        for session in self.all_sessions() {
            if session.has_client(client_id) {
                session.on_client_disconnected(client_id);
                return;
            }
        }
    }

    pub fn route_client_payload(&self, client_id: u32, payload: &[u8]) {
        for session in self.all_sessions() {
            if session.has_client(client_id) {
                session.on_client_payload(client_id, payload);
                return;
            }
        }
    }

    pub fn session(&self, session_id: SessionId) -> Option<Arc<UserSession>> {
        self.shared
            .sessions
            .lock()
            .expect("manager sessions poisoned")
            .get(&session_id)
            .cloned()
    }

    pub fn session_count(&self) -> usize {
        self.shared.sessions.lock().expect("manager sessions poisoned").len()
    }

    fn all_sessions(&self) -> Vec<Arc<UserSession>> {
        self.shared
            .sessions
            .lock()
            .expect("manager sessions poisoned")
            .values()
            .cloned()
            .collect()
    }

    fn cached_router_state(&self) -> RouterState {
        self.shared.router_state.lock().expect("router state poisoned").clone()
    }

    /// Accept helper connections until the listener fails.
    #[cfg(unix)]
    pub async fn serve_ipc(&self, server: crate::ipc::IpcServer) {
        loop {
            match server.accept().await {
                Ok(channel) => {
                    info!(session = %channel.session_id(), "helper connected");
                    if let Err(e) = self.add_user_session(channel).await {
                        warn!(error = %e, "failed to bind helper channel");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "IPC accept failed");
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            }
        }
    }
}

/// Launcher that does nothing. Used when helpers connect on their own (and
/// in tests).
#[derive(Default)]
pub struct NullLauncher;

impl SessionProcessLauncher for NullLauncher {
    fn launch(&self, session_id: SessionId) -> HostResult<()> {
        debug!(session = %session_id, "helper launch elided");
        Ok(())
    }
}

/// Delegate that records calls. Useful to embedders as a stand-in and to
/// tests as an observer.
#[derive(Default)]
pub struct RecordingDelegate {
    pub host_id_requests: Mutex<Vec<String>>,
    pub reset_host_ids: Mutex<Vec<HostId>>,
    pub user_list_changes: AtomicU32,
}

#[async_trait]
impl ManagerDelegate for RecordingDelegate {
    async fn on_host_id_request(&self, session_name: String) {
        self.host_id_requests
            .lock()
            .expect("delegate poisoned")
            .push(session_name);
    }

    async fn on_reset_host_id(&self, host_id: HostId) {
        self.reset_host_ids.lock().expect("delegate poisoned").push(host_id);
    }

    async fn on_user_list_changed(&self) {
        self.user_list_changes.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
#[path = "session_manager.test.rs"]
mod tests;
