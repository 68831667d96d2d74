//! Supervisor for one interactive OS session.
//!
//! A user session owns the IPC channel to its in-session UI helper, the set
//! of connected client sessions, and the shared desktop proxy. The helper
//! process comes and goes with logons, locks, and crashes; the session rides
//! those out as DETACHED and only gives up after the attach timeout.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use fv_types::{
    config::{HostConfig, PasswordRotation},
    ipc::{ServiceToUi, UiToService},
    router::RouterState,
    ClientKind, HostId, SessionId,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::client_session::{ClientCapabilities, ClientSession};
use crate::credentials;
use crate::desktop::{DesktopPipelineFactory, DesktopSessionProxy};
use crate::error::{HostError, HostResult};
use crate::ipc::{IpcChannel, IpcEvent, IpcSender};
use crate::session_manager::SessionStatus;

/// Kind of interactive session this supervisor covers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UserSessionType {
    Console,
    Rdp,
}

impl UserSessionType {
    pub fn label(self) -> &'static str {
        match self {
            UserSessionType::Console => "console",
            UserSessionType::Rdp => "rdp",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UserSessionState {
    Started,
    Detached,
    Finished,
}

/// Notifications a session posts to its owning manager. Tagged with the
/// session so one fan-in channel serves the whole manager.
#[derive(Debug)]
pub enum SessionNotice {
    HostIdRequest { session_name: String },
    CredentialsChanged { session_id: SessionId },
    Detached { session_id: SessionId },
    Finished { session_id: SessionId, host_id: HostId },
}

const HOST_ID_RETRY_INITIAL: Duration = Duration::from_secs(1);
const HOST_ID_RETRY_CAP: Duration = Duration::from_secs(30);

struct SessionInner {
    state: UserSessionState,
    ipc: Option<IpcSender>,
    host_id: HostId,
    /// One-time access password; regenerated per rotation policy. Never logged.
    password: Option<String>,
    router_state: RouterState,
    desktop_clients: Vec<ClientSession>,
    file_clients: Vec<ClientSession>,
    /// Bumped whenever the attach timer must be invalidated.
    attach_generation: u64,
    host_id_pending: bool,
}

pub struct UserSession {
    os_session_id: SessionId,
    session_type: UserSessionType,
    config: HostConfig,
    notices: mpsc::UnboundedSender<SessionNotice>,
    desktop: Arc<DesktopSessionProxy>,
    inner: Mutex<SessionInner>,
    weak_self: std::sync::Weak<Self>,
}

impl UserSession {
    pub fn new(
        os_session_id: SessionId,
        session_type: UserSessionType,
        config: HostConfig,
        notices: mpsc::UnboundedSender<SessionNotice>,
        pipelines: &dyn DesktopPipelineFactory,
    ) -> Arc<Self> {
        let idle_grace = Duration::from_millis(config.capture_idle_grace_ms);
        let desktop = DesktopSessionProxy::new(pipelines.create(os_session_id), idle_grace);
        Arc::new_cyclic(|weak_self| Self {
            os_session_id,
            session_type,
            config,
            notices,
            desktop,
            inner: Mutex::new(SessionInner {
                state: UserSessionState::Detached,
                ipc: None,
                host_id: HostId::INVALID,
                password: None,
                router_state: RouterState::default(),
                desktop_clients: Vec::new(),
                file_clients: Vec::new(),
                attach_generation: 0,
                host_id_pending: false,
            }),
            weak_self: weak_self.clone(),
        })
    }

    pub fn os_session_id(&self) -> SessionId {
        self.os_session_id
    }

    pub fn session_type(&self) -> UserSessionType {
        self.session_type
    }

    pub fn session_name(&self) -> String {
        format!("{}:{}", self.session_type.label(), self.os_session_id)
    }

    pub fn state(&self) -> UserSessionState {
        self.lock().state
    }

    pub fn host_id(&self) -> HostId {
        self.lock().host_id
    }

    pub fn desktop_proxy(&self) -> Arc<DesktopSessionProxy> {
        self.desktop.clone()
    }

    /// Initial wiring. With a channel the session starts attached; without
    /// one it starts DETACHED with the attach timer already running.
    pub fn start(&self, channel: Option<IpcChannel>) {
        if self.config.password_rotation == PasswordRotation::Never {
            let mut inner = self.lock();
            if inner.password.is_none() {
                inner.password = Some(credentials::generate_one_time_password(
                    credentials::DEFAULT_PASSWORD_LENGTH,
                ));
            }
        }

        match channel {
            Some(channel) => self.bind_channel(channel),
            None => {
                let generation = {
                    let mut inner = self.lock();
                    inner.state = UserSessionState::Detached;
                    inner.attach_generation += 1;
                    inner.attach_generation
                };
                self.start_attach_timer(generation);
            }
        }

        if !self.host_id().is_valid() {
            self.request_host_id();
        }
    }

    /// Rebind a fresh helper channel onto a detached session.
    ///
    /// The attach timer is cancelled, router state, host id, and credentials
    /// are re-issued on the new channel, and the existing client sessions are
    /// preserved untouched.
    pub fn restart(&self, channel: IpcChannel) -> HostResult<()> {
        {
            let inner = self.lock();
            if inner.state == UserSessionState::Finished {
                return Err(HostError::SessionFinished(self.os_session_id));
            }
        }
        info!(session = %self.session_name(), "helper reattached");
        self.bind_channel(channel);
        Ok(())
    }

    fn bind_channel(&self, channel: IpcChannel) {
        let (_sid, sender, mut events) = channel.into_parts();
        {
            let mut inner = self.lock();
            if let Some(old) = inner.ipc.take() {
                old.close();
            }
            inner.ipc = Some(sender);
            inner.state = UserSessionState::Started;
            inner.attach_generation += 1;
        }

        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(session) = weak.upgrade() else { break };
                match event {
                    IpcEvent::Message(message) => session.on_ipc_message(message),
                    IpcEvent::Disconnected => {
                        session.on_ipc_disconnected();
                        break;
                    }
                }
            }
        });

        // Re-issue everything the helper needs to render its state.
        let rotate = self.config.password_rotation == PasswordRotation::PerSession;
        self.update_credentials(rotate);
        let mut inner = self.lock();
        let router_state = inner.router_state.clone();
        let host_id = inner.host_id;
        Self::send_to_helper(&mut inner, ServiceToUi::RouterState(router_state));
        if host_id.is_valid() {
            Self::send_to_helper(&mut inner, ServiceToUi::HostId(host_id));
        }
    }

    fn on_ipc_message(&self, message: UiToService) {
        match message {
            UiToService::Hello { .. } => {}
            UiToService::HostIdRequest { .. } => {
                let host_id = self.host_id();
                if host_id.is_valid() {
                    let mut inner = self.lock();
                    Self::send_to_helper(&mut inner, ServiceToUi::HostId(host_id));
                } else {
                    self.request_host_id();
                }
            }
            UiToService::CredentialsRequest => self.update_credentials(true),
            UiToService::ConnectConfirmation { id, accept } => {
                if !accept {
                    self.kill_client_session(id);
                }
            }
            UiToService::KillClient { id } => {
                self.kill_client_session(id);
            }
        }
    }

    fn on_ipc_disconnected(&self) {
        let generation = {
            let mut inner = self.lock();
            if inner.state != UserSessionState::Started {
                return;
            }
            inner.state = UserSessionState::Detached;
            inner.ipc = None;
            inner.attach_generation += 1;
            inner.attach_generation
        };
        info!(session = %self.session_name(), "helper detached");
        let _ = self.notices.send(SessionNotice::Detached {
            session_id: self.os_session_id,
        });
        self.start_attach_timer(generation);
    }

    fn start_attach_timer(&self, generation: u64) {
        let weak = self.weak_self.clone();
        let timeout = Duration::from_millis(self.config.attach_timeout_ms);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(session) = weak.upgrade() {
                session.on_attach_timeout(generation);
            }
        });
    }

    fn on_attach_timeout(&self, generation: u64) {
        {
            let inner = self.lock();
            if inner.state != UserSessionState::Detached || inner.attach_generation != generation {
                return;
            }
        }
        warn!(session = %self.session_name(), "attach timeout elapsed, finishing session");
        self.finish();
    }

    /// Add a negotiated client session. Only valid while STARTED.
    pub fn add_client(
        &self,
        mut client: ClientSession,
        capabilities: ClientCapabilities,
    ) -> HostResult<()> {
        let mut inner = self.lock();
        match inner.state {
            UserSessionState::Started => {}
            UserSessionState::Detached => return Err(HostError::SessionDetached(self.os_session_id)),
            UserSessionState::Finished => return Err(HostError::SessionFinished(self.os_session_id)),
        }

        let total = inner.desktop_clients.len() + inner.file_clients.len();
        if total as u32 >= self.config.max_clients_per_host {
            return Err(HostError::ClientLimitReached {
                session_id: self.os_session_id,
                limit: self.config.max_clients_per_host,
            });
        }

        let event = ServiceToUi::ConnectEvent {
            id: client.id(),
            kind: client.kind(),
            username: client.username().to_string(),
        };
        match client.kind() {
            ClientKind::Desktop => {
                client.configure(capabilities, Some(&self.desktop));
                inner.desktop_clients.push(client);
            }
            ClientKind::FileTransfer => {
                client.configure(capabilities, None);
                inner.file_clients.push(client);
            }
            ClientKind::Admin => return Err(HostError::UnroutableKind(ClientKind::Admin)),
        }
        Self::send_to_helper(&mut inner, event);
        drop(inner);

        if self.config.password_rotation == PasswordRotation::PerConnection {
            self.update_credentials(true);
        }
        Ok(())
    }

    /// OS-level transition hook fed by the manager.
    pub fn set_session_event(&self, status: SessionStatus, session_id: SessionId) {
        if session_id != self.os_session_id {
            return;
        }
        match status {
            SessionStatus::SessionLock
            | SessionStatus::SessionLogoff
            | SessionStatus::ConsoleDisconnect
            | SessionStatus::RemoteDisconnect => {
                let sender = {
                    let inner = self.lock();
                    inner.ipc.clone()
                };
                if let Some(sender) = sender {
                    // Closing the channel drives the normal detach path.
                    sender.close();
                }
            }
            SessionStatus::SessionUnlock
            | SessionStatus::SessionLogon
            | SessionStatus::ConsoleConnect
            | SessionStatus::RemoteConnect => {
                // Re-attach happens through the manager relaunching the
                // helper, which lands in restart().
            }
        }
    }

    pub fn set_router_state(&self, router_state: RouterState) {
        let mut inner = self.lock();
        if inner.state == UserSessionState::Finished {
            return;
        }
        inner.router_state = router_state.clone();
        Self::send_to_helper(&mut inner, ServiceToUi::RouterState(router_state));
    }

    pub fn set_host_id(&self, host_id: HostId) {
        let mut inner = self.lock();
        if inner.state == UserSessionState::Finished {
            return;
        }
        inner.host_id = host_id;
        inner.host_id_pending = false;
        Self::send_to_helper(&mut inner, ServiceToUi::HostId(host_id));
    }

    /// Close one client by id. Searches both lists.
    pub fn kill_client_session(&self, id: u32) -> bool {
        let mut inner = self.lock();
        let desktop = self.desktop.clone();
        let mut found = false;
        if let Some(pos) = inner.desktop_clients.iter().position(|c| c.id() == id) {
            let mut client = inner.desktop_clients.remove(pos);
            client.close(Some(&desktop));
            found = true;
        } else if let Some(pos) = inner.file_clients.iter().position(|c| c.id() == id) {
            let mut client = inner.file_clients.remove(pos);
            client.close(None);
            found = true;
        }
        if found {
            Self::send_to_helper(&mut inner, ServiceToUi::DisconnectEvent { id });
        }
        found
    }

    /// Peer-side failure of one client: same cleanup as a kill.
    pub fn on_client_disconnected(&self, id: u32) {
        if self.kill_client_session(id) {
            debug!(session = %self.session_name(), client = id, "client dropped");
        }
    }

    /// Route an opaque payload from a connected peer into its session.
    pub fn on_client_payload(&self, id: u32, payload: &[u8]) {
        let inner = self.lock();
        if let Some(client) = inner.desktop_clients.iter().find(|c| c.id() == id) {
            client.handle_control(&self.desktop, payload);
        }
    }

    pub fn has_client(&self, id: u32) -> bool {
        let inner = self.lock();
        inner.desktop_clients.iter().any(|c| c.id() == id) || inner.file_clients.iter().any(|c| c.id() == id)
    }

    pub fn client_count(&self) -> (usize, usize) {
        let inner = self.lock();
        (inner.desktop_clients.len(), inner.file_clients.len())
    }

    /// Regenerate (or reuse) the one-time password and push it to the helper.
    fn update_credentials(&self, regenerate: bool) {
        let mut inner = self.lock();
        if inner.state == UserSessionState::Finished {
            return;
        }
        if regenerate || inner.password.is_none() {
            inner.password = Some(credentials::generate_one_time_password(
                credentials::DEFAULT_PASSWORD_LENGTH,
            ));
        }
        let message = ServiceToUi::Credentials {
            host_id: inner.host_id,
            password: inner.password.clone().unwrap_or_default(),
            update_server: self.config.update_server.clone(),
        };
        Self::send_to_helper(&mut inner, message);
        drop(inner);
        let _ = self.notices.send(SessionNotice::CredentialsChanged {
            session_id: self.os_session_id,
        });
    }

    fn request_host_id(&self) {
        {
            let mut inner = self.lock();
            inner.host_id_pending = true;
        }
        let _ = self.notices.send(SessionNotice::HostIdRequest {
            session_name: self.session_name(),
        });

        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            let mut delay = HOST_ID_RETRY_INITIAL;
            loop {
                tokio::time::sleep(delay).await;
                let Some(session) = weak.upgrade() else { break };
                {
                    let inner = session.lock();
                    if !inner.host_id_pending || inner.state == UserSessionState::Finished {
                        break;
                    }
                }
                debug!(session = %session.session_name(), "retrying host id request");
                let _ = session.notices.send(SessionNotice::HostIdRequest {
                    session_name: session.session_name(),
                });
                delay = (delay * 2).min(HOST_ID_RETRY_CAP);
            }
        });
    }

    /// Terminal teardown: clients first, then the desktop, then the channel.
    /// The finished notice fires exactly once.
    pub fn finish(&self) {
        let host_id = {
            let mut inner = self.lock();
            if inner.state == UserSessionState::Finished {
                return;
            }
            inner.state = UserSessionState::Finished;
            inner.attach_generation += 1;
            inner.host_id_pending = false;

            let desktop = self.desktop.clone();
            for mut client in inner.desktop_clients.drain(..) {
                client.close(Some(&desktop));
            }
            for mut client in inner.file_clients.drain(..) {
                client.close(None);
            }
            self.desktop.shutdown();

            if let Some(sender) = inner.ipc.take() {
                sender.close();
            }
            inner.host_id
        };
        info!(session = %self.session_name(), "user session finished");
        let _ = self.notices.send(SessionNotice::Finished {
            session_id: self.os_session_id,
            host_id,
        });
    }

    fn send_to_helper(inner: &mut SessionInner, message: ServiceToUi) {
        if let Some(sender) = &inner.ipc {
            if sender.send(message).is_err() {
                inner.ipc = None;
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionInner> {
        self.inner.lock().expect("user session poisoned")
    }
}

#[cfg(test)]
#[path = "user_session.test.rs"]
mod tests;
