//! One connected remote peer inside a user session.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use fv_types::ClientKind;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::desktop::{ClipboardEvent, DesktopControl, DesktopEvent, DesktopSessionProxy, ScreenInfo};
use crate::error::HostResult;

/// Lifecycle of a client session. Transitions only move forward.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ClientState {
    Handshaking,
    Configured,
    Closed,
}

/// Capabilities negotiated while configuring.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientCapabilities {
    pub clipboard: bool,
    /// Grants the admin input-override in the shared input slot.
    pub admin_input: bool,
    /// Screen the viewer wants initially, when not the primary one.
    pub screen: Option<u32>,
}

/// Byte pipe back to the remote peer. The relay plumbing implements this;
/// tests substitute an in-memory recorder.
pub trait ClientTransport: Send + Sync {
    fn send(&self, payload: Vec<u8>) -> HostResult<()>;
    fn close(&self);
    fn is_closed(&self) -> bool;
}

/// Desktop artifacts in the form they cross the wire to a viewer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ViewerEvent {
    Frame {
        screen_id: u32,
        sequence: u64,
        data: String,
    },
    ScreenList {
        screens: Vec<ScreenInfo>,
    },
    Clipboard {
        event: ClipboardEvent,
    },
}

impl From<DesktopEvent> for ViewerEvent {
    fn from(event: DesktopEvent) -> Self {
        match event {
            DesktopEvent::Frame(frame) => ViewerEvent::Frame {
                screen_id: frame.screen_id,
                sequence: frame.sequence,
                data: fv_types::wire::encode_base64(&frame.data),
            },
            DesktopEvent::ScreenList(screens) => ViewerEvent::ScreenList { screens },
            DesktopEvent::Clipboard(event) => ViewerEvent::Clipboard { event },
        }
    }
}

/// Per-remote-peer state owned by exactly one user session.
pub struct ClientSession {
    id: u32,
    kind: ClientKind,
    username: String,
    state: ClientState,
    capabilities: ClientCapabilities,
    transport: Arc<dyn ClientTransport>,
    forward_task: Option<JoinHandle<()>>,
    created_at: DateTime<Utc>,
}

impl ClientSession {
    pub fn new(id: u32, kind: ClientKind, username: impl Into<String>, transport: Arc<dyn ClientTransport>) -> Self {
        Self {
            id,
            kind,
            username: username.into(),
            state: ClientState::Handshaking,
            capabilities: ClientCapabilities::default(),
            transport,
            forward_task: None,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn kind(&self) -> ClientKind {
        self.kind
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Finish capability negotiation. Desktop sessions subscribe to the
    /// shared proxy here; the subscription starts with the first frame
    /// captured after this call.
    pub fn configure(&mut self, capabilities: ClientCapabilities, proxy: Option<&Arc<DesktopSessionProxy>>) {
        if self.state != ClientState::Handshaking {
            debug!(id = self.id, state = ?self.state, "configure ignored in current state");
            return;
        }
        self.capabilities = capabilities;
        self.state = ClientState::Configured;

        if self.kind == ClientKind::Desktop {
            if let Some(proxy) = proxy {
                if let Some(screen) = self.capabilities.screen {
                    proxy.control(self.id, DesktopControl::SelectScreen { screen_id: screen });
                }
                let mut rx = proxy.subscribe(self.id, self.capabilities.clipboard, self.capabilities.admin_input);
                let transport = self.transport.clone();
                let id = self.id;
                self.forward_task = Some(tokio::spawn(async move {
                    while let Some(event) = rx.recv().await {
                        let viewer: ViewerEvent = event.into();
                        let payload = match serde_json::to_vec(&viewer) {
                            Ok(p) => p,
                            Err(e) => {
                                debug!(id, error = %e, "failed to encode viewer event");
                                continue;
                            }
                        };
                        if transport.send(payload).is_err() {
                            break;
                        }
                    }
                }));
            }
        }
    }

    /// Apply a control payload arriving from the peer. Only configured
    /// desktop sessions may drive the pipeline.
    pub fn handle_control(&self, proxy: &Arc<DesktopSessionProxy>, payload: &[u8]) {
        if self.state != ClientState::Configured || self.kind != ClientKind::Desktop {
            return;
        }
        match serde_json::from_slice::<DesktopControl>(payload) {
            Ok(request) => proxy.control(self.id, request),
            Err(e) => debug!(id = self.id, error = %e, "malformed control payload dropped"),
        }
    }

    /// Tear the session down. Idempotent.
    pub fn close(&mut self, proxy: Option<&Arc<DesktopSessionProxy>>) {
        if self.state == ClientState::Closed {
            return;
        }
        if self.kind == ClientKind::Desktop {
            if let Some(proxy) = proxy {
                proxy.unsubscribe(self.id);
            }
        }
        if let Some(task) = self.forward_task.take() {
            task.abort();
        }
        self.transport.close();
        self.state = ClientState::Closed;
    }

    pub fn is_closed(&self) -> bool {
        self.state == ClientState::Closed
    }

    pub fn transport_closed(&self) -> bool {
        self.transport.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::desktop::NullCapturePipeline;

    #[derive(Default)]
    pub struct RecordingTransport {
        pub sent: Mutex<Vec<Vec<u8>>>,
        pub closed: Mutex<bool>,
    }

    impl ClientTransport for RecordingTransport {
        fn send(&self, payload: Vec<u8>) -> HostResult<()> {
            self.sent.lock().unwrap().push(payload);
            Ok(())
        }
        fn close(&self) {
            *self.closed.lock().unwrap() = true;
        }
        fn is_closed(&self) -> bool {
            *self.closed.lock().unwrap()
        }
    }

    fn proxy() -> Arc<DesktopSessionProxy> {
        DesktopSessionProxy::new(Arc::new(NullCapturePipeline::default()), Duration::from_secs(30))
    }

    #[tokio::test]
    async fn desktop_session_receives_frames_after_configure() {
        let proxy = proxy();
        let transport = Arc::new(RecordingTransport::default());
        let mut session = ClientSession::new(1, ClientKind::Desktop, "alice", transport.clone());
        assert_eq!(session.state(), ClientState::Handshaking);

        session.configure(
            ClientCapabilities {
                clipboard: true,
                ..Default::default()
            },
            Some(&proxy),
        );
        assert_eq!(session.state(), ClientState::Configured);

        let seq = proxy.begin_capture();
        proxy.handle_frame(seq, 0, vec![9, 9]);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let event: ViewerEvent = serde_json::from_slice(&sent[0]).unwrap();
        match event {
            ViewerEvent::Frame { sequence, data, .. } => {
                assert_eq!(sequence, seq);
                assert_eq!(fv_types::wire::decode_base64(&data).unwrap(), vec![9, 9]);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_unsubscribes_and_closes_the_transport() {
        let proxy = proxy();
        let transport = Arc::new(RecordingTransport::default());
        let mut session = ClientSession::new(2, ClientKind::Desktop, "bob", transport.clone());
        session.configure(ClientCapabilities::default(), Some(&proxy));
        assert_eq!(proxy.subscriber_count(), 1);

        session.close(Some(&proxy));
        assert_eq!(session.state(), ClientState::Closed);
        assert_eq!(proxy.subscriber_count(), 0);
        assert!(transport.is_closed());

        // Idempotent.
        session.close(Some(&proxy));
        assert_eq!(session.state(), ClientState::Closed);
    }

    #[tokio::test]
    async fn file_transfer_sessions_do_not_subscribe() {
        let proxy = proxy();
        let transport = Arc::new(RecordingTransport::default());
        let mut session = ClientSession::new(3, ClientKind::FileTransfer, "carol", transport);
        session.configure(ClientCapabilities::default(), Some(&proxy));
        assert_eq!(session.state(), ClientState::Configured);
        assert_eq!(proxy.subscriber_count(), 0);
    }
}
