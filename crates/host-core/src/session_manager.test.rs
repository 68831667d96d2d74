use std::sync::{Arc, Mutex};
use std::time::Duration;

use fv_types::{config::HostConfig, ipc::ServiceToUi, router::RouterState, ClientKind, HostId, SessionId};

use super::*;
use crate::client_session::ClientCapabilities;
use crate::desktop::NullPipelineFactory;
use crate::ipc::{accept_stream, UiChannel, UiEvent};
use crate::user_session::UserSessionState;

#[derive(Default)]
struct TestTransport {
    closed: Mutex<bool>,
}

impl ClientTransport for TestTransport {
    fn send(&self, _payload: Vec<u8>) -> HostResult<()> {
        Ok(())
    }
    fn close(&self) {
        *self.closed.lock().unwrap() = true;
    }
    fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap()
    }
}

async fn ipc_pair(session_id: u32) -> (IpcChannel, UiChannel) {
    let (service_stream, helper_stream) = tokio::io::duplex(64 * 1024);
    let accept = tokio::spawn(async move { accept_stream(service_stream).await });
    let ui = UiChannel::from_stream(helper_stream, SessionId(session_id))
        .await
        .unwrap();
    (accept.await.unwrap().unwrap(), ui)
}

fn manager_with(delegate: Arc<RecordingDelegate>, attach_timeout_ms: u64) -> UserSessionManager {
    let config = HostConfig {
        attach_timeout_ms,
        ..HostConfig::default()
    };
    UserSessionManager::start(
        config,
        delegate,
        Arc::new(NullLauncher),
        Arc::new(NullPipelineFactory),
    )
}

async fn wait_until(mut predicate: impl FnMut() -> bool) {
    for _ in 0..100 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn at_most_one_session_per_os_session() {
    let delegate = Arc::new(RecordingDelegate::default());
    let manager = manager_with(delegate.clone(), 60_000);

    let (channel_a, _ui_a) = ipc_pair(1).await;
    manager.add_user_session(channel_a).await.unwrap();
    assert_eq!(manager.session_count(), 1);

    // A second helper connection for the same OS session re-attaches instead
    // of creating a duplicate.
    let (channel_b, _ui_b) = ipc_pair(1).await;
    manager.add_user_session(channel_b).await.unwrap();
    assert_eq!(manager.session_count(), 1);
    assert_eq!(
        manager.session(SessionId(1)).unwrap().state(),
        UserSessionState::Started
    );
}

#[tokio::test]
async fn concurrent_host_id_requests_resolve_independently() {
    let delegate = Arc::new(RecordingDelegate::default());
    let manager = manager_with(delegate.clone(), 60_000);

    let (channel_a, _ui_a) = ipc_pair(1).await;
    let (channel_b, _ui_b) = ipc_pair(2).await;
    manager.add_user_session(channel_a).await.unwrap();
    manager.add_user_session(channel_b).await.unwrap();

    // Both sessions ask for an id on start; the requests reach the delegate
    // tagged with their session names.
    wait_until(|| {
        let requests = delegate.host_id_requests.lock().unwrap();
        requests.contains(&"console:1".to_string()) && requests.contains(&"console:2".to_string())
    })
    .await;

    manager.set_host_id("console:1", HostId(10));
    manager.set_host_id("console:2", HostId(20));

    assert_eq!(manager.session(SessionId(1)).unwrap().host_id(), HostId(10));
    assert_eq!(manager.session(SessionId(2)).unwrap().host_id(), HostId(20));
}

#[tokio::test]
async fn clients_route_to_the_session_holding_the_host_id() {
    let delegate = Arc::new(RecordingDelegate::default());
    let manager = manager_with(delegate.clone(), 60_000);

    let (channel_a, _ui_a) = ipc_pair(1).await;
    let (channel_b, _ui_b) = ipc_pair(2).await;
    manager.add_user_session(channel_a).await.unwrap();
    manager.add_user_session(channel_b).await.unwrap();
    manager.set_host_id("console:1", HostId(10));
    manager.set_host_id("console:2", HostId(20));

    let transport = Arc::new(TestTransport::default());
    let id = manager
        .add_new_session(
            ClientKind::Desktop,
            "alice",
            HostId(20),
            transport.clone(),
            ClientCapabilities::default(),
        )
        .unwrap();

    assert_eq!(manager.session(SessionId(2)).unwrap().client_count(), (1, 0));
    assert_eq!(manager.session(SessionId(1)).unwrap().client_count(), (0, 0));
    assert!(manager.session(SessionId(2)).unwrap().has_client(id));
}

#[tokio::test]
async fn unknown_host_id_closes_the_client() {
    let delegate = Arc::new(RecordingDelegate::default());
    let manager = manager_with(delegate.clone(), 60_000);

    let transport = Arc::new(TestTransport::default());
    let result = manager.add_new_session(
        ClientKind::Desktop,
        "alice",
        HostId(99),
        transport.clone(),
        ClientCapabilities::default(),
    );

    assert!(matches!(result, Err(HostError::NoActiveSession(HostId(99)))));
    assert!(transport.is_closed());
}

#[tokio::test]
async fn admin_peers_are_not_routed_to_sessions() {
    let delegate = Arc::new(RecordingDelegate::default());
    let manager = manager_with(delegate.clone(), 60_000);

    let transport = Arc::new(TestTransport::default());
    let result = manager.add_new_session(
        ClientKind::Admin,
        "root",
        HostId(1),
        transport.clone(),
        ClientCapabilities::default(),
    );

    assert!(matches!(result, Err(HostError::UnroutableKind(ClientKind::Admin))));
    assert!(transport.is_closed());
}

#[tokio::test(start_paused = true)]
async fn reaped_session_resets_its_host_id() {
    let delegate = Arc::new(RecordingDelegate::default());
    let manager = manager_with(delegate.clone(), 50);

    let (channel, ui) = ipc_pair(1).await;
    manager.add_user_session(channel).await.unwrap();
    manager.set_host_id("console:1", HostId(10));

    ui.close();
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(manager.session_count(), 0);
    assert_eq!(delegate.reset_host_ids.lock().unwrap().as_slice(), &[HostId(10)]);
}

#[tokio::test]
async fn kill_client_session_reaches_into_the_owning_session() {
    let delegate = Arc::new(RecordingDelegate::default());
    let manager = manager_with(delegate.clone(), 60_000);

    let (channel, mut ui) = ipc_pair(1).await;
    manager.add_user_session(channel).await.unwrap();
    manager.set_host_id("console:1", HostId(10));

    let transport = Arc::new(TestTransport::default());
    let id = manager
        .add_new_session(
            ClientKind::FileTransfer,
            "bob",
            HostId(10),
            transport.clone(),
            ClientCapabilities::default(),
        )
        .unwrap();

    assert!(manager.kill_client_session(id));
    assert!(transport.is_closed());
    assert_eq!(manager.session(SessionId(1)).unwrap().client_count(), (0, 0));

    // Helper learns about the disconnect.
    let mut saw_disconnect = false;
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(100), ui.recv()).await {
        if let UiEvent::Message(ServiceToUi::DisconnectEvent { id: got }) = event {
            assert_eq!(got, id);
            saw_disconnect = true;
            break;
        }
    }
    assert!(saw_disconnect);
}

#[tokio::test]
async fn session_events_spawn_helpers_for_new_arrivals() {
    let delegate = Arc::new(RecordingDelegate::default());
    let manager = manager_with(delegate.clone(), 60_000);

    manager.handle_session_event(SessionStatus::SessionLogon, SessionId(7));
    assert_eq!(manager.session_count(), 1);
    let session = manager.session(SessionId(7)).unwrap();
    assert_eq!(session.state(), UserSessionState::Detached);

    // The helper then connects over IPC and attaches.
    let (channel, _ui) = ipc_pair(7).await;
    manager.add_user_session(channel).await.unwrap();
    assert_eq!(manager.session_count(), 1);
    assert_eq!(session.state(), UserSessionState::Started);

    // Router state fans out to the session.
    manager.set_router_state(RouterState::connected("router.example:8060"));
}
