use std::sync::{Arc, Mutex};
use std::time::Duration;

use fv_types::{
    config::HostConfig,
    ipc::ServiceToUi,
    router::RouterState,
    ClientKind, HostId, SessionId,
};
use tokio::sync::mpsc;

use super::*;
use crate::client_session::{ClientCapabilities, ClientSession, ClientTransport};
use crate::desktop::{CapturePipeline, NullCapturePipeline};
use crate::error::HostResult;
use crate::ipc::{accept_stream, IpcChannel, UiChannel, UiEvent};

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

/// Factory that keeps every pipeline it hands out so tests can inspect it.
#[derive(Default)]
struct TestPipelineFactory {
    created: Mutex<Vec<Arc<NullCapturePipeline>>>,
}

impl TestPipelineFactory {
    fn last(&self) -> Arc<NullCapturePipeline> {
        self.created.lock().unwrap().last().unwrap().clone()
    }
}

impl crate::desktop::DesktopPipelineFactory for TestPipelineFactory {
    fn create(&self, _session_id: SessionId) -> Arc<dyn CapturePipeline> {
        let pipeline = Arc::new(NullCapturePipeline::default());
        self.created.lock().unwrap().push(pipeline.clone());
        pipeline
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

fn test_config(attach_timeout_ms: u64) -> HostConfig {
    HostConfig {
        attach_timeout_ms,
        capture_idle_grace_ms: 60_000,
        ..HostConfig::default()
    }
}

async fn drain_ui(ui: &mut UiChannel, window: Duration) -> Vec<ServiceToUi> {
    let mut messages = Vec::new();
    loop {
        match tokio::time::timeout(window, ui.recv()).await {
            Ok(Some(UiEvent::Message(m))) => messages.push(m),
            Ok(Some(UiEvent::Disconnected)) | Ok(None) | Err(_) => break,
        }
    }
    messages
}

fn add_two_clients(session: &Arc<UserSession>) -> (u32, u32) {
    let desktop = ClientSession::new(1, ClientKind::Desktop, "alice", Arc::new(TestTransport::default()));
    let file = ClientSession::new(2, ClientKind::FileTransfer, "alice", Arc::new(TestTransport::default()));
    session.add_client(desktop, ClientCapabilities::default()).unwrap();
    session.add_client(file, ClientCapabilities::default()).unwrap();
    (1, 2)
}

#[tokio::test]
async fn reattach_preserves_clients_and_reissues_state() {
    let (notices_tx, mut notices_rx) = mpsc::unbounded_channel();
    let factory = TestPipelineFactory::default();
    let session = UserSession::new(
        SessionId(5),
        UserSessionType::Console,
        test_config(5_000),
        notices_tx,
        &factory,
    );

    let (channel, mut ui) = ipc_pair(5).await;
    session.set_router_state(RouterState::connected("router.example:8060"));
    session.start(Some(channel));
    session.set_host_id(HostId(42));
    assert_eq!(session.state(), UserSessionState::Started);

    add_two_clients(&session);
    let initial = drain_ui(&mut ui, Duration::from_millis(100)).await;
    assert_eq!(
        initial
            .iter()
            .filter(|m| matches!(m, ServiceToUi::ConnectEvent { .. }))
            .count(),
        2
    );

    // Helper goes away: the session detaches but keeps its clients.
    ui.close();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(session.state(), UserSessionState::Detached);
    assert_eq!(session.client_count(), (1, 1));
    assert!(matches!(
        notices_rx.try_recv(),
        Ok(SessionNotice::HostIdRequest { .. }) | Ok(SessionNotice::CredentialsChanged { .. }) | Ok(SessionNotice::Detached { .. })
    ));

    // A new helper arrives inside the attach window.
    let (channel2, mut ui2) = ipc_pair(5).await;
    session.restart(channel2).unwrap();
    assert_eq!(session.state(), UserSessionState::Started);
    assert_eq!(session.client_count(), (1, 1));

    let reissued = drain_ui(&mut ui2, Duration::from_millis(100)).await;
    assert!(reissued.iter().any(|m| matches!(m, ServiceToUi::RouterState(rs) if rs.connected)));
    assert!(reissued.iter().any(|m| matches!(m, ServiceToUi::HostId(id) if *id == HostId(42))));
    assert!(reissued.iter().any(|m| matches!(m, ServiceToUi::Credentials { .. })));
    assert!(
        !reissued.iter().any(|m| matches!(m, ServiceToUi::ConnectEvent { .. })),
        "existing clients must not be announced again"
    );
}

#[tokio::test(start_paused = true)]
async fn attach_timeout_reaps_the_session() {
    let (notices_tx, mut notices_rx) = mpsc::unbounded_channel();
    let factory = TestPipelineFactory::default();
    let session = UserSession::new(
        SessionId(3),
        UserSessionType::Console,
        test_config(50),
        notices_tx,
        &factory,
    );

    let (channel, ui) = ipc_pair(3).await;
    session.start(Some(channel));
    add_two_clients(&session);

    ui.close();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(session.state(), UserSessionState::Finished);
    assert_eq!(session.client_count(), (0, 0));
    assert!(factory.last().calls().contains(&"stop"), "desktop must be released");

    let mut finished = 0;
    while let Ok(notice) = notices_rx.try_recv() {
        if matches!(notice, SessionNotice::Finished { .. }) {
            finished += 1;
        }
    }
    assert_eq!(finished, 1, "finished notice fires exactly once");
}

#[tokio::test(start_paused = true)]
async fn finished_session_emits_no_further_notices() {
    let (notices_tx, mut notices_rx) = mpsc::unbounded_channel();
    let factory = TestPipelineFactory::default();
    let session = UserSession::new(
        SessionId(9),
        UserSessionType::Console,
        test_config(50),
        notices_tx,
        &factory,
    );
    session.start(None);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(session.state(), UserSessionState::Finished);
    while notices_rx.try_recv().is_ok() {}

    // Post-finish operations are inert.
    session.finish();
    session.set_host_id(HostId(7));
    session.set_router_state(RouterState::connected("elsewhere:1"));
    let client = ClientSession::new(8, ClientKind::Desktop, "mallory", Arc::new(TestTransport::default()));
    assert!(session.add_client(client, ClientCapabilities::default()).is_err());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(notices_rx.try_recv().is_err());
    assert_eq!(session.host_id(), HostId::INVALID);
}

#[tokio::test]
async fn detached_session_rejects_new_clients() {
    let (notices_tx, _notices_rx) = mpsc::unbounded_channel();
    let factory = TestPipelineFactory::default();
    let session = UserSession::new(
        SessionId(4),
        UserSessionType::Console,
        test_config(60_000),
        notices_tx,
        &factory,
    );
    session.start(None);
    assert_eq!(session.state(), UserSessionState::Detached);

    let client = ClientSession::new(1, ClientKind::Desktop, "alice", Arc::new(TestTransport::default()));
    assert!(matches!(
        session.add_client(client, ClientCapabilities::default()),
        Err(crate::error::HostError::SessionDetached(_))
    ));
}

#[tokio::test]
async fn kill_client_session_searches_both_lists() {
    let (notices_tx, _notices_rx) = mpsc::unbounded_channel();
    let factory = TestPipelineFactory::default();
    let session = UserSession::new(
        SessionId(6),
        UserSessionType::Console,
        test_config(60_000),
        notices_tx,
        &factory,
    );
    let (channel, mut ui) = ipc_pair(6).await;
    session.start(Some(channel));

    let transport = Arc::new(TestTransport::default());
    let file = ClientSession::new(11, ClientKind::FileTransfer, "bob", transport.clone());
    session.add_client(file, ClientCapabilities::default()).unwrap();

    assert!(session.kill_client_session(11));
    assert!(!session.kill_client_session(11));
    assert!(transport.is_closed());

    let messages = drain_ui(&mut ui, Duration::from_millis(100)).await;
    assert!(messages
        .iter()
        .any(|m| matches!(m, ServiceToUi::DisconnectEvent { id: 11 })));
}

#[tokio::test]
async fn client_limit_is_enforced() {
    let (notices_tx, _notices_rx) = mpsc::unbounded_channel();
    let factory = TestPipelineFactory::default();
    let config = HostConfig {
        max_clients_per_host: 1,
        ..test_config(60_000)
    };
    let session = UserSession::new(SessionId(2), UserSessionType::Console, config, notices_tx, &factory);
    let (channel, _ui) = ipc_pair(2).await;
    session.start(Some(channel));

    let first = ClientSession::new(1, ClientKind::Desktop, "a", Arc::new(TestTransport::default()));
    session.add_client(first, ClientCapabilities::default()).unwrap();

    let second = ClientSession::new(2, ClientKind::Desktop, "b", Arc::new(TestTransport::default()));
    assert!(matches!(
        session.add_client(second, ClientCapabilities::default()),
        Err(crate::error::HostError::ClientLimitReached { limit: 1, .. })
    ));
}

#[tokio::test]
async fn credentials_request_rotates_the_password() {
    let (notices_tx, _notices_rx) = mpsc::unbounded_channel();
    let factory = TestPipelineFactory::default();
    let session = UserSession::new(
        SessionId(8),
        UserSessionType::Console,
        test_config(60_000),
        notices_tx,
        &factory,
    );
    let (channel, mut ui) = ipc_pair(8).await;
    session.start(Some(channel));

    let first_batch = drain_ui(&mut ui, Duration::from_millis(100)).await;
    let first_password = first_batch
        .iter()
        .find_map(|m| match m {
            ServiceToUi::Credentials { password, .. } => Some(password.clone()),
            _ => None,
        })
        .expect("attach issues credentials");

    ui.send(fv_types::ipc::UiToService::CredentialsRequest).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second_batch = drain_ui(&mut ui, Duration::from_millis(100)).await;
    let second_password = second_batch
        .iter()
        .find_map(|m| match m {
            ServiceToUi::Credentials { password, .. } => Some(password.clone()),
            _ => None,
        })
        .expect("request issues fresh credentials");

    assert_ne!(first_password, second_password);
    assert_eq!(second_password.len(), crate::credentials::DEFAULT_PASSWORD_LENGTH);
}
