mod common;

use std::sync::Arc;
use std::time::Duration;

use common::set_test_db_env;
use fv_types::{
    config::RouterConfig,
    user::{session_access, user_flags},
    wire::{ConnectOutcome, PeerToRouter, RouterToPeer},
    ClientKind, HostId,
};
use peer_net::{accept_handshake, connect_handshake, IdentityKeyPair, PeerChannel, PeerEvent, PeerRole};
use router_core::{Broker, Directory};
use serial_test::serial;

const DEADLINE: Duration = Duration::from_secs(5);

async fn open_directory(test_name: &str) -> Directory {
    set_test_db_env(test_name);
    Directory::open().await.unwrap()
}

fn test_config() -> RouterConfig {
    RouterConfig {
        listen_endpoint: "127.0.0.1:0".to_string(),
        max_clients_per_host: 8,
        max_sessions_per_client: 8,
        private_key: String::new(),
    }
}

async fn spawn_peer(
    broker: &Arc<Broker>,
    router_key: &IdentityKeyPair,
    identity: &IdentityKeyPair,
    role: PeerRole,
) -> PeerChannel {
    let (server_stream, peer_stream) = tokio::io::duplex(256 * 1024);
    let router_key = router_key.clone();
    let broker = broker.clone();
    tokio::spawn(async move {
        if let Ok(channel) = accept_handshake(server_stream, &router_key, DEADLINE).await {
            broker.handle_connection(channel, None).await;
        }
    });
    connect_handshake(peer_stream, identity, role, DEADLINE).await.unwrap()
}

fn send_msg(channel: &PeerChannel, message: &PeerToRouter) {
    channel.send(serde_json::to_vec(message).unwrap()).unwrap();
}

async fn recv_msg(channel: &mut PeerChannel) -> RouterToPeer {
    match tokio::time::timeout(DEADLINE, channel.recv()).await {
        Ok(Some(PeerEvent::Message(payload))) => serde_json::from_slice(&payload).unwrap(),
        other => panic!("expected a router message, got {other:?}"),
    }
}

async fn recv_disconnect(channel: &mut PeerChannel) {
    match tokio::time::timeout(DEADLINE, channel.recv()).await {
        Ok(Some(PeerEvent::Disconnected)) => {}
        other => panic!("expected disconnect, got {other:?}"),
    }
}

async fn register_host(broker: &Arc<Broker>, router_key: &IdentityKeyPair, identity: &IdentityKeyPair) -> (PeerChannel, HostId) {
    let mut channel = spawn_peer(broker, router_key, identity, PeerRole::Host).await;
    send_msg(&channel, &PeerToRouter::RegisterHost);
    let host_id = match recv_msg(&mut channel).await {
        RouterToPeer::HostRegistered { host_id } => host_id,
        other => panic!("expected registration ack, got {other:?}"),
    };
    match recv_msg(&mut channel).await {
        RouterToPeer::State(state) => assert!(state.connected),
        other => panic!("expected router state, got {other:?}"),
    }
    (channel, host_id)
}

async fn authenticated_client(
    broker: &Arc<Broker>,
    router_key: &IdentityKeyPair,
    username: &str,
    password: &str,
) -> PeerChannel {
    let identity = IdentityKeyPair::generate();
    let mut channel = spawn_peer(broker, router_key, &identity, PeerRole::Client).await;
    send_msg(
        &channel,
        &PeerToRouter::Authenticate {
            username: username.to_string(),
            password: password.to_string(),
        },
    );
    match recv_msg(&mut channel).await {
        RouterToPeer::AuthResult { ok: true } => channel,
        other => panic!("expected successful auth, got {other:?}"),
    }
}

#[tokio::test]
#[serial]
async fn introduction_relays_bytes_both_ways() {
    let directory = open_directory("broker_intro").await;
    directory
        .create_user("admin", "secret", session_access::CLIENT, user_flags::ENABLED)
        .await
        .unwrap();

    let router_key = IdentityKeyPair::generate();
    let broker = Broker::new(test_config(), directory);

    let host_identity = IdentityKeyPair::generate();
    let (mut host, host_id) = register_host(&broker, &router_key, &host_identity).await;
    assert!(host_id.is_valid());

    let mut client = authenticated_client(&broker, &router_key, "admin", "secret").await;
    send_msg(
        &client,
        &PeerToRouter::ConnectRequest {
            host_id,
            kind: ClientKind::Desktop,
        },
    );

    // Both sides learn about the introduction.
    let token = match recv_msg(&mut client).await {
        RouterToPeer::ConnectResponse {
            outcome: ConnectOutcome::Accepted { token, host_id: got },
            ..
        } => {
            assert_eq!(got, host_id);
            token
        }
        other => panic!("expected acceptance, got {other:?}"),
    };
    match recv_msg(&mut host).await {
        RouterToPeer::ConnectResponse {
            outcome: ConnectOutcome::Accepted { token: host_token, .. },
            username,
            peer_kind,
        } => {
            assert_eq!(host_token, token);
            assert_eq!(username.as_deref(), Some("admin"));
            assert_eq!(peer_kind, Some(ClientKind::Desktop));
        }
        other => panic!("expected acceptance on host side, got {other:?}"),
    }

    // Bytes pass opaquely in both directions.
    send_msg(
        &client,
        &PeerToRouter::RelayData {
            token,
            data: b"ping".to_vec(),
        },
    );
    match recv_msg(&mut host).await {
        RouterToPeer::RelayData { token: t, data } => {
            assert_eq!(t, token);
            assert_eq!(data, b"ping");
        }
        other => panic!("expected relay data, got {other:?}"),
    }

    send_msg(
        &host,
        &PeerToRouter::RelayData {
            token,
            data: vec![0, 255, 1, 254],
        },
    );
    match recv_msg(&mut client).await {
        RouterToPeer::RelayData { data, .. } => assert_eq!(data, vec![0, 255, 1, 254]),
        other => panic!("expected relay data, got {other:?}"),
    }

    // Client leaves; the host side of the stream is told.
    client.close();
    recv_disconnect(&mut client).await;
    match recv_msg(&mut host).await {
        RouterToPeer::RelayClose { token: t } => assert_eq!(t, token),
        other => panic!("expected relay close, got {other:?}"),
    }
    assert_eq!(broker.relay_count().await, 0);
}

#[tokio::test]
#[serial]
async fn offline_target_yields_no_host_found_without_side_effects() {
    let directory = open_directory("broker_offline").await;
    directory
        .create_user("admin", "secret", session_access::CLIENT, user_flags::ENABLED)
        .await
        .unwrap();
    let hosts_before = directory.count_hosts().await.unwrap();

    let router_key = IdentityKeyPair::generate();
    let broker = Broker::new(test_config(), directory.clone());

    let mut client = authenticated_client(&broker, &router_key, "admin", "secret").await;
    send_msg(
        &client,
        &PeerToRouter::ConnectRequest {
            host_id: HostId(42),
            kind: ClientKind::Desktop,
        },
    );

    match recv_msg(&mut client).await {
        RouterToPeer::ConnectResponse {
            outcome: ConnectOutcome::NoHostFound,
            ..
        } => {}
        other => panic!("expected no-host-found, got {other:?}"),
    }

    assert_eq!(directory.count_hosts().await.unwrap(), hosts_before);
    assert_eq!(broker.registry().count().await, 0);
    assert_eq!(broker.relay_count().await, 0);
}

#[tokio::test]
#[serial]
async fn bad_credentials_are_rejected_opaquely() {
    let directory = open_directory("broker_badauth").await;
    directory
        .create_user("admin", "secret", session_access::CLIENT, user_flags::ENABLED)
        .await
        .unwrap();

    let router_key = IdentityKeyPair::generate();
    let broker = Broker::new(test_config(), directory);

    let identity = IdentityKeyPair::generate();
    let mut channel = spawn_peer(&broker, &router_key, &identity, PeerRole::Client).await;
    send_msg(
        &channel,
        &PeerToRouter::Authenticate {
            username: "admin".to_string(),
            password: "wrong".to_string(),
        },
    );

    match recv_msg(&mut channel).await {
        RouterToPeer::AuthResult { ok: false } => {}
        other => panic!("expected opaque rejection, got {other:?}"),
    }
    recv_disconnect(&mut channel).await;
}

#[tokio::test]
#[serial]
async fn disabled_users_always_fail_authentication() {
    let directory = open_directory("broker_disabled").await;
    directory
        .create_user("ghost", "secret", session_access::CLIENT, 0)
        .await
        .unwrap();

    let router_key = IdentityKeyPair::generate();
    let broker = Broker::new(test_config(), directory);

    let identity = IdentityKeyPair::generate();
    let mut channel = spawn_peer(&broker, &router_key, &identity, PeerRole::Client).await;
    send_msg(
        &channel,
        &PeerToRouter::Authenticate {
            username: "ghost".to_string(),
            password: "secret".to_string(),
        },
    );

    match recv_msg(&mut channel).await {
        RouterToPeer::AuthResult { ok: false } => {}
        other => panic!("expected rejection, got {other:?}"),
    }
    recv_disconnect(&mut channel).await;
}

#[tokio::test]
#[serial]
async fn admin_kind_requires_admin_access() {
    let directory = open_directory("broker_access").await;
    directory
        .create_user("viewer", "secret", session_access::CLIENT, user_flags::ENABLED)
        .await
        .unwrap();

    let router_key = IdentityKeyPair::generate();
    let broker = Broker::new(test_config(), directory);

    let mut client = authenticated_client(&broker, &router_key, "viewer", "secret").await;
    send_msg(
        &client,
        &PeerToRouter::ConnectRequest {
            host_id: HostId(1),
            kind: ClientKind::Admin,
        },
    );

    match recv_msg(&mut client).await {
        RouterToPeer::ConnectResponse {
            outcome: ConnectOutcome::AccessDenied,
            ..
        } => {}
        other => panic!("expected access denial, got {other:?}"),
    }
    assert_eq!(broker.relay_count().await, 0);
}

#[tokio::test]
#[serial]
async fn per_client_stream_limit_is_enforced() {
    let directory = open_directory("broker_limits").await;
    directory
        .create_user("admin", "secret", session_access::CLIENT, user_flags::ENABLED)
        .await
        .unwrap();

    let router_key = IdentityKeyPair::generate();
    let config = RouterConfig {
        max_sessions_per_client: 1,
        ..test_config()
    };
    let broker = Broker::new(config, directory);

    let host_identity = IdentityKeyPair::generate();
    let (mut host, host_id) = register_host(&broker, &router_key, &host_identity).await;

    let mut client = authenticated_client(&broker, &router_key, "admin", "secret").await;
    send_msg(
        &client,
        &PeerToRouter::ConnectRequest {
            host_id,
            kind: ClientKind::Desktop,
        },
    );
    assert!(matches!(
        recv_msg(&mut client).await,
        RouterToPeer::ConnectResponse {
            outcome: ConnectOutcome::Accepted { .. },
            ..
        }
    ));
    let _ = recv_msg(&mut host).await; // host-side acceptance

    send_msg(
        &client,
        &PeerToRouter::ConnectRequest {
            host_id,
            kind: ClientKind::FileTransfer,
        },
    );
    assert!(matches!(
        recv_msg(&mut client).await,
        RouterToPeer::ConnectResponse {
            outcome: ConnectOutcome::LimitExceeded,
            ..
        }
    ));
}

#[tokio::test]
#[serial]
async fn host_disconnect_evicts_the_registry_and_keeps_the_row() {
    let directory = open_directory("broker_evict").await;
    directory
        .create_user("admin", "secret", session_access::CLIENT, user_flags::ENABLED)
        .await
        .unwrap();

    let router_key = IdentityKeyPair::generate();
    let broker = Broker::new(test_config(), directory.clone());

    let host_identity = IdentityKeyPair::generate();
    let (host, host_id) = register_host(&broker, &router_key, &host_identity).await;

    host.close();
    // Wait for the broker task to run its teardown.
    for _ in 0..100 {
        if broker.registry().count().await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(broker.registry().count().await, 0);

    // Offline now, but the persistent row remains, and a reconnect gets the
    // same id back.
    let mut client = authenticated_client(&broker, &router_key, "admin", "secret").await;
    send_msg(
        &client,
        &PeerToRouter::ConnectRequest {
            host_id,
            kind: ClientKind::Desktop,
        },
    );
    assert!(matches!(
        recv_msg(&mut client).await,
        RouterToPeer::ConnectResponse {
            outcome: ConnectOutcome::NoHostFound,
            ..
        }
    ));

    let (_host2, host_id2) = register_host(&broker, &router_key, &host_identity).await;
    assert_eq!(host_id2, host_id);
}
