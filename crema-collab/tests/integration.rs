//! Integration tests for end-to-end WebSocket RPC.
//!
//! These tests start a real server and connect real clients,
//! verifying requests, faults and callbacks over the wire.

use crema_collab::client::{ConnectionState, CremaClient};
use crema_collab::context::CreateDomain;
use crema_collab::domain::{DomainContent, DomainTable};
use crema_collab::protocol::{Callback, CallbackMessage};
use crema_collab::server::{CremaServer, ServerConfig};
use crema_collab::DomainEventKind;
use crema_core::{Authority, CloseReason, DomainAccessType, DomainRowInfo, DomainState};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

struct TestServer {
    _dir: TempDir,
    server: Arc<CremaServer>,
    url: String,
}

/// Start a server with seeded users on a free port.
async fn start_test_server() -> TestServer {
    let dir = TempDir::new().unwrap();
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..ServerConfig::for_testing(dir.path().join("db"))
    };
    let server = Arc::new(CremaServer::open(config).unwrap());
    let registry = server.registry();
    registry.add_user("admin", "Admin", "admin", Authority::Admin).await.unwrap();
    registry.add_user("alice", "Alice", "pw", Authority::Member).await.unwrap();
    registry.add_user("bob", "Bob", "pw", Authority::Member).await.unwrap();

    let runner = server.clone();
    tokio::spawn(async move {
        runner.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    TestServer {
        _dir: dir,
        server,
        url: format!("ws://127.0.0.1:{port}"),
    }
}

struct Session {
    client: CremaClient,
    callbacks: mpsc::UnboundedReceiver<CallbackMessage>,
    peer_token: Uuid,
    token: Uuid,
}

/// Connect, subscribe both services and log `user_id` in.
async fn open_session(url: &str, user_id: &str, password: &str) -> Session {
    let mut client = CremaClient::connect(url).await.unwrap();
    let callbacks = client.take_callback_rx().unwrap();
    let peer_token = client.subscribe().await.unwrap().into_result().unwrap();
    let token = client.login(user_id, password).await.unwrap().into_result().unwrap();
    client
        .subscribe_domains(peer_token)
        .await
        .unwrap()
        .into_result()
        .unwrap();
    Session {
        client,
        callbacks,
        peer_token,
        token,
    }
}

async fn next_callback<F>(session: &mut Session, mut accept: F) -> CallbackMessage
where
    F: FnMut(&Callback) -> bool,
{
    loop {
        let message = timeout(Duration::from_secs(2), session.callbacks.recv())
            .await
            .expect("callback timed out")
            .expect("callback channel closed");
        if accept(&message.callback) {
            return message;
        }
    }
}

fn is_event(callback: &Callback, name: &str) -> bool {
    matches!(callback, Callback::Domain(kind) if kind.name() == name)
}

fn items(data_base_id: Uuid) -> CreateDomain {
    CreateDomain {
        data_base_id,
        item_path: "/tables/Items".into(),
        item_type: "TableContent".into(),
        domain_type: "TableContentDomain".into(),
        content: DomainContent::new().with_table(
            "Items",
            DomainTable::new(vec!["Name".into(), "Price".into()], vec!["Id".into()]),
        ),
    }
}

fn row(id: i64, name: &str, price: f64) -> DomainRowInfo {
    DomainRowInfo::new("Items", vec![json!(id)])
        .with_field("Name", json!(name))
        .with_field("Price", json!(price))
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let server = start_test_server().await;
    let result = tokio_tungstenite::connect_async(&server.url).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_login_lifecycle() {
    let server = start_test_server().await;
    let client = CremaClient::connect(&server.url).await.unwrap();
    assert_eq!(client.state().await, ConnectionState::Connected);
    assert!(client.ping().await.is_ok());

    let early = client.login("alice", "pw").await.unwrap();
    assert_eq!(early.fault_type(), Some("InvalidOperation"));

    let peer_token = client.subscribe().await.unwrap().into_result().unwrap();
    let wrong = client.login("alice", "nope").await.unwrap();
    assert_eq!(wrong.fault_type(), Some("AuthenticationFailed"));

    let token = client.login("alice", "pw").await.unwrap().into_result().unwrap();
    assert_eq!(client.is_alive(token).await.unwrap().value, Some(true));

    let snapshot = client.subscribe_domains(peer_token).await.unwrap().into_result().unwrap();
    assert!(snapshot.is_empty());

    assert!(client.logout(token).await.unwrap().is_ok());
    assert_eq!(client.is_alive(token).await.unwrap().value, Some(false));
    assert!(client.unsubscribe(peer_token).await.unwrap().is_ok());
}

#[tokio::test]
async fn test_domain_editing_between_clients() {
    let server = start_test_server().await;
    let mut alice = open_session(&server.url, "alice", "pw").await;
    let mut bob = open_session(&server.url, "bob", "pw").await;

    let created = alice
        .client
        .create_domain(alice.token, items(Uuid::new_v4()))
        .await
        .unwrap();
    assert!(created.task_id.is_some());
    let domain_id = created.value.unwrap().domain_id;

    let message = next_callback(&mut bob, |c| is_event(c, "DomainsCreated")).await;
    assert_eq!(message.info.signature_date.id, "alice");

    let content = alice
        .client
        .enter_domain(alice.token, domain_id, DomainAccessType::ReadWrite)
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert!(content["tables"]["Items"].is_object());
    bob.client
        .enter_domain(bob.token, domain_id, DomainAccessType::Read)
        .await
        .unwrap()
        .into_result()
        .unwrap();

    let added = alice
        .client
        .new_row(alice.token, domain_id, vec![row(1, "apple", 1.5)])
        .await
        .unwrap();
    let task_id = added.task_id.unwrap();
    let message = next_callback(&mut bob, |c| is_event(c, "RowAdded")).await;
    match message.callback {
        Callback::Domain(DomainEventKind::RowAdded { rows, task_id: event_task, .. }) => {
            assert_eq!(rows.len(), 1);
            assert_eq!(event_task, task_id);
        }
        other => panic!("Expected RowAdded, got {other:?}"),
    }
    next_callback(&mut bob, |c| {
        matches!(c, Callback::Domain(DomainEventKind::TaskCompleted { task_ids }) if task_ids.contains(&task_id))
    })
    .await;

    let denied = bob
        .client
        .set_row(bob.token, domain_id, vec![row(1, "pear", 2.0)])
        .await
        .unwrap();
    assert_eq!(denied.fault_type(), Some("PermissionDenied"));
    assert_eq!(denied.signature_date.id, "bob");

    let metadata = alice
        .client
        .get_metadata(alice.token, None)
        .await
        .unwrap()
        .into_result()
        .unwrap();
    let domain = metadata.find(domain_id).unwrap();
    assert_eq!(domain.domain_state, DomainState::Active);
    assert_eq!(domain.owner_id.as_deref(), Some("alice"));
    assert_eq!(domain.users.len(), 2);
}

#[tokio::test]
async fn test_kick_sends_expiry_callback() {
    let server = start_test_server().await;
    let admin = open_session(&server.url, "admin", "admin").await;
    let mut alice = open_session(&server.url, "alice", "pw").await;

    let kicked = admin.client.kick_user(admin.token, "alice", "maintenance").await.unwrap();
    assert!(kicked.is_ok());

    let message = next_callback(&mut alice, |c| matches!(c, Callback::AuthenticationExpired { .. })).await;
    assert_eq!(
        message.callback,
        Callback::AuthenticationExpired {
            token: alice.token,
            reason: CloseReason::Kicked,
        }
    );

    let after = alice.client.get_metadata(alice.token, None).await.unwrap();
    assert_eq!(after.fault_type(), Some("InvalidToken"));
}

#[tokio::test]
async fn test_disconnect_detaches_participant() {
    let server = start_test_server().await;
    let mut admin = open_session(&server.url, "admin", "admin").await;
    let mut alice = open_session(&server.url, "alice", "pw").await;

    let domain_id = admin
        .client
        .create_domain(admin.token, items(Uuid::new_v4()))
        .await
        .unwrap()
        .value
        .unwrap()
        .domain_id;
    alice
        .client
        .enter_domain(alice.token, domain_id, DomainAccessType::ReadWrite)
        .await
        .unwrap()
        .into_result()
        .unwrap();
    next_callback(&mut admin, |c| is_event(c, "UserAdded")).await;

    let alice_token = alice.token;
    alice.client.disconnect().await;
    drop(alice);

    let message = next_callback(&mut admin, |c| {
        matches!(c, Callback::Domain(DomainEventKind::UserStateChanged { user_state, .. }) if !user_state.is_online)
    })
    .await;
    match message.callback {
        Callback::Domain(DomainEventKind::UserStateChanged { user_id, user_state, .. }) => {
            assert_eq!(user_id, "alice");
            assert!(!user_state.is_online);
        }
        other => panic!("Expected UserStateChanged, got {other:?}"),
    }
    assert!(!server.server.registry().is_alive(alice_token).await);
    assert!(server.server.peers().get(admin.peer_token).is_some());
    assert_eq!(server.server.peers().len(), 1);
}

#[tokio::test]
async fn test_delete_domain_over_the_wire() {
    let server = start_test_server().await;
    let mut admin = open_session(&server.url, "admin", "admin").await;
    let data_base_id = Uuid::new_v4();

    let domain_id = admin
        .client
        .create_domain(admin.token, items(data_base_id))
        .await
        .unwrap()
        .value
        .unwrap()
        .domain_id;

    let deleted = admin.client.delete_domain(admin.token, domain_id, false).await.unwrap();
    assert!(deleted.is_ok());
    let message = next_callback(&mut admin, |c| is_event(c, "DomainsDeleted")).await;
    match message.callback {
        Callback::Domain(DomainEventKind::DomainsDeleted { domain_ids, is_canceleds }) => {
            assert_eq!(domain_ids, vec![domain_id]);
            assert_eq!(is_canceleds, vec![false]);
        }
        other => panic!("Expected DomainsDeleted, got {other:?}"),
    }

    let again = admin.client.delete_domain(admin.token, domain_id, true).await.unwrap();
    assert_eq!(again.fault_type(), Some("DomainNotFound"));

    let remaining = admin
        .client
        .delete_domains(admin.token, data_base_id)
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert!(remaining.is_empty());
}

#[tokio::test]
async fn test_callback_indices_are_consecutive() {
    let server = start_test_server().await;
    let mut alice = open_session(&server.url, "alice", "pw").await;
    for n in 0..3 {
        let mut request = items(Uuid::new_v4());
        request.item_path = format!("/tables/Items{n}");
        alice.client.create_domain(alice.token, request).await.unwrap().into_result().unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut indices = Vec::new();
    while let Ok(message) = alice.callbacks.try_recv() {
        indices.push(message.info.index);
    }
    assert!(indices.len() >= 3);
    assert_eq!(indices[0], 1);
    assert!(indices.windows(2).all(|w| w[1] == w[0] + 1));
}
