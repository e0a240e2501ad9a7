//! End-to-end scenarios over loopback TCP

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use chatrelay_protocol::{ApplicationMessage, FrameCodec};

use crate::config::ServerConfig;
use crate::state::{SharedState, SHUTDOWN_NOTICE};
use crate::tcp;

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(150);

type Client = Framed<TcpStream, FrameCodec>;

struct Relay {
    addr: SocketAddr,
    state: SharedState,
}

async fn start_relay() -> Relay {
    let config = ServerConfig {
        bind_address: "127.0.0.1".into(),
        port: 0,
        ..Default::default()
    };
    let listener = tcp::bind(&config).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = SharedState::new(config);
    tokio::spawn(tcp::run_accept_loop(listener, state.clone()));
    Relay { addr, state }
}

async fn connect(relay: &Relay) -> Client {
    let stream = TcpStream::connect(relay.addr).await.unwrap();
    Framed::new(stream, FrameCodec::new())
}

/// Connect and join, consuming the welcome notice and first roster
async fn join(relay: &Relay, identity: &str) -> Client {
    let mut client = connect(relay).await;
    client.send(ApplicationMessage::join(identity)).await.unwrap();
    expect_notice(&mut client, &format!("Connected to relay as {}", identity)).await;
    match recv(&mut client).await {
        ApplicationMessage::Roster { .. } => {}
        other => panic!("expected roster, got {:?}", other),
    }
    client
}

async fn recv(client: &mut Client) -> ApplicationMessage {
    tokio::time::timeout(WAIT, client.next())
        .await
        .expect("timed out waiting for a message")
        .expect("connection closed")
        .expect("undecodable frame")
}

async fn expect_notice(client: &mut Client, expected: &str) {
    match recv(client).await {
        ApplicationMessage::SystemNotice {
            text,
            timestamp: Some(_),
        } => assert_eq!(text, expected),
        other => panic!("expected notice {:?}, got {:?}", expected, other),
    }
}

async fn expect_roster(client: &mut Client, expected: &[&str]) {
    match recv(client).await {
        ApplicationMessage::Roster {
            identities,
            timestamp: Some(_),
        } => assert_eq!(identities, expected),
        other => panic!("expected roster {:?}, got {:?}", expected, other),
    }
}

async fn expect_chat(client: &mut Client, sender: &str, expected: &str) {
    match recv(client).await {
        ApplicationMessage::Chat {
            text,
            sender_identity,
            timestamp: Some(_),
        } => {
            assert_eq!(text, expected);
            assert_eq!(sender_identity.as_deref(), Some(sender));
        }
        other => panic!("expected chat {:?}, got {:?}", expected, other),
    }
}

async fn expect_direct(client: &mut Client, sender: &str, target: &str, expected: &str) {
    match recv(client).await {
        ApplicationMessage::Direct {
            text,
            target_identity,
            sender_identity,
            timestamp: Some(_),
        } => {
            assert_eq!(text, expected);
            assert_eq!(target_identity, target);
            assert_eq!(sender_identity.as_deref(), Some(sender));
        }
        other => panic!("expected direct {:?}, got {:?}", expected, other),
    }
}

async fn expect_closed(client: &mut Client) {
    match tokio::time::timeout(WAIT, client.next()).await {
        Ok(None) | Ok(Some(Err(_))) => {}
        Ok(Some(Ok(message))) => panic!("expected close, got {:?}", message),
        Err(_) => panic!("connection was not closed"),
    }
}

async fn expect_quiet(client: &mut Client) {
    if let Ok(next) = tokio::time::timeout(QUIET, client.next()).await {
        panic!("expected silence, got {:?}", next);
    }
}

// ==================== Scenarios ====================

#[tokio::test]
async fn test_alice_bob_chat_and_departure() {
    let relay = start_relay().await;

    let mut alice = join(&relay, "Alice").await;
    let mut bob = join(&relay, "Bob").await;

    expect_notice(&mut alice, "Bob joined").await;
    expect_roster(&mut alice, &["Alice", "Bob"]).await;

    alice
        .send(ApplicationMessage::chat("hi bob"))
        .await
        .unwrap();
    expect_chat(&mut alice, "Alice", "hi bob").await;
    expect_chat(&mut bob, "Alice", "hi bob").await;

    drop(bob);
    expect_notice(&mut alice, "Bob left").await;
    expect_roster(&mut alice, &["Alice"]).await;
    expect_quiet(&mut alice).await;
}

#[tokio::test]
async fn test_joiner_sees_full_roster() {
    let relay = start_relay().await;

    let _alice = join(&relay, "Alice").await;
    let mut bob = connect(&relay).await;
    bob.send(ApplicationMessage::join("Bob")).await.unwrap();

    expect_notice(&mut bob, "Connected to relay as Bob").await;
    expect_roster(&mut bob, &["Alice", "Bob"]).await;
    expect_quiet(&mut bob).await;
}

#[tokio::test]
async fn test_duplicate_alice_rejected() {
    let relay = start_relay().await;
    let mut alice = join(&relay, "Alice").await;

    let mut imposter = connect(&relay).await;
    imposter
        .send(ApplicationMessage::join("Alice"))
        .await
        .unwrap();
    expect_closed(&mut imposter).await;

    // The first Alice sees nothing and keeps working
    expect_quiet(&mut alice).await;
    alice.send(ApplicationMessage::chat("still me")).await.unwrap();
    expect_chat(&mut alice, "Alice", "still me").await;
    assert_eq!(relay.state.registry.identities(), vec!["Alice"]);
}

#[tokio::test]
async fn test_identity_reusable_after_departure() {
    let relay = start_relay().await;

    let alice = join(&relay, "Alice").await;
    drop(alice);

    tokio::time::timeout(WAIT, async {
        while !relay.state.registry.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("departure never processed");

    let _again = join(&relay, "Alice").await;
}

#[tokio::test]
async fn test_direct_message_online_target() {
    let relay = start_relay().await;

    let mut alice = join(&relay, "Alice").await;
    let mut bob = join(&relay, "Bob").await;
    let mut carol = join(&relay, "Carol").await;

    // Drain join announcements
    expect_notice(&mut alice, "Bob joined").await;
    expect_roster(&mut alice, &["Alice", "Bob"]).await;
    expect_notice(&mut alice, "Carol joined").await;
    expect_roster(&mut alice, &["Alice", "Bob", "Carol"]).await;
    expect_notice(&mut bob, "Carol joined").await;
    expect_roster(&mut bob, &["Alice", "Bob", "Carol"]).await;

    alice
        .send(ApplicationMessage::direct("Bob", "psst"))
        .await
        .unwrap();

    expect_direct(&mut bob, "Alice", "Bob", "psst").await;
    expect_direct(&mut alice, "Alice", "Bob", "psst").await;
    expect_quiet(&mut carol).await;
    expect_quiet(&mut bob).await;
}

#[tokio::test]
async fn test_direct_message_offline_target() {
    let relay = start_relay().await;

    let mut alice = join(&relay, "Alice").await;
    let mut bob = join(&relay, "Bob").await;
    expect_notice(&mut alice, "Bob joined").await;
    expect_roster(&mut alice, &["Alice", "Bob"]).await;

    alice
        .send(ApplicationMessage::direct("Dave", "anyone?"))
        .await
        .unwrap();

    expect_notice(&mut alice, "User Dave not found").await;
    expect_quiet(&mut bob).await;
}

#[tokio::test]
async fn test_client_cannot_forge_sender() {
    let relay = start_relay().await;
    let mut alice = join(&relay, "Alice").await;

    alice
        .send(ApplicationMessage::Chat {
            text: "I am root".into(),
            sender_identity: Some("root".into()),
            timestamp: Some(0),
        })
        .await
        .unwrap();

    match recv(&mut alice).await {
        ApplicationMessage::Chat {
            sender_identity,
            timestamp,
            ..
        } => {
            assert_eq!(sender_identity.as_deref(), Some("Alice"));
            assert_ne!(timestamp, Some(0));
        }
        other => panic!("expected chat, got {:?}", other),
    }
}

#[tokio::test]
async fn test_large_multibyte_message() {
    let relay = start_relay().await;
    let mut alice = join(&relay, "Алиса").await;

    let text = "привет, 世界 🎉 ".repeat(10_000);
    alice.send(ApplicationMessage::chat(text.clone())).await.unwrap();
    expect_chat(&mut alice, "Алиса", &text).await;
}

#[tokio::test]
async fn test_handshake_violation_closes_without_registering() {
    let relay = start_relay().await;
    let mut watcher = join(&relay, "Watcher").await;

    let mut rude = connect(&relay).await;
    rude.send(ApplicationMessage::chat("let me in"))
        .await
        .unwrap();
    expect_closed(&mut rude).await;

    expect_quiet(&mut watcher).await;
    assert_eq!(relay.state.registry.identities(), vec!["Watcher"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_joins() {
    let relay = start_relay().await;
    let names: Vec<String> = (0..8).map(|i| format!("user-{}", i)).collect();

    let mut tasks = Vec::new();
    for name in &names {
        let addr = relay.addr;
        let name = name.clone();
        tasks.push(tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            let mut client = Framed::new(stream, FrameCodec::new());
            client.send(ApplicationMessage::join(name)).await.unwrap();
            client
        }));
    }

    let mut clients = Vec::new();
    for task in tasks {
        clients.push(task.await.unwrap());
    }

    // Every client eventually sees a roster of exactly the joined set
    for client in &mut clients {
        loop {
            if let ApplicationMessage::Roster { identities, .. } = recv(client).await {
                if identities == names {
                    break;
                }
                assert!(identities.len() < names.len());
            }
        }
    }
    assert_eq!(relay.state.registry.identities(), names);
}

#[tokio::test]
async fn test_shutdown_notifies_everyone() {
    let relay = start_relay().await;

    let mut alice = join(&relay, "Alice").await;
    let mut bob = join(&relay, "Bob").await;
    expect_notice(&mut alice, "Bob joined").await;
    expect_roster(&mut alice, &["Alice", "Bob"]).await;

    relay.state.shutdown().await;

    for client in [&mut alice, &mut bob] {
        expect_notice(client, SHUTDOWN_NOTICE).await;
        expect_closed(client).await;
    }
    assert!(relay.state.registry.is_empty());

    // Listener is gone or refuses to hand out new sessions
    if let Ok(stream) = TcpStream::connect(relay.addr).await {
        let mut late = Framed::new(stream, FrameCodec::new());
        let _ = late.send(ApplicationMessage::join("Late")).await;
        expect_closed(&mut late).await;
    }
}
