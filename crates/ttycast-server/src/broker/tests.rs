use super::*;
use crate::auth::profile::MemoryProfileStore;
use crate::auth::{hash_password, ConfigCredentials};
use crate::config::{CliOverrides, ConfigFile, GameSection, ServerSection, UserSection};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

fn user(admin: bool, account_hold: bool) -> UserSection {
    UserSection {
        password_sha256: hash_password("secret"),
        admin,
        account_hold,
        banned: false,
    }
}

fn broker(root: &Path, script: &str, max_connections: usize) -> Broker {
    let game = GameSection {
        name: Some("Test Game".into()),
        binary: "/bin/sh".into(),
        args: vec!["-c".into(), script.into()],
        socket_path: root.join("sockets").to_string_lossy().into_owned(),
        lock_path: root.join("locks").to_string_lossy().into_owned(),
        transcript_path: Some(root.join("ttyrec/%n").to_string_lossy().into_owned()),
        morgue_url: None,
        env: BTreeMap::from([("PATH".to_string(), "/bin:/usr/bin".to_string())]),
        cwd: None,
        socket_arg: "-webtiles-socket".into(),
        extra_args: Vec::new(),
        allowed_with_hold: false,
    };
    let file = ConfigFile {
        server: ServerSection {
            max_connections,
            ..ServerSection::default()
        },
        games: BTreeMap::from([("test".to_string(), game)]),
        users: BTreeMap::from([
            ("Alice".to_string(), user(false, false)),
            ("bob".to_string(), user(false, false)),
            ("held".to_string(), user(false, true)),
        ]),
    };
    let config = Arc::new(ServerConfig::from_file(file, CliOverrides::default()));
    let credentials = Arc::new(ConfigCredentials::new(&config.users));
    Broker::new(config, credentials, Arc::new(MemoryProfileStore::default()))
}

fn connect(broker: &mut Broker, conn: ConnId) -> mpsc::UnboundedReceiver<OutboundFrame> {
    let (tx, rx) = mpsc::unbounded_channel();
    broker.handle_event(BrokerEvent::Connected {
        conn,
        remote: "127.0.0.1:5000".parse().unwrap(),
        compression: false,
        outbound: tx,
    });
    rx
}

fn send(broker: &mut Broker, conn: ConnId, text: &str) {
    broker.handle_event(BrokerEvent::ClientText {
        conn,
        text: text.to_string(),
    });
}

/// Every message delivered so far; a close frame shows up as `"<close>"`.
fn drain(rx: &mut mpsc::UnboundedReceiver<OutboundFrame>) -> Vec<Value> {
    let mut msgs = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        match frame {
            OutboundFrame::Text(batch) => {
                let batch: Value = serde_json::from_str(&batch).unwrap();
                msgs.extend(batch["msgs"].as_array().unwrap().iter().cloned());
            }
            OutboundFrame::Binary(_) => panic!("unexpected compressed frame"),
            OutboundFrame::Close => msgs.push(Value::String("<close>".into())),
        }
    }
    msgs
}

fn tags(msgs: &[Value]) -> Vec<String> {
    msgs.iter()
        .map(|m| match m {
            Value::String(s) => s.clone(),
            m => m["msg"].as_str().unwrap_or_default().to_string(),
        })
        .collect()
}

fn find<'a>(msgs: &'a [Value], tag: &str) -> Option<&'a Value> {
    msgs.iter().find(|m| m["msg"] == tag)
}

async fn pump_until(broker: &mut Broker, mut done: impl FnMut(&Broker) -> bool) {
    while !done(broker) {
        let event = tokio::time::timeout(Duration::from_secs(10), broker.next_event())
            .await
            .expect("broker stalled")
            .unwrap();
        broker.handle_event(event);
    }
}

fn login(broker: &mut Broker, conn: ConnId, name: &str) {
    send(
        broker,
        conn,
        &format!(r#"{{"msg":"login","username":"{name}","password":"secret"}}"#),
    );
}

#[tokio::test]
async fn new_connection_gets_lobby_snapshot() {
    let dir = TempDir::new().unwrap();
    let mut broker = broker(dir.path(), "exit 0", 10);
    let mut rx = connect(&mut broker, 1);
    assert_eq!(
        tags(&drain(&mut rx)),
        vec!["ping", "lobby_clear", "lobby_complete"]
    );
    assert!(broker.connections[&1].heartbeat.is_some());
    assert!(!broker.connections[&1].received_pong);
}

#[tokio::test]
async fn heartbeat_without_pong_times_out() {
    let dir = TempDir::new().unwrap();
    let mut broker = broker(dir.path(), "exit 0", 10);
    let mut answering = connect(&mut broker, 1);
    let mut silent = connect(&mut broker, 2);
    drain(&mut answering);
    drain(&mut silent);

    send(&mut broker, 1, r#"{"msg":"pong"}"#);
    broker.handle_event(BrokerEvent::Heartbeat { conn: 1 });
    broker.handle_event(BrokerEvent::Heartbeat { conn: 2 });

    assert_eq!(tags(&drain(&mut answering)), vec!["ping"]);
    assert!(!broker.connections[&1].received_pong);

    let msgs = drain(&mut silent);
    assert_eq!(tags(&msgs), vec!["close", "<close>"]);
    assert_eq!(msgs[0]["reason"], TIMED_OUT);
    assert!(!broker.connections.contains_key(&2));
}

#[tokio::test]
async fn connections_beyond_limit_are_refused() {
    let dir = TempDir::new().unwrap();
    let mut broker = broker(dir.path(), "exit 0", 1);
    let _first = connect(&mut broker, 1);
    let mut second = connect(&mut broker, 2);
    let msgs = drain(&mut second);
    assert_eq!(tags(&msgs), vec!["close", "<close>"]);
    assert_eq!(msgs[0]["reason"], MAX_CONNECTIONS_REACHED);
    assert!(!broker.connections.contains_key(&2));
}

#[tokio::test]
async fn login_success_and_failure() {
    let dir = TempDir::new().unwrap();
    let mut broker = broker(dir.path(), "exit 0", 10);
    let mut rx = connect(&mut broker, 1);
    drain(&mut rx);

    send(
        &mut broker,
        1,
        r#"{"msg":"login","username":"alice","password":"wrong"}"#,
    );
    assert_eq!(tags(&drain(&mut rx)), vec!["login_fail"]);

    login(&mut broker, 1, "alice");
    let msgs = drain(&mut rx);
    let success = find(&msgs, "login_success").unwrap();
    assert_eq!(success["username"], "Alice");
    assert_eq!(success["admin"], false);
    assert_eq!(broker.connections[&1].username.as_deref(), Some("Alice"));
}

#[tokio::test]
async fn play_requires_login_and_known_game() {
    let dir = TempDir::new().unwrap();
    let mut broker = broker(dir.path(), "exit 0", 10);
    let mut rx = connect(&mut broker, 1);
    drain(&mut rx);

    send(&mut broker, 1, r#"{"msg":"play","game_id":"test"}"#);
    let msgs = drain(&mut rx);
    assert_eq!(tags(&msgs), vec!["login_required"]);
    assert_eq!(msgs[0]["game"], "Test Game");

    login(&mut broker, 1, "alice");
    drain(&mut rx);
    send(&mut broker, 1, r#"{"msg":"play","game_id":"nope"}"#);
    assert_eq!(tags(&drain(&mut rx)), vec!["go_lobby"]);
    assert!(broker.registry.is_empty());
}

#[tokio::test]
async fn held_account_cannot_play_restricted_game_or_watch() {
    let dir = TempDir::new().unwrap();
    let mut broker = broker(dir.path(), "exit 0", 10);
    let mut rx = connect(&mut broker, 1);
    login(&mut broker, 1, "held");
    assert!(tags(&drain(&mut rx)).contains(&"set_account_hold".to_string()));

    send(&mut broker, 1, r#"{"msg":"play","game_id":"test"}"#);
    assert_eq!(tags(&drain(&mut rx)), vec!["go_lobby"]);

    send(&mut broker, 1, r#"{"msg":"watch","username":"alice"}"#);
    assert_eq!(tags(&drain(&mut rx)), vec!["auth_error"]);
}

#[tokio::test]
async fn watching_unknown_player_returns_to_lobby() {
    let dir = TempDir::new().unwrap();
    let mut broker = broker(dir.path(), "exit 0", 10);
    let mut rx = connect(&mut broker, 1);
    drain(&mut rx);

    send(&mut broker, 1, r#"{"msg":"watch","username":"nobody"}"#);
    assert_eq!(
        tags(&drain(&mut rx)),
        vec!["go_lobby", "lobby_clear", "lobby_complete"]
    );
    assert_eq!(broker.connections[&1].mode, ConnectionMode::Lobby);
}

#[tokio::test]
async fn malformed_messages_are_ignored() {
    let dir = TempDir::new().unwrap();
    let mut broker = broker(dir.path(), "exit 0", 10);
    let mut rx = connect(&mut broker, 1);
    drain(&mut rx);

    send(&mut broker, 1, "not json");
    send(&mut broker, 1, r#"{"msg":"ui_state_sync","x":1}"#);
    assert!(drain(&mut rx).is_empty());
    assert!(broker.connections.contains_key(&1));
}

#[tokio::test]
async fn played_game_runs_to_completion() {
    let dir = TempDir::new().unwrap();
    let mut broker = broker(dir.path(), "echo one; exit 0", 10);
    let mut player = connect(&mut broker, 1);
    let mut lobby = connect(&mut broker, 2);
    login(&mut broker, 1, "alice");
    drain(&mut player);
    drain(&mut lobby);

    send(&mut broker, 1, r#"{"msg":"play","game_id":"test"}"#);
    let msgs = drain(&mut player);
    assert_eq!(tags(&msgs)[0], "game_started");
    assert!(matches!(
        broker.connections[&1].mode,
        ConnectionMode::Playing(_)
    ));
    let id = broker.registry.find_by_username("alice").unwrap();

    broker.handle_event(BrokerEvent::LobbyFlush);
    let msgs = drain(&mut lobby);
    let entry = find(&msgs, "lobby_entry").unwrap();
    assert_eq!(entry["username"], "Alice");
    assert_eq!(entry["game_id"], "test");

    pump_until(&mut broker, |b| b.registry.is_empty()).await;

    let msgs = drain(&mut player);
    let ended = find(&msgs, "game_ended").unwrap();
    assert_eq!(ended["reason"], "normal");
    assert!(tags(&msgs).contains(&"go_lobby".to_string()));
    assert_eq!(broker.connections[&1].mode, ConnectionMode::Lobby);

    let msgs = drain(&mut lobby);
    let removed = find(&msgs, "lobby_remove").unwrap();
    assert_eq!(removed["id"], id);
    assert_eq!(removed["reason"], "normal");
}

#[tokio::test]
async fn spectators_follow_the_game_and_return_to_lobby() {
    let dir = TempDir::new().unwrap();
    let mut broker = broker(dir.path(), "read line; exit 3", 10);
    let mut player = connect(&mut broker, 1);
    let mut spectator = connect(&mut broker, 2);
    login(&mut broker, 1, "alice");
    send(&mut broker, 1, r#"{"msg":"play","game_id":"test"}"#);
    drain(&mut player);
    drain(&mut spectator);

    send(&mut broker, 2, r#"{"msg":"watch","username":"ALICE"}"#);
    let msgs = drain(&mut spectator);
    assert_eq!(find(&msgs, "watching_started").unwrap()["username"], "Alice");
    let update = find(&drain(&mut player), "update_spectators").cloned().unwrap();
    assert_eq!(update["count"], 1);
    assert_eq!(update["names"], "Alice, 1 Anon");

    // Spectators cannot type into the game.
    send(&mut broker, 2, r#"{"msg":"input","text":"\n"}"#);
    send(&mut broker, 1, r#"{"msg":"input","text":"\n"}"#);
    pump_until(&mut broker, |b| b.registry.is_empty()).await;

    for rx in [&mut player, &mut spectator] {
        let msgs = drain(rx);
        assert_eq!(find(&msgs, "game_ended").unwrap()["reason"], "error");
        assert!(tags(&msgs).contains(&"go_lobby".to_string()));
    }
    assert_eq!(broker.connections[&2].mode, ConnectionMode::Lobby);
}

#[tokio::test]
async fn disconnecting_player_stops_the_session() {
    let dir = TempDir::new().unwrap();
    let mut broker = broker(dir.path(), "exec sleep 30", 10);
    let _player = connect(&mut broker, 1);
    login(&mut broker, 1, "alice");
    send(&mut broker, 1, r#"{"msg":"play","game_id":"test"}"#);
    assert_eq!(broker.registry.len(), 1);

    broker.handle_event(BrokerEvent::Disconnected { conn: 1 });
    assert!(broker.connections.contains_key(&1));
    pump_until(&mut broker, |b| b.registry.is_empty()).await;
    assert!(!broker.connections.contains_key(&1));
}

#[tokio::test]
async fn second_play_for_same_user_meets_the_live_lock() {
    let dir = TempDir::new().unwrap();
    let mut broker = broker(dir.path(), "exec sleep 30", 10);
    let _first = connect(&mut broker, 1);
    let mut second = connect(&mut broker, 3);
    login(&mut broker, 1, "alice");
    login(&mut broker, 3, "alice");
    send(&mut broker, 1, r#"{"msg":"play","game_id":"test"}"#);
    drain(&mut second);
    let first_id = broker.registry.find_by_username("alice").unwrap();

    send(&mut broker, 3, r#"{"msg":"play","game_id":"test"}"#);
    let msgs = drain(&mut second);
    let stale = find(&msgs, "stale_processes").unwrap();
    assert_eq!(stale["game"], "Test Game");
    assert_eq!(broker.registry.len(), 2);

    // The session still purging is neither listed nor watchable.
    let mut watcher = connect(&mut broker, 4);
    let msgs = drain(&mut watcher);
    let entries: Vec<_> = msgs.iter().filter(|m| m["msg"] == "lobby_entry").collect();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["id"], first_id);
    assert_eq!(broker.registry.find_by_username("alice"), Some(first_id));
    send(&mut broker, 4, r#"{"msg":"watch","username":"alice"}"#);
    assert_eq!(
        broker.connections[&4].mode,
        ConnectionMode::Spectating(first_id)
    );

    send(&mut broker, 3, r#"{"msg":"stop_stale_process_purge"}"#);
    assert_eq!(broker.registry.len(), 1);
    let msgs = drain(&mut second);
    assert!(tags(&msgs).contains(&"go_lobby".to_string()));
    assert_eq!(broker.connections[&3].mode, ConnectionMode::Lobby);

    broker.handle_event(BrokerEvent::Disconnected { conn: 1 });
    pump_until(&mut broker, |b| b.registry.is_empty()).await;
}

#[tokio::test]
async fn shutdown_closes_clients_and_waits_for_sessions() {
    let dir = TempDir::new().unwrap();
    let mut broker = broker(dir.path(), "exec sleep 30", 10);
    let mut player = connect(&mut broker, 1);
    login(&mut broker, 1, "alice");
    send(&mut broker, 1, r#"{"msg":"play","game_id":"test"}"#);
    drain(&mut player);

    let (done, mut finished) = oneshot::channel();
    broker.handle_event(BrokerEvent::Shutdown { done });
    let msgs = drain(&mut player);
    assert_eq!(find(&msgs, "close").unwrap()["reason"], SHUTTING_DOWN);
    assert!(finished.try_recv().is_err());

    pump_until(&mut broker, |b| b.registry.is_empty()).await;
    assert!(finished.try_recv().is_ok());

    let mut late = connect(&mut broker, 9);
    assert_eq!(tags(&drain(&mut late)), vec!["close", "<close>"]);
}

#[tokio::test]
async fn discovered_socket_attaches_as_spectator_session() {
    let dir = TempDir::new().unwrap();
    let sockets = dir.path().join("sockets");
    std::fs::create_dir_all(&sockets).unwrap();
    let path = sockets.join("alice:test.sock");
    let worker = tokio::net::UnixDatagram::bind(&path).unwrap();

    let mut broker = broker(dir.path(), "exit 0", 10);
    let mut lobby = connect(&mut broker, 1);
    drain(&mut lobby);

    broker.handle_event(BrokerEvent::Socket(SocketEvent::Created(path.clone())));
    assert_eq!(broker.registry.len(), 1);
    let id = broker.registry.by_path(&path).unwrap();
    assert_eq!(
        broker.registry.get(id).unwrap().origin(),
        SessionOrigin::Discovered
    );

    let mut buf = [0u8; 1024];
    let (n, _) = tokio::time::timeout(Duration::from_secs(10), worker.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let attach: Value = serde_json::from_slice(&buf[..n]).unwrap();
    assert_eq!(attach, serde_json::json!({"msg": "attach", "primary": false}));

    // A socket already tracked is not attached twice.
    broker.handle_event(BrokerEvent::Socket(SocketEvent::Created(path.clone())));
    assert_eq!(broker.registry.len(), 1);

    broker.handle_event(BrokerEvent::LobbyFlush);
    let msgs = drain(&mut lobby);
    assert_eq!(find(&msgs, "lobby_entry").unwrap()["id"], id);

    broker.handle_event(BrokerEvent::Socket(SocketEvent::Removed(path)));
    assert!(broker.registry.is_empty());
    let msgs = drain(&mut lobby);
    assert_eq!(find(&msgs, "lobby_remove").unwrap()["id"], id);
}
