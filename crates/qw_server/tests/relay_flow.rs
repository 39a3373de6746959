//! End-to-end session flows, pumped in-process.
//!
//! Client sessions and the server state are wired together through the
//! same channels the network layer uses, with the sockets left out: each
//! test client owns its session's outbound receiver and the server-side
//! connection handle. A pump loop moves records both ways until the system
//! goes quiet, auto-answering the password prompts a real shell would show.

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tokio::sync::mpsc;

use qw_client::{ClientEvent, ClientSession};
use qw_proto::{Record, Value};
use qw_server::handlers::check_identity;
use qw_server::{dispatch, Connection, Flow, ServerState};

struct TestClient {
    password: String,
    auto_login: bool,
    session: ClientSession,
    to_server: mpsc::UnboundedReceiver<Record>,
    conn: Connection,
    from_server: mpsc::UnboundedReceiver<Record>,
    events: Vec<ClientEvent>,
    connected: bool,
}

async fn connect(
    state: &ServerState,
    dir: &Path,
    name: &str,
    password: &str,
    auto_login: bool,
) -> TestClient {
    let (out_tx, mut to_server) = mpsc::unbounded_channel();
    let session = ClientSession::open(dir, name, out_tx).expect("open session");
    session.identify().expect("identify");
    let identity = to_server.try_recv().expect("identity record");

    let (srv_tx, from_server) = mpsc::unbounded_channel();
    let conn = check_identity(state, &srv_tx, &identity)
        .await
        .expect("identity check")
        .expect("identity accepted");

    TestClient {
        password: password.to_string(),
        auto_login,
        session,
        to_server,
        conn,
        from_server,
        events: Vec::new(),
        connected: true,
    }
}

async fn disconnect(state: &ServerState, client: &mut TestClient) {
    state.unregister_peer(&client.conn.username).await;
    state
        .stores()
        .await
        .set_logged_in(&client.conn.username, false)
        .expect("logout");
    client.connected = false;
}

/// Move records in both directions until nothing moves any more.
async fn pump(state: &ServerState, clients: &mut [&mut TestClient]) {
    loop {
        let mut progressed = false;
        for client in clients.iter_mut() {
            while let Ok(record) = client.to_server.try_recv() {
                progressed = true;
                if !client.connected {
                    continue;
                }
                match dispatch(state, &client.conn, record).await.expect("dispatch") {
                    Flow::Continue => {}
                    Flow::Close => disconnect(state, client).await,
                }
            }
            while let Ok(record) = client.from_server.try_recv() {
                progressed = true;
                let (_, events) = client.session.on_record(record).expect("on_record");
                for event in events {
                    match &event {
                        ClientEvent::NeedsRegistration => {
                            client.session.register(&client.password).expect("register")
                        }
                        ClientEvent::RegisteredAwaitLogin => {
                            client.session.login(&client.password).expect("login")
                        }
                        ClientEvent::SaltReceived if client.auto_login => {
                            client.session.login(&client.password).expect("login")
                        }
                        _ => {}
                    }
                    client.events.push(event);
                }
            }
        }
        if !progressed {
            break;
        }
    }
}

fn messages(client: &TestClient) -> Vec<(String, String)> {
    client
        .events
        .iter()
        .filter_map(|event| match event {
            ClientEvent::Message { from, text } => Some((from.clone(), text.clone())),
            _ => None,
        })
        .collect()
}

fn infos(client: &TestClient) -> Vec<String> {
    client
        .events
        .iter()
        .filter_map(|event| match event {
            ClientEvent::Info(text) => Some(text.clone()),
            _ => None,
        })
        .collect()
}

fn server_opk_count(stores: &qw_server::state::Stores, user: &str) -> usize {
    stores
        .user(user)
        .and_then(|u| u.get("keys"))
        .and_then(Value::as_dict)
        .and_then(|keys| keys.get("OPKs"))
        .and_then(Value::as_list)
        .map(Vec::len)
        .unwrap_or(0)
}

struct World {
    _dir: TempDir,
    state: ServerState,
    client_dir: PathBuf,
}

fn world() -> World {
    let dir = TempDir::new().expect("tempdir");
    let state = ServerState::open(&dir.path().join("server")).expect("server state");
    let client_dir = dir.path().join("clients");
    World { _dir: dir, state, client_dir }
}

// ── Scenarios ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn s1_s2_round_trip_with_ratchet_turn() {
    let w = world();
    let mut alice = connect(&w.state, &w.client_dir, "alice", "pw1", true).await;
    let mut bob = connect(&w.state, &w.client_dir, "bob", "pw2", true).await;
    pump(&w.state, &mut [&mut alice, &mut bob]).await;
    assert!(alice.events.contains(&ClientEvent::LoggedIn));
    assert!(bob.events.contains(&ClientEvent::LoggedIn));

    // alice: init bob
    assert!(alice.session.initiate_x3dh("bob").unwrap());
    pump(&w.state, &mut [&mut alice, &mut bob]).await;
    assert!(alice.session.peer_value_exists("shared_secrets", "bob"));
    assert!(bob.session.peer_value_exists("shared_secrets", "alice"));

    // S1: first message decrypts at bob.
    assert!(alice.session.send_text("bob", "hello").unwrap());
    let alice_msg = alice.to_server.try_recv().unwrap();
    let alice_x = alice_msg.get("X").cloned().expect("ratchet key on the wire");
    assert_eq!(dispatch(&w.state, &alice.conn, alice_msg).await.unwrap(), Flow::Continue);
    pump(&w.state, &mut [&mut alice, &mut bob]).await;
    assert_eq!(messages(&bob), vec![("alice".to_string(), "hello".to_string())]);

    // S2: bob answers; his outbound ratchet key differs from alice's.
    assert!(bob.session.send_text("alice", "hi").unwrap());
    let bob_msg = bob.to_server.try_recv().unwrap();
    let bob_x = bob_msg.get("X").cloned().expect("ratchet key on the wire");
    assert_ne!(alice_x, bob_x);
    assert_eq!(dispatch(&w.state, &bob.conn, bob_msg).await.unwrap(), Flow::Continue);
    pump(&w.state, &mut [&mut alice, &mut bob]).await;
    assert_eq!(messages(&alice), vec![("bob".to_string(), "hi".to_string())]);
}

#[tokio::test]
async fn s3_offline_messages_arrive_in_order() {
    let w = world();
    let mut alice = connect(&w.state, &w.client_dir, "alice", "pw1", true).await;
    let mut bob = connect(&w.state, &w.client_dir, "bob", "pw2", true).await;
    pump(&w.state, &mut [&mut alice, &mut bob]).await;

    alice.session.initiate_x3dh("bob").unwrap();
    pump(&w.state, &mut [&mut alice, &mut bob]).await;
    alice.session.send_text("bob", "hello").unwrap();
    pump(&w.state, &mut [&mut alice, &mut bob]).await;
    assert_eq!(messages(&bob).len(), 1);

    // bob drops; alice keeps talking.
    disconnect(&w.state, &mut bob).await;
    alice.session.send_text("bob", "first while away").unwrap();
    alice.session.send_text("bob", "second while away").unwrap();
    pump(&w.state, &mut [&mut alice]).await;
    assert_eq!(
        w.state.stores().await.user("bob").unwrap()
            .get("offline_messages").unwrap().as_list().unwrap().len(),
        2
    );

    // bob reconnects and logs in: the queue drains in send order.
    let mut bob = connect(&w.state, &w.client_dir, "bob", "pw2", true).await;
    pump(&w.state, &mut [&mut alice, &mut bob]).await;
    assert_eq!(
        messages(&bob),
        vec![
            ("alice".to_string(), "first while away".to_string()),
            ("alice".to_string(), "second while away".to_string()),
        ]
    );
}

#[tokio::test]
async fn s4_opk_exhaustion_and_replenishment() {
    let w = world();
    let mut bob = connect(&w.state, &w.client_dir, "bob", "pw2", true).await;
    let mut carol = connect(&w.state, &w.client_dir, "carol", "pw3", true).await;
    let mut dave = connect(&w.state, &w.client_dir, "dave", "pw4", true).await;
    pump(&w.state, &mut [&mut bob, &mut carol, &mut dave]).await;

    // Shrink bob's published pool to exactly one prekey, on both sides.
    {
        let mut stores = w.state.stores().await;
        let keys = stores.user_mut("bob").unwrap()
            .get_mut("keys").unwrap().as_dict_mut().unwrap();
        keys.get_mut("OPKs").unwrap().as_list_mut().unwrap().truncate(1);
        stores.database.save().unwrap();
    }
    {
        let db = bob.session.db_mut();
        let keys = db.get_mut("keys").unwrap().as_dict_mut().unwrap();
        keys.get_mut("oks").unwrap().as_list_mut().unwrap().truncate(1);
        keys.get_mut("OPKs").unwrap().as_list_mut().unwrap().truncate(1);
        db.save().unwrap();
    }

    // carol consumes the last prekey; bob has not processed the reaction yet.
    carol.session.initiate_x3dh("bob").unwrap();
    pump(&w.state, &mut [&mut carol]).await;
    assert_eq!(server_opk_count(&*w.state.stores().await, "bob"), 0);

    // dave asks next: error for dave, replenishment prompt for bob.
    dave.session.initiate_x3dh("bob").unwrap();
    pump(&w.state, &mut [&mut dave]).await;
    assert!(infos(&dave).iter().any(|i| i.contains("doesn't have keys left")));

    // bob processes the reaction and the prompt, uploading fresh batches.
    pump(&w.state, &mut [&mut bob, &mut carol, &mut dave]).await;
    assert!(server_opk_count(&*w.state.stores().await, "bob") >= 5);
    assert!(bob.session.peer_value_exists("shared_secrets", "carol"));

    // dave retries and the whole handshake now completes.
    assert!(dave.session.initiate_x3dh("bob").unwrap());
    pump(&w.state, &mut [&mut bob, &mut carol, &mut dave]).await;
    dave.session.send_text("bob", "made it").unwrap();
    pump(&w.state, &mut [&mut bob, &mut carol, &mut dave]).await;
    assert!(messages(&bob).contains(&("dave".to_string(), "made it".to_string())));
}

#[tokio::test]
async fn s5_peer_reset_purges_both_sides() {
    let w = world();
    let mut alice = connect(&w.state, &w.client_dir, "alice", "pw1", true).await;
    let mut bob = connect(&w.state, &w.client_dir, "bob", "pw2", true).await;
    pump(&w.state, &mut [&mut alice, &mut bob]).await;

    alice.session.initiate_x3dh("bob").unwrap();
    pump(&w.state, &mut [&mut alice, &mut bob]).await;
    alice.session.send_text("bob", "hello").unwrap();
    pump(&w.state, &mut [&mut alice, &mut bob]).await;

    alice.session.reset("bob").unwrap();
    for map in ["chats", "shared_secrets", "key_bundles"] {
        assert!(!alice.session.peer_value_exists(map, "bob"));
    }
    pump(&w.state, &mut [&mut alice, &mut bob]).await;
    assert!(bob.events.contains(&ClientEvent::ResetBy("alice".to_string())));
    for map in ["chats", "shared_secrets", "key_bundles"] {
        assert!(!bob.session.peer_value_exists(map, "alice"));
    }
}

#[tokio::test]
async fn s6_account_reset_fans_out_and_terminates() {
    let w = world();
    let mut alice = connect(&w.state, &w.client_dir, "alice", "pw1", true).await;
    let mut bob = connect(&w.state, &w.client_dir, "bob", "pw2", true).await;
    pump(&w.state, &mut [&mut alice, &mut bob]).await;

    alice.session.reset("server").unwrap();
    pump(&w.state, &mut [&mut alice, &mut bob]).await;

    assert!(!alice.connected, "the resetting connection terminates");
    assert!(!w.state.stores().await.database.has("alice"));
    assert!(bob.events.contains(&ClientEvent::ResetBy("alice".to_string())));
    assert_eq!(alice.session.db().keys().count(), 0, "local store wiped");
}

// ── Quantified invariants ────────────────────────────────────────────────────

#[tokio::test]
async fn bundle_fetch_pops_exactly_one_opk_and_never_reserves_it() {
    let w = world();
    let mut alice = connect(&w.state, &w.client_dir, "alice", "pw1", true).await;
    let mut bob = connect(&w.state, &w.client_dir, "bob", "pw2", true).await;
    let mut carol = connect(&w.state, &w.client_dir, "carol", "pw3", true).await;
    pump(&w.state, &mut [&mut alice, &mut bob, &mut carol]).await;

    let before = {
        let stores = w.state.stores().await;
        assert_eq!(server_opk_count(&stores, "bob"), 5);
        stores.user("bob").unwrap().get("keys").unwrap().as_dict().unwrap()
            .get("OPKs").unwrap().as_list().unwrap().clone()
    };

    alice.session.initiate_x3dh("bob").unwrap();
    pump(&w.state, &mut [&mut alice, &mut bob, &mut carol]).await;
    carol.session.initiate_x3dh("bob").unwrap();
    pump(&w.state, &mut [&mut alice, &mut bob, &mut carol]).await;

    let stores = w.state.stores().await;
    let after = stores.user("bob").unwrap().get("keys").unwrap().as_dict().unwrap()
        .get("OPKs").unwrap().as_list().unwrap();
    assert_eq!(after.len(), 3);
    assert!(!after.contains(&before[0]), "served prekeys never reappear");
    assert!(!after.contains(&before[1]));
}

#[tokio::test]
async fn login_throttle_rejects_before_password_comparison() {
    let w = world();
    {
        let mut alice = connect(&w.state, &w.client_dir, "alice", "pw1", true).await;
        pump(&w.state, &mut [&mut alice]).await;
        assert!(alice.events.contains(&ClientEvent::LoggedIn));
        disconnect(&w.state, &mut alice).await;
    }

    // Reconnect without auto-login and burn three wrong passwords.
    let mut alice = connect(&w.state, &w.client_dir, "alice", "pw1", false).await;
    pump(&w.state, &mut [&mut alice]).await;
    assert!(alice.events.contains(&ClientEvent::SaltReceived));

    for _ in 0..3 {
        alice.session.login("wrong password").unwrap();
        pump(&w.state, &mut [&mut alice]).await;
    }
    assert_eq!(
        infos(&alice).iter().filter(|i| i.contains("Password incorrect")).count(),
        3
    );

    // The fourth attempt carries the correct password and is still refused.
    alice.session.login("pw1").unwrap();
    pump(&w.state, &mut [&mut alice]).await;
    assert!(infos(&alice).iter().any(|i| i.contains("Too many failed login attempts")));
    assert!(!w.state.stores().await.is_logged_in("alice"));
}
