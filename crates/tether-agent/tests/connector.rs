//! Connector against a real host daemon over a tempdir Unix socket.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tether_agent::config::AgentConfig;
use tether_agent::connector::Connector;
use tether_core::codec::{frame_decode, frame_encode, read_frame};
use tether_core::{payload, Envelope, ForwardDirection, ForwardSpec, ResponseBody, PROTOCOL_VERSION};
use tether_host::events::LogEvents;
use tether_host::policy::{ForwardPolicy, PolicyEnforcer};
use tether_host::registry::{Connection, ConnectionRegistry};
use tether_host::usage::UsageTracker;
use tether_host::ControlListener;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, UnixListener};

struct Harness {
    _dir: TempDir,
    socket_path: PathBuf,
    registry: Arc<ConnectionRegistry>,
}

fn start_host() -> Harness {
    let dir = TempDir::new().unwrap();
    let socket_path = dir.path().join("control.sock");
    let registry = ConnectionRegistry::new();

    let listener = ControlListener::bind(
        &socket_path,
        registry.clone(),
        Arc::new(PolicyEnforcer::new(ForwardPolicy::default())),
        Arc::new(UsageTracker::new()),
        Arc::new(LogEvents),
    )
    .unwrap();
    tokio::spawn(async move { listener.run().await });

    Harness {
        _dir: dir,
        socket_path,
        registry,
    }
}

fn agent_config(socket_path: PathBuf, identity: &str, forwards: Vec<ForwardSpec>) -> AgentConfig {
    AgentConfig {
        socket_path,
        identity: identity.to_string(),
        ipc_path: None,
        worktree_root: std::env::temp_dir(),
        stall_enabled: false,
        stall_threshold: Duration::from_secs(30),
        stall_check_interval: Duration::from_secs(5),
        forwards,
    }
}

async fn wait_for_connection(harness: &Harness, identity: &str) -> Arc<Connection> {
    for _ in 0..100 {
        if let Some(conn) = harness.registry.get(identity) {
            return conn;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("agent {identity} never connected");
}

fn free_port() -> u16 {
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    probe.local_addr().unwrap().port()
}

#[tokio::test]
async fn connector_establishes_and_serves_echo() {
    let harness = start_host();
    let connector = Connector::new(agent_config(
        harness.socket_path.clone(),
        "box-echo",
        Vec::new(),
    ));
    tokio::spawn(async move { connector.run().await });

    let conn = wait_for_connection(&harness, "box-echo").await;

    // Host-to-agent request over the established channel.
    let body = conn
        .channel
        .request("echo", payload! {"ping" => "pong"}, Duration::from_secs(2))
        .await
        .unwrap();
    assert!(body.ok);
    assert_eq!(body.data.unwrap()["ping"], "pong");
}

#[tokio::test]
async fn static_remote_forward_is_negotiated_on_connect() {
    let harness = start_host();
    let port = free_port();
    let forward = ForwardSpec {
        name: "web".into(),
        host_port: port,
        container_port: 3000,
        direction: ForwardDirection::Remote,
        bind_addresses: vec!["127.0.0.1".into()],
    };
    let connector = Connector::new(agent_config(
        harness.socket_path.clone(),
        "box-fwd",
        vec![forward],
    ));
    tokio::spawn(async move { connector.run().await });

    let conn = wait_for_connection(&harness, "box-fwd").await;

    // The host side should be holding the listener shortly after connect.
    let mut bound = false;
    for _ in 0..100 {
        if !conn.forwards.list().await.is_empty() {
            bound = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(bound, "forward never negotiated");
    assert!(TcpListener::bind(("127.0.0.1", port)).await.is_err());
}

#[tokio::test]
async fn reconnect_delay_resets_after_an_established_connection() {
    // Stand-in host: completes the hello handshake, then writes a
    // truncated frame so the established channel dies with a transport
    // error instead of a clean EOF.
    let dir = TempDir::new().unwrap();
    let socket_path = dir.path().join("control.sock");
    let listener = UnixListener::bind(&socket_path).unwrap();
    let accepts: Arc<Mutex<Vec<Instant>>> = Arc::default();
    let log = accepts.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            log.lock().unwrap().push(Instant::now());
            let Ok(Some(frame)) = read_frame(&mut stream).await else {
                continue;
            };
            let Ok(hello) = frame_decode(&frame) else {
                continue;
            };
            let reply = Envelope::response(
                hello.id.as_deref().unwrap_or_default(),
                "hello",
                ResponseBody::ok_with(payload! {"version" => PROTOCOL_VERSION}),
            );
            let _ = stream.write_all(&frame_encode(&reply).unwrap()).await;
            // Length prefix with no body behind it.
            let _ = stream.write_all(&[0, 0, 0, 16]).await;
            let _ = stream.shutdown().await;
        }
    });

    let connector = Connector::new(agent_config(socket_path, "box-flaky", Vec::new()));
    tokio::spawn(async move { connector.run().await });

    // Every attempt gets through the handshake, so every reconnect gap
    // should stay at the shortest delay instead of doubling.
    for _ in 0..200 {
        if accepts.lock().unwrap().len() >= 4 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let times = accepts.lock().unwrap().clone();
    assert!(times.len() >= 4, "only {} connections observed", times.len());
    let gap = times[3] - times[2];
    assert!(
        gap < Duration::from_millis(2500),
        "reconnect gap grew to {gap:?}"
    );
}

#[tokio::test]
async fn forward_removed_event_drops_the_agent_record() {
    let harness = start_host();
    let port = free_port();
    let forward = ForwardSpec {
        name: "web".into(),
        host_port: port,
        container_port: 3000,
        direction: ForwardDirection::Remote,
        bind_addresses: vec!["127.0.0.1".into()],
    };
    let connector = Connector::new(agent_config(
        harness.socket_path.clone(),
        "box-rm",
        vec![forward],
    ));
    let peer = connector.peer_forwards();
    tokio::spawn(async move { connector.run().await });

    let conn = wait_for_connection(&harness, "box-rm").await;

    // Negotiation succeeded and the agent recorded the host's listener.
    let mut recorded = false;
    for _ in 0..100 {
        if !peer.list().is_empty() {
            recorded = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(recorded, "negotiated forward never recorded");

    // The host drops the listener and tells the agent.
    assert!(conn.forwards.remove(port).await.is_some());
    conn.channel
        .send_event(
            "forward_removed",
            payload! {"host_port" => port, "name" => "web"},
        )
        .await
        .unwrap();

    let mut dropped = false;
    for _ in 0..100 {
        if peer.list().is_empty() {
            dropped = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(dropped, "agent record survived forward_removed");
}

#[tokio::test]
async fn duplicate_identity_supersedes_the_first_connection() {
    let harness = start_host();

    let first = Connector::new(agent_config(harness.socket_path.clone(), "box-dup", Vec::new()));
    let first_task = tokio::spawn(async move { first.run().await });
    let old = wait_for_connection(&harness, "box-dup").await;

    let second = Connector::new(agent_config(harness.socket_path.clone(), "box-dup", Vec::new()));
    tokio::spawn(async move { second.run().await });

    // The registry entry is replaced, never duplicated.
    let mut superseded = false;
    for _ in 0..100 {
        let current = harness.registry.get("box-dup").unwrap();
        if current.conn_id != old.conn_id {
            superseded = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(superseded, "second connection never superseded the first");
    // Stop the first connector before it re-dials and flaps the entry.
    first_task.abort();
    assert_eq!(harness.registry.count(), 1);

    // The old channel is closed; the new one answers.
    assert!(old
        .channel
        .request("echo", payload! {}, Duration::from_millis(500))
        .await
        .is_err());
    let current = harness.registry.get("box-dup").unwrap();
    let body = current
        .channel
        .request("echo", payload! {}, Duration::from_secs(2))
        .await
        .unwrap();
    assert!(body.ok);
}
