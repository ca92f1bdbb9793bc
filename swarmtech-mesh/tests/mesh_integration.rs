//! End-to-end mesh tests: a real relay on loopback, sessions on the
//! in-memory transport (plus one run over TCP).

use std::collections::BTreeSet;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use swarmtech_core::{Agent, LocationOptions, MessageKind, Role};
use swarmtech_mesh::{
    LinkState, MemoryNetwork, MemoryTransport, MeshConfig, MeshError, RelayServer, RelayState,
    SessionEvent, SwarmSession, TcpTransport, Transport,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration, Instant};

const ROOM: &str = "ops-north";

async fn start_relay() -> (String, RelayState) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    let server = RelayServer::with_defaults();
    let state = server.state();
    tokio::spawn(async move {
        server.serve(listener, std::future::pending()).await.unwrap();
    });
    (format!("ws://{addr}/ws"), state)
}

/// Poll `check` until it holds, failing after ten seconds.
async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check().await {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(20)).await;
    }
}

async fn next_matching(
    rx: &mut mpsc::Receiver<SessionEvent>,
    mut matches: impl FnMut(&SessionEvent) -> bool,
) -> SessionEvent {
    loop {
        let event = timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for session event")
            .expect("event channel closed");
        if matches(&event) {
            return event;
        }
    }
}

fn session<T: Transport>(id: &str, config: MeshConfig, transport: T) -> SwarmSession<T> {
    SwarmSession::create(Agent::with_id(id, format!("Unit {id}"), Role::Field), config, transport)
}

/// Join one session and wait until the relay has registered it.
async fn join<T: Transport>(session: &SwarmSession<T>, url: &str, relay: &RelayState) {
    let before = relay.registry().members(ROOM).await.len();
    session.connect_to_room(url, ROOM).await.unwrap();
    eventually("relay membership", move || async move {
        relay.registry().members(ROOM).await.len() == before + 1
    })
    .await;
}

async fn join_all(
    ids: &[&str],
    network: &MemoryNetwork,
    url: &str,
    relay: &RelayState,
) -> Vec<SwarmSession<MemoryTransport>> {
    let mut sessions = Vec::new();
    for id in ids {
        let session = session(id, MeshConfig::default(), network.transport());
        join(&session, url, relay).await;
        sessions.push(session);
    }
    sessions
}

async fn wait_for_full_mesh(sessions: &[SwarmSession<MemoryTransport>]) {
    let expected = sessions.len() - 1;
    for session in sessions {
        eventually("full mesh", move || async move { session.open_links().await.len() == expected }).await;
    }
}

#[tokio::test]
async fn test_three_peers_form_one_link_per_pair() {
    let (url, relay) = start_relay().await;
    let network = MemoryNetwork::default();
    let peers = join_all(&["a", "b", "c"], &network, &url, &relay).await;
    wait_for_full_mesh(&peers).await;

    // Only the newcomer initiates, so each pair opened exactly once.
    let established: BTreeSet<_> = network.established().into_iter().collect();
    let expected: BTreeSet<_> = [("b", "a"), ("c", "a"), ("c", "b")]
        .into_iter()
        .map(|(i, r)| (i.to_string(), r.to_string()))
        .collect();
    assert_eq!(established, expected);
    assert_eq!(network.established().len(), 3);
    assert_eq!(network.active_links(), 3);

    assert_eq!(peers[0].open_links().await, vec!["b".to_string(), "c".to_string()]);
    assert_eq!(peers[2].link_state("a").await, Some(LinkState::Open));
}

#[tokio::test]
async fn test_late_joiner_bootstraps_from_snapshot() {
    let (url, relay) = start_relay().await;
    let network = MemoryNetwork::default();
    let early = join_all(&["a", "b"], &network, &url, &relay).await;
    wait_for_full_mesh(&early).await;

    early[0].upsert_agent(Agent::with_id("hq", "Dispatch", Role::Command)).await.unwrap();
    for i in 0..10 {
        early[i % 2].send_message(&format!("sitrep {i}"), MessageKind::Text).await.unwrap();
    }
    let b = &early[1];
    eventually("early peers to converge", move || async move { b.messages().await.len() == 10 }).await;

    let late = session("c", MeshConfig::default(), network.transport());
    join(&late, &url, &relay).await;
    let late = &late;
    eventually("late joiner snapshot", move || async move {
        late.messages().await.len() == 10 && late.agents().await.len() == 4
    })
    .await;

    let a = &early[0];
    eventually("identical views", move || async move { a.view().await == late.view().await }).await;
    let contents: Vec<_> = late.messages().await.into_iter().map(|m| m.content).collect();
    let mut sorted = contents.clone();
    sorted.sort();
    assert_eq!(contents.len(), 10);
    assert_eq!(sorted.first().map(String::as_str), Some("sitrep 0"));
}

#[tokio::test]
async fn test_concurrent_mutations_converge() {
    let (url, relay) = start_relay().await;
    let network = MemoryNetwork::default();
    let peers = join_all(&["a", "b", "c"], &network, &url, &relay).await;
    wait_for_full_mesh(&peers).await;

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    peers[2]
        .on_messages_change(move |messages| {
            counter.store(messages.len(), Ordering::SeqCst);
        })
        .await;

    for (i, peer) in peers.iter().enumerate() {
        let options = LocationOptions { accuracy: Some(5.0), ..LocationOptions::default() };
        peer.update_location(-122.4 + i as f64 * 0.01, 37.7, options).await.unwrap();
        peer.send_message("on scene", MessageKind::Text).await.unwrap();
        peer.send_message("need water", MessageKind::Emergency).await.unwrap();
    }

    for peer in &peers {
        eventually("all deltas", move || async move {
            peer.messages().await.len() == 6 && peer.locations().await.len() == 3
        })
        .await;
    }
    let reference = peers[0].view().await;
    for peer in &peers[1..] {
        assert_eq!(peer.view().await, reference);
    }
    assert_eq!(seen.load(Ordering::SeqCst), 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_burst_to_slow_peer_loses_nothing() {
    let (url, relay) = start_relay().await;
    let network = MemoryNetwork::default();
    let peers = join_all(&["a", "b"], &network, &url, &relay).await;
    wait_for_full_mesh(&peers).await;

    // Every merge on b stalls its event loop, so a's link queue fills up.
    peers[1]
        .on_messages_change(|_| std::thread::sleep(Duration::from_millis(2)))
        .await;
    for i in 0..800 {
        peers[0].send_message(&format!("burst {i}"), MessageKind::Text).await.unwrap();
    }

    let b = &peers[1];
    eventually("burst delivered", move || async move { b.messages().await.len() == 800 }).await;
    assert_eq!(peers[0].view().await, peers[1].view().await);
}

#[tokio::test]
async fn test_agent_removal_propagates() {
    let (url, relay) = start_relay().await;
    let network = MemoryNetwork::default();
    let peers = join_all(&["a", "b"], &network, &url, &relay).await;
    wait_for_full_mesh(&peers).await;

    peers[0].upsert_agent(Agent::with_id("hq", "Dispatch", Role::Command)).await.unwrap();
    let b = &peers[1];
    eventually("hq on b", move || async move { b.agents().await.contains_key("hq") }).await;

    peers[1].remove_agent("hq").await.unwrap();
    let a = &peers[0];
    eventually("hq removed on a", move || async move { !a.agents().await.contains_key("hq") }).await;
}

#[tokio::test]
async fn test_departed_peer_closes_link_but_keeps_roster() {
    let (url, relay) = start_relay().await;
    let network = MemoryNetwork::default();
    let mut a = session("a", MeshConfig::default(), network.transport());
    let mut events = a.take_event_rx().unwrap();
    join(&a, &url, &relay).await;
    let b = session("b", MeshConfig::default(), network.transport());
    join(&b, &url, &relay).await;

    next_matching(&mut events, |e| *e == SessionEvent::LinkOpened("b".into())).await;
    let a = &a;
    eventually("b roster entry", move || async move { a.agents().await.contains_key("b") }).await;

    b.shutdown().await;
    next_matching(&mut events, |e| *e == SessionEvent::PeerLeft("b".into())).await;
    eventually("link to b closed", move || async move { a.link_state("b").await.is_none() }).await;
    assert!(a.open_links().await.is_empty());
    // Leaving the room is not a removal.
    assert!(a.agents().await.contains_key("b"));
}

#[tokio::test]
async fn test_severed_link_reports_closed() {
    let (url, relay) = start_relay().await;
    let network = MemoryNetwork::default();
    let mut a = session("a", MeshConfig::default(), network.transport());
    let mut events = a.take_event_rx().unwrap();
    join(&a, &url, &relay).await;
    let b = session("b", MeshConfig::default(), network.transport());
    join(&b, &url, &relay).await;
    next_matching(&mut events, |e| *e == SessionEvent::LinkOpened("b".into())).await;

    assert_eq!(network.sever("a", "b"), 1);
    next_matching(&mut events, |e| *e == SessionEvent::LinkClosed("b".into())).await;
    assert!(a.open_links().await.is_empty());
}

#[tokio::test]
async fn test_stalled_handshake_retries_once_then_closes() {
    let (url, relay) = start_relay().await;
    let network = MemoryNetwork::default();
    let config = MeshConfig { handshake_timeout: Duration::from_millis(200), ..MeshConfig::default() };

    let a = session("a", config.clone(), network.transport());
    join(&a, &url, &relay).await;
    network.set_stalled("a", true);

    let mut b = session("b", config, network.transport());
    let mut events = b.take_event_rx().unwrap();
    join(&b, &url, &relay).await;

    next_matching(&mut events, |e| *e == SessionEvent::LinkClosed("a".into())).await;
    assert_eq!(network.offers_between("b", "a"), 2);
    assert!(b.link_state("a").await.is_none());

    sleep(Duration::from_millis(500)).await;
    assert_eq!(network.offers_between("b", "a"), 2, "no third attempt");
    assert!(network.established().is_empty());
}

#[tokio::test]
async fn test_invalid_room_id_rejected() {
    let (url, _relay) = start_relay().await;
    let a = session("a", MeshConfig::default(), MemoryNetwork::default().transport());
    let err = a.connect_to_room(&url, "no spaces").await.unwrap_err();
    assert!(matches!(err, MeshError::InvalidRoomId(_)));
    assert!(a.room_id().await.is_none());
}

#[tokio::test]
async fn test_second_connect_rejected() {
    let (url, relay) = start_relay().await;
    let a = session("a", MeshConfig::default(), MemoryNetwork::default().transport());
    join(&a, &url, &relay).await;
    let err = a.connect_to_room(&url, "ops-south").await.unwrap_err();
    assert!(matches!(err, MeshError::AlreadyConnected(room) if room == ROOM));
}

#[tokio::test]
async fn test_unreachable_relay() {
    let a = session("a", MeshConfig::default(), MemoryNetwork::default().transport());
    let err = a.connect_to_room("ws://127.0.0.1:1/ws", ROOM).await.unwrap_err();
    assert!(matches!(err, MeshError::RelayUnreachable { .. }));
}

#[tokio::test]
async fn test_two_peers_over_tcp() {
    let (url, relay) = start_relay().await;
    let a = session("a", MeshConfig::default(), TcpTransport::default());
    join(&a, &url, &relay).await;
    let b = session("b", MeshConfig::default(), TcpTransport::default());
    join(&b, &url, &relay).await;

    let (a, b) = (&a, &b);
    eventually("tcp link", move || async move {
        a.open_links().await == ["b"] && b.open_links().await == ["a"]
    })
    .await;

    a.send_message("radio check", MessageKind::Text).await.unwrap();
    eventually("message over tcp", move || async move { b.messages().await.len() == 1 }).await;
    assert_eq!(b.messages().await[0].content, "radio check");
    assert_eq!(a.view().await, b.view().await);
}
