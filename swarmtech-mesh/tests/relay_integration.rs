//! Integration tests for the signaling relay.
//!
//! These tests start a real relay on a loopback port and talk to it with
//! raw WebSocket clients and a `reqwest` HTTP client.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use swarmtech_core::{Agent, Role};
use swarmtech_mesh::{RelayServer, RelayState, SignalMessage};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout, Duration, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_relay() -> (SocketAddr, RelayState) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = RelayServer::with_defaults();
    let state = server.state();
    tokio::spawn(async move {
        server.serve(listener, std::future::pending()).await.unwrap();
    });
    (addr, state)
}

async fn connect(addr: SocketAddr) -> Ws {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws")).await.unwrap();
    ws
}

async fn send(ws: &mut Ws, msg: SignalMessage) {
    ws.send(Message::Binary(msg.encode().unwrap().into())).await.unwrap();
}

async fn recv(ws: &mut Ws) -> SignalMessage {
    loop {
        let msg = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for relay frame")
            .expect("relay closed the connection")
            .unwrap();
        if let Message::Binary(data) = msg {
            let bytes: Vec<u8> = data.into();
            return SignalMessage::decode(&bytes).unwrap();
        }
    }
}

async fn join(ws: &mut Ws, room: &str, id: &str) -> Vec<Agent> {
    send(ws, SignalMessage::JoinRoom { room_id: room.into(), agent: Agent::with_id(id, id, Role::Field) }).await;
    match recv(ws).await {
        SignalMessage::RoomPeers { peers, .. } => peers,
        other => panic!("expected room-peers, got {other:?}"),
    }
}

/// GET a JSON endpoint, returning (status, body).
async fn http_get(addr: SocketAddr, path: &str) -> (u16, serde_json::Value) {
    let response = timeout(Duration::from_secs(5), reqwest::get(format!("http://{addr}{path}")))
        .await
        .expect("timed out waiting for HTTP response")
        .unwrap();
    let status = response.status().as_u16();
    (status, response.json().await.unwrap())
}

async fn wait_for_room(state: &RelayState, room: &str, members: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let count = state.registry().members(room).await.len();
        if count == members {
            return;
        }
        assert!(Instant::now() < deadline, "room {room} stuck at {count} members, wanted {members}");
        sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_room_lifecycle() {
    let (addr, state) = start_relay().await;
    let mut a = connect(addr).await;
    let mut b = connect(addr).await;

    assert!(join(&mut a, "room-1", "a").await.is_empty());
    let (status, body) = http_get(addr, "/rooms/room-1").await;
    assert_eq!(status, 200);
    assert_eq!(body["id"], "room-1");
    assert_eq!(body["name"], "room-1");
    assert_eq!(body["peerCount"], 1);
    assert!(body["createdAt"].as_u64().unwrap() > 0);

    let peers = join(&mut b, "room-1", "b").await;
    assert_eq!(peers.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(), ["a"]);
    match recv(&mut a).await {
        SignalMessage::PeerJoined { room_id, peer } => {
            assert_eq!(room_id, "room-1");
            assert_eq!(peer.id, "b");
        }
        other => panic!("expected peer-joined, got {other:?}"),
    }

    a.close(None).await.unwrap();
    assert_eq!(
        recv(&mut b).await,
        SignalMessage::PeerLeft { room_id: "room-1".into(), peer_id: "a".into() }
    );

    send(&mut b, SignalMessage::LeaveRoom).await;
    wait_for_room(&state, "room-1", 0).await;
    let (status, body) = http_get(addr, "/rooms/room-1").await;
    assert_eq!(status, 404);
    assert_eq!(body["error"], "Room not found");
}

#[tokio::test]
async fn test_handshake_payloads_relayed_with_bound_sender() {
    let (addr, _state) = start_relay().await;
    let mut a = connect(addr).await;
    let mut b = connect(addr).await;
    join(&mut a, "room-1", "a").await;
    join(&mut b, "room-1", "b").await;
    let _ = recv(&mut a).await; // peer-joined

    let sdp = "v=0\r\nopaque \u{1F4E1}".to_string();
    send(&mut b, SignalMessage::Offer { from: "mallory".into(), to: "a".into(), sdp: sdp.clone() }).await;
    assert_eq!(recv(&mut a).await, SignalMessage::Offer { from: "b".into(), to: "a".into(), sdp });

    send(&mut a, SignalMessage::IceCandidate { from: "a".into(), to: "b".into(), candidate: "c1".into() }).await;
    assert_eq!(
        recv(&mut b).await,
        SignalMessage::IceCandidate { from: "a".into(), to: "b".into(), candidate: "c1".into() }
    );
}

#[tokio::test]
async fn test_missing_target_and_garbage_are_dropped() {
    let (addr, state) = start_relay().await;
    let mut a = connect(addr).await;
    join(&mut a, "room-1", "a").await;

    send(&mut a, SignalMessage::Answer { from: "a".into(), to: "ghost".into(), sdp: "x".into() }).await;
    a.send(Message::Binary(vec![0xFF, 0x00, 0x13].into())).await.unwrap();
    send(&mut a, SignalMessage::Ping).await;

    // Nothing came back for the dropped frames; the session is still alive.
    assert_eq!(recv(&mut a).await, SignalMessage::Pong);
    let stats = state.stats().await;
    assert_eq!(stats.dropped_frames, 1);
    assert_eq!(stats.relayed_frames, 0);
}

#[tokio::test]
async fn test_relay_before_join_is_dropped() {
    let (addr, state) = start_relay().await;
    let mut a = connect(addr).await;
    send(&mut a, SignalMessage::Offer { from: "a".into(), to: "b".into(), sdp: "x".into() }).await;
    send(&mut a, SignalMessage::Ping).await;
    assert_eq!(recv(&mut a).await, SignalMessage::Pong);
    assert_eq!(state.registry().room_count().await, 0);
}

#[tokio::test]
async fn test_second_join_leaves_previous_room() {
    let (addr, state) = start_relay().await;
    let mut a = connect(addr).await;
    let mut b = connect(addr).await;
    join(&mut a, "room-1", "a").await;
    join(&mut b, "room-1", "b").await;
    let _ = recv(&mut a).await;

    assert!(join(&mut a, "room-2", "a").await.is_empty());
    assert_eq!(
        recv(&mut b).await,
        SignalMessage::PeerLeft { room_id: "room-1".into(), peer_id: "a".into() }
    );
    assert_eq!(state.registry().members("room-1").await.len(), 1);
    assert_eq!(state.registry().members("room-2").await.len(), 1);
}

#[tokio::test]
async fn test_superseded_session_close_keeps_new_binding() {
    let (addr, state) = start_relay().await;
    let mut first = connect(addr).await;
    let mut second = connect(addr).await;
    join(&mut first, "room-1", "a").await;
    join(&mut second, "room-1", "a").await;

    first.close(None).await.unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while state.stats().await.active_connections != 1 {
        assert!(Instant::now() < deadline, "first session never closed");
        sleep(Duration::from_millis(10)).await;
    }

    let (_, body) = http_get(addr, "/rooms/room-1").await;
    assert_eq!(body["peerCount"], 1);
    assert_eq!(state.stats().await.total_connections, 2);
}

#[tokio::test]
async fn test_health_endpoint() {
    let (addr, _state) = start_relay().await;
    let (status, body) = http_get(addr, "/health").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["rooms"], 0);
    assert!(body["uptime"].as_f64().unwrap() >= 0.0);
    assert!(body["timestamp"].as_u64().unwrap() > 0);
}
