//! Direct TCP transport with WebSocket framing.
//!
//! Handshake mapping:
//! ```text
//! offer      "swarm-tcp/1 offer <token>"    initiator binds an ephemeral listener
//! candidate  "<host>:<port>"                one per advertised host of that listener
//! answer     "swarm-tcp/1 answer <token>"   responder echoes the token
//! ```
//! The responder dials every candidate it learns and presents the token as
//! its first (text) frame; the first dial whose token checks out becomes the
//! channel, later ones are dropped. Data frames are binary WebSocket
//! messages, so ordering and reliability come from TCP.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use swarmtech_core::AgentId;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use super::{PeerChannel, PeerConnection, Transport, TransportError, TransportEvent, TransportState};
use crate::config::TcpTransportConfig;

const OFFER_PREFIX: &str = "swarm-tcp/1 offer ";
const ANSWER_PREFIX: &str = "swarm-tcp/1 answer ";
const EVENT_CAPACITY: usize = 32;
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct TcpTransport {
    config: Arc<TcpTransportConfig>,
    channel_capacity: usize,
}

impl TcpTransport {
    pub fn new(config: TcpTransportConfig, channel_capacity: usize) -> Self {
        Self { config: Arc::new(config), channel_capacity }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(TcpTransportConfig::default(), 256)
    }
}

impl Transport for TcpTransport {
    type Connection = TcpConnection;

    fn connect(&self, local: &AgentId, remote: &AgentId) -> (TcpConnection, mpsc::Receiver<TransportEvent>) {
        let (events, rx) = mpsc::channel(EVENT_CAPACITY);
        let conn = TcpConnection {
            config: self.config.clone(),
            channel_capacity: self.channel_capacity,
            label: format!("{local}->{remote}"),
            events,
            phase: Phase::Idle,
            opened: Arc::new(AtomicBool::new(false)),
            tasks: Vec::new(),
        };
        (conn, rx)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Idle,
    Offered(String),
    Answered(String),
    Closed,
}

pub struct TcpConnection {
    config: Arc<TcpTransportConfig>,
    channel_capacity: usize,
    label: String,
    events: mpsc::Sender<TransportEvent>,
    phase: Phase,
    opened: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

fn parse_token<'a>(value: &'a str, prefix: &str) -> Result<&'a str, TransportError> {
    value
        .strip_prefix(prefix)
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| TransportError::MalformedDescription(value.to_string()))
}

fn parse_candidate(candidate: &str) -> Result<String, TransportError> {
    let malformed = || TransportError::MalformedCandidate(candidate.to_string());
    let (host, port) = candidate.rsplit_once(':').ok_or_else(malformed)?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(malformed());
    }
    Ok(candidate.to_string())
}

impl PeerConnection for TcpConnection {
    async fn create_offer(&mut self) -> Result<String, TransportError> {
        if self.phase != Phase::Idle {
            return Err(TransportError::WrongPhase("create_offer"));
        }
        let listener = TcpListener::bind((self.config.listen_host.as_str(), 0)).await?;
        let port = listener.local_addr()?.port();
        let token = Uuid::new_v4().to_string();

        let _ = self.events.try_send(TransportEvent::StateChanged(TransportState::Connecting));
        let hosts = if self.config.advertise_hosts.is_empty() {
            std::slice::from_ref(&self.config.listen_host)
        } else {
            self.config.advertise_hosts.as_slice()
        };
        for host in hosts {
            let _ = self.events.try_send(TransportEvent::LocalCandidate(format!("{host}:{port}")));
        }

        log::debug!("{} listening on port {port}", self.label);
        self.tasks.push(tokio::spawn(accept_loop(
            listener,
            token.clone(),
            self.events.clone(),
            self.channel_capacity,
        )));
        self.phase = Phase::Offered(token.clone());
        Ok(format!("{OFFER_PREFIX}{token}"))
    }

    async fn accept_offer(&mut self, offer: &str) -> Result<String, TransportError> {
        if self.phase != Phase::Idle {
            return Err(TransportError::WrongPhase("accept_offer"));
        }
        let token = parse_token(offer, OFFER_PREFIX)?.to_string();
        let _ = self.events.try_send(TransportEvent::StateChanged(TransportState::Connecting));
        self.phase = Phase::Answered(token.clone());
        Ok(format!("{ANSWER_PREFIX}{token}"))
    }

    async fn apply_answer(&mut self, answer: &str) -> Result<(), TransportError> {
        let Phase::Offered(own) = &self.phase else {
            return Err(TransportError::WrongPhase("apply_answer"));
        };
        if parse_token(answer, ANSWER_PREFIX)? != own.as_str() {
            return Err(TransportError::StaleDescription);
        }
        Ok(())
    }

    async fn add_candidate(&mut self, candidate: &str) -> Result<(), TransportError> {
        let token = match &self.phase {
            Phase::Offered(_) => return Ok(()),
            Phase::Answered(token) => token.clone(),
            Phase::Idle | Phase::Closed => return Err(TransportError::WrongPhase("add_candidate")),
        };
        let addr = parse_candidate(candidate)?;
        if self.opened.load(Ordering::Acquire) {
            return Ok(());
        }
        self.tasks.push(tokio::spawn(dial(
            addr,
            token,
            self.events.clone(),
            self.channel_capacity,
            self.opened.clone(),
        )));
        Ok(())
    }

    fn close(&mut self) {
        if self.phase == Phase::Closed {
            return;
        }
        self.phase = Phase::Closed;
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Accept dials until one presents the token, then carry its traffic.
async fn accept_loop(
    listener: TcpListener,
    token: String,
    events: mpsc::Sender<TransportEvent>,
    capacity: usize,
) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                log::warn!("Peer listener failed: {e}");
                let _ = events.send(TransportEvent::StateChanged(TransportState::Failed)).await;
                return;
            }
        };
        match tokio::time::timeout(DIAL_TIMEOUT, verify_dialer(stream, &token)).await {
            Ok(Ok(ws)) => {
                drop(listener);
                carry(ws, events, capacity).await;
                return;
            }
            Ok(Err(e)) => log::debug!("Rejected dial from {addr}: {e}"),
            Err(_) => log::debug!("Dial from {addr} timed out before presenting a token"),
        }
    }
}

async fn verify_dialer(stream: TcpStream, token: &str) -> Result<WebSocketStream<TcpStream>, TransportError> {
    let mut ws = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| TransportError::Refused(e.to_string()))?;
    match ws.next().await {
        Some(Ok(Message::Text(presented))) if presented.as_str() == token => Ok(ws),
        _ => Err(TransportError::Refused("token mismatch".into())),
    }
}

async fn dial(
    addr: String,
    token: String,
    events: mpsc::Sender<TransportEvent>,
    capacity: usize,
    opened: Arc<AtomicBool>,
) {
    let attempt = async {
        let stream = TcpStream::connect(&addr).await?;
        let (mut ws, _) = tokio_tungstenite::client_async(format!("ws://{addr}/"), stream)
            .await
            .map_err(|e| TransportError::Refused(e.to_string()))?;
        ws.send(Message::text(token.clone()))
            .await
            .map_err(|e| TransportError::Refused(e.to_string()))?;
        Ok::<_, TransportError>(ws)
    };

    match tokio::time::timeout(DIAL_TIMEOUT, attempt).await {
        Ok(Ok(ws)) => {
            if opened.swap(true, Ordering::AcqRel) {
                log::trace!("Candidate {addr} connected after another one won");
                return;
            }
            carry(ws, events, capacity).await;
        }
        Ok(Err(e)) => log::debug!("Candidate {addr} failed: {e}"),
        Err(_) => log::debug!("Candidate {addr} timed out"),
    }
}

/// Bridge a verified WebSocket to a [`PeerChannel`] until either side ends.
async fn carry(ws: WebSocketStream<TcpStream>, events: mpsc::Sender<TransportEvent>, capacity: usize) {
    let (app_end, bridge_end) = PeerChannel::pair(capacity);
    let PeerChannel { tx: inbound, rx: mut outbound } = bridge_end;
    let (mut sink, mut stream) = ws.split();

    let _ = events.send(TransportEvent::StateChanged(TransportState::Connected)).await;
    if events.send(TransportEvent::ChannelOpen(app_end)).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            out = outbound.recv() => match out {
                Some(bytes) => {
                    if sink.send(Message::Binary(bytes.into())).await.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            msg = stream.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    if inbound.send(data.into()).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    log::warn!("Peer channel error: {e}");
                    break;
                }
                _ => {}
            },
        }
    }

    let _ = events.send(TransportEvent::StateChanged(TransportState::Disconnected)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_candidate() {
        assert_eq!(parse_candidate("127.0.0.1:4000").unwrap(), "127.0.0.1:4000");
        assert!(parse_candidate("127.0.0.1").is_err());
        assert!(parse_candidate(":4000").is_err());
        assert!(parse_candidate("host:99999").is_err());
    }

    #[tokio::test]
    async fn test_wrong_phase() {
        let transport = TcpTransport::default();
        let (mut conn, _rx) = transport.connect(&"a".to_string(), &"b".to_string());
        assert_eq!(
            conn.apply_answer("swarm-tcp/1 answer x").await,
            Err(TransportError::WrongPhase("apply_answer"))
        );
        assert!(conn.add_candidate("127.0.0.1:1").await.is_err());
    }

    #[tokio::test]
    async fn test_loopback_channel() {
        let transport = TcpTransport::default();
        let (mut a, mut a_rx) = transport.connect(&"a".to_string(), &"b".to_string());
        let (mut b, mut b_rx) = transport.connect(&"b".to_string(), &"a".to_string());

        let offer = a.create_offer().await.unwrap();
        let answer = b.accept_offer(&offer).await.unwrap();
        a.apply_answer(&answer).await.unwrap();
        assert_eq!(a.apply_answer("swarm-tcp/1 answer other").await, Err(TransportError::StaleDescription));

        let mut a_end = None;
        while a_end.is_none() {
            match a_rx.recv().await.unwrap() {
                TransportEvent::LocalCandidate(c) => b.add_candidate(&c).await.unwrap(),
                TransportEvent::ChannelOpen(ch) => a_end = Some(ch),
                TransportEvent::StateChanged(_) => {}
            }
        }
        let mut b_end = loop {
            if let TransportEvent::ChannelOpen(ch) = b_rx.recv().await.unwrap() {
                break ch;
            }
        };
        let mut a_end = a_end.unwrap();

        a_end.tx.send(b"hello".to_vec()).await.unwrap();
        assert_eq!(b_end.rx.recv().await.unwrap(), b"hello".to_vec());
        b_end.tx.send(vec![9; 4096]).await.unwrap();
        assert_eq!(a_end.rx.recv().await.unwrap().len(), 4096);

        b.close();
        assert!(a_end.rx.recv().await.is_none());
    }
}
