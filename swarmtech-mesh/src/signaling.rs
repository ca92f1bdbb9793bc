//! WebSocket client for the signaling relay.
//!
//! Owns one connection to the relay. Outgoing frames go through a bounded
//! queue drained by a writer task; a reader task decodes incoming frames and
//! forwards them as [`SignalEvent`]s. Both tasks stop when the socket closes.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use swarmtech_core::{Agent, AgentId};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::error::MeshError;
use crate::protocol::{ProtocolError, SignalKind, SignalMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalEvent {
    Message(SignalMessage),
    /// The relay connection is gone; no further events follow.
    Disconnected,
}

pub(crate) enum Outgoing {
    Frame(SignalMessage),
    Close,
}

/// Cloneable handle for sending handshake payloads as one agent.
#[derive(Clone)]
pub struct SignalSender {
    local_id: AgentId,
    outgoing: mpsc::Sender<Outgoing>,
}

impl SignalSender {
    /// Queue a relayed handshake payload for `to`. Never blocks; a full or
    /// closed queue drops the frame.
    pub fn relay(&self, kind: SignalKind, to: &str, payload: String) -> Result<(), ProtocolError> {
        let msg = SignalMessage::relayed(kind, self.local_id.as_str(), to, payload);
        self.outgoing.try_send(Outgoing::Frame(msg)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ProtocolError::Timeout,
            mpsc::error::TrySendError::Closed(_) => ProtocolError::ConnectionClosed,
        })
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    #[cfg(test)]
    pub(crate) fn for_tests(local_id: &str, outgoing: mpsc::Sender<Outgoing>) -> Self {
        Self { local_id: local_id.to_string(), outgoing }
    }
}

pub struct SignalClient {
    url: String,
    sender: SignalSender,
    state: Arc<RwLock<ConnectionState>>,
    tasks: Vec<JoinHandle<()>>,
}

impl SignalClient {
    /// Connect to `url` (e.g. `ws://host:8001/ws`) as `local_id`.
    pub async fn connect(
        url: &str,
        local_id: impl Into<AgentId>,
        capacity: usize,
    ) -> Result<(Self, mpsc::Receiver<SignalEvent>), MeshError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| MeshError::RelayUnreachable { url: url.to_string(), reason: e.to_string() })?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Outgoing>(capacity);
        let (event_tx, event_rx) = mpsc::channel::<SignalEvent>(capacity);
        let state = Arc::new(RwLock::new(ConnectionState::Connected));

        let writer = tokio::spawn(async move {
            while let Some(outgoing) = out_rx.recv().await {
                let frame = match outgoing {
                    Outgoing::Frame(msg) => match msg.encode() {
                        Ok(bytes) => Message::Binary(bytes.into()),
                        Err(e) => {
                            log::warn!("Dropping unencodable {}: {e}", msg.name());
                            continue;
                        }
                    },
                    Outgoing::Close => {
                        let _ = ws_writer.send(Message::Close(None)).await;
                        break;
                    }
                };
                if ws_writer.send(frame).await.is_err() {
                    break;
                }
            }
        });

        let reader_state = state.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match SignalMessage::decode(&bytes) {
                            Ok(signal) => {
                                log::trace!("Relay sent {}", signal.name());
                                if event_tx.send(SignalEvent::Message(signal)).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => log::warn!("Failed to decode relay frame: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            *reader_state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SignalEvent::Disconnected).await;
        });

        log::info!("Connected to relay {url}");
        let client = Self {
            url: url.to_string(),
            sender: SignalSender { local_id: local_id.into(), outgoing: out_tx },
            state,
            tasks: vec![writer, reader],
        };
        Ok((client, event_rx))
    }

    async fn send(&self, msg: SignalMessage) -> Result<(), ProtocolError> {
        self.sender
            .outgoing
            .send(Outgoing::Frame(msg))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    pub async fn join_room(&self, room_id: &str, agent: &Agent) -> Result<(), ProtocolError> {
        self.send(SignalMessage::JoinRoom { room_id: room_id.to_string(), agent: agent.clone() }).await
    }

    pub async fn leave_room(&self) -> Result<(), ProtocolError> {
        self.send(SignalMessage::LeaveRoom).await
    }

    pub async fn ping(&self) -> Result<(), ProtocolError> {
        self.send(SignalMessage::Ping).await
    }

    /// Handle for link drivers.
    pub fn sender(&self) -> SignalSender {
        self.sender.clone()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Send a close frame and stop both tasks.
    pub async fn close(mut self) {
        let _ = self.sender.outgoing.send(Outgoing::Close).await;
        let mut tasks = std::mem::take(&mut self.tasks);
        if let Some(writer) = tasks.first_mut() {
            let _ = tokio::time::timeout(std::time::Duration::from_secs(1), writer).await;
        }
        for task in tasks {
            task.abort();
        }
        *self.state.write().await = ConnectionState::Disconnected;
    }
}

impl Drop for SignalClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
