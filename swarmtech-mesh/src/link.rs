//! Per-peer link: handshake state machine and channel pump.
//!
//! ```text
//!  initiator:  Discovered ─▶ Offering ─▶ AwaitingAnswer ─────────────▶ Open ─▶ Closed
//!                               ▲              │ timeout (retry once)
//!                               └──────────────┘
//!  responder:  Discovered ─▶ AwaitingOffer ─▶ Answering ─▶ Open ─▶ Closed
//!                                  ▲              │ new offer (restart)
//!                                  └──────────────┘
//! ```
//!
//! Every link runs as its own task, so one stuck handshake never delays
//! another. The task owns the transport connection; the connection manager
//! talks to it through [`LinkCommand`]s and hears back through [`LinkEvent`]s
//! tagged with the link's generation.

use std::sync::Arc;
use std::time::Duration;

use swarmtech_core::AgentId;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::protocol::SignalKind;
use crate::signaling::SignalSender;
use crate::transport::{PeerChannel, PeerConnection, Transport, TransportError, TransportEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    Discovered,
    Offering,
    AwaitingAnswer,
    AwaitingOffer,
    Answering,
    Open,
    Closed,
}

impl LinkState {
    pub fn can_transition_to(self, next: LinkState) -> bool {
        use LinkState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Discovered, Offering) | (Discovered, AwaitingOffer) => true,
            (Offering, AwaitingAnswer) => true,
            (AwaitingAnswer, Open) | (AwaitingAnswer, Offering) => true,
            (AwaitingOffer, Answering) => true,
            (Answering, Open) | (Answering, AwaitingOffer) => true,
            _ => false,
        }
    }

    /// Still negotiating.
    pub fn is_handshaking(self) -> bool {
        !matches!(self, LinkState::Open | LinkState::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Initiator,
    Responder,
}

#[derive(Debug)]
pub(crate) enum LinkCommand {
    RemoteOffer(String),
    RemoteAnswer(String),
    RemoteCandidate(String),
    Close,
}

#[derive(Debug)]
pub(crate) enum LinkEvent {
    State { peer: AgentId, generation: u64, state: LinkState },
    Opened { peer: AgentId, generation: u64, tx: mpsc::Sender<Vec<u8>> },
    Frame { peer: AgentId, generation: u64, bytes: Vec<u8> },
}

enum Attempt<C> {
    Open(C, mpsc::Receiver<TransportEvent>, PeerChannel),
    TimedOut,
    Restart(String),
    Ended,
}

enum Step {
    Continue,
    Open(PeerChannel),
    Failed,
}

pub(crate) struct LinkDriver<T: Transport> {
    pub transport: Arc<T>,
    pub local: AgentId,
    pub peer: AgentId,
    pub generation: u64,
    pub role: LinkRole,
    pub handshake_timeout: Duration,
    pub retries: u32,
    pub signals: SignalSender,
    pub events: mpsc::Sender<LinkEvent>,
    pub commands: mpsc::Receiver<LinkCommand>,
    pub state: LinkState,
    pub pending_candidates: Vec<String>,
}

impl<T: Transport> LinkDriver<T> {
    /// Drive the link until it closes. Responders start with the offer that
    /// created them.
    pub async fn run(mut self, mut offer: Option<String>) {
        let mut retries_left = match self.role {
            LinkRole::Initiator => self.retries,
            LinkRole::Responder => 0,
        };

        loop {
            let outcome = match self.role {
                LinkRole::Initiator => self.initiate().await,
                LinkRole::Responder => match offer.take() {
                    Some(remote) => self.respond(remote).await,
                    None => break,
                },
            };

            match outcome {
                Attempt::Open(conn, transport_events, channel) => {
                    self.carry(conn, transport_events, channel).await;
                    break;
                }
                Attempt::Restart(remote) => {
                    log::debug!("Link {} -> {}: new offer, restarting handshake", self.local, self.peer);
                    self.transition(LinkState::AwaitingOffer).await;
                    offer = Some(remote);
                }
                Attempt::TimedOut if retries_left > 0 => {
                    retries_left -= 1;
                    log::warn!(
                        "Link {} -> {}: handshake timed out after {:?}, retrying",
                        self.local,
                        self.peer,
                        self.handshake_timeout
                    );
                }
                Attempt::TimedOut => {
                    log::warn!("Link {} -> {}: handshake timed out, giving up", self.local, self.peer);
                    break;
                }
                Attempt::Ended => break,
            }
        }

        self.transition(LinkState::Closed).await;
    }

    async fn transition(&mut self, next: LinkState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(next) {
            log::warn!("Link {} -> {}: ignoring transition {:?} -> {next:?}", self.local, self.peer, self.state);
            return;
        }
        log::debug!("Link {} -> {}: {:?} -> {next:?}", self.local, self.peer, self.state);
        self.state = next;
        let _ = self
            .events
            .send(LinkEvent::State { peer: self.peer.clone(), generation: self.generation, state: next })
            .await;
    }

    async fn initiate(&mut self) -> Attempt<T::Connection> {
        let deadline = Instant::now() + self.handshake_timeout;
        let (mut conn, mut transport_events) = self.transport.connect(&self.local, &self.peer);
        self.pending_candidates.clear();
        self.transition(LinkState::Offering).await;

        let offer = match tokio::time::timeout_at(deadline, conn.create_offer()).await {
            Ok(Ok(offer)) => offer,
            Ok(Err(e)) => {
                log::warn!("Link {} -> {}: failed to create offer: {e}", self.local, self.peer);
                conn.close();
                return Attempt::Ended;
            }
            Err(_) => {
                conn.close();
                return Attempt::TimedOut;
            }
        };
        if let Err(e) = self.signals.relay(SignalKind::Offer, &self.peer, offer) {
            log::warn!("Link {} -> {}: could not send offer: {e}", self.local, self.peer);
            conn.close();
            return Attempt::Ended;
        }
        self.transition(LinkState::AwaitingAnswer).await;

        let mut described = false;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    conn.close();
                    return Attempt::TimedOut;
                }
                command = self.commands.recv() => match command {
                    None | Some(LinkCommand::Close) => {
                        conn.close();
                        return Attempt::Ended;
                    }
                    Some(LinkCommand::RemoteAnswer(answer)) => match conn.apply_answer(&answer).await {
                        Ok(()) => {
                            described = true;
                            self.flush_candidates(&mut conn).await;
                        }
                        Err(TransportError::StaleDescription) => {
                            log::debug!("Link {} -> {}: ignoring stale answer", self.local, self.peer);
                        }
                        Err(e) => {
                            log::warn!("Link {} -> {}: bad answer: {e}", self.local, self.peer);
                            conn.close();
                            return Attempt::Ended;
                        }
                    },
                    Some(LinkCommand::RemoteCandidate(candidate)) => {
                        if described {
                            self.apply_candidate(&mut conn, &candidate).await;
                        } else {
                            self.pending_candidates.push(candidate);
                        }
                    }
                    Some(LinkCommand::RemoteOffer(_)) => {
                        log::debug!("Link {} -> {}: initiator ignores offers", self.local, self.peer);
                    }
                },
                event = transport_events.recv() => match self.on_transport_event(event) {
                    Step::Continue => {}
                    Step::Open(channel) => return Attempt::Open(conn, transport_events, channel),
                    Step::Failed => {
                        conn.close();
                        return Attempt::Ended;
                    }
                },
            }
        }
    }

    async fn respond(&mut self, offer: String) -> Attempt<T::Connection> {
        let deadline = Instant::now() + self.handshake_timeout;
        let (mut conn, mut transport_events) = self.transport.connect(&self.local, &self.peer);
        self.transition(LinkState::AwaitingOffer).await;
        self.transition(LinkState::Answering).await;

        let answer = match tokio::time::timeout_at(deadline, conn.accept_offer(&offer)).await {
            Ok(Ok(answer)) => answer,
            Ok(Err(e)) => {
                log::warn!("Link {} -> {}: rejected offer: {e}", self.local, self.peer);
                conn.close();
                return Attempt::Ended;
            }
            Err(_) => {
                conn.close();
                return Attempt::TimedOut;
            }
        };
        if let Err(e) = self.signals.relay(SignalKind::Answer, &self.peer, answer) {
            log::warn!("Link {} -> {}: could not send answer: {e}", self.local, self.peer);
            conn.close();
            return Attempt::Ended;
        }
        self.flush_candidates(&mut conn).await;

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    conn.close();
                    return Attempt::TimedOut;
                }
                command = self.commands.recv() => match command {
                    None | Some(LinkCommand::Close) => {
                        conn.close();
                        return Attempt::Ended;
                    }
                    Some(LinkCommand::RemoteOffer(next)) => {
                        conn.close();
                        self.pending_candidates.clear();
                        return Attempt::Restart(next);
                    }
                    Some(LinkCommand::RemoteCandidate(candidate)) => {
                        self.apply_candidate(&mut conn, &candidate).await;
                    }
                    Some(LinkCommand::RemoteAnswer(_)) => {
                        log::debug!("Link {} -> {}: responder ignores answers", self.local, self.peer);
                    }
                },
                event = transport_events.recv() => match self.on_transport_event(event) {
                    Step::Continue => {}
                    Step::Open(channel) => return Attempt::Open(conn, transport_events, channel),
                    Step::Failed => {
                        conn.close();
                        return Attempt::Ended;
                    }
                },
            }
        }
    }

    /// Pump frames between the open channel and the session.
    async fn carry(
        &mut self,
        mut conn: T::Connection,
        mut transport_events: mpsc::Receiver<TransportEvent>,
        channel: PeerChannel,
    ) {
        self.transition(LinkState::Open).await;
        let PeerChannel { tx, mut rx } = channel;
        let opened = LinkEvent::Opened { peer: self.peer.clone(), generation: self.generation, tx };
        if self.events.send(opened).await.is_err() {
            conn.close();
            return;
        }

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    None | Some(LinkCommand::Close) => break,
                    Some(LinkCommand::RemoteCandidate(candidate)) => {
                        self.apply_candidate(&mut conn, &candidate).await;
                    }
                    Some(other) => log::debug!("Link {} -> {}: ignoring {other:?} while open", self.local, self.peer),
                },
                frame = rx.recv() => match frame {
                    Some(bytes) => {
                        let event = LinkEvent::Frame { peer: self.peer.clone(), generation: self.generation, bytes };
                        if self.events.send(event).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        log::debug!("Link {} -> {}: channel closed by peer", self.local, self.peer);
                        break;
                    }
                },
                event = transport_events.recv() => match event {
                    Some(TransportEvent::StateChanged(state)) if state.is_terminal() => {
                        log::warn!("Link {} -> {}: transport {state:?}", self.local, self.peer);
                        break;
                    }
                    None => break,
                    Some(_) => {}
                },
            }
        }
        conn.close();
    }

    fn on_transport_event(&self, event: Option<TransportEvent>) -> Step {
        match event {
            Some(TransportEvent::LocalCandidate(candidate)) => {
                if let Err(e) = self.signals.relay(SignalKind::Candidate, &self.peer, candidate) {
                    log::warn!("Link {} -> {}: could not send candidate: {e}", self.local, self.peer);
                }
                Step::Continue
            }
            Some(TransportEvent::ChannelOpen(channel)) => Step::Open(channel),
            Some(TransportEvent::StateChanged(state)) if state.is_terminal() => {
                log::warn!("Link {} -> {}: transport {state:?} during handshake", self.local, self.peer);
                Step::Failed
            }
            Some(TransportEvent::StateChanged(_)) => Step::Continue,
            None => Step::Failed,
        }
    }

    async fn flush_candidates(&mut self, conn: &mut T::Connection) {
        for candidate in std::mem::take(&mut self.pending_candidates) {
            self.apply_candidate(conn, &candidate).await;
        }
    }

    async fn apply_candidate(&self, conn: &mut T::Connection, candidate: &str) {
        match conn.add_candidate(candidate).await {
            Ok(()) => {}
            Err(TransportError::StaleDescription) => {
                log::debug!("Link {} -> {}: stale candidate", self.local, self.peer);
            }
            Err(e) => log::warn!("Link {} -> {}: candidate rejected: {e}", self.local, self.peer),
        }
    }
}
