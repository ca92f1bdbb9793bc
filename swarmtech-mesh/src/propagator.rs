//! Fan-out of document frames to open links.
//!
//! Each route owns an unbounded outbox drained by a writer task that awaits
//! the link's bounded channel. Callers never block and a slow link never
//! loses a frame: it falls behind and catches up in order. A route whose
//! link is gone is dropped from the table.

use std::collections::HashMap;

use swarmtech_core::AgentId;
use tokio::sync::mpsc;

struct Route {
    generation: u64,
    outbox: mpsc::UnboundedSender<Vec<u8>>,
}

impl Route {
    fn spawn(generation: u64, link: mpsc::Sender<Vec<u8>>) -> Self {
        let (outbox, mut pending) = mpsc::unbounded_channel::<Vec<u8>>();
        tokio::spawn(async move {
            while let Some(frame) = pending.recv().await {
                if link.send(frame).await.is_err() {
                    break;
                }
            }
        });
        Self { generation, outbox }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PropagatorStats {
    pub sent: u64,
    pub dropped: u64,
}

#[derive(Default)]
pub struct Propagator {
    routes: HashMap<AgentId, Route>,
    stats: PropagatorStats,
}

impl Propagator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the channel of a newly opened link, replacing any older one.
    /// Must be called from within a tokio runtime.
    pub fn insert(&mut self, peer: AgentId, generation: u64, tx: mpsc::Sender<Vec<u8>>) {
        self.routes.insert(peer, Route::spawn(generation, tx));
    }

    /// Remove `peer`'s route if it still belongs to `generation`.
    pub fn remove(&mut self, peer: &str, generation: u64) -> bool {
        if self.routes.get(peer).is_some_and(|r| r.generation == generation) {
            self.routes.remove(peer);
            return true;
        }
        false
    }

    /// Queue `frame` on one link. Fails only once the link is gone.
    pub fn send_to(&mut self, peer: &str, frame: &[u8]) -> bool {
        let Some(route) = self.routes.get(peer) else {
            return false;
        };
        if route.outbox.send(frame.to_vec()).is_err() {
            log::debug!("Link to {peer} is gone, dropping its route");
            self.routes.remove(peer);
            self.stats.dropped += 1;
            return false;
        }
        self.stats.sent += 1;
        true
    }

    /// Queue `frame` on every open link except `except`. Returns the number
    /// of links it was queued on.
    pub fn broadcast(&mut self, frame: &[u8], except: Option<&str>) -> usize {
        let targets: Vec<AgentId> = self
            .routes
            .keys()
            .filter(|peer| Some(peer.as_str()) != except)
            .cloned()
            .collect();
        targets.iter().filter(|peer| self.send_to(peer, frame)).count()
    }

    /// Peers with a registered channel, sorted.
    pub fn peers(&self) -> Vec<AgentId> {
        let mut peers: Vec<AgentId> = self.routes.keys().cloned().collect();
        peers.sort();
        peers
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn stats(&self) -> PropagatorStats {
        self.stats
    }

    pub fn clear(&mut self) {
        self.routes.clear();
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    fn route(p: &mut Propagator, peer: &str, generation: u64, capacity: usize) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(capacity);
        p.insert(peer.to_string(), generation, tx);
        rx
    }

    async fn next(rx: &mut mpsc::Receiver<Vec<u8>>) -> Vec<u8> {
        timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_broadcast_skips_origin() {
        let mut p = Propagator::new();
        let mut a = route(&mut p, "a", 1, 4);
        let mut b = route(&mut p, "b", 1, 4);
        let mut c = route(&mut p, "c", 1, 4);

        assert_eq!(p.broadcast(b"delta", Some("b")), 2);
        assert_eq!(p.broadcast(b"local", None), 3);
        assert_eq!(next(&mut a).await, b"delta".to_vec());
        assert_eq!(next(&mut c).await, b"delta".to_vec());
        assert_eq!(next(&mut b).await, b"local".to_vec(), "b never saw the delta");
        assert_eq!(p.stats().sent, 5);
    }

    #[tokio::test]
    async fn test_remove_checks_generation() {
        let mut p = Propagator::new();
        let _old = route(&mut p, "a", 1, 4);
        let _new = route(&mut p, "a", 2, 4);
        assert!(!p.remove("a", 1));
        assert_eq!(p.len(), 1);
        assert!(p.remove("a", 2));
        assert!(p.is_empty());
    }

    #[tokio::test]
    async fn test_slow_link_receives_every_frame_in_order() {
        let mut p = Propagator::new();
        let mut slow = route(&mut p, "slow", 1, 2);

        for i in 0..500u32 {
            assert!(p.send_to("slow", &i.to_be_bytes()));
        }
        for i in 0..500u32 {
            tokio::task::yield_now().await;
            assert_eq!(next(&mut slow).await, i.to_be_bytes().to_vec());
        }
        assert_eq!(p.stats(), PropagatorStats { sent: 500, dropped: 0 });
    }

    #[tokio::test]
    async fn test_closed_link_route_removed() {
        let mut p = Propagator::new();
        let gone = route(&mut p, "gone", 1, 1);
        drop(gone);

        // The writer notices the closed link on its first frame, then exits.
        p.send_to("gone", b"1");
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while p.send_to("gone", b"2") {
            assert!(tokio::time::Instant::now() < deadline, "route never dropped");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(p.is_empty());
        assert_eq!(p.stats().dropped, 1);
    }
}
