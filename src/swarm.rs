//! Discovery and transport collaborator.
//!
//! An in-memory hub connects repo endpoints that share at least one topic.
//! Each connection is a pair of unbounded duplex channels carrying
//! [`WireMsg`]s; the gossip extension and the feed replication protocol share
//! the stream on disjoint tags.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::trace;

use crate::{replication::FeedWireMsg, DiscoveryId, PeerId};

/// Everything that travels on a peer stream.
#[derive(Debug, Clone, Serialize, Deserialize, strum::Display)]
pub enum WireMsg {
    /// The set of discovery topics the sender currently advertises.
    Joined(Vec<DiscoveryId>),
    /// A named extension message (typed gossip).
    Ext { name: String, payload: Bytes },
    /// Feed replication traffic.
    Feed(FeedWireMsg),
}

/// Sending half of a peer connection.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    pub id: PeerId,
    tx: mpsc::UnboundedSender<WireMsg>,
}

impl PeerHandle {
    /// Transmit, ignoring a hung-up peer.
    pub fn send(&self, msg: WireMsg) {
        self.tx.send(msg).ok();
    }
}

/// Notifications from the swarm to the coordinator.
#[derive(Debug)]
pub enum SwarmEvent {
    /// A connected peer stream came up.
    Peer {
        peer: PeerHandle,
        rx: mpsc::UnboundedReceiver<WireMsg>,
    },
}

#[derive(Debug, Default)]
struct Endpoint {
    topics: HashSet<DiscoveryId>,
    events: Option<mpsc::UnboundedSender<SwarmEvent>>,
    connected: HashSet<PeerId>,
}

#[derive(Debug, Default)]
struct HubInner {
    endpoints: HashMap<PeerId, Endpoint>,
}

/// In-memory rendezvous hub. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct SwarmHub {
    inner: Arc<Mutex<HubInner>>,
}

impl SwarmHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint and get its swarm handle plus event stream.
    pub fn bind(&self, id: PeerId) -> (Swarm, mpsc::UnboundedReceiver<SwarmEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        let endpoint = inner.endpoints.entry(id).or_default();
        endpoint.events = Some(tx);
        (
            Swarm {
                id,
                inner: self.inner.clone(),
            },
            rx,
        )
    }
}

/// One repo's view of the swarm.
#[derive(Debug, Clone)]
pub struct Swarm {
    id: PeerId,
    inner: Arc<Mutex<HubInner>>,
}

impl Swarm {
    /// Start advertising a topic. Connects to every endpoint already on it.
    pub fn join(&self, topic: DiscoveryId) {
        let mut inner = self.inner.lock();
        let Some(endpoint) = inner.endpoints.get_mut(&self.id) else {
            return;
        };
        if !endpoint.topics.insert(topic) {
            return;
        }
        trace!(me = %self.id.fmt_short(), topic = %topic.fmt_short(), "join");
        let candidates: Vec<PeerId> = inner
            .endpoints
            .iter()
            .filter(|(other, ep)| {
                **other != self.id
                    && ep.topics.contains(&topic)
                    && !ep.connected.contains(&self.id)
            })
            .map(|(other, _)| *other)
            .collect();
        for other in candidates {
            connect(&mut inner, self.id, other);
        }
    }

    /// Stop advertising a topic. Existing connections stay up.
    pub fn leave(&self, topic: DiscoveryId) {
        let mut inner = self.inner.lock();
        if let Some(endpoint) = inner.endpoints.get_mut(&self.id) {
            endpoint.topics.remove(&topic);
        }
    }

    /// Drop off the hub entirely; peers observe closed streams.
    pub fn unbind(&self) {
        let mut inner = self.inner.lock();
        if let Some(endpoint) = inner.endpoints.remove(&self.id) {
            for other in endpoint.connected {
                if let Some(ep) = inner.endpoints.get_mut(&other) {
                    ep.connected.remove(&self.id);
                }
            }
        }
    }
}

fn connect(inner: &mut HubInner, left: PeerId, right: PeerId) {
    let (left_tx, left_rx) = mpsc::unbounded_channel();
    let (right_tx, right_rx) = mpsc::unbounded_channel();
    let deliveries = [
        // each side gets a handle naming the *remote* peer
        (left, right, right_tx, left_rx),
        (right, left, left_tx, right_rx),
    ];
    for (me, remote, tx, rx) in deliveries {
        let Some(endpoint) = inner.endpoints.get_mut(&me) else {
            continue;
        };
        endpoint.connected.insert(remote);
        if let Some(events) = &endpoint.events {
            events
                .send(SwarmEvent::Peer {
                    peer: PeerHandle { id: remote, tx },
                    rx,
                })
                .ok();
        }
    }
    trace!(left = %left.fmt_short(), right = %right.fmt_short(), "peers connected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Keypair;

    fn peer() -> PeerId {
        PeerId::from_bytes(
            *Keypair::generate(&mut rand::thread_rng())
                .public()
                .as_bytes(),
        )
    }

    fn topic() -> DiscoveryId {
        Keypair::generate(&mut rand::thread_rng())
            .public()
            .discovery()
    }

    #[tokio::test]
    async fn shared_topic_connects_both_sides() {
        let hub = SwarmHub::new();
        let (one, two) = (peer(), peer());
        let (swarm_one, mut events_one) = hub.bind(one);
        let (swarm_two, mut events_two) = hub.bind(two);
        let t = topic();
        swarm_one.join(t);
        swarm_two.join(t);

        let SwarmEvent::Peer { peer, mut rx } = events_one.recv().await.unwrap();
        assert_eq!(peer.id, two);
        let SwarmEvent::Peer { peer: back, .. } = events_two.recv().await.unwrap();
        assert_eq!(back.id, one);

        back.send(WireMsg::Joined(vec![t]));
        assert!(matches!(rx.recv().await, Some(WireMsg::Joined(_))));
    }

    #[tokio::test]
    async fn one_connection_per_pair() {
        let hub = SwarmHub::new();
        let (one, two) = (peer(), peer());
        let (swarm_one, mut events_one) = hub.bind(one);
        let (swarm_two, _events_two) = hub.bind(two);
        let (ta, tb) = (topic(), topic());
        swarm_one.join(ta);
        swarm_one.join(tb);
        swarm_two.join(ta);
        swarm_two.join(tb);

        assert!(events_one.recv().await.is_some());
        assert!(events_one.try_recv().is_err(), "second shared topic must not reconnect");
    }
}
