//! Maps peers to the feeds they can replicate.
//!
//! Every peer advertises the discovery topics it has joined. The manager
//! intersects those with the locally known feeds and reports each newly
//! replicable `(feed, peer)` pair exactly once — that is what drives the
//! coordinator's "a new peer is interested in this actor" path. It also
//! answers block requests from the local feed store and forwards local
//! appends to subscribed peers.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{
    feed::FeedStore,
    swarm::{PeerHandle, WireMsg},
    ActorId, DiscoveryId, PeerId,
};

/// Feed replication traffic.
#[derive(Debug, Clone, Serialize, Deserialize, strum::Display)]
pub enum FeedWireMsg {
    /// Ask for blocks of a feed starting at `have`; subscribes the sender to
    /// future appends.
    Request { discovery: DiscoveryId, have: u64 },
    /// Signed blocks `(data, signature)` starting at `start`.
    Blocks {
        discovery: DiscoveryId,
        start: u64,
        blocks: Vec<(Bytes, Bytes)>,
    },
}

/// A peer became able to replicate a feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovery {
    pub feed_id: ActorId,
    pub peer: PeerId,
}

#[derive(Debug)]
struct PeerState {
    handle: PeerHandle,
    joined: HashSet<DiscoveryId>,
}

#[derive(Debug, Default)]
pub struct ReplicationManager {
    /// Locally known feeds by their discovery topic.
    feeds: HashMap<DiscoveryId, ActorId>,
    peers: HashMap<PeerId, PeerState>,
    /// `(feed, peer)` pairs already reported.
    shared: HashSet<(DiscoveryId, PeerId)>,
    /// Peers that asked to stay current per feed.
    subscribers: HashMap<DiscoveryId, HashSet<PeerId>>,
}

impl ReplicationManager {
    /// Register feeds the local process wants to replicate.
    ///
    /// Re-advertises to every connected peer and returns the discoveries the
    /// wider interest set now covers.
    pub fn add_feed_ids(&mut self, ids: impl IntoIterator<Item = ActorId>) -> Vec<Discovery> {
        let mut added = false;
        for id in ids {
            added |= self.feeds.insert(id.discovery(), id).is_none();
        }
        if !added {
            return Vec::new();
        }
        let joined: Vec<DiscoveryId> = self.feeds.keys().copied().collect();
        for state in self.peers.values() {
            state.handle.send(WireMsg::Joined(joined.clone()));
        }
        let peers: Vec<PeerId> = self.peers.keys().copied().collect();
        peers
            .into_iter()
            .flat_map(|peer| self.newly_shared(peer))
            .collect()
    }

    /// Handshake a newly connected peer: advertise our interests.
    pub fn on_peer(&mut self, peer: PeerHandle) {
        let joined: Vec<DiscoveryId> = self.feeds.keys().copied().collect();
        peer.send(WireMsg::Joined(joined));
        self.peers.insert(
            peer.id,
            PeerState {
                handle: peer,
                joined: HashSet::new(),
            },
        );
    }

    pub fn remove_peer(&mut self, peer: &PeerId) {
        self.peers.remove(peer);
        self.shared.retain(|(_, p)| p != peer);
        for subs in self.subscribers.values_mut() {
            subs.remove(peer);
        }
    }

    /// A peer advertised its joined topics.
    pub fn on_joined(&mut self, peer: PeerId, topics: Vec<DiscoveryId>) -> Vec<Discovery> {
        let Some(state) = self.peers.get_mut(&peer) else {
            return Vec::new();
        };
        state.joined.extend(topics);
        self.newly_shared(peer)
    }

    fn newly_shared(&mut self, peer: PeerId) -> Vec<Discovery> {
        let Some(state) = self.peers.get(&peer) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for topic in &state.joined {
            if let Some(feed_id) = self.feeds.get(topic) {
                if self.shared.insert((*topic, peer)) {
                    trace!(feed = %feed_id.fmt_short(), peer = %peer.fmt_short(), "discovery");
                    out.push(Discovery {
                        feed_id: *feed_id,
                        peer,
                    });
                }
            }
        }
        out
    }

    /// The peers currently advertising at least one of the given topics.
    pub fn peers_with(&self, topics: impl IntoIterator<Item = DiscoveryId>) -> Vec<PeerId> {
        let topics: HashSet<DiscoveryId> = topics.into_iter().collect();
        self.peers
            .iter()
            .filter(|(_, state)| !state.joined.is_disjoint(&topics))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Ask `peer` for blocks of `feed` beyond what we hold.
    pub fn request_feed(&self, peer: &PeerId, feed: &ActorId, have: u64) {
        if let Some(state) = self.peers.get(peer) {
            state.handle.send(WireMsg::Feed(FeedWireMsg::Request {
                discovery: feed.discovery(),
                have,
            }));
        }
    }

    /// Handle inbound replication traffic.
    pub fn on_feed_msg(
        &mut self,
        sender: PeerId,
        msg: FeedWireMsg,
        feeds: &mut FeedStore,
    ) -> anyhow::Result<()> {
        match msg {
            FeedWireMsg::Request { discovery, have } => {
                let Some(feed_id) = self.feeds.get(&discovery).copied() else {
                    trace!(peer = %sender.fmt_short(), "request for unknown feed");
                    return Ok(());
                };
                self.subscribers.entry(discovery).or_default().insert(sender);
                let blocks = feeds.signed_from(&feed_id, have);
                if !blocks.is_empty() {
                    if let Some(state) = self.peers.get(&sender) {
                        state.handle.send(WireMsg::Feed(FeedWireMsg::Blocks {
                            discovery,
                            start: have,
                            blocks,
                        }));
                    }
                }
            }
            FeedWireMsg::Blocks {
                discovery,
                start,
                blocks,
            } => {
                let Some(feed_id) = self.feeds.get(&discovery).copied() else {
                    trace!(peer = %sender.fmt_short(), "blocks for unknown feed");
                    return Ok(());
                };
                feeds.append_remote(&feed_id, start, blocks)?;
            }
        }
        Ok(())
    }

    /// Forward a local append to every subscribed peer.
    pub fn broadcast_append(
        &self,
        feed: &ActorId,
        start: u64,
        blocks: Vec<(Bytes, Bytes)>,
    ) {
        let discovery = feed.discovery();
        let Some(subs) = self.subscribers.get(&discovery) else {
            return;
        };
        for peer in subs {
            if let Some(state) = self.peers.get(peer) {
                state.handle.send(WireMsg::Feed(FeedWireMsg::Blocks {
                    discovery,
                    start,
                    blocks: blocks.clone(),
                }));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swarm::{SwarmEvent, SwarmHub};
    use crate::Keypair;

    fn peer_id() -> PeerId {
        PeerId::from_bytes(
            *Keypair::generate(&mut rand::thread_rng())
                .public()
                .as_bytes(),
        )
    }

    async fn handle_pair() -> (PeerHandle, PeerHandle) {
        let hub = SwarmHub::new();
        let (a, b) = (peer_id(), peer_id());
        let (swarm_a, mut events_a) = hub.bind(a);
        let (swarm_b, mut events_b) = hub.bind(b);
        let topic = Keypair::generate(&mut rand::thread_rng())
            .public()
            .discovery();
        swarm_a.join(topic);
        swarm_b.join(topic);
        let SwarmEvent::Peer { peer: to_b, .. } = events_a.recv().await.unwrap();
        let SwarmEvent::Peer { peer: to_a, .. } = events_b.recv().await.unwrap();
        (to_b, to_a)
    }

    #[tokio::test]
    async fn discovery_fires_once_per_pair() {
        let (to_b, _to_a) = handle_pair().await;
        let remote = to_b.id;
        let mut manager = ReplicationManager::default();
        let feed = Keypair::generate(&mut rand::thread_rng()).public();

        manager.on_peer(to_b);
        assert!(manager.add_feed_ids([feed]).is_empty(), "peer has not joined yet");

        let found = manager.on_joined(remote, vec![feed.discovery()]);
        assert_eq!(
            found,
            vec![Discovery {
                feed_id: feed,
                peer: remote
            }]
        );
        assert!(manager.on_joined(remote, vec![feed.discovery()]).is_empty());
        assert_eq!(manager.peers_with([feed.discovery()]), vec![remote]);
    }
}
