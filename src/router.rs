//! Typed gossip multiplexed over peer streams.
//!
//! Gossip rides a named extension channel on each peer's transport stream,
//! next to (but disjoint from) feed replication. Remote metadata is
//! sanitized before it is merged: a peer is only authoritative about its own
//! writability, so writable bits are always stripped.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    metadata::MetadataBlock,
    swarm::{PeerHandle, WireMsg},
    Clock, DocId, PeerId,
};

/// The extension tag gossip travels under.
pub const EXTENSION: &str = "hypermerge.2";

/// Gossip exchanged between peers.
#[derive(Debug, Clone, Serialize, Deserialize, strum::Display)]
pub enum PeerMsg {
    /// What the sender knows: metadata blocks plus its clocks per document.
    RemoteMetadata {
        blocks: Vec<MetadataBlock>,
        clocks: BTreeMap<DocId, Clock>,
    },
    /// Application-level passthrough for a document.
    DocumentMsg { id: DocId, contents: Bytes },
}

/// An inbound gossip message with its sender.
#[derive(Debug)]
pub struct Routed {
    pub sender: PeerId,
    pub msg: PeerMsg,
}

/// Encodes and decodes gossip on every attached peer stream.
#[derive(Debug, Default)]
pub struct MessageRouter {
    peers: HashMap<PeerId, PeerHandle>,
}

impl MessageRouter {
    /// Begin routing messages for a peer stream.
    pub fn listen_to(&mut self, peer: PeerHandle) {
        self.peers.insert(peer.id, peer);
    }

    pub fn forget(&mut self, peer: &PeerId) {
        self.peers.remove(peer);
    }

    /// Decode an inbound extension message.
    ///
    /// Unknown extensions and undecodable payloads are logged and dropped so
    /// one malformed peer cannot stall the node.
    pub fn on_ext(&self, sender: PeerId, name: &str, payload: &[u8]) -> Option<Routed> {
        if name != EXTENSION {
            warn!(peer = %sender.fmt_short(), name, "unknown extension, dropping");
            return None;
        }
        match postcard::from_bytes::<PeerMsg>(payload) {
            Ok(msg) => Some(Routed { sender, msg }),
            Err(err) => {
                warn!(peer = %sender.fmt_short(), %err, "undecodable gossip, dropping");
                None
            }
        }
    }

    pub fn send_to_peer(&self, peer: &PeerId, msg: &PeerMsg) {
        let Some(handle) = self.peers.get(peer) else {
            return;
        };
        match postcard::to_stdvec(msg) {
            Ok(payload) => handle.send(WireMsg::Ext {
                name: EXTENSION.to_string(),
                payload: payload.into(),
            }),
            Err(err) => warn!(%err, "failed to encode gossip"),
        }
    }

    pub fn send_to_peers(&self, peers: impl IntoIterator<Item = PeerId>, msg: &PeerMsg) {
        for peer in peers {
            self.send_to_peer(&peer, msg);
        }
    }
}

/// Strip the fields a peer is not authoritative about.
pub fn sanitize_remote_metadata(mut blocks: Vec<MetadataBlock>) -> Vec<MetadataBlock> {
    for block in &mut blocks {
        block.writable.clear();
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ActorId, Keypair};
    use std::collections::BTreeSet;

    fn sender() -> PeerId {
        PeerId::from_bytes(
            *Keypair::generate(&mut rand::thread_rng())
                .public()
                .as_bytes(),
        )
    }

    #[test]
    fn round_trips_gossip() {
        let router = MessageRouter::default();
        let msg = PeerMsg::DocumentMsg {
            id: DocId::from(Keypair::generate(&mut rand::thread_rng()).public()),
            contents: Bytes::from_static(b"hello"),
        };
        let payload = postcard::to_stdvec(&msg).unwrap();
        let routed = router.on_ext(sender(), EXTENSION, &payload).unwrap();
        assert!(matches!(routed.msg, PeerMsg::DocumentMsg { .. }));
    }

    #[test]
    fn drops_unknown_extension_and_garbage() {
        let router = MessageRouter::default();
        assert!(router.on_ext(sender(), "other.ext", b"x").is_none());
        assert!(router.on_ext(sender(), EXTENSION, b"\xff\xff\xff").is_none());
    }

    #[test]
    fn sanitize_strips_writable_bits() {
        let keys = Keypair::generate(&mut rand::thread_rng());
        let actor: ActorId = keys.public();
        let block = MetadataBlock {
            id: DocId::from(actor),
            actors: BTreeSet::from([actor]),
            writable: [(actor, true)].into_iter().collect(),
            merge: Clock::new(),
            is_file: false,
            file_header: None,
        };
        let sanitized = sanitize_remote_metadata(vec![block]);
        assert!(sanitized[0].writable.is_empty());
    }
}
