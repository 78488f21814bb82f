//! Per-document metadata: actor sets, merge clocks, file classification.
//!
//! The metadata ledger is authoritative for which actors contribute to a
//! document and how far into each actor's feed the document has requested to
//! read (the merge clock). Actor sets only ever grow for the lifetime of the
//! process; a document disappears as a whole on destroy.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{feed::FileHeader, ActorId, Clock, DocId};

/// Everything known about one document, in gossipable form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataBlock {
    pub id: DocId,
    /// Every actor ever observed for this document.
    pub actors: BTreeSet<ActorId>,
    /// Which actors the sender can write to. Only meaningful locally;
    /// stripped from remote blocks before merging.
    pub writable: BTreeMap<ActorId, bool>,
    /// How far into each actor's feed this document reads.
    pub merge: Clock,
    pub is_file: bool,
    pub file_header: Option<FileHeader>,
}

impl MetadataBlock {
    fn new(id: DocId) -> Self {
        MetadataBlock {
            id,
            actors: BTreeSet::new(),
            writable: BTreeMap::new(),
            merge: Clock::new(),
            is_file: false,
            file_header: None,
        }
    }
}

/// Snapshot of a document's metadata for the frontend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PublicMetadata {
    Document {
        id: DocId,
        actors: BTreeSet<ActorId>,
        clock: Clock,
        local_actor: Option<ActorId>,
    },
    File {
        id: DocId,
        bytes: u64,
        mime_type: String,
    },
}

/// The in-memory metadata ledger.
#[derive(Debug, Default)]
pub struct Metadata {
    docs: BTreeMap<DocId, MetadataBlock>,
    index: BTreeMap<ActorId, BTreeSet<DocId>>,
    writable: BTreeMap<ActorId, bool>,
}

impl Metadata {
    /// Insert `actor` into the document's actor set.
    ///
    /// Idempotent; returns true on first insertion so the caller can start
    /// looking for the feed on the swarm.
    pub fn add_actor(&mut self, doc: DocId, actor: ActorId) -> bool {
        let block = self.docs.entry(doc).or_insert_with(|| MetadataBlock::new(doc));
        let added = block.actors.insert(actor);
        if added {
            self.index.entry(actor).or_default().insert(doc);
        }
        added
    }

    /// Apply remote metadata blocks, unioning actor sets and merge clocks.
    ///
    /// Returns the actors that were not known for their document before.
    pub fn add_blocks(&mut self, blocks: Vec<MetadataBlock>) -> BTreeSet<ActorId> {
        let mut newly = BTreeSet::new();
        for incoming in blocks {
            for actor in &incoming.actors {
                if self.add_actor(incoming.id, *actor) {
                    newly.insert(*actor);
                }
            }
            for actor in incoming.merge.actors() {
                if self.add_actor(incoming.id, *actor) {
                    newly.insert(*actor);
                }
            }
            let block = self
                .docs
                .entry(incoming.id)
                .or_insert_with(|| MetadataBlock::new(incoming.id));
            block.merge.merge(&incoming.merge);
            if incoming.is_file {
                block.is_file = true;
                if block.file_header.is_none() {
                    block.file_header = incoming.file_header;
                }
            }
        }
        newly
    }

    /// Record writability as learned from the feed layer.
    pub fn set_writable(&mut self, actor: ActorId, writable: bool) {
        self.writable.insert(actor, writable);
        for doc in self.index.get(&actor).cloned().unwrap_or_default() {
            if let Some(block) = self.docs.get_mut(&doc) {
                block.writable.insert(actor, writable);
            }
        }
    }

    pub fn is_writable(&self, actor: &ActorId) -> bool {
        self.writable.get(actor).copied().unwrap_or(false)
    }

    /// The single locally-writable actor of a document, if any.
    ///
    /// More than one writable actor per document is a contract violation.
    pub fn local_actor(&self, doc: &DocId) -> Option<ActorId> {
        let block = self.docs.get(doc)?;
        let mut writable = block.actors.iter().filter(|a| self.is_writable(a));
        let first = writable.next().copied();
        assert!(
            writable.next().is_none(),
            "document {doc} has more than one writable actor"
        );
        first
    }

    /// Client-initiated merge: union the clock's actors into the actor set
    /// and the clock into the merge clock. Returns the newly added actors.
    pub fn merge(&mut self, doc: DocId, clock: &Clock) -> BTreeSet<ActorId> {
        let mut newly = BTreeSet::new();
        for actor in clock.actors() {
            if self.add_actor(doc, *actor) {
                newly.insert(*actor);
            }
        }
        if let Some(block) = self.docs.get_mut(&doc) {
            block.merge.merge(clock);
        }
        newly
    }

    /// How far into `actor`'s feed this document has requested to read.
    pub fn clock_at(&self, doc: &DocId, actor: &ActorId) -> u64 {
        self.docs
            .get(doc)
            .map(|block| block.merge.get(actor))
            .unwrap_or(0)
    }

    pub fn actors(&self, doc: &DocId) -> Vec<ActorId> {
        self.docs
            .get(doc)
            .map(|block| block.actors.iter().copied().collect())
            .unwrap_or_default()
    }

    /// The documents containing `actor`.
    pub fn docs_with(&self, actor: &ActorId) -> Vec<DocId> {
        self.index
            .get(actor)
            .map(|docs| docs.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Snapshot of one document's block.
    pub fn block(&self, doc: &DocId) -> Option<MetadataBlock> {
        self.docs.get(doc).cloned()
    }

    /// Metadata blocks for every document containing `actor`.
    pub fn for_actor(&self, actor: &ActorId) -> Vec<MetadataBlock> {
        self.docs_with(actor)
            .into_iter()
            .filter_map(|doc| self.docs.get(&doc).cloned())
            .collect()
    }

    pub fn contains(&self, doc: &DocId) -> bool {
        self.docs.contains_key(doc)
    }

    pub fn is_file(&self, doc: &DocId) -> bool {
        self.docs.get(doc).map(|b| b.is_file).unwrap_or(false)
    }

    /// Classify a feed as a file, as learned from its head block.
    pub fn mark_file(&mut self, doc: DocId, header: FileHeader) {
        let block = self.docs.entry(doc).or_insert_with(|| MetadataBlock::new(doc));
        block.is_file = true;
        block.file_header = Some(header);
    }

    /// Snapshot for the frontend.
    pub fn public(&self, doc: &DocId) -> Option<PublicMetadata> {
        let block = self.docs.get(doc)?;
        Some(if block.is_file {
            let header = block.file_header.clone().unwrap_or_else(|| {
                warn!(doc = %doc.fmt_short(), "file document without header");
                FileHeader {
                    bytes: 0,
                    mime_type: String::new(),
                }
            });
            PublicMetadata::File {
                id: *doc,
                bytes: header.bytes,
                mime_type: header.mime_type,
            }
        } else {
            PublicMetadata::Document {
                id: *doc,
                actors: block.actors.clone(),
                clock: block.merge.clone(),
                local_actor: self.local_actor(doc),
            }
        })
    }

    /// Drop a document. Actors shared with other documents survive.
    pub fn remove(&mut self, doc: &DocId) {
        if let Some(block) = self.docs.remove(doc) {
            for actor in block.actors {
                if let Some(docs) = self.index.get_mut(&actor) {
                    docs.remove(doc);
                    if docs.is_empty() {
                        self.index.remove(&actor);
                    }
                }
            }
        }
    }

    /// The union of actor sets across all documents.
    pub fn all_actors(&self) -> BTreeSet<ActorId> {
        self.index.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Keypair;

    fn actor() -> ActorId {
        Keypair::generate(&mut rand::thread_rng()).public()
    }

    fn doc() -> DocId {
        DocId::from(actor())
    }

    fn block(id: DocId, actors: &[ActorId], merge: Clock) -> MetadataBlock {
        MetadataBlock {
            id,
            actors: actors.iter().copied().collect(),
            writable: BTreeMap::new(),
            merge,
            is_file: false,
            file_header: None,
        }
    }

    #[test]
    fn add_actor_is_idempotent() {
        let mut meta = Metadata::default();
        let (d, a) = (doc(), actor());
        assert!(meta.add_actor(d, a));
        assert!(!meta.add_actor(d, a));
        assert_eq!(meta.actors(&d), vec![a]);
        assert_eq!(meta.docs_with(&a), vec![d]);
    }

    #[test]
    fn add_blocks_is_idempotent_and_commutative() {
        let (d, a, b) = (doc(), actor(), actor());
        let one = block(d, &[a], [(a, 2)].into_iter().collect());
        let two = block(d, &[a, b], [(a, 1), (b, 3)].into_iter().collect());

        let mut left = Metadata::default();
        left.add_blocks(vec![one.clone(), two.clone()]);
        let mut right = Metadata::default();
        right.add_blocks(vec![two.clone(), one.clone()]);
        assert_eq!(left.docs, right.docs);

        let before = left.docs.clone();
        let newly = left.add_blocks(vec![one, two]);
        assert!(newly.is_empty());
        assert_eq!(left.docs, before);
    }

    #[test]
    fn merge_unions_actors_and_clock() {
        let mut meta = Metadata::default();
        let (d, a) = (doc(), actor());
        meta.add_actor(d, d.root_actor());
        let newly = meta.merge(d, &[(a, 1)].into_iter().collect());
        assert_eq!(newly.into_iter().collect::<Vec<_>>(), vec![a]);
        assert_eq!(meta.clock_at(&d, &a), 1);
        // dominated merge does not rewind
        meta.merge(d, &[(a, 1)].into_iter().collect());
        assert_eq!(meta.clock_at(&d, &a), 1);
    }

    #[test]
    fn local_actor_is_the_writable_one() {
        let mut meta = Metadata::default();
        let (d, a) = (doc(), actor());
        meta.add_actor(d, d.root_actor());
        meta.add_actor(d, a);
        assert_eq!(meta.local_actor(&d), None);
        meta.set_writable(a, true);
        assert_eq!(meta.local_actor(&d), Some(a));
    }

    #[test]
    #[should_panic(expected = "more than one writable actor")]
    fn two_writable_actors_is_a_contract_violation() {
        let mut meta = Metadata::default();
        let (d, a, b) = (doc(), actor(), actor());
        meta.add_actor(d, a);
        meta.add_actor(d, b);
        meta.set_writable(a, true);
        meta.set_writable(b, true);
        meta.local_actor(&d);
    }

    #[test]
    fn remove_keeps_shared_actors() {
        let mut meta = Metadata::default();
        let (d1, d2, shared, only) = (doc(), doc(), actor(), actor());
        meta.add_actor(d1, shared);
        meta.add_actor(d1, only);
        meta.add_actor(d2, shared);
        meta.remove(&d1);
        assert!(!meta.contains(&d1));
        assert_eq!(meta.all_actors().into_iter().collect::<Vec<_>>(), {
            let mut v = vec![shared];
            v.sort();
            v
        });
        assert_eq!(meta.docs_with(&only), Vec::<DocId>::new());
    }
}
