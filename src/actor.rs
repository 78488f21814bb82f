//! Per-feed actor lifecycle.
//!
//! An actor wraps one feed: it classifies the feed on its first block,
//! accumulates parsed changes (document feeds) or raw chunks (file feeds),
//! tracks attached peers, and defers work until the feed is ready or has
//! synced once.

use bytes::Bytes;
use tracing::trace;

use crate::{
    crdt::Change,
    feed::{Block, FileHeader, CHUNK_SIZE},
    util::LatchQueue,
    ActorId, DiscoveryId, DocId, PeerId, RepoError,
};

/// What kind of data a feed carries. Decided by its first block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Unknown,
    Automerge,
    File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Creating,
    Ready,
    Closed,
}

/// Notifications from an actor to the coordinator.
#[derive(Debug, strum::Display)]
pub enum ActorEvent {
    /// The feed is open and its existing blocks were replayed.
    FeedReady { actor: ActorId, writable: bool },
    /// A brand-new empty local feed came up.
    Initialized { actor: ActorId },
    /// The feed caught up with a remote batch.
    Sync { actor: ActorId },
    /// The first block classified this feed as a file.
    ClassifiedFile { actor: ActorId, header: FileHeader },
}

/// Work deferred on an actor latch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActorTask {
    /// Continue loading a document once this actor is ready.
    LoadDoc(DocId),
    /// Propagate newly arrived changes into the documents containing this
    /// actor.
    SyncChanges,
}

#[derive(Debug)]
pub struct Actor {
    pub id: ActorId,
    pub discovery: DiscoveryId,
    state: State,
    classification: Classification,
    writable: bool,
    /// Sparse change log; index `i` holds the change with `seq == i + 1`.
    changes: Vec<Option<Change>>,
    file_header: Option<FileHeader>,
    /// Sparse file chunks; index `i` holds feed block `i + 1`.
    data: Vec<Option<Bytes>>,
    peers: std::collections::BTreeSet<PeerId>,
    /// Deferred until the feed is ready.
    q: LatchQueue<ActorTask>,
    /// Deferred until the first sync.
    sync_q: LatchQueue<ActorTask>,
}

impl Actor {
    pub fn new(id: ActorId) -> Self {
        Actor {
            id,
            discovery: id.discovery(),
            state: State::Creating,
            classification: Classification::Unknown,
            writable: false,
            changes: Vec::new(),
            file_header: None,
            data: Vec::new(),
            peers: Default::default(),
            q: Default::default(),
            sync_q: Default::default(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == State::Ready
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn classification(&self) -> Classification {
        self.classification
    }

    /// Feed came up: replay its existing blocks in order and open the ready
    /// latch.
    ///
    /// Returns the lifecycle events plus the deferred tasks to run now.
    pub fn on_ready(
        &mut self,
        writable: bool,
        fresh: bool,
        blocks: Vec<(u64, Bytes)>,
    ) -> Result<(Vec<ActorEvent>, Vec<ActorTask>), RepoError> {
        self.writable = writable;
        let mut events = Vec::new();
        for (index, data) in blocks {
            if let Some(event) = self.apply_block(index, &data)? {
                events.push(event);
            }
        }
        self.state = State::Ready;
        events.push(ActorEvent::FeedReady {
            actor: self.id,
            writable,
        });
        if fresh {
            events.push(ActorEvent::Initialized { actor: self.id });
        }
        let tasks = self.q.open();
        trace!(actor = %self.id.fmt_short(), writable, tasks = tasks.len(), "actor ready");
        Ok((events, tasks))
    }

    /// Store one feed block, classifying the feed on block 0.
    pub fn apply_block(
        &mut self,
        index: u64,
        data: &[u8],
    ) -> Result<Option<ActorEvent>, RepoError> {
        let block = Block::unpack(data).map_err(|err| RepoError::BadBlock {
            actor: self.id,
            index,
            reason: err.to_string(),
        })?;
        if index == 0 && self.classification == Classification::Unknown {
            self.classification = match &block {
                Block::FileHeader(_) => Classification::File,
                _ => Classification::Automerge,
            };
        }
        match block {
            Block::Change(change) => {
                let slot = index as usize;
                if self.changes.len() <= slot {
                    self.changes.resize(slot + 1, None);
                }
                if self.changes[slot].is_none() {
                    self.changes[slot] = Some(change);
                }
                Ok(None)
            }
            Block::FileHeader(header) => {
                self.file_header = Some(header.clone());
                Ok(Some(ActorEvent::ClassifiedFile {
                    actor: self.id,
                    header,
                }))
            }
            Block::FileChunk(chunk) => {
                let slot = (index as usize).saturating_sub(1);
                if self.data.len() <= slot {
                    self.data.resize(slot + 1, None);
                }
                self.data[slot] = Some(chunk.into());
                Ok(None)
            }
        }
    }

    /// The feed caught up with a remote batch: open the sync latch.
    pub fn on_sync(&mut self) -> (Vec<ActorEvent>, Vec<ActorTask>) {
        let tasks = self.sync_q.open();
        (vec![ActorEvent::Sync { actor: self.id }], tasks)
    }

    /// Defer `task` until the feed is ready; hands it back when it already
    /// is.
    pub fn when_ready(&mut self, task: ActorTask) -> Option<ActorTask> {
        if self.is_ready() {
            Some(task)
        } else {
            self.q.push(task)
        }
    }

    /// Defer `task` until the first sync.
    pub fn when_synced(&mut self, task: ActorTask) -> Option<ActorTask> {
        self.sync_q.push(task)
    }

    /// Record a locally authored change and hand back the block to append.
    ///
    /// The change must extend the log by exactly one: a sequence skip is a
    /// correctness bug upstream.
    pub fn write_change(&mut self, change: Change) -> Result<Block, RepoError> {
        if self.classification == Classification::File {
            return Err(RepoError::NotADocument(self.id));
        }
        let len = self.changes.len() as u64;
        assert_eq!(
            change.seq,
            len + 1,
            "change sequence {} does not extend feed of length {}",
            change.seq,
            len
        );
        self.classification = Classification::Automerge;
        self.changes.push(Some(change.clone()));
        Ok(Block::Change(change))
    }

    /// Chunk a file into blocks for an empty feed.
    pub fn write_file(&mut self, bytes: Bytes, mime_type: String) -> Result<Vec<Block>, RepoError> {
        if !self.changes.is_empty() || self.file_header.is_some() {
            return Err(RepoError::FileRewrite(self.id));
        }
        let header = FileHeader {
            bytes: bytes.len() as u64,
            mime_type,
        };
        self.classification = Classification::File;
        self.file_header = Some(header.clone());
        let mut blocks = vec![Block::FileHeader(header)];
        for chunk in bytes.chunks(CHUNK_SIZE) {
            self.data.push(Some(Bytes::copy_from_slice(chunk)));
            blocks.push(Block::FileChunk(chunk.to_vec()));
        }
        Ok(blocks)
    }

    /// Concatenate the file chunks, validating the total length against the
    /// header.
    pub fn read_file(&self) -> Result<(Bytes, FileHeader), RepoError> {
        let header = self
            .file_header
            .clone()
            .ok_or(RepoError::NotAFile(self.id))?;
        let mut out = Vec::with_capacity(header.bytes as usize);
        for chunk in self.data.iter().flatten() {
            out.extend_from_slice(chunk);
        }
        if out.len() as u64 != header.bytes {
            return Err(RepoError::FileSizeMismatch {
                expected: header.bytes,
                actual: out.len() as u64,
            });
        }
        Ok((out.into(), header))
    }

    /// The consecutive changes in `[min, max)`; a hole terminates the scan.
    ///
    /// Returns the changes and the index after the last one collected.
    pub fn consecutive_changes(&self, min: u64, max: u64) -> (Vec<Change>, u64) {
        let mut out = Vec::new();
        let mut i = min;
        while i < max {
            match self.changes.get(i as usize).and_then(|c| c.as_ref()) {
                Some(change) => out.push(change.clone()),
                None => break,
            }
            i += 1;
        }
        (out, i)
    }

    pub fn changes_len(&self) -> u64 {
        self.changes.len() as u64
    }

    pub fn add_peer(&mut self, peer: PeerId) -> bool {
        self.peers.insert(peer)
    }

    pub fn remove_peer(&mut self, peer: &PeerId) -> bool {
        self.peers.remove(peer)
    }

    pub fn close(&mut self) {
        self.state = State::Closed;
    }

    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Clock, Keypair};

    fn actor_id() -> ActorId {
        Keypair::generate(&mut rand::thread_rng()).public()
    }

    fn change(actor: ActorId, seq: u64) -> Change {
        Change {
            actor,
            seq,
            deps: Clock::new(),
            ops: vec![],
        }
    }

    #[test]
    fn classification_follows_first_block() {
        let id = actor_id();
        let mut doc_actor = Actor::new(id);
        let block = Block::Change(change(id, 1)).pack().unwrap();
        doc_actor.apply_block(0, &block).unwrap();
        assert_eq!(doc_actor.classification(), Classification::Automerge);

        let mut file_actor = Actor::new(id);
        let head = Block::FileHeader(FileHeader {
            bytes: 0,
            mime_type: "text/plain".into(),
        })
        .pack()
        .unwrap();
        let event = file_actor.apply_block(0, &head).unwrap();
        assert!(matches!(event, Some(ActorEvent::ClassifiedFile { .. })));
        assert_eq!(file_actor.classification(), Classification::File);
    }

    #[test]
    fn ready_latch_defers_tasks() {
        let id = actor_id();
        let doc = DocId::from(actor_id());
        let mut actor = Actor::new(id);
        assert_eq!(actor.when_ready(ActorTask::LoadDoc(doc)), None);
        let (events, tasks) = actor.on_ready(true, true, vec![]).unwrap();
        assert_eq!(tasks, vec![ActorTask::LoadDoc(doc)]);
        assert_eq!(events.len(), 2, "feed-ready plus initialized");
        assert_eq!(
            actor.when_ready(ActorTask::SyncChanges),
            Some(ActorTask::SyncChanges)
        );
    }

    #[test]
    #[should_panic(expected = "does not extend feed")]
    fn sequence_skip_asserts() {
        let id = actor_id();
        let mut actor = Actor::new(id);
        actor.write_change(change(id, 2)).unwrap();
    }

    #[test]
    fn consecutive_changes_stop_at_holes() {
        let id = actor_id();
        let mut actor = Actor::new(id);
        for seq in [1u64, 2] {
            let block = Block::Change(change(id, seq)).pack().unwrap();
            actor.apply_block(seq - 1, &block).unwrap();
        }
        // block 3 arrives before block 2
        let block = Block::Change(change(id, 4)).pack().unwrap();
        actor.apply_block(3, &block).unwrap();

        let (changes, next) = actor.consecutive_changes(0, 4);
        assert_eq!(changes.len(), 2);
        assert_eq!(next, 2);
    }

    #[test]
    fn file_round_trip_and_rewrite_guard() {
        let id = actor_id();
        let mut actor = Actor::new(id);
        let payload = Bytes::from(vec![7u8; CHUNK_SIZE + 10]);
        let blocks = actor
            .write_file(payload.clone(), "application/octet-stream".into())
            .unwrap();
        assert_eq!(blocks.len(), 3, "header plus two chunks");
        let (read, header) = actor.read_file().unwrap();
        assert_eq!(read, payload);
        assert_eq!(header.bytes, payload.len() as u64);
        assert!(matches!(
            actor.write_file(Bytes::new(), String::new()),
            Err(RepoError::FileRewrite(_))
        ));
    }

    #[test]
    fn truncated_file_is_detected() {
        let id = actor_id();
        let mut writer = Actor::new(id);
        let payload = Bytes::from(vec![1u8; 2 * CHUNK_SIZE]);
        let blocks = writer.write_file(payload, "x".into()).unwrap();

        let mut reader = Actor::new(id);
        for (i, block) in blocks.iter().take(2).enumerate() {
            reader
                .apply_block(i as u64, &block.pack().unwrap())
                .unwrap();
        }
        assert!(matches!(
            reader.read_file(),
            Err(RepoError::FileSizeMismatch { .. })
        ));
    }
}
