//! Feed storage collaborator: append-only signed logs with random block
//! access.
//!
//! One feed per actor. Writable feeds hold the secret key and sign every
//! block over `(index || data)`; blocks arriving from peers are verified
//! against the feed public key before they are stored. Feeds come up
//! asynchronously: every `create`/`open` reports back through the event
//! channel, which is what drives the actor state machine.

use std::{
    collections::HashMap,
    fs,
    path::PathBuf,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use ed25519_dalek::Signature;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::{crdt::Change, ActorId, Keypair};

/// Fixed chunk size for file feeds.
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Where feeds live.
#[derive(Debug, Clone)]
pub enum Storage {
    Memory,
    Disk(PathBuf),
}

/// Head block of a file feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHeader {
    pub bytes: u64,
    pub mime_type: String,
}

/// The unit of feed storage.
///
/// The variant of block 0 decides the feed classification: a change means a
/// document feed, a file header means a file feed.
#[derive(Debug, Clone, Serialize, Deserialize, derive_more::From)]
pub enum Block {
    Change(Change),
    FileHeader(FileHeader),
    FileChunk(Vec<u8>),
}

impl Block {
    pub fn pack(&self) -> Result<Bytes> {
        Ok(postcard::to_stdvec(self)?.into())
    }

    pub fn unpack(data: &[u8]) -> Result<Block> {
        Ok(postcard::from_bytes(data)?)
    }
}

/// Notifications from the feed layer to the coordinator.
#[derive(Debug, strum::Display)]
pub enum FeedEvent {
    /// The feed is open; existing blocks can be read.
    Ready {
        actor: ActorId,
        writable: bool,
        /// Whether this process created the feed just now (empty, local).
        fresh: bool,
    },
    /// A block arrived from the network.
    Download {
        actor: ActorId,
        index: u64,
        size: u64,
        time: u64,
    },
    /// The feed caught up with a remote batch.
    Sync { actor: ActorId },
    Closed { actor: ActorId },
}

#[derive(Debug)]
struct Feed {
    public: ActorId,
    keys: Option<Keypair>,
    /// Sparse block storage: `(data, signature)` per index.
    blocks: Vec<Option<(Bytes, Bytes)>>,
}

impl Feed {
    fn writable(&self) -> bool {
        self.keys.is_some()
    }

    fn contiguous_len(&self) -> u64 {
        self.blocks.iter().take_while(|b| b.is_some()).count() as u64
    }

    fn set(&mut self, index: u64, entry: (Bytes, Bytes)) {
        let index = index as usize;
        if self.blocks.len() <= index {
            self.blocks.resize(index + 1, None);
        }
        self.blocks[index] = Some(entry);
    }
}

/// Owns every feed of the process.
#[derive(Debug)]
pub struct FeedStore {
    storage: Storage,
    feeds: HashMap<ActorId, Feed>,
    events: mpsc::UnboundedSender<FeedEvent>,
}

impl FeedStore {
    pub fn new(storage: Storage, events: mpsc::UnboundedSender<FeedEvent>) -> Result<Self> {
        if let Storage::Disk(path) = &storage {
            fs::create_dir_all(path)
                .with_context(|| format!("creating feed directory {}", path.display()))?;
        }
        Ok(FeedStore {
            storage,
            feeds: HashMap::new(),
            events,
        })
    }

    /// Create a writable feed from a keypair. Idempotent per id.
    pub fn create(&mut self, keys: Keypair) -> Result<ActorId> {
        let id = keys.public();
        if self.feeds.contains_key(&id) {
            return Ok(id);
        }
        let feed = Feed {
            public: id,
            keys: Some(keys),
            blocks: Vec::new(),
        };
        self.persist_keys(&feed)?;
        self.feeds.insert(id, feed);
        debug!(actor = %id.fmt_short(), "feed created");
        self.events
            .send(FeedEvent::Ready {
                actor: id,
                writable: true,
                fresh: true,
            })
            .ok();
        Ok(id)
    }

    /// Open a feed by public key, loading any persisted state. Idempotent.
    pub fn open(&mut self, id: ActorId) -> Result<()> {
        if self.feeds.contains_key(&id) {
            return Ok(());
        }
        let mut feed = Feed {
            public: id,
            keys: None,
            blocks: Vec::new(),
        };
        self.load(&mut feed)?;
        let writable = feed.writable();
        self.feeds.insert(id, feed);
        debug!(actor = %id.fmt_short(), writable, "feed opened");
        self.events
            .send(FeedEvent::Ready {
                actor: id,
                writable,
                fresh: false,
            })
            .ok();
        Ok(())
    }

    pub fn is_open(&self, id: &ActorId) -> bool {
        self.feeds.contains_key(id)
    }

    pub fn writable(&self, id: &ActorId) -> bool {
        self.feeds.get(id).map(|f| f.writable()).unwrap_or(false)
    }

    /// Append locally authored blocks. The feed must be writable.
    ///
    /// Returns the new feed length.
    pub fn append(&mut self, id: &ActorId, blocks: Vec<Block>) -> Result<u64> {
        let feed = self.feeds.get_mut(id).context("feed not open")?;
        let keys = feed.keys.clone().context("feed is not writable")?;
        let mut start = feed.contiguous_len();
        for block in blocks {
            let data = block.pack()?;
            let sig = Bytes::copy_from_slice(&sign_block(&keys, start, &data));
            feed.set(start, (data.clone(), sig.clone()));
            persist_block(&self.storage, id, start, &data, &sig)?;
            start += 1;
        }
        trace!(actor = %id.fmt_short(), len = start, "append");
        Ok(start)
    }

    /// Store blocks received from a peer, verifying each signature.
    pub fn append_remote(
        &mut self,
        id: &ActorId,
        start: u64,
        blocks: Vec<(Bytes, Bytes)>,
    ) -> Result<()> {
        if blocks.is_empty() {
            return Ok(());
        }
        let feed = self.feeds.get_mut(id).context("feed not open")?;
        let mut index = start;
        let mut stored = 0u64;
        for (data, sig) in blocks {
            let signature = Signature::from_slice(&sig).context("malformed block signature")?;
            if let Err(err) = id.verify(&signing_input(index, &data), &signature) {
                warn!(actor = %id.fmt_short(), index, %err, "dropping block with bad signature");
                index += 1;
                continue;
            }
            if feed.blocks.get(index as usize).map(|b| b.is_some()) != Some(true) {
                let size = data.len() as u64;
                feed.set(index, (data.clone(), sig.clone()));
                persist_block(&self.storage, id, index, &data, &sig)?;
                self.events
                    .send(FeedEvent::Download {
                        actor: *id,
                        index,
                        size,
                        time: unix_millis(),
                    })
                    .ok();
                stored += 1;
            }
            index += 1;
        }
        if stored > 0 {
            self.events.send(FeedEvent::Sync { actor: *id }).ok();
        }
        Ok(())
    }

    /// Random access to one block.
    pub fn get(&self, id: &ActorId, index: u64) -> Option<Bytes> {
        self.feeds
            .get(id)?
            .blocks
            .get(index as usize)?
            .as_ref()
            .map(|(data, _)| data.clone())
    }

    /// The filled blocks in ascending index order.
    pub fn blocks_snapshot(&self, id: &ActorId) -> Vec<(u64, Bytes)> {
        let Some(feed) = self.feeds.get(id) else {
            return Vec::new();
        };
        feed.blocks
            .iter()
            .enumerate()
            .filter_map(|(i, b)| b.as_ref().map(|(data, _)| (i as u64, data.clone())))
            .collect()
    }

    /// Signed blocks from `start` up to the first hole, for replication.
    pub fn signed_from(&self, id: &ActorId, start: u64) -> Vec<(Bytes, Bytes)> {
        let Some(feed) = self.feeds.get(id) else {
            return Vec::new();
        };
        let end = feed.contiguous_len();
        (start..end)
            .filter_map(|i| feed.blocks[i as usize].clone())
            .collect()
    }

    /// Length of the contiguous prefix.
    pub fn contiguous_len(&self, id: &ActorId) -> u64 {
        self.feeds
            .get(id)
            .map(|f| f.contiguous_len())
            .unwrap_or(0)
    }

    pub fn close(&mut self, id: &ActorId) {
        if self.feeds.remove(id).is_some() {
            self.events.send(FeedEvent::Closed { actor: *id }).ok();
        }
    }

    pub fn close_all(&mut self) {
        let ids: Vec<_> = self.feeds.keys().copied().collect();
        for id in ids {
            self.close(&id);
        }
    }

    /// Close the feed and delete its storage.
    pub fn remove(&mut self, id: &ActorId) -> Result<()> {
        self.close(id);
        if let Storage::Disk(root) = &self.storage {
            let dir = root.join(id.to_string());
            if dir.exists() {
                fs::remove_dir_all(&dir)
                    .with_context(|| format!("removing feed directory {}", dir.display()))?;
            }
        }
        Ok(())
    }

    fn persist_keys(&self, feed: &Feed) -> Result<()> {
        let Storage::Disk(root) = &self.storage else {
            return Ok(());
        };
        let dir = root.join(feed.public.to_string());
        fs::create_dir_all(&dir)?;
        let secret = feed.keys.as_ref().map(|k| k.to_bytes());
        let encoded = postcard::to_stdvec(&(feed.public.as_bytes(), secret))?;
        fs::write(dir.join("key"), encoded)?;
        Ok(())
    }

    fn load(&self, feed: &mut Feed) -> Result<()> {
        let Storage::Disk(root) = &self.storage else {
            return Ok(());
        };
        let dir = root.join(feed.public.to_string());
        if !dir.exists() {
            return Ok(());
        }
        if let Ok(raw) = fs::read(dir.join("key")) {
            let (_public, secret): ([u8; 32], Option<[u8; 32]>) = postcard::from_bytes(&raw)?;
            feed.keys = secret.map(|s| Keypair::from_bytes(&s));
        }
        let mut indices = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if let Ok(index) = entry.file_name().to_string_lossy().parse::<u64>() {
                indices.push(index);
            }
        }
        indices.sort_unstable();
        for index in indices {
            let raw = fs::read(dir.join(index.to_string()))?;
            if raw.len() < 64 {
                bail!("corrupt block {} in {}", index, dir.display());
            }
            let (sig, data) = raw.split_at(64);
            feed.set(
                index,
                (
                    Bytes::copy_from_slice(data),
                    Bytes::copy_from_slice(sig),
                ),
            );
        }
        Ok(())
    }
}

fn signing_input(index: u64, data: &[u8]) -> Vec<u8> {
    let mut msg = index.to_be_bytes().to_vec();
    msg.extend_from_slice(data);
    msg
}

fn sign_block(keys: &Keypair, index: u64, data: &[u8]) -> [u8; 64] {
    keys.sign(&signing_input(index, data)).to_bytes()
}

fn persist_block(
    storage: &Storage,
    id: &ActorId,
    index: u64,
    data: &[u8],
    sig: &[u8],
) -> Result<()> {
    let Storage::Disk(root) = storage else {
        return Ok(());
    };
    let dir = root.join(id.to_string());
    fs::create_dir_all(&dir)?;
    let mut raw = Vec::with_capacity(64 + data.len());
    raw.extend_from_slice(sig);
    raw.extend_from_slice(data);
    fs::write(dir.join(index.to_string()), raw)?;
    Ok(())
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time drift")
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Clock, Keypair};

    fn change(actor: ActorId, seq: u64) -> Block {
        Block::Change(Change {
            actor,
            seq,
            deps: Clock::new(),
            ops: vec![],
        })
    }

    fn store() -> (FeedStore, mpsc::UnboundedReceiver<FeedEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (FeedStore::new(Storage::Memory, tx).unwrap(), rx)
    }

    #[test]
    fn append_signs_and_remote_verifies() {
        let (mut source, _ev) = store();
        let keys = Keypair::generate(&mut rand::thread_rng());
        let id = source.create(keys).unwrap();
        source.append(&id, vec![change(id, 1), change(id, 2)]).unwrap();

        let (mut sink, mut events) = store();
        sink.open(id).unwrap();
        sink.append_remote(&id, 0, source.signed_from(&id, 0)).unwrap();
        assert_eq!(sink.contiguous_len(&id), 2);

        let mut kinds = Vec::new();
        while let Ok(ev) = events.try_recv() {
            kinds.push(ev.to_string());
        }
        assert_eq!(kinds, vec!["Ready", "Download", "Download", "Sync"]);
    }

    #[test]
    fn tampered_blocks_are_dropped() {
        let (mut source, _ev) = store();
        let keys = Keypair::generate(&mut rand::thread_rng());
        let id = source.create(keys).unwrap();
        source.append(&id, vec![change(id, 1)]).unwrap();
        let mut signed = source.signed_from(&id, 0);
        signed[0].0 = Bytes::from_static(b"forged");

        let (mut sink, _events) = store();
        sink.open(id).unwrap();
        sink.append_remote(&id, 0, signed).unwrap();
        assert_eq!(sink.contiguous_len(&id), 0);
    }

    #[test]
    fn disk_feeds_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let keys = Keypair::generate(&mut rand::thread_rng());
        let id = {
            let (tx, _rx) = mpsc::unbounded_channel();
            let mut feeds =
                FeedStore::new(Storage::Disk(dir.path().to_path_buf()), tx).unwrap();
            let id = feeds.create(keys).unwrap();
            feeds.append(&id, vec![change(id, 1)]).unwrap();
            id
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut feeds = FeedStore::new(Storage::Disk(dir.path().to_path_buf()), tx).unwrap();
        feeds.open(id).unwrap();
        assert_eq!(feeds.contiguous_len(&id), 1);
        assert!(feeds.writable(&id));
        match rx.try_recv().unwrap() {
            FeedEvent::Ready { writable, fresh, .. } => {
                assert!(writable);
                assert!(!fresh);
            }
            other => panic!("unexpected event {other}"),
        }
    }
}
