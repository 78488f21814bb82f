//! Persistent clock and key storage.
//!
//! Both stores share one embedded [`redb`] database (`hypermerge.db`), either
//! file-backed or in-memory. Writes are serialized by the single-threaded
//! dispatcher; readers see completed writes.

use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use redb::{backends::InMemoryBackend, Database, ReadableTable, TableDefinition};

use crate::{Clock, DocId, Keypair, PeerId};

/// `(doc, peer) -> postcard-encoded Clock`
const CLOCKS_TABLE: TableDefinition<(&[u8; 32], &[u8; 32]), &[u8]> =
    TableDefinition::new("clocks-1");
/// `name -> secret key bytes`
const KEYS_TABLE: TableDefinition<&str, &[u8; 32]> = TableDefinition::new("keys-1");

/// Reserved key store name for the repo identity keypair.
pub const SELF_REPO_KEY: &str = "self.repo";

/// Shared handle to the metadata database.
#[derive(Debug, Clone)]
pub struct MetaDb {
    db: Arc<Database>,
}

impl MetaDb {
    /// Open an in-memory database.
    pub fn memory() -> Result<Self> {
        let db = Database::builder().create_with_backend(InMemoryBackend::new())?;
        Self::new_impl(db)
    }

    /// Create or open a database file.
    pub fn persistent(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::create(&path)
            .with_context(|| format!("opening database at {}", path.as_ref().display()))?;
        Self::new_impl(db)
    }

    fn new_impl(db: Database) -> Result<Self> {
        // Setup all tables
        let write_tx = db.begin_write()?;
        {
            let _ = write_tx.open_table(CLOCKS_TABLE)?;
            let _ = write_tx.open_table(KEYS_TABLE)?;
        }
        write_tx.commit()?;
        Ok(MetaDb { db: Arc::new(db) })
    }
}

/// Persistent mapping `(peer, doc) -> Clock`.
///
/// Entries only ever grow: [`ClockStore::update`] merges with pointwise
/// maximum and never moves a clock backward.
#[derive(Debug, Clone)]
pub struct ClockStore {
    db: MetaDb,
    me: PeerId,
}

impl ClockStore {
    pub fn new(db: MetaDb, me: PeerId) -> Self {
        ClockStore { db, me }
    }

    /// Merge `incoming` into the stored clock for `(peer, doc)`.
    ///
    /// Returns the merged clock and whether the stored value changed.
    pub fn update(&self, peer: &PeerId, doc: &DocId, incoming: &Clock) -> Result<(Clock, bool)> {
        let mut merged = self.get(peer, doc)?.unwrap_or_default();
        let before = merged.clone();
        merged.merge(incoming);
        let changed = merged != before;
        if changed {
            let encoded = postcard::to_stdvec(&merged)?;
            let tx = self.db.db.begin_write()?;
            {
                let mut table = tx.open_table(CLOCKS_TABLE)?;
                table.insert((doc.as_bytes(), peer.as_bytes()), encoded.as_slice())?;
            }
            tx.commit()?;
        }
        Ok((merged, changed))
    }

    /// The stored clock for `(peer, doc)`, if any.
    pub fn get(&self, peer: &PeerId, doc: &DocId) -> Result<Option<Clock>> {
        let tx = self.db.db.begin_read()?;
        let table = tx.open_table(CLOCKS_TABLE)?;
        let Some(guard) = table.get((doc.as_bytes(), peer.as_bytes()))? else {
            return Ok(None);
        };
        Ok(Some(postcard::from_bytes(guard.value())?))
    }

    /// Whether a clock is stored for `(peer, doc)`.
    pub fn has(&self, peer: &PeerId, doc: &DocId) -> Result<bool> {
        Ok(self.get(peer, doc)?.is_some())
    }

    /// The stored clock for this doc that is still covered by `target`.
    ///
    /// The own entry is preferred; failing that, any peer's stored clock
    /// dominated by `target` proves the target is at least as fresh as a
    /// known persisted baseline.
    pub fn max_satisfied(&self, doc: &DocId, target: &Clock) -> Result<Option<Clock>> {
        if let Some(own) = self.get(&self.me, doc)? {
            if own.le(target) {
                return Ok(Some(own));
            }
        }
        let tx = self.db.db.begin_read()?;
        let table = tx.open_table(CLOCKS_TABLE)?;
        let min = [0u8; 32];
        let max = [0xffu8; 32];
        for entry in table.range((doc.as_bytes(), &min)..=(doc.as_bytes(), &max))? {
            let (key, value) = entry?;
            let (_, peer_bytes) = key.value();
            if peer_bytes == self.me.as_bytes() {
                continue;
            }
            let clock: Clock = postcard::from_bytes(value.value())?;
            if clock.le(target) {
                return Ok(Some(clock));
            }
        }
        Ok(None)
    }
}

/// Persistent named keypairs.
#[derive(Debug, Clone)]
pub struct KeyStore {
    db: MetaDb,
}

impl KeyStore {
    pub fn new(db: MetaDb) -> Self {
        KeyStore { db }
    }

    pub fn get(&self, name: &str) -> Result<Option<Keypair>> {
        let tx = self.db.db.begin_read()?;
        let table = tx.open_table(KEYS_TABLE)?;
        let Some(guard) = table.get(name)? else {
            return Ok(None);
        };
        Ok(Some(Keypair::from_bytes(guard.value())))
    }

    pub fn set(&self, name: &str, keys: &Keypair) -> Result<()> {
        let secret = keys.to_bytes();
        let tx = self.db.db.begin_write()?;
        {
            let mut table = tx.open_table(KEYS_TABLE)?;
            table.insert(name, &secret)?;
        }
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ActorId, Keypair};

    fn ids() -> (PeerId, DocId, ActorId) {
        let mut rng = rand::thread_rng();
        (
            PeerId::from_bytes(*Keypair::generate(&mut rng).public().as_bytes()),
            DocId::from(Keypair::generate(&mut rng).public()),
            Keypair::generate(&mut rng).public(),
        )
    }

    #[test]
    fn update_merges_monotonically() {
        let (me, doc, a) = ids();
        let store = ClockStore::new(MetaDb::memory().unwrap(), me);
        let (merged, changed) = store
            .update(&me, &doc, &[(a, 2)].into_iter().collect())
            .unwrap();
        assert!(changed);
        assert_eq!(merged.get(&a), 2);

        // dominated update is a no-op
        let (merged, changed) = store
            .update(&me, &doc, &[(a, 1)].into_iter().collect())
            .unwrap();
        assert!(!changed);
        assert_eq!(merged.get(&a), 2);
        assert!(store.has(&me, &doc).unwrap());
    }

    #[test]
    fn max_satisfied_prefers_own_entry() {
        let (me, doc, a) = ids();
        let store = ClockStore::new(MetaDb::memory().unwrap(), me);
        store
            .update(&me, &doc, &[(a, 1)].into_iter().collect())
            .unwrap();
        let target: Clock = [(a, 3)].into_iter().collect();
        let got = store.max_satisfied(&doc, &target).unwrap().unwrap();
        assert_eq!(got.get(&a), 1);
    }

    #[test]
    fn max_satisfied_falls_back_to_peer_entries() {
        let (me, doc, a) = ids();
        let other = PeerId::from_bytes(
            *Keypair::generate(&mut rand::thread_rng())
                .public()
                .as_bytes(),
        );
        let store = ClockStore::new(MetaDb::memory().unwrap(), me);
        store
            .update(&other, &doc, &[(a, 2)].into_iter().collect())
            .unwrap();
        let target: Clock = [(a, 2)].into_iter().collect();
        assert!(store.max_satisfied(&doc, &target).unwrap().is_some());
        // a peer clock ahead of the target does not satisfy it
        let behind: Clock = [(a, 1)].into_iter().collect();
        assert!(store.max_satisfied(&doc, &behind).unwrap().is_none());
    }

    #[test]
    fn key_store_round_trip() {
        let db = MetaDb::memory().unwrap();
        let keys = KeyStore::new(db);
        assert!(keys.get(SELF_REPO_KEY).unwrap().is_none());
        let pair = Keypair::generate(&mut rand::thread_rng());
        keys.set(SELF_REPO_KEY, &pair).unwrap();
        let back = keys.get(SELF_REPO_KEY).unwrap().unwrap();
        assert_eq!(back.public(), pair.public());
    }
}
