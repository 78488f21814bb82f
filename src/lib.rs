//! Peer-to-peer collaborative documents.
//!
//! Documents carry CRDT semantics layered over append-only signed logs
//! ("feeds"), one per actor. Changes are recorded as immutable operations in
//! per-actor feeds, replicated between peers over a discovery swarm, and
//! merged deterministically into each peer's view of each document.
//!
//! The entry point is [`RepoBackend`]: a single-threaded coordinator that
//! owns the actors, documents and metadata, drives the replication
//! lifecycle as peers come and go, routes change blocks between feed storage
//! and CRDT replay, and mediates a bidirectional message queue
//! ([`ToBackend`] / [`ToFrontend`]) with a frontend holding the materialized
//! view.

#![deny(rustdoc::broken_intra_doc_links)]

pub mod actor;
pub mod clock;
pub mod crdt;
pub mod db;
pub mod doc;
pub mod feed;
pub mod keys;
pub mod metadata;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod proto;
pub mod replication;
pub mod repo;
pub mod router;
pub mod swarm;
mod util;

pub use self::clock::Clock;
pub use self::keys::{ActorId, DiscoveryId, DocId, Keypair, PeerId};
pub use self::proto::{Query, ReplyPayload, ToBackend, ToFrontend};
pub use self::repo::{RepoBackend, RepoHandle, RepoOptions};

/// Errors surfaced by the repo backend.
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    /// `open` was called on an id the metadata knows to be a file.
    #[error("{0} is a file and cannot be opened as a document")]
    OpenAsFile(DocId),
    /// A feed block could not be decoded.
    #[error("feed {actor} block {index} is malformed: {reason}")]
    BadBlock {
        actor: ActorId,
        index: u64,
        reason: String,
    },
    /// `write_file` on a feed that already holds blocks.
    #[error("feed {0} already contains blocks")]
    FileRewrite(ActorId),
    /// `read_file` found fewer or more bytes than the header promised.
    #[error("file length {actual} does not match header {expected}")]
    FileSizeMismatch { expected: u64, actual: u64 },
    /// A change operation on a file feed.
    #[error("feed {0} is a file, not a document")]
    NotADocument(ActorId),
    /// A file operation on a document feed.
    #[error("feed {0} is not a file")]
    NotAFile(ActorId),
}
