//! The frontend protocol: commands in, notifications out.

use std::path::PathBuf;

use bytes::Bytes;

use crate::{
    crdt::{ChangeRequest, Patch},
    metadata::PublicMetadata,
    ActorId, Clock, DocId, Keypair,
};

/// Commands from the frontend to the backend.
#[derive(Debug, strum::Display)]
pub enum ToBackend {
    /// Mint a new document with an explicit keypair. The frontend derives
    /// the new [`DocId`] from the public key on its own channel.
    Create { keys: Keypair },
    /// Ensure a document backend exists for `id`.
    Open { id: DocId },
    /// Drop the document and garbage-collect orphan actors.
    Destroy { id: DocId },
    /// Dump internal state for diagnostics.
    Debug { id: DocId },
    /// Mint (or report) the writable actor of a document.
    NeedsActorId { id: DocId },
    /// Apply a local CRDT change.
    Request { id: DocId, request: ChangeRequest },
    /// Merge an external clock into the document.
    Merge { id: DocId, actors: Clock },
    /// Gossip an application payload to all peers interested in `id`.
    DocumentMsg { id: DocId, contents: Bytes },
    /// Read-only query; the reply is tagged with `id`.
    Query { id: u64, query: Query },
    /// Shut down the backend.
    Close,
}

/// Read-only queries.
#[derive(Debug, strum::Display)]
pub enum Query {
    Metadata { id: DocId },
    /// Materialize the state after the first `history` changes.
    Materialize { id: DocId, history: u64 },
}

/// Notifications from the backend to the frontend.
#[derive(Debug, Clone, strum::Display)]
pub enum ToFrontend {
    /// Initial materialization completed.
    Ready {
        id: DocId,
        actor_id: Option<ActorId>,
        minimum_clock_satisfied: bool,
        history: u64,
        patch: Patch,
    },
    /// A writable local actor was assigned.
    ActorId { id: DocId, actor_id: ActorId },
    /// The document changed.
    Patch {
        id: DocId,
        minimum_clock_satisfied: bool,
        history: u64,
        patch: Patch,
    },
    /// Reply to a [`ToBackend::Query`], tagged with its id.
    Reply { id: u64, payload: ReplyPayload },
    /// Application payload from a peer.
    DocumentMsg { id: DocId, contents: Bytes },
    /// A feed block finished downloading; enables progress UIs.
    ActorBlockDownloaded {
        id: DocId,
        actor_id: ActorId,
        index: u64,
        size: u64,
        time: u64,
    },
    /// The file server is listening.
    FileServerReady { path: PathBuf },
}

/// Query reply payloads.
#[derive(Debug, Clone)]
pub enum ReplyPayload {
    Metadata(Option<PublicMetadata>),
    Materialize(Patch),
}
