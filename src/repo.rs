//! The repo backend: the stateful coordinator owning actors, documents and
//! metadata.
//!
//! The coordinator is single-threaded and cooperative. Every input — frontend
//! commands, feed lifecycle events, swarm connections, peer wire traffic —
//! arrives on a channel and is dispatched by one `select!` loop; each handler
//! runs to completion before the next event is dequeued. Collaborators never
//! hold references back into the coordinator: actors and documents are looked
//! up by id in coordinator-owned tables.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fs,
    path::PathBuf,
};

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, error, error_span, info, trace, warn, Instrument};

#[cfg(feature = "metrics")]
use crate::metrics::Metrics;
#[cfg(feature = "metrics")]
use iroh_metrics::{inc, inc_by};

use crate::{
    actor::{Actor, ActorEvent, ActorTask},
    crdt::{Change, ChangeRequest, DocState, Patch},
    db::{ClockStore, KeyStore, MetaDb, SELF_REPO_KEY},
    doc::{DocBackend, DocEvent, DocTask},
    feed::{FeedEvent, FeedStore, Storage},
    metadata::Metadata,
    proto::{Query, ReplyPayload, ToBackend, ToFrontend},
    replication::{Discovery, ReplicationManager},
    router::{sanitize_remote_metadata, MessageRouter, PeerMsg, Routed},
    swarm::{Swarm, SwarmEvent, SwarmHub, WireMsg},
    ActorId, DocId, Keypair, PeerId, RepoError,
};

/// Options for [`RepoBackend::spawn`].
#[derive(Debug, Clone, Default)]
pub struct RepoOptions {
    /// Root directory for feeds and the database. Defaults to `"default"`.
    pub path: Option<PathBuf>,
    /// Keep everything in memory; no directory is created.
    pub memory: bool,
}

impl RepoOptions {
    /// In-memory repo, for tests and ephemeral nodes.
    pub fn memory() -> Self {
        RepoOptions {
            path: None,
            memory: true,
        }
    }

    /// Persistent repo rooted at `path`.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        RepoOptions {
            path: Some(path.into()),
            memory: false,
        }
    }
}

/// Cheaply clonable handle to a running [`RepoBackend`].
#[derive(Debug, Clone)]
pub struct RepoHandle {
    tx: mpsc::UnboundedSender<ToBackend>,
}

impl RepoHandle {
    /// Send a command to the backend.
    pub fn send(&self, msg: ToBackend) {
        self.tx.send(msg).ok();
    }

    /// Mint a new document; the id is derived from the public key.
    pub fn create(&self, keys: Keypair) -> DocId {
        let id = DocId::from(keys.public());
        self.send(ToBackend::Create { keys });
        id
    }

    pub fn open(&self, id: DocId) {
        self.send(ToBackend::Open { id });
    }

    pub fn close(&self) {
        self.send(ToBackend::Close);
    }
}

/// The coordinator. Owns every actor, document and collaborator.
pub struct RepoBackend {
    me: PeerId,
    meta: Metadata,
    clocks: ClockStore,
    feeds: FeedStore,
    actors: HashMap<ActorId, Actor>,
    docs: HashMap<DocId, DocBackend>,
    replication: ReplicationManager,
    router: MessageRouter,
    swarm: Swarm,
    to_frontend: flume::Sender<ToFrontend>,
    inbox: mpsc::UnboundedReceiver<ToBackend>,
    feed_events: mpsc::UnboundedReceiver<FeedEvent>,
    swarm_events: mpsc::UnboundedReceiver<SwarmEvent>,
    net_rx: mpsc::UnboundedReceiver<(PeerId, WireMsg)>,
    net_tx: mpsc::UnboundedSender<(PeerId, WireMsg)>,
}

impl RepoBackend {
    /// Spawn a backend on the runtime and return the command handle plus the
    /// frontend notification queue.
    pub fn spawn(
        options: RepoOptions,
        hub: &SwarmHub,
    ) -> Result<(RepoHandle, flume::Receiver<ToFrontend>)> {
        let (storage, db) = if options.memory {
            (Storage::Memory, MetaDb::memory()?)
        } else {
            let path = options.path.clone().unwrap_or_else(|| "default".into());
            fs::create_dir_all(&path)
                .with_context(|| format!("creating repo directory {}", path.display()))?;
            (
                Storage::Disk(path.clone()),
                MetaDb::persistent(path.join("hypermerge.db"))?,
            )
        };
        let keys = KeyStore::new(db.clone());
        let identity = match keys.get(SELF_REPO_KEY)? {
            Some(keys) => keys,
            None => {
                let fresh = Keypair::generate(&mut rand::thread_rng());
                keys.set(SELF_REPO_KEY, &fresh)?;
                fresh
            }
        };
        let me = PeerId::from_bytes(*identity.public().as_bytes());
        let clocks = ClockStore::new(db, me);

        let (feed_tx, feed_events) = mpsc::unbounded_channel();
        let feeds = FeedStore::new(storage, feed_tx)?;
        let (swarm, swarm_events) = hub.bind(me);
        let (tx, inbox) = mpsc::unbounded_channel();
        let (front_tx, front_rx) = flume::unbounded();
        let (net_tx, net_rx) = mpsc::unbounded_channel();

        let backend = RepoBackend {
            me,
            meta: Metadata::default(),
            clocks,
            feeds,
            actors: HashMap::new(),
            docs: HashMap::new(),
            replication: ReplicationManager::default(),
            router: MessageRouter::default(),
            swarm,
            to_frontend: front_tx,
            inbox,
            feed_events,
            swarm_events,
            net_rx,
            net_tx,
        };
        let span = error_span!("repo", me = %me.fmt_short());
        tokio::spawn(
            async move {
                if let Err(err) = backend.run().await {
                    error!(?err, "repo backend closed with error");
                }
            }
            .instrument(span),
        );
        Ok((RepoHandle { tx }, front_rx))
    }

    async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                biased;
                msg = self.inbox.recv() => {
                    let Some(msg) = msg else { break };
                    trace!(%msg, "tick: frontend");
                    if matches!(msg, ToBackend::Close) {
                        break;
                    }
                    if let Err(err) = self.on_frontend(msg) {
                        warn!(?err, "frontend command failed");
                    }
                }
                Some(event) = self.feed_events.recv() => {
                    trace!(%event, "tick: feed");
                    if let Err(err) = self.on_feed_event(event) {
                        warn!(?err, "feed event failed");
                    }
                }
                Some(event) = self.swarm_events.recv() => {
                    self.on_swarm_event(event);
                }
                Some((peer, msg)) = self.net_rx.recv() => {
                    trace!(peer = %peer.fmt_short(), %msg, "tick: wire");
                    if let Err(err) = self.on_wire(peer, msg) {
                        warn!(?err, "wire message failed");
                    }
                }
            }
        }
        self.shutdown();
        Ok(())
    }

    // ---- frontend commands ----

    fn on_frontend(&mut self, msg: ToBackend) -> Result<()> {
        match msg {
            ToBackend::Create { keys } => self.create(keys),
            ToBackend::Open { id } => self.open(id),
            ToBackend::NeedsActorId { id } => self.needs_actor_id(id),
            ToBackend::Request { id, request } => self.request(id, request),
            ToBackend::Merge { id, actors } => self.merge(id, actors),
            ToBackend::DocumentMsg { id, contents } => self.document_msg(id, contents),
            ToBackend::Query { id, query } => self.query(id, query),
            ToBackend::Destroy { id } => self.destroy(id),
            ToBackend::Debug { id } => self.debug(id),
            ToBackend::Close => Ok(()),
        }
    }

    fn create(&mut self, keys: Keypair) -> Result<()> {
        let actor_id = keys.public();
        let doc_id = DocId::from(actor_id);
        if self.docs.contains_key(&doc_id) {
            warn!(doc = %doc_id.fmt_short(), "create for an existing document");
            return Ok(());
        }
        self.docs.insert(doc_id, DocBackend::new(doc_id));
        self.feeds.create(keys)?;
        self.register_actor(doc_id, actor_id)?;
        self.meta.set_writable(actor_id, true);
        self.defer_load(doc_id);
        Ok(())
    }

    fn open(&mut self, id: DocId) -> Result<()> {
        if self.meta.is_file(&id) {
            error!("{}", RepoError::OpenAsFile(id));
            return Ok(());
        }
        if let Some(doc) = self.docs.get(&id) {
            if doc.is_ready() {
                let snapshot = ToFrontend::Ready {
                    id,
                    actor_id: doc.actor_id(),
                    minimum_clock_satisfied: self.good_clock(&id).is_some(),
                    history: doc.history(),
                    patch: full_patch(doc),
                };
                self.push_frontend(snapshot);
            }
            return Ok(());
        }
        self.docs.insert(id, DocBackend::new(id));
        self.register_actor(id, id.root_actor())?;
        self.defer_load(id);
        Ok(())
    }

    fn needs_actor_id(&mut self, id: DocId) -> Result<()> {
        let task = match self.docs.get_mut(&id) {
            Some(doc) => doc.when_ready(DocTask::NeedsActorId),
            None => {
                warn!(doc = %id.fmt_short(), "needs-actor-id for unknown document");
                return Ok(());
            }
        };
        if let Some(task) = task {
            self.run_doc_task(id, task);
        }
        Ok(())
    }

    fn request(&mut self, id: DocId, request: ChangeRequest) -> Result<()> {
        let task = match self.docs.get_mut(&id) {
            Some(doc) => doc.when_ready(DocTask::LocalChange(request)),
            None => {
                warn!(doc = %id.fmt_short(), "request for unknown document");
                return Ok(());
            }
        };
        if let Some(task) = task {
            self.run_doc_task(id, task);
        }
        Ok(())
    }

    fn merge(&mut self, id: DocId, actors: crate::Clock) -> Result<()> {
        if !self.docs.contains_key(&id) {
            warn!(doc = %id.fmt_short(), "merge for unknown document");
            return Ok(());
        }
        let newly = self.meta.merge(id, &actors);
        for actor_id in newly {
            self.register_actor(id, actor_id)?;
        }
        self.sync_ready_actors(actors.actors().copied().collect());
        Ok(())
    }

    fn document_msg(&mut self, id: DocId, contents: Bytes) -> Result<()> {
        if !self.meta.contains(&id) {
            warn!(doc = %id.fmt_short(), "document message for unknown document");
            return Ok(());
        }
        let topics = self
            .meta
            .actors(&id)
            .into_iter()
            .map(|a| a.discovery())
            .collect::<Vec<_>>();
        let peers = self.replication.peers_with(topics);
        self.router
            .send_to_peers(peers, &PeerMsg::DocumentMsg { id, contents });
        #[cfg(feature = "metrics")]
        inc!(Metrics, gossip_sent);
        Ok(())
    }

    fn query(&mut self, id: u64, query: Query) -> Result<()> {
        let payload = match query {
            Query::Metadata { id: doc_id } => ReplyPayload::Metadata(self.meta.public(&doc_id)),
            Query::Materialize { id: doc_id, history } => {
                let patch = match self.docs.get(&doc_id) {
                    Some(doc) => {
                        let (_, patch) = DocState::load(doc.history_prefix(history), None);
                        patch
                    }
                    None => Patch::default(),
                };
                ReplyPayload::Materialize(patch)
            }
        };
        self.push_frontend(ToFrontend::Reply { id, payload });
        Ok(())
    }

    fn destroy(&mut self, id: DocId) -> Result<()> {
        debug!(doc = %id.fmt_short(), "destroy");
        self.meta.remove(&id);
        self.docs.remove(&id);
        let keep = self.meta.all_actors();
        let orphans: Vec<ActorId> = self
            .actors
            .keys()
            .filter(|a| !keep.contains(a))
            .copied()
            .collect();
        for actor_id in orphans {
            if let Some(mut actor) = self.actors.remove(&actor_id) {
                self.swarm.leave(actor.discovery);
                actor.close();
            }
            self.feeds.remove(&actor_id)?;
        }
        Ok(())
    }

    fn debug(&mut self, id: DocId) -> Result<()> {
        let doc = self.docs.get(&id);
        info!(
            doc = %id.fmt_short(),
            ready = doc.map(|d| d.is_ready()).unwrap_or(false),
            history = doc.map(|d| d.history()).unwrap_or(0),
            clock = ?doc.map(|d| d.clock()),
            metadata = ?self.meta.public(&id),
            actors = self.actors.len(),
            docs = self.docs.len(),
            "debug dump"
        );
        Ok(())
    }

    // ---- document loading ----

    /// Make sure `actor_id` is tracked: metadata entry, feed, replication
    /// interest and swarm topic.
    fn register_actor(&mut self, doc_id: DocId, actor_id: ActorId) -> Result<()> {
        self.meta.add_actor(doc_id, actor_id);
        self.swarm.join(actor_id.discovery());
        if !self.actors.contains_key(&actor_id) {
            self.actors.insert(actor_id, Actor::new(actor_id));
            self.feeds.open(actor_id)?;
            let discoveries = self.replication.add_feed_ids([actor_id]);
            self.on_discoveries(discoveries);
        }
        Ok(())
    }

    /// Run the document load once the root actor is ready.
    fn defer_load(&mut self, doc_id: DocId) {
        let root = doc_id.root_actor();
        let task = match self.actors.get_mut(&root) {
            Some(actor) => actor.when_ready(ActorTask::LoadDoc(doc_id)),
            None => return,
        };
        if let Some(task) = task {
            self.run_actor_task(root, task);
        }
    }

    /// The document loading algorithm: slice every ready actor's log as far
    /// as the merge clock requests, reuse or mint the writable actor, and
    /// initialize the CRDT.
    fn load_document(&mut self, doc_id: DocId) -> Result<()> {
        if self.docs.get(&doc_id).map(|d| d.is_ready()) != Some(false) {
            return Ok(());
        }
        // Seed the merge clock from the persisted baseline, so a restart
        // reads its own history back instead of starting from zero.
        if let Some(stored) = self.clocks.get(&self.me, &doc_id)? {
            let newly = self.meta.merge(doc_id, &stored);
            for actor_id in newly {
                self.register_actor(doc_id, actor_id)?;
            }
        }
        let mut changes: Vec<Change> = Vec::new();
        let mut counters: BTreeMap<ActorId, u64> = BTreeMap::new();
        for actor_id in self.meta.actors(&doc_id) {
            let Some(actor) = self.actors.get(&actor_id) else {
                continue;
            };
            if !actor.is_ready() {
                continue;
            }
            let max = self.meta.clock_at(&doc_id, &actor_id);
            let (slice, next) = actor.consecutive_changes(0, max);
            if next > 0 {
                counters.insert(actor_id, next);
            }
            changes.extend(slice);
        }
        let local = match self.meta.local_actor(&doc_id) {
            Some(existing) => existing,
            None => self.init_actor_feed(doc_id)?,
        };
        let (events, tasks) = match self.docs.get_mut(&doc_id) {
            Some(doc) => doc.init(changes, counters, Some(local)),
            None => return Ok(()),
        };
        self.handle_doc_events(doc_id, events)?;
        for task in tasks {
            self.run_doc_task(doc_id, task);
        }
        Ok(())
    }

    /// Mint a fresh writable actor for a document.
    fn init_actor_feed(&mut self, doc_id: DocId) -> Result<ActorId> {
        let keys = Keypair::generate(&mut rand::thread_rng());
        let actor_id = keys.public();
        debug!(doc = %doc_id.fmt_short(), actor = %actor_id.fmt_short(), "minting writable actor");
        self.feeds.create(keys)?;
        self.register_actor(doc_id, actor_id)?;
        self.meta.set_writable(actor_id, true);
        Ok(actor_id)
    }

    // ---- feed and actor lifecycle ----

    fn on_feed_event(&mut self, event: FeedEvent) -> Result<()> {
        match event {
            FeedEvent::Ready {
                actor,
                writable,
                fresh,
            } => self.on_actor_ready(actor, writable, fresh),
            FeedEvent::Download {
                actor,
                index,
                size,
                time,
            } => self.on_download(actor, index, size, time),
            FeedEvent::Sync { actor } => self.on_actor_sync(actor),
            FeedEvent::Closed { .. } => Ok(()),
        }
    }

    fn on_actor_ready(&mut self, actor_id: ActorId, writable: bool, fresh: bool) -> Result<()> {
        let blocks = self.feeds.blocks_snapshot(&actor_id);
        let (events, tasks) = match self.actors.get_mut(&actor_id) {
            Some(actor) => actor.on_ready(writable, fresh, blocks)?,
            None => return Ok(()),
        };
        for event in events {
            self.on_actor_event(event)?;
        }
        for task in tasks {
            self.run_actor_task(actor_id, task);
        }
        Ok(())
    }

    fn on_actor_event(&mut self, event: ActorEvent) -> Result<()> {
        match event {
            ActorEvent::FeedReady { actor, writable } => {
                self.meta.set_writable(actor, writable);
                self.gossip_actor(&actor);
                self.swarm.join(actor.discovery());
            }
            ActorEvent::Initialized { actor } => {
                // nothing to push yet, the feed is empty
                self.swarm.join(actor.discovery());
            }
            ActorEvent::Sync { actor } => self.sync_changes(actor),
            ActorEvent::ClassifiedFile { actor, header } => {
                self.meta.mark_file(DocId::from(actor), header);
            }
        }
        Ok(())
    }

    fn run_actor_task(&mut self, actor_id: ActorId, task: ActorTask) {
        match task {
            ActorTask::LoadDoc(doc_id) => {
                if let Err(err) = self.load_document(doc_id) {
                    warn!(doc = %doc_id.fmt_short(), ?err, "document load failed");
                }
            }
            ActorTask::SyncChanges => self.sync_changes(actor_id),
        }
    }

    fn on_download(&mut self, actor_id: ActorId, index: u64, size: u64, time: u64) -> Result<()> {
        #[cfg(feature = "metrics")]
        inc!(Metrics, blocks_replicated);
        let Some(data) = self.feeds.get(&actor_id, index) else {
            return Ok(());
        };
        let event = match self.actors.get_mut(&actor_id) {
            Some(actor) => actor.apply_block(index, &data)?,
            None => return Ok(()),
        };
        if let Some(event) = event {
            self.on_actor_event(event)?;
        }
        for id in self.meta.docs_with(&actor_id) {
            self.push_frontend(ToFrontend::ActorBlockDownloaded {
                id,
                actor_id,
                index,
                size,
                time,
            });
        }
        Ok(())
    }

    fn on_actor_sync(&mut self, actor_id: ActorId) -> Result<()> {
        let (events, tasks) = match self.actors.get_mut(&actor_id) {
            Some(actor) => actor.on_sync(),
            None => return Ok(()),
        };
        for event in events {
            self.on_actor_event(event)?;
        }
        for task in tasks {
            self.run_actor_task(actor_id, task);
        }
        Ok(())
    }

    /// Propagate newly arrived changes of `actor` into every document
    /// containing it, deferring per document until its initial load ran.
    fn sync_changes(&mut self, actor_id: ActorId) {
        for doc_id in self.meta.docs_with(&actor_id) {
            let task = match self.docs.get_mut(&doc_id) {
                Some(doc) => doc.when_ready(DocTask::Sync(actor_id)),
                None => continue,
            };
            if let Some(task) = task {
                self.run_doc_task(doc_id, task);
            }
        }
    }

    fn run_doc_task(&mut self, doc_id: DocId, task: DocTask) {
        match task {
            DocTask::Sync(actor_id) => self.run_doc_sync(doc_id, actor_id),
            DocTask::NeedsActorId => {
                if let Err(err) = self.assign_actor(doc_id) {
                    warn!(doc = %doc_id.fmt_short(), ?err, "actor assignment failed");
                }
            }
            DocTask::LocalChange(request) => {
                let events = match self.docs.get_mut(&doc_id) {
                    Some(doc) => doc.apply_local_change(request),
                    None => return,
                };
                if let Err(err) = self.handle_doc_events(doc_id, events) {
                    warn!(doc = %doc_id.fmt_short(), ?err, "local change failed");
                }
            }
        }
    }

    /// Apply the consecutive changes between the document's applied counter
    /// and the merge clock. A hole in the feed pauses delivery until filled.
    fn run_doc_sync(&mut self, doc_id: DocId, actor_id: ActorId) {
        let max = self.meta.clock_at(&doc_id, &actor_id);
        let (changes, next, min) = {
            let Some(actor) = self.actors.get(&actor_id) else {
                return;
            };
            let Some(doc) = self.docs.get(&doc_id) else {
                return;
            };
            let min = doc.applied(&actor_id);
            let (changes, next) = actor.consecutive_changes(min, max);
            (changes, next, min)
        };
        if next > min {
            if let Some(doc) = self.docs.get_mut(&doc_id) {
                doc.set_applied(actor_id, next);
            }
        }
        if changes.is_empty() {
            return;
        }
        #[cfg(feature = "metrics")]
        inc_by!(Metrics, changes_applied, changes.len() as u64);
        let events = match self.docs.get_mut(&doc_id) {
            Some(doc) => doc.apply_remote_changes(changes),
            None => return,
        };
        if let Err(err) = self.handle_doc_events(doc_id, events) {
            warn!(doc = %doc_id.fmt_short(), ?err, "patch handling failed");
        }
    }

    fn assign_actor(&mut self, doc_id: DocId) -> Result<()> {
        let existing = self.docs.get(&doc_id).and_then(|d| d.actor_id());
        let actor_id = match existing {
            Some(actor_id) => actor_id,
            None => match self.meta.local_actor(&doc_id) {
                Some(actor_id) => actor_id,
                None => self.init_actor_feed(doc_id)?,
            },
        };
        let events = match self.docs.get_mut(&doc_id) {
            Some(doc) => doc.init_actor(actor_id),
            None => return Ok(()),
        };
        self.handle_doc_events(doc_id, events)
    }

    // ---- document notifications ----

    fn handle_doc_events(&mut self, doc_id: DocId, events: Vec<DocEvent>) -> Result<()> {
        for event in events {
            match event {
                DocEvent::Ready {
                    id,
                    actor_id,
                    history,
                    patch,
                } => {
                    let satisfied = self.good_clock(&id).is_some();
                    self.push_frontend(ToFrontend::Ready {
                        id,
                        actor_id,
                        minimum_clock_satisfied: satisfied,
                        history,
                        patch,
                    });
                }
                DocEvent::ActorId { id, actor_id } => {
                    self.push_frontend(ToFrontend::ActorId { id, actor_id });
                }
                DocEvent::RemotePatch { id, history, patch } => {
                    let good = self.good_clock(&id);
                    if let Some(good) = &good {
                        self.clocks.update(&self.me, &id, good)?;
                    }
                    self.push_frontend(ToFrontend::Patch {
                        id,
                        minimum_clock_satisfied: good.is_some(),
                        history,
                        patch,
                    });
                }
                DocEvent::LocalPatch {
                    id,
                    actor_id,
                    change,
                    history,
                    patch,
                } => {
                    self.write_change(id, actor_id, change)?;
                    let satisfied = self.good_clock(&id).is_some();
                    self.push_frontend(ToFrontend::Patch {
                        id,
                        minimum_clock_satisfied: satisfied,
                        history,
                        patch,
                    });
                }
            }
        }
        Ok(())
    }

    /// Persist a locally generated change: append it to the actor's feed,
    /// forward it to subscribed peers, and advance both the requested-state
    /// clock and the persisted baseline.
    fn write_change(&mut self, doc_id: DocId, actor_id: ActorId, change: Change) -> Result<()> {
        let block = match self.actors.get_mut(&actor_id) {
            Some(actor) => actor.write_change(change)?,
            None => anyhow::bail!("no actor {actor_id} for local change"),
        };
        let len = self.feeds.append(&actor_id, vec![block])?;
        #[cfg(feature = "metrics")]
        inc!(Metrics, changes_written);
        let start = len - 1;
        let blocks = self.feeds.signed_from(&actor_id, start);
        self.replication.broadcast_append(&actor_id, start, blocks);

        let clock = self
            .docs
            .get(&doc_id)
            .map(|d| d.clock())
            .unwrap_or_default();
        self.meta.merge(doc_id, &clock);
        self.clocks.update(&self.me, &doc_id, &clock)?;
        self.gossip_doc(&doc_id);
        Ok(())
    }

    // ---- peers and gossip ----

    fn on_swarm_event(&mut self, event: SwarmEvent) {
        let SwarmEvent::Peer { peer, mut rx } = event;
        let peer_id = peer.id;
        debug!(peer = %peer_id.fmt_short(), "peer connected");
        self.router.listen_to(peer.clone());
        self.replication.on_peer(peer);
        let net_tx = self.net_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if net_tx.send((peer_id, msg)).is_err() {
                    break;
                }
            }
        });
    }

    fn on_wire(&mut self, peer: PeerId, msg: WireMsg) -> Result<()> {
        match msg {
            WireMsg::Joined(topics) => {
                let discoveries = self.replication.on_joined(peer, topics);
                self.on_discoveries(discoveries);
            }
            WireMsg::Ext { name, payload } => {
                if let Some(routed) = self.router.on_ext(peer, &name, &payload) {
                    self.on_gossip(routed)?;
                }
            }
            WireMsg::Feed(msg) => {
                self.replication.on_feed_msg(peer, msg, &mut self.feeds)?;
            }
        }
        Ok(())
    }

    fn on_discoveries(&mut self, discoveries: Vec<Discovery>) {
        for discovery in discoveries {
            self.on_discovery(discovery);
        }
    }

    /// A peer newly interested in this actor: send it our metadata and
    /// clocks, then ask for the blocks we miss.
    fn on_discovery(&mut self, discovery: Discovery) {
        let Discovery { feed_id, peer } = discovery;
        if let Some(actor) = self.actors.get_mut(&feed_id) {
            actor.add_peer(peer);
        }
        if let Some(msg) = self.actor_gossip(&feed_id) {
            self.router.send_to_peer(&peer, &msg);
            #[cfg(feature = "metrics")]
            inc!(Metrics, gossip_sent);
        }
        let have = self.feeds.contiguous_len(&feed_id);
        self.replication.request_feed(&peer, &feed_id, have);
    }

    fn on_gossip(&mut self, routed: Routed) -> Result<()> {
        #[cfg(feature = "metrics")]
        inc!(Metrics, gossip_received);
        match routed.msg {
            PeerMsg::RemoteMetadata { blocks, clocks } => {
                let blocks = sanitize_remote_metadata(blocks);
                for (doc_id, clock) in &clocks {
                    self.clocks.update(&routed.sender, doc_id, clock)?;
                }
                let mut mentioned: BTreeSet<ActorId> = BTreeSet::new();
                for block in &blocks {
                    for actor_id in block.actors.iter().chain(block.merge.actors()) {
                        mentioned.insert(*actor_id);
                        self.register_actor(block.id, *actor_id)?;
                    }
                }
                self.meta.add_blocks(blocks);
                self.sync_ready_actors(mentioned);
            }
            PeerMsg::DocumentMsg { id, contents } => {
                self.push_frontend(ToFrontend::DocumentMsg { id, contents });
            }
        }
        Ok(())
    }

    /// Kick `sync_changes` for every actor, as soon as each is ready.
    fn sync_ready_actors(&mut self, ids: BTreeSet<ActorId>) {
        for actor_id in ids {
            let task = match self.actors.get_mut(&actor_id) {
                Some(actor) => actor.when_ready(ActorTask::SyncChanges),
                None => continue,
            };
            if let Some(task) = task {
                self.run_actor_task(actor_id, task);
            }
        }
    }

    /// Gossip for one actor: the metadata blocks of every document
    /// containing it, plus our clock for each of those documents.
    fn actor_gossip(&self, actor_id: &ActorId) -> Option<PeerMsg> {
        let blocks = self.meta.for_actor(actor_id);
        if blocks.is_empty() {
            return None;
        }
        let mut clocks = BTreeMap::new();
        for block in &blocks {
            if let Ok(Some(stored)) = self.clocks.get(&self.me, &block.id) {
                clocks.insert(block.id, stored);
            } else if let Some(doc) = self.docs.get(&block.id) {
                clocks.insert(block.id, doc.clock());
            }
        }
        Some(PeerMsg::RemoteMetadata { blocks, clocks })
    }

    /// Re-send actor gossip to every peer interested in a document
    /// containing it.
    fn gossip_actor(&mut self, actor_id: &ActorId) {
        let Some(msg) = self.actor_gossip(actor_id) else {
            return;
        };
        let PeerMsg::RemoteMetadata { blocks, .. } = &msg else {
            unreachable!();
        };
        let mut topics = BTreeSet::new();
        for block in blocks {
            for actor in &block.actors {
                topics.insert(actor.discovery());
            }
        }
        let peers = self.replication.peers_with(topics);
        if peers.is_empty() {
            return;
        }
        self.router.send_to_peers(peers, &msg);
        #[cfg(feature = "metrics")]
        inc!(Metrics, gossip_sent);
    }

    /// Tell peers interested in this document how far to read.
    fn gossip_doc(&mut self, doc_id: &DocId) {
        let Some(block) = self.meta.block(doc_id) else {
            return;
        };
        let mut clocks = BTreeMap::new();
        if let Ok(Some(stored)) = self.clocks.get(&self.me, doc_id) {
            clocks.insert(*doc_id, stored);
        }
        let topics: Vec<_> = block.actors.iter().map(|a| a.discovery()).collect();
        let peers = self.replication.peers_with(topics);
        if peers.is_empty() {
            return;
        }
        let msg = PeerMsg::RemoteMetadata {
            blocks: vec![block],
            clocks,
        };
        self.router.send_to_peers(peers, &msg);
        #[cfg(feature = "metrics")]
        inc!(Metrics, gossip_sent);
    }

    // ---- satisfied-clock predicate ----

    /// Whether the document's visible state covers a previously persisted
    /// baseline.
    ///
    /// With an own stored clock the current clock counts as satisfied;
    /// otherwise any stored baseline dominated by the current clock does.
    fn good_clock(&self, doc_id: &DocId) -> Option<crate::Clock> {
        let doc = self.docs.get(doc_id)?;
        let current = doc.clock();
        match self.clocks.has(&self.me, doc_id) {
            Ok(true) => Some(current),
            Ok(false) => match self.clocks.max_satisfied(doc_id, &current) {
                Ok(found) => found,
                Err(err) => {
                    warn!(?err, "clock store read failed");
                    None
                }
            },
            Err(err) => {
                warn!(?err, "clock store read failed");
                None
            }
        }
    }

    fn push_frontend(&self, msg: ToFrontend) {
        self.to_frontend.send(msg).ok();
    }

    fn shutdown(&mut self) {
        debug!("close");
        for actor in self.actors.values_mut() {
            actor.close();
        }
        self.feeds.close_all();
        self.swarm.unbind();
    }
}

fn full_patch(doc: &DocBackend) -> Patch {
    Patch {
        diffs: doc
            .materialize()
            .into_iter()
            .map(|(key, value)| crate::crdt::Diff {
                key,
                value: Some(value),
            })
            .collect(),
    }
}
